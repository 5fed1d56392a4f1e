//! Node store interface
//!
//! The address-space information model is a collaborator of the server core,
//! reached only through this trait. The server writes a handful of well-known
//! namespace-zero variables at startup and browses references for
//! `for_each_child_node`; everything else (type system, attribute services,
//! modeling rules) belongs to the node store implementation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::{UaError, UaResult};
use crate::types::{NodeId, Timestamp};

// Well-known namespace-zero variable ids written by the server
pub const NS0_ID_SERVER_ARRAY: u32 = 2254;
pub const NS0_ID_NAMESPACE_ARRAY: u32 = 2255;
pub const NS0_ID_SERVER_STATUS_STARTTIME: u32 = 2257;

/// Reference type id `HasComponent`, used by the in-memory store's tests
pub const NS0_ID_HASCOMPONENT: u32 = 47;

// ----------------------------------------------------------------------------
// Values and References
// ----------------------------------------------------------------------------

/// Variable value subset used by the server core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Variant {
    Boolean(bool),
    UInt32(u32),
    String(String),
    StringArray(Vec<String>),
    DateTime(Timestamp),
}

/// Direction filter for browsing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowseDirection {
    Forward,
    Inverse,
    Both,
}

/// A single reference returned by a browse
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceDescription {
    /// Target node
    pub node_id: NodeId,
    /// Whether the target lives in this server (remote targets are skipped
    /// by local-only iteration)
    pub is_local: bool,
    /// Whether the reference points away from the browsed node
    pub is_forward: bool,
    /// Reference type, e.g. HasComponent
    pub reference_type_id: NodeId,
}

// ----------------------------------------------------------------------------
// Node Store Trait
// ----------------------------------------------------------------------------

/// Minimal address-space surface consumed by the server core
pub trait NodeStore: Send {
    /// Write a variable value, creating the slot if the store allows it
    fn write_value(&mut self, node: &NodeId, value: Variant) -> UaResult<()>;

    /// Read a variable value
    fn read_value(&self, node: &NodeId) -> Option<Variant>;

    /// Browse references of a node in the given direction
    fn browse(&self, node: &NodeId, direction: BrowseDirection) -> UaResult<Vec<ReferenceDescription>>;
}

// ----------------------------------------------------------------------------
// In-Memory Node Store
// ----------------------------------------------------------------------------

/// HashMap-backed node store
///
/// The default store for embedded and test configurations. Writes create
/// slots on demand; references are registered explicitly.
#[derive(Debug, Default)]
pub struct MapNodeStore {
    values: HashMap<NodeId, Variant>,
    references: HashMap<NodeId, Vec<ReferenceDescription>>,
}

impl MapNodeStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reference from `source` to `target`
    pub fn add_reference(
        &mut self,
        source: NodeId,
        target: NodeId,
        reference_type_id: NodeId,
        is_forward: bool,
        is_local: bool,
    ) {
        self.references.entry(source).or_default().push(ReferenceDescription {
            node_id: target,
            is_local,
            is_forward,
            reference_type_id,
        });
    }

    /// Number of stored values
    pub fn value_count(&self) -> usize {
        self.values.len()
    }
}

impl NodeStore for MapNodeStore {
    fn write_value(&mut self, node: &NodeId, value: Variant) -> UaResult<()> {
        self.values.insert(node.clone(), value);
        Ok(())
    }

    fn read_value(&self, node: &NodeId) -> Option<Variant> {
        self.values.get(node).cloned()
    }

    fn browse(&self, node: &NodeId, direction: BrowseDirection) -> UaResult<Vec<ReferenceDescription>> {
        let refs = self.references.get(node).ok_or(UaError::NotFound)?;
        let filtered = refs
            .iter()
            .filter(|r| match direction {
                BrowseDirection::Forward => r.is_forward,
                BrowseDirection::Inverse => !r.is_forward,
                BrowseDirection::Both => true,
            })
            .cloned()
            .collect();
        Ok(filtered)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

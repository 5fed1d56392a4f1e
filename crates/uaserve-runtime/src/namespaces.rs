//! Namespace registry
//!
//! An append-only table of namespace URIs indexed by 16-bit handles. Index 0
//! is fixed to the OPC Foundation standard namespace. Index 1 belongs to the
//! server itself and is lazily populated from the configured application URI:
//! the embedding application may override it with a custom URI, but only
//! before the first observable use of the table (any public namespace
//! operation or server startup).

use tracing::warn;

use uaserve_core::errors::{UaError, UaResult};

/// URI of the OPC Foundation standard namespace, always index 0
pub const NS0_URI: &str = "http://opcfoundation.org/UA/";

// ----------------------------------------------------------------------------
// Namespace Table
// ----------------------------------------------------------------------------

/// Ordered, append-only table of namespace URIs
#[derive(Debug, Clone)]
pub struct NamespaceTable {
    uris: Vec<String>,
}

impl NamespaceTable {
    /// Table with namespace 0 installed and namespace 1 reserved
    pub fn new() -> Self {
        Self {
            uris: vec![NS0_URI.to_string(), String::new()],
        }
    }

    /// Fill namespace 1 from the application URI unless already set
    ///
    /// Called at the entry of every public namespace operation and at server
    /// startup, so any externally observable read sees ns1 populated whenever
    /// the application URI is non-empty.
    pub(crate) fn setup_ns1(&mut self, application_uri: &str) {
        if self.uris[1].is_empty() && !application_uri.is_empty() {
            self.uris[1] = application_uri.to_string();
        }
    }

    /// Add a namespace URI, returning its index
    ///
    /// Adding a URI that is already present returns the existing index and
    /// leaves the table unchanged. When the 16-bit index space is exhausted
    /// the sentinel index 0 is returned, matching the on-wire "not found"
    /// usage.
    pub fn add(&mut self, uri: &str) -> u16 {
        if let Some(idx) = self.uris.iter().position(|u| u == uri) {
            return idx as u16;
        }
        if self.uris.len() > u16::MAX as usize {
            warn!(uri, "namespace table is full");
            return 0;
        }
        self.uris.push(uri.to_string());
        (self.uris.len() - 1) as u16
    }

    /// Find the index of a namespace URI
    pub fn get_by_name(&self, uri: &str) -> UaResult<u16> {
        self.uris
            .iter()
            .position(|u| u == uri)
            .map(|idx| idx as u16)
            .ok_or(UaError::NotFound)
    }

    /// Resolve an index to its URI; any index at or past the table size is
    /// a lookup miss
    pub fn get_by_index(&self, index: u16) -> UaResult<&str> {
        self.uris
            .get(index as usize)
            .map(|u| u.as_str())
            .ok_or(UaError::NotFound)
    }

    /// All URIs in index order
    pub fn uris(&self) -> &[String] {
        &self.uris
    }

    /// Number of table entries, including the reserved ns1 slot
    pub fn len(&self) -> usize {
        self.uris.len()
    }

    /// The table always holds ns0 and ns1
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Default for NamespaceTable {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

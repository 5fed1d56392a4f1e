//! Core types for the uaserve server
//!
//! Fundamental types shared by all crates in the workspace, using newtype
//! patterns for semantic validation and type safety.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Node Identifier
// ----------------------------------------------------------------------------

/// OPC UA node identifier: a namespace index plus a typed identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeId {
    /// Numeric identifier, e.g. `ns=0;i=2254`
    Numeric { ns: u16, id: u32 },
    /// String identifier, e.g. `ns=1;s=Device.Temperature`
    String { ns: u16, id: String },
    /// GUID identifier, used for session ids
    Guid { ns: u16, id: Uuid },
}

impl NodeId {
    /// Numeric node id
    pub fn numeric(ns: u16, id: u32) -> Self {
        Self::Numeric { ns, id }
    }

    /// String node id
    pub fn string(ns: u16, id: impl Into<String>) -> Self {
        Self::String { ns, id: id.into() }
    }

    /// GUID node id
    pub fn guid(ns: u16, id: Uuid) -> Self {
        Self::Guid { ns, id }
    }

    /// The namespace index of this node id
    pub fn namespace(&self) -> u16 {
        match self {
            Self::Numeric { ns, .. } | Self::String { ns, .. } | Self::Guid { ns, .. } => *ns,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric { ns, id } => write!(f, "ns={};i={}", ns, id),
            Self::String { ns, id } => write!(f, "ns={};s={}", ns, id),
            Self::Guid { ns, id } => write!(f, "ns={};g={}", ns, id),
        }
    }
}

// ----------------------------------------------------------------------------
// Byte String
// ----------------------------------------------------------------------------

/// Owned byte sequence, used for certificates and private keys
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ByteString(Vec<u8>);

impl ByteString {
    /// Create a byte string from raw bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The empty byte string
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Raw byte access
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the byte string holds no bytes
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<&[u8]> for ByteString {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for ByteString {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl fmt::Debug for ByteString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteString({})", hex::encode(&self.0))
    }
}

impl fmt::Display for ByteString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp
///
/// The server uses two clocks, both represented by this type: the wall clock
/// (milliseconds since the Unix epoch, for shutdown deadlines and the
/// published start time) and the monotonic clock (milliseconds since an
/// event-loop-defined origin, for timed callbacks and expiry checks). The
/// [`crate::eventloop::EventLoop`] is the source of both; values from the two
/// clocks must never be compared with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Largest representable timestamp, used for never-expiring deadlines
    pub const MAX: Self = Self(u64::MAX);

    /// Create a timestamp from raw milliseconds
    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// This timestamp advanced by a duration, saturating at the maximum
    pub fn saturating_add(&self, d: Duration) -> Self {
        Self(self.0.saturating_add(d.as_millis() as u64))
    }

    /// Milliseconds from `self` until `later`; zero if `later` is in the past
    pub fn millis_until(&self, later: Timestamp) -> u64 {
        later.0.saturating_sub(self.0)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display() {
        assert_eq!(NodeId::numeric(0, 2254).to_string(), "ns=0;i=2254");
        assert_eq!(NodeId::string(1, "pump").to_string(), "ns=1;s=pump");
    }

    #[test]
    fn test_byte_string_hex_display() {
        let bs = ByteString::new(vec![0xde, 0xad]);
        assert_eq!(bs.to_string(), "dead");
        assert!(!bs.is_empty());
        assert!(ByteString::empty().is_empty());
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let t = Timestamp::from_millis(1_000);
        assert_eq!(t.saturating_add(Duration::from_millis(500)).as_millis(), 1_500);
        assert_eq!(t.millis_until(Timestamp::from_millis(1_200)), 200);
        assert_eq!(t.millis_until(Timestamp::from_millis(800)), 0);
        assert_eq!(Timestamp::MAX.saturating_add(Duration::from_secs(1)), Timestamp::MAX);
    }
}

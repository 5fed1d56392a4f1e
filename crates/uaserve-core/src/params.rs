//! Connection parameter maps
//!
//! Connection managers are configured through a small key-value map rather
//! than a fixed struct, so transports can define their own keys without
//! changing the trait surface. The keys used by the server core are `port`,
//! `listen` and `address`.

// Well-known parameter keys
pub const PARAM_PORT: &str = "port";
pub const PARAM_LISTEN: &str = "listen";
pub const PARAM_ADDRESS: &str = "address";

// ----------------------------------------------------------------------------
// Parameter Values
// ----------------------------------------------------------------------------

/// A single typed parameter value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterValue {
    UInt16(u16),
    Boolean(bool),
    String(String),
    StringArray(Vec<String>),
}

// ----------------------------------------------------------------------------
// Parameter Map
// ----------------------------------------------------------------------------

/// Ordered key-value parameter map passed to connection managers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterMap {
    entries: Vec<(String, ParameterValue)>,
}

impl ParameterMap {
    /// Create an empty parameter map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing any previous value under the same key
    pub fn insert(&mut self, key: impl Into<String>, value: ParameterValue) {
        let key = key.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Look up a value by key
    pub fn get(&self, key: &str) -> Option<&ParameterValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Typed lookup for `u16` values
    pub fn get_u16(&self, key: &str) -> Option<u16> {
        match self.get(key) {
            Some(ParameterValue::UInt16(v)) => Some(*v),
            _ => None,
        }
    }

    /// Typed lookup for boolean values
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(ParameterValue::Boolean(v)) => Some(*v),
            _ => None,
        }
    }

    /// Typed lookup for strings; a string array yields its first element
    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(ParameterValue::String(s)) => Some(s.as_str()),
            Some(ParameterValue::StringArray(a)) => a.first().map(|s| s.as_str()),
            _ => None,
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_lookups() {
        let mut params = ParameterMap::new();
        params.insert(PARAM_PORT, ParameterValue::UInt16(4840));
        params.insert(PARAM_LISTEN, ParameterValue::Boolean(true));
        params.insert(
            PARAM_ADDRESS,
            ParameterValue::StringArray(vec!["plc.example".into()]),
        );

        assert_eq!(params.get_u16(PARAM_PORT), Some(4840));
        assert_eq!(params.get_bool(PARAM_LISTEN), Some(true));
        assert_eq!(params.get_string(PARAM_ADDRESS), Some("plc.example"));
        assert_eq!(params.get_u16(PARAM_LISTEN), None);
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_insert_replaces() {
        let mut params = ParameterMap::new();
        params.insert(PARAM_PORT, ParameterValue::UInt16(4840));
        params.insert(PARAM_PORT, ParameterValue::UInt16(4841));
        assert_eq!(params.get_u16(PARAM_PORT), Some(4841));
        assert_eq!(params.len(), 1);
    }
}

//! Node identity
//!
//! Participant nodes are identified by hostname-derived names. Hostnames are
//! case-insensitive, so the factory canonicalizes on construction: two
//! different spellings of the same host resolve to the same identity and the
//! same map key everywhere in the coordinator and the listener.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Canonical identifier of a participant node.
///
/// Construction lowercases the name and trims a trailing dot, matching DNS
/// name semantics. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeName(String);

// Deserialization funnels through the canonicalizing factory so that names
// read from scenario files obey the same equality contract as constructed
// ones.
impl<'de> Deserialize<'de> for NodeName {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(NodeName::new(&raw))
    }
}

impl NodeName {
    /// Canonicalizing factory: `"NodeA."` and `"nodea"` yield equal names.
    pub fn new(name: &str) -> Self {
        let trimmed = name.strip_suffix('.').unwrap_or(name);
        NodeName(trimmed.to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeName {
    fn from(name: &str) -> Self {
        NodeName::new(name)
    }
}

impl Borrow<str> for NodeName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_case_insensitive() {
        assert_eq!(NodeName::new("nodeA"), NodeName::new("NODEA"));
        assert_eq!(NodeName::new("nodeA"), NodeName::new("nodea"));
        assert_eq!(NodeName::new("ServerB"), NodeName::new("serverb"));
    }

    #[test]
    fn trailing_dot_is_trimmed() {
        assert_eq!(NodeName::new("nodea."), NodeName::new("nodea"));
    }

    #[test]
    fn usable_as_map_key_across_spellings() {
        use std::collections::HashMap;

        let mut map = HashMap::new();
        map.insert(NodeName::new("NodeA"), 1);
        assert_eq!(map.get(&NodeName::new("nodeA")), Some(&1));
    }
}

//! ID definitions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{ulid_id, IdError};

ulid_id!(NodeId, "node");
ulid_id!(BootId, "boot");

// =============================================================================
// Instance IDs
// =============================================================================

/// Identifier of an instance, assigned by the cluster controller.
///
/// The controller guarantees uniqueness within the cluster; the agent only
/// checks that the value is usable as a directory name. Allowed characters
/// are ASCII alphanumerics, `-`, `_` and `.`, with `.` and `..` rejected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    /// Longest accepted ID, in bytes.
    pub const MAX_LEN: usize = 128;

    /// Validates and wraps an instance ID.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.len() > Self::MAX_LEN {
            return Err(IdError::TooLong {
                len: s.len(),
                max: Self::MAX_LEN,
            });
        }
        if s == "." || s == ".." {
            return Err(IdError::Reserved(s.to_string()));
        }
        if let Some((offset, ch)) = s
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(IdError::InvalidChar { ch, offset });
        }

        Ok(Self(s.to_string()))
    }

    /// Returns the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for InstanceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for InstanceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<std::path::Path> for InstanceId {
    fn as_ref(&self) -> &std::path::Path {
        std::path::Path::new(&self.0)
    }
}

impl Serialize for InstanceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for InstanceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_node_id_roundtrip() {
        let id = NodeId::new();
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("node_"));
    }

    #[test]
    fn test_node_id_wrong_prefix() {
        let result: Result<NodeId, _> = "boot_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            IdError::InvalidPrefix { expected: "node", .. }
        ));
    }

    #[test]
    fn test_node_id_missing_separator() {
        let result: Result<NodeId, _> = "node01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert_eq!(result.unwrap_err(), IdError::MissingSeparator);
    }

    #[test]
    fn test_node_id_invalid_ulid() {
        let result: Result<NodeId, _> = "node_invalid".parse();
        assert!(matches!(result.unwrap_err(), IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_boot_ids_are_time_ordered() {
        let id1 = BootId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = BootId::new();
        assert!(id1 < id2);
    }

    #[test]
    fn test_instance_id_accepts_controller_names() {
        for s in ["vm-001", "inst_01HV4Z4NYPLTRS0JTUA8XDME5F", "a.b-c_d", "X"] {
            let id = InstanceId::parse(s).unwrap();
            assert_eq!(id.as_str(), s);
        }
    }

    #[test]
    fn test_instance_id_rejects_path_tricks() {
        assert_eq!(InstanceId::parse("").unwrap_err(), IdError::Empty);
        assert!(matches!(
            InstanceId::parse("..").unwrap_err(),
            IdError::Reserved(_)
        ));
        assert_eq!(
            InstanceId::parse("../etc").unwrap_err(),
            IdError::InvalidChar { ch: '/', offset: 2 }
        );
        assert!(matches!(
            InstanceId::parse("vm 1").unwrap_err(),
            IdError::InvalidChar { ch: ' ', .. }
        ));
    }

    #[test]
    fn test_instance_id_length_limit() {
        let long = "a".repeat(InstanceId::MAX_LEN + 1);
        assert!(matches!(
            InstanceId::parse(&long).unwrap_err(),
            IdError::TooLong { .. }
        ));
        assert!(InstanceId::parse(&long[1..]).is_ok());
    }

    #[test]
    fn test_instance_id_serde_rejects_invalid() {
        let err = serde_json::from_str::<InstanceId>("\"a/b\"").unwrap_err();
        assert!(err.to_string().contains("invalid character"));

        let id: InstanceId = serde_json::from_str("\"vm-001\"").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"vm-001\"");
    }

    proptest! {
        #[test]
        fn prop_valid_instance_id_is_single_path_component(s in "[A-Za-z0-9_-][A-Za-z0-9._-]{0,40}") {
            let id = InstanceId::parse(&s).unwrap();
            let path: &std::path::Path = id.as_ref();
            prop_assert_eq!(path.components().count(), 1);
            prop_assert_eq!(path.file_name().and_then(|n| n.to_str()), Some(s.as_str()));
        }
    }
}

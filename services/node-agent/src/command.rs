//! The start command received from the controller.

use serde::{Deserialize, Serialize};

use crate::instance::InstanceConfig;

/// Request to start one instance on this node.
///
/// `user_data` and `meta_data` are opaque to the agent and handed to the
/// backend untouched. On the wire they are base64 strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartCommand {
    pub config: InstanceConfig,
    #[serde(default, with = "base64_bytes")]
    pub user_data: Vec<u8>,
    #[serde(default, with = "base64_bytes")]
    pub meta_data: Vec<u8>,
}

impl StartCommand {
    pub fn new(config: InstanceConfig) -> Self {
        Self {
            config,
            user_data: Vec::new(),
            meta_data: Vec::new(),
        }
    }

    pub fn with_user_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.user_data = data.into();
        self
    }

    pub fn with_meta_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.meta_data = data.into();
        self
    }

    /// Whether this start retries an earlier attempt.
    pub fn restart(&self) -> bool {
        self.config.restart
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_with_payloads() {
        let cmd: StartCommand = serde_json::from_value(serde_json::json!({
            "config": {
                "instance": "vm-020",
                "tenant": "00000000-0000-0000-0000-000000000001",
                "image": "alpine",
                "restart": true,
            },
            "user_data": "I2Nsb3VkLWNvbmZpZw==",
        }))
        .unwrap();

        assert_eq!(cmd.user_data, b"#cloud-config");
        assert!(cmd.meta_data.is_empty());
        assert!(cmd.restart());

        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["user_data"], "I2Nsb3VkLWNvbmZpZw==");
        assert_eq!(json["meta_data"], "");
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let result = serde_json::from_value::<StartCommand>(serde_json::json!({
            "config": {
                "instance": "vm-021",
                "tenant": "00000000-0000-0000-0000-000000000001",
                "image": "alpine",
            },
            "meta_data": "not base64!",
        }));
        assert!(result.is_err());
    }
}

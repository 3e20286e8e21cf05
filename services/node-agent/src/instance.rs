//! Instance configuration and its on-disk record.
//!
//! Each instance owns one directory under the agent's instances root,
//! named after its ID. The directory holds the persisted configuration
//! (`instance.json`) plus whatever artifacts the backend creates, and its
//! presence is the durable marker that the instance exists on this node.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nimbus_id::InstanceId;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// File name of the persisted configuration inside an instance directory.
pub const CONFIG_FILE: &str = "instance.json";

/// Directory for an instance under the instances root.
pub fn instance_dir(root: &Path, id: &InstanceId) -> PathBuf {
    root.join(id)
}

/// Resource sizing for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub vcpus: u8,
    pub mem_mib: u32,
    /// Root disk size; 0 keeps the backing image size.
    #[serde(default)]
    pub disk_mib: u32,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            vcpus: 1,
            mem_mib: 512,
            disk_mib: 0,
        }
    }
}

/// Network requirements as sent by the controller.
///
/// Addresses are kept in their wire form; they are parsed and checked when
/// the VNIC request is built, so a malformed value fails the start with
/// `InvalidData` instead of failing to decode the whole command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceNetwork {
    pub vnic_id: Uuid,
    pub mac: String,
    pub ip: String,
    /// Tenant subnet in CIDR notation.
    pub subnet: String,
    pub subnet_key: u32,
    pub concentrator_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u16>,
}

/// Configuration of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub instance: InstanceId,
    pub tenant: Uuid,
    /// Name of the backing image the instance disk is derived from.
    pub image: String,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<InstanceNetwork>,
    /// Container workload rather than a VM.
    #[serde(default)]
    pub container: bool,
    /// Set by the controller when this start retries an earlier attempt.
    #[serde(default)]
    pub restart: bool,
}

impl InstanceConfig {
    /// Persist the configuration into `dir`.
    ///
    /// Writes a temporary file and renames it into place so a crash never
    /// leaves a truncated `instance.json` behind.
    pub async fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(CONFIG_FILE);
        let tmp = dir.join(format!(".{}.tmp", CONFIG_FILE));

        let json = serde_json::to_vec_pretty(self).context("failed to encode instance config")?;
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to rename into {}", path.display()))?;

        debug!(instance_id = %self.instance, path = %path.display(), "Instance config saved");
        Ok(())
    }

    /// Load a configuration previously written by [`save`](Self::save).
    #[cfg(test)]
    pub(crate) async fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("invalid config in {}", path.display()))
    }
}

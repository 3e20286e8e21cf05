//! Configuration for the node agent.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nimbus_id::NodeId;

/// Which virtualization backend starts instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Firecracker,
    Mock,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "firecracker" => Ok(Self::Firecracker),
            "mock" => Ok(Self::Mock),
            other => bail!("unknown backend '{other}', expected 'firecracker' or 'mock'"),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Firecracker => "firecracker",
            Self::Mock => "mock",
        })
    }
}

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Address of this node, handed to backends.
    pub node_ip: IpAddr,

    /// Root under which every instance gets its own directory.
    pub instances_dir: PathBuf,

    /// Allocate a VNIC for each instance.
    pub networking_enabled: bool,

    /// Storage cluster this node belongs to, if any.
    pub storage_cluster_id: Option<String>,

    /// Deadline for VNIC allocation.
    pub vnic_timeout: Duration,

    /// Upper bound on starts running at the same time.
    pub max_concurrent_starts: usize,

    pub backend: BackendKind,

    /// Path to the firecracker binary.
    pub firecracker_path: PathBuf,

    /// Guest kernel image.
    pub kernel_path: PathBuf,

    /// Directory of `<image>.ext4` backing images.
    pub images_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        // Node ID can be provided or auto-generated
        let node_id = match get("NIMBUS_NODE_ID") {
            Some(s) => NodeId::parse(&s).context("invalid NIMBUS_NODE_ID")?,
            None => NodeId::new(),
        };

        let node_ip = parse_or(get("NIMBUS_NODE_IP"), "NIMBUS_NODE_IP", IpAddr::from([127, 0, 0, 1]))?;

        let instances_dir = get("NIMBUS_INSTANCES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/nimbus/instances"));

        let networking_enabled = match get("NIMBUS_NETWORKING") {
            Some(v) => parse_bool(&v).context("invalid NIMBUS_NETWORKING")?,
            None => false,
        };

        let storage_cluster_id = get("NIMBUS_STORAGE_CLUSTER_ID");

        let vnic_timeout_secs: u64 = parse_or(
            get("NIMBUS_VNIC_TIMEOUT_SECS"),
            "NIMBUS_VNIC_TIMEOUT_SECS",
            30,
        )?;
        if vnic_timeout_secs == 0 {
            bail!("NIMBUS_VNIC_TIMEOUT_SECS must be greater than zero");
        }

        let max_concurrent_starts: usize = parse_or(
            get("NIMBUS_MAX_CONCURRENT_STARTS"),
            "NIMBUS_MAX_CONCURRENT_STARTS",
            4,
        )?;
        if max_concurrent_starts == 0 {
            bail!("NIMBUS_MAX_CONCURRENT_STARTS must be greater than zero");
        }

        let backend = parse_or(get("NIMBUS_BACKEND"), "NIMBUS_BACKEND", BackendKind::Firecracker)?;

        let firecracker_path = get("NIMBUS_FIRECRACKER_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/usr/bin/firecracker"));

        let kernel_path = get("NIMBUS_KERNEL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/nimbus/kernel/vmlinux"));

        let images_dir = get("NIMBUS_IMAGES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/nimbus/images"));

        let log_level = get("NIMBUS_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            node_id,
            node_ip,
            instances_dir,
            networking_enabled,
            storage_cluster_id,
            vnic_timeout: Duration::from_secs(vnic_timeout_secs),
            max_concurrent_starts,
            backend,
            firecracker_path,
            kernel_path,
            images_dir,
            log_level,
        })
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match value {
        Some(v) => v
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key} '{v}': {e}")),
        None => Ok(default),
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rstest::rstest;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();

        assert_eq!(config.node_ip, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(config.instances_dir, PathBuf::from("/var/lib/nimbus/instances"));
        assert!(!config.networking_enabled);
        assert!(config.storage_cluster_id.is_none());
        assert_eq!(config.vnic_timeout, Duration::from_secs(30));
        assert_eq!(config.max_concurrent_starts, 4);
        assert_eq!(config.backend, BackendKind::Firecracker);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_overrides() {
        let node_id = NodeId::new();
        let config = load(&[
            ("NIMBUS_NODE_ID", &node_id.to_string()),
            ("NIMBUS_NODE_IP", "10.1.2.3"),
            ("NIMBUS_INSTANCES_DIR", "/srv/instances"),
            ("NIMBUS_NETWORKING", "true"),
            ("NIMBUS_STORAGE_CLUSTER_ID", "ceph-a"),
            ("NIMBUS_VNIC_TIMEOUT_SECS", "5"),
            ("NIMBUS_MAX_CONCURRENT_STARTS", "16"),
            ("NIMBUS_BACKEND", "mock"),
        ])
        .unwrap();

        assert_eq!(config.node_id, node_id);
        assert_eq!(config.node_ip, IpAddr::from([10, 1, 2, 3]));
        assert_eq!(config.instances_dir, PathBuf::from("/srv/instances"));
        assert!(config.networking_enabled);
        assert_eq!(config.storage_cluster_id.as_deref(), Some("ceph-a"));
        assert_eq!(config.vnic_timeout, Duration::from_secs(5));
        assert_eq!(config.max_concurrent_starts, 16);
        assert_eq!(config.backend, BackendKind::Mock);
    }

    #[rstest]
    #[case("NIMBUS_NODE_ID", "node_nope")]
    #[case("NIMBUS_NODE_IP", "10.0.0")]
    #[case("NIMBUS_NETWORKING", "maybe")]
    #[case("NIMBUS_VNIC_TIMEOUT_SECS", "soon")]
    #[case("NIMBUS_VNIC_TIMEOUT_SECS", "0")]
    #[case("NIMBUS_MAX_CONCURRENT_STARTS", "0")]
    #[case("NIMBUS_BACKEND", "qemu")]
    fn test_malformed_values_are_errors(#[case] key: &str, #[case] value: &str) {
        let err = load(&[(key, value)]).unwrap_err();
        assert!(format!("{err:#}").contains(key), "{err:#}");
    }

    #[test]
    fn test_empty_value_means_unset() {
        let config = load(&[("NIMBUS_STORAGE_CLUSTER_ID", ""), ("NIMBUS_NODE_IP", "")]).unwrap();
        assert!(config.storage_cluster_id.is_none());
        assert_eq!(config.node_ip, IpAddr::from([127, 0, 0, 1]));
    }
}

//! Instance network interfaces.
//!
//! When cluster networking is enabled every instance gets one VNIC: a TAP
//! device on the node, enslaved to the bridge of the instance's tenant
//! subnet. Allocation goes through a [`ControllerConnection`] because the
//! controller has to learn about new tenant bridges on this node.
//!
//! - `tap`: local provisioner built on bridges and TAP devices
//! - `mock`: recording test double

mod mock;
mod tap;

use std::net::Ipv4Addr;
use std::os::fd::OwnedFd;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use nimbus_networking::{Ipv4Subnet, MacAddr, VnicConfig, VnicRole, MTU_DEFAULT_ETHERNET};
use thiserror::Error;

use crate::instance::InstanceConfig;

pub use mock::{ConnectionCall, MockConnection};
pub use tap::{NetworkEvent, TapNetwork, TapNetworkConfig};

/// Errors from VNIC allocation.
#[derive(Debug, Error)]
pub enum VnicError {
    #[error("network resources exhausted: {0}")]
    Exhausted(String),

    #[error("invalid VNIC configuration: {0}")]
    InvalidConfig(String),

    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("TAP device error: {0}")]
    Tap(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A successfully allocated VNIC.
#[derive(Debug)]
pub struct VnicAllocation {
    /// Interface the instance attaches to.
    pub name: String,
    pub bridge: String,
    pub gateway: Ipv4Addr,
    /// Kernel handles owned by the instance once it runs.
    pub fds: Vec<OwnedFd>,
}

/// Network provisioning capability of the controller connection.
#[async_trait]
pub trait ControllerConnection: Send + Sync {
    /// Allocate the VNIC described by `config`.
    ///
    /// Must be cancel safe: if the future is dropped before it resolves,
    /// whatever it allocated is released by the implementation.
    async fn create_vnic(&self, config: &VnicConfig) -> Result<VnicAllocation, VnicError>;

    /// Release a VNIC previously returned by `create_vnic`. Releasing one
    /// that was never allocated does nothing.
    ///
    /// Failures are logged by the implementation; callers cannot act on them.
    async fn destroy_vnic(&self, config: &VnicConfig);
}

/// Build the VNIC request for an instance.
///
/// Fails when the command has no network section or any of its values is
/// malformed or inconsistent.
pub fn vnic_config_for(config: &InstanceConfig) -> Result<VnicConfig> {
    let net = config
        .network
        .as_ref()
        .ok_or_else(|| anyhow!("instance {} has no network configuration", config.instance))?;

    let mac: MacAddr = net.mac.parse()?;
    let ip: Ipv4Addr = net
        .ip
        .parse()
        .with_context(|| format!("invalid instance IP '{}'", net.ip))?;
    let subnet = Ipv4Subnet::from_cidr(&net.subnet)?;
    let concentrator_ip: Ipv4Addr = net
        .concentrator_ip
        .parse()
        .with_context(|| format!("invalid concentrator IP '{}'", net.concentrator_ip))?;

    let vnic = VnicConfig {
        role: if config.container {
            VnicRole::TenantContainer
        } else {
            VnicRole::TenantVm
        },
        instance_id: config.instance.to_string(),
        tenant_id: config.tenant,
        vnic_id: net.vnic_id,
        mac,
        ip,
        subnet,
        subnet_key: net.subnet_key,
        concentrator_ip,
        mtu: net.mtu.unwrap_or(MTU_DEFAULT_ETHERNET),
    };
    vnic.validate()?;

    Ok(vnic)
}

#[cfg(test)]
mod tests {
    use nimbus_id::InstanceId;
    use uuid::Uuid;

    use super::*;
    use crate::instance::{InstanceNetwork, Resources};

    fn config(network: Option<InstanceNetwork>) -> InstanceConfig {
        InstanceConfig {
            instance: InstanceId::parse("vm-030").unwrap(),
            tenant: Uuid::from_u128(1),
            image: "alpine".to_string(),
            resources: Resources::default(),
            network,
            container: false,
            restart: false,
        }
    }

    fn network() -> InstanceNetwork {
        InstanceNetwork {
            vnic_id: Uuid::from_u128(2),
            mac: "02:00:0a:00:00:05".to_string(),
            ip: "10.0.0.5".to_string(),
            subnet: "10.0.0.0/24".to_string(),
            subnet_key: 42,
            concentrator_ip: "192.168.0.2".to_string(),
            mtu: None,
        }
    }

    #[test]
    fn test_builds_vm_vnic() {
        let vnic = vnic_config_for(&config(Some(network()))).unwrap();

        assert_eq!(vnic.role, VnicRole::TenantVm);
        assert_eq!(vnic.instance_id, "vm-030");
        assert_eq!(vnic.ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(vnic.mtu, MTU_DEFAULT_ETHERNET);
        assert_eq!(vnic.gateway(), Some(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_container_role() {
        let mut cfg = config(Some(network()));
        cfg.container = true;
        assert_eq!(vnic_config_for(&cfg).unwrap().role, VnicRole::TenantContainer);
    }

    #[test]
    fn test_missing_network_section() {
        let err = vnic_config_for(&config(None)).unwrap_err();
        assert!(err.to_string().contains("no network configuration"));
    }

    #[test]
    fn test_malformed_values_rejected() {
        let cases = [
            InstanceNetwork { mac: "zz".into(), ..network() },
            InstanceNetwork { ip: "10.0.0".into(), ..network() },
            InstanceNetwork { subnet: "10.0.0.0".into(), ..network() },
            InstanceNetwork { concentrator_ip: "".into(), ..network() },
            InstanceNetwork { ip: "10.0.1.5".into(), ..network() },
            InstanceNetwork { mtu: Some(20), ..network() },
        ];

        for net in cases {
            assert!(vnic_config_for(&config(Some(net.clone()))).is_err(), "{net:?}");
        }
    }
}

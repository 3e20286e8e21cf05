//! Bridge and TAP based VNIC provisioning.
//!
//! Host-side layout per tenant subnet:
//! - one bridge `br<subnet key>` carrying the subnet gateway address
//! - one TAP device `vn<vnic id suffix>` per instance, enslaved to the bridge
//!
//! Bridges are reference counted across the VNICs on this node. Creating
//! the first VNIC of a subnet emits [`NetworkEvent::TenantAdded`], removing
//! the last one emits [`NetworkEvent::TenantRemoved`]; whoever owns the
//! controller transport forwards these so the concentrator can set up or
//! tear down the subnet tunnel to this node. Releasing a VNIC that was never
//! allocated is a no-op.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use nimbus_networking::{validate_ifname, Ipv4Subnet, VnicConfig};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ControllerConnection, VnicAllocation, VnicError};

/// Network change the controller has to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    TenantAdded {
        tenant_id: Uuid,
        subnet: Ipv4Subnet,
        subnet_key: u32,
        bridge: String,
        concentrator_ip: Ipv4Addr,
    },
    TenantRemoved {
        tenant_id: Uuid,
        subnet_key: u32,
        bridge: String,
    },
}

/// TAP provisioner configuration.
#[derive(Debug, Clone)]
pub struct TapNetworkConfig {
    /// `ip` binary from iproute2.
    pub ip_path: PathBuf,
    /// TUN/TAP clone device.
    pub tun_path: PathBuf,
}

impl Default for TapNetworkConfig {
    fn default() -> Self {
        Self {
            ip_path: PathBuf::from("ip"),
            tun_path: PathBuf::from("/dev/net/tun"),
        }
    }
}

#[derive(Debug)]
struct BridgeState {
    tenant_id: Uuid,
    subnet_key: u32,
    refs: usize,
}

/// Provisioner bookkeeping.
#[derive(Debug, Default)]
struct State {
    /// Live bridges by name.
    bridges: HashMap<String, BridgeState>,
    /// Bridge of every allocated VNIC, by VNIC id.
    vnics: HashMap<Uuid, String>,
}

/// Local VNIC provisioner.
///
/// Allocation is cancel safe: it runs on its own task, and an allocation
/// whose requester has gone away is released again by that task.
#[derive(Clone)]
pub struct TapNetwork {
    inner: Arc<Inner>,
}

struct Inner {
    config: TapNetworkConfig,
    /// Held across bridge and TAP setup so two VNICs of a new subnet cannot
    /// both try to create its bridge.
    state: Mutex<State>,
    events: mpsc::UnboundedSender<NetworkEvent>,
}

impl TapNetwork {
    pub fn new(config: TapNetworkConfig, events: mpsc::UnboundedSender<NetworkEvent>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                events,
            }),
        }
    }

    /// Number of VNICs currently attached to `bridge`.
    #[cfg(test)]
    async fn bridge_refs(&self, bridge: &str) -> usize {
        self.inner
            .state
            .lock()
            .await
            .bridges
            .get(bridge)
            .map_or(0, |b| b.refs)
    }
}

impl Inner {
    async fn run_ip(&self, args: &[&str]) -> Result<(), VnicError> {
        let output = Command::new(&self.config.ip_path)
            .args(args)
            .output()
            .await?;

        if !output.status.success() {
            return Err(VnicError::CommandFailed {
                command: format!("ip {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn delete_link(&self, name: &str) {
        if let Err(e) = self.run_ip(&["link", "delete", name]).await {
            warn!(link = %name, error = %e, "Failed to delete link");
        }
    }

    async fn create_bridge(&self, name: &str, gateway: Ipv4Addr, vnic: &VnicConfig) -> Result<(), VnicError> {
        info!(bridge = %name, subnet = %vnic.subnet, "Creating tenant bridge");

        self.run_ip(&["link", "add", "name", name, "type", "bridge"]).await?;

        let address = format!("{}/{}", gateway, vnic.subnet.prefix_len());
        let mtu = vnic.mtu.to_string();
        let steps: [&[&str]; 3] = [
            &["link", "set", "dev", name, "mtu", mtu.as_str()],
            &["addr", "add", address.as_str(), "dev", name],
            &["link", "set", "dev", name, "up"],
        ];
        for args in steps {
            if let Err(e) = self.run_ip(args).await {
                self.delete_link(name).await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn create_tap(&self, name: &str, bridge: &str, mtu: u16) -> Result<OwnedFd, VnicError> {
        self.run_ip(&["tuntap", "add", "dev", name, "mode", "tap"]).await?;

        let result = async {
            let fd = open_tap_queue(&self.config.tun_path, name)?;
            let mtu = mtu.to_string();
            self.run_ip(&["link", "set", "dev", name, "mtu", &mtu]).await?;
            self.run_ip(&["link", "set", "dev", name, "master", bridge]).await?;
            self.run_ip(&["link", "set", "dev", name, "up"]).await?;
            Ok::<_, VnicError>(fd)
        }
        .await;

        if result.is_err() {
            self.delete_link(name).await;
        }
        result
    }

    async fn allocate(&self, config: &VnicConfig) -> Result<VnicAllocation, VnicError> {
        let gateway = config
            .gateway()
            .ok_or_else(|| VnicError::InvalidConfig(format!("no gateway in {}", config.subnet)))?;
        let bridge = config.bridge_name();
        let tap = config.tap_name();
        for name in [&bridge, &tap] {
            validate_ifname(name).map_err(|e| VnicError::InvalidConfig(e.to_string()))?;
        }

        let mut state = self.state.lock().await;

        if state.vnics.contains_key(&config.vnic_id) {
            return Err(VnicError::InvalidConfig(format!(
                "VNIC {} is already allocated",
                config.vnic_id
            )));
        }

        let new_bridge = !state.bridges.contains_key(&bridge);
        if new_bridge {
            self.create_bridge(&bridge, gateway, config).await?;
        }

        let fd = match self.create_tap(&tap, &bridge, config.mtu).await {
            Ok(fd) => fd,
            Err(e) => {
                if new_bridge {
                    self.delete_link(&bridge).await;
                }
                return Err(e);
            }
        };

        state
            .bridges
            .entry(bridge.clone())
            .or_insert(BridgeState {
                tenant_id: config.tenant_id,
                subnet_key: config.subnet_key,
                refs: 0,
            })
            .refs += 1;
        state.vnics.insert(config.vnic_id, bridge.clone());
        drop(state);

        if new_bridge {
            let _ = self.events.send(NetworkEvent::TenantAdded {
                tenant_id: config.tenant_id,
                subnet: config.subnet,
                subnet_key: config.subnet_key,
                bridge: bridge.clone(),
                concentrator_ip: config.concentrator_ip,
            });
        }

        debug!(tap = %tap, bridge = %bridge, instance_id = %config.instance_id, "VNIC created");

        Ok(VnicAllocation {
            name: tap,
            bridge,
            gateway,
            fds: vec![fd],
        })
    }

    async fn release(&self, config: &VnicConfig) {
        let tap = config.tap_name();

        let mut state = self.state.lock().await;
        let Some(bridge) = state.vnics.remove(&config.vnic_id) else {
            debug!(tap = %tap, instance_id = %config.instance_id, "Ignoring release of unallocated VNIC");
            return;
        };

        info!(tap = %tap, instance_id = %config.instance_id, "Deleting VNIC");
        self.delete_link(&tap).await;

        let Some(bridge_state) = state.bridges.get_mut(&bridge) else {
            warn!(bridge = %bridge, "Released VNIC on untracked bridge");
            return;
        };

        bridge_state.refs = bridge_state.refs.saturating_sub(1);
        if bridge_state.refs > 0 {
            return;
        }

        let (tenant_id, subnet_key) = (bridge_state.tenant_id, bridge_state.subnet_key);
        state.bridges.remove(&bridge);
        self.delete_link(&bridge).await;
        drop(state);

        let _ = self.events.send(NetworkEvent::TenantRemoved {
            tenant_id,
            subnet_key,
            bridge,
        });
    }
}

#[async_trait]
impl ControllerConnection for TapNetwork {
    async fn create_vnic(&self, config: &VnicConfig) -> Result<VnicAllocation, VnicError> {
        let inner = Arc::clone(&self.inner);
        let config = config.clone();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let result = inner.allocate(&config).await;
            if let Err(Ok(allocation)) = tx.send(result) {
                warn!(instance_id = %config.instance_id, "VNIC requester went away, releasing allocation");
                drop(allocation);
                inner.release(&config).await;
            }
        });

        rx.await
            .map_err(|e| VnicError::Tap(format!("VNIC allocation task ended early: {e}")))?
    }

    async fn destroy_vnic(&self, config: &VnicConfig) {
        self.inner.release(config).await;
    }
}

// ============================================================================
// TUN/TAP queue
// ============================================================================

const TUNSETIFF: u64 = 0x4004_54ca;
const IFF_TAP: i16 = 0x0002;
const IFF_NO_PI: i16 = 0x1000;

/// `struct ifreq` restricted to the name and flags members.
#[repr(C)]
struct IfReq {
    name: [u8; libc::IFNAMSIZ],
    flags: i16,
    _pad: [u8; 22],
}

/// Attach a queue to an existing TAP device and return its fd.
fn open_tap_queue(tun_path: &std::path::Path, name: &str) -> Result<OwnedFd, VnicError> {
    if name.len() >= libc::IFNAMSIZ {
        return Err(VnicError::InvalidConfig(format!("TAP name too long: {}", name)));
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_CLOEXEC | libc::O_NONBLOCK)
        .open(tun_path)?;

    let mut req = IfReq {
        name: [0; libc::IFNAMSIZ],
        flags: IFF_TAP | IFF_NO_PI,
        _pad: [0; 22],
    };
    req.name[..name.len()].copy_from_slice(name.as_bytes());

    // SAFETY: `req` is a properly sized, initialised ifreq and outlives the call.
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req as *mut IfReq) };
    if rc < 0 {
        return Err(VnicError::Tap(format!(
            "TUNSETIFF {} failed: {}",
            name,
            std::io::Error::last_os_error()
        )));
    }

    Ok(OwnedFd::from(file))
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;

    use nimbus_networking::VnicRole;

    use super::*;

    /// `ip` stand-in that stalls on `ip tuntap` and accepts everything else.
    fn slow_ip(dir: &Path) -> PathBuf {
        let path = dir.join("ip");
        std::fs::write(&path, "#!/bin/sh\n[ \"$1\" = tuntap ] && sleep 1\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn vnic() -> VnicConfig {
        VnicConfig {
            role: VnicRole::TenantVm,
            instance_id: "vm-040".to_string(),
            tenant_id: Uuid::from_u128(9),
            vnic_id: Uuid::from_u128(0x40),
            mac: "02:00:0a:00:00:05".parse().unwrap(),
            ip: "10.0.0.5".parse().unwrap(),
            subnet: Ipv4Subnet::from_cidr("10.0.0.0/24").unwrap(),
            subnet_key: 7,
            concentrator_ip: "192.168.0.2".parse().unwrap(),
            mtu: 1500,
        }
    }

    #[test]
    fn test_ifreq_layout() {
        assert_eq!(std::mem::size_of::<IfReq>(), 40);
    }

    #[tokio::test]
    async fn test_failed_tap_unwinds_new_bridge() {
        // `true` accepts every ip invocation; a regular file is not a TUN device.
        let tun = tempfile::NamedTempFile::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let network = TapNetwork::new(
            TapNetworkConfig {
                ip_path: PathBuf::from("true"),
                tun_path: tun.path().to_path_buf(),
            },
            tx,
        );

        let err = network.create_vnic(&vnic()).await.unwrap_err();
        assert!(matches!(err, VnicError::Tap(_)), "{err}");
        assert_eq!(network.bridge_refs("br00000007").await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failing_ip_reports_command() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let network = TapNetwork::new(
            TapNetworkConfig {
                ip_path: PathBuf::from("false"),
                ..TapNetworkConfig::default()
            },
            tx,
        );

        let err = network.create_vnic(&vnic()).await.unwrap_err();
        assert!(
            matches!(&err, VnicError::CommandFailed { command, .. } if command.starts_with("ip link add")),
            "{err}"
        );
    }

    #[tokio::test]
    async fn test_destroy_untracked_is_quiet() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let network = TapNetwork::new(
            TapNetworkConfig {
                ip_path: PathBuf::from("true"),
                ..TapNetworkConfig::default()
            },
            tx,
        );

        network.destroy_vnic(&vnic()).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_abandoned_allocation_keeps_shared_bridge() {
        let bin = tempfile::TempDir::new().unwrap();
        let tun = tempfile::NamedTempFile::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let network = TapNetwork::new(
            TapNetworkConfig {
                ip_path: slow_ip(bin.path()),
                tun_path: tun.path().to_path_buf(),
            },
            tx,
        );

        // Another instance of the subnet is running on the bridge.
        {
            let mut state = network.inner.state.lock().await;
            state.bridges.insert(
                "br00000007".to_string(),
                BridgeState {
                    tenant_id: Uuid::from_u128(9),
                    subnet_key: 7,
                    refs: 1,
                },
            );
            state.vnics.insert(Uuid::from_u128(0x41), "br00000007".to_string());
        }

        let abandoned = tokio::time::timeout(Duration::from_millis(200), network.create_vnic(&vnic())).await;
        assert!(abandoned.is_err());

        // Never allocated, so this must not touch the bridge.
        network.destroy_vnic(&vnic()).await;
        // Let the allocation task run out.
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(network.bridge_refs("br00000007").await, 1);
        assert!(rx.try_recv().is_err());
    }
}

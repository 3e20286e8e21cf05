//! Start pipeline.
//!
//! Drives one instance from nonexistent to running:
//!
//! ```text
//! existence check -> backing image -> VNIC (if networking) -> instance resources -> start VM
//! ```
//!
//! Stages run strictly in order. Each failure is classified where it
//! happens, and a VNIC allocated earlier is released exactly once before
//! the error is returned. After a successful start the VNIC and its fds
//! belong to the running instance.

use std::net::IpAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::Utc;
use nimbus_networking::VnicConfig;
use tracing::{debug, error, info, warn};

use crate::command::StartCommand;
use crate::config::Config;
use crate::creator::create_instance;
use crate::error::{FailureReason, StartError};
use crate::network::{vnic_config_for, ControllerConnection, VnicAllocation};
use crate::timing::StartTimes;
use crate::virtualizer::Virtualizer;

/// Node-wide settings read by every start. Fixed for the launcher's lifetime.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Allocate a VNIC for each instance.
    pub networking_enabled: bool,
    /// This node's own address, passed to the backend.
    pub node_ip: IpAddr,
    /// Storage cluster identity for backends with network-attached disks.
    pub storage_cluster_id: Option<String>,
    /// Deadline for the VNIC allocation round trip.
    pub vnic_timeout: Duration,
}

impl From<&Config> for LauncherConfig {
    fn from(config: &Config) -> Self {
        Self {
            networking_enabled: config.networking_enabled,
            node_ip: config.node_ip,
            storage_cluster_id: config.storage_cluster_id.clone(),
            vnic_timeout: config.vnic_timeout,
        }
    }
}

/// Runs the start pipeline.
#[derive(Debug, Clone)]
pub struct Launcher {
    config: LauncherConfig,
}

impl Launcher {
    pub fn new(config: LauncherConfig) -> Self {
        Self { config }
    }

    /// Start the instance described by `cmd` in `instance_dir`.
    ///
    /// Run the returned future to completion. Once a VNIC is allocated,
    /// dropping it closes the VNIC's fds but leaves the VNIC allocated;
    /// [`StartDispatcher`](crate::StartDispatcher) runs every start on a
    /// detached task and never aborts one.
    pub async fn start(
        &self,
        cmd: &StartCommand,
        instance_dir: &Path,
        vm: &dyn Virtualizer,
        conn: &dyn ControllerConnection,
    ) -> Result<StartTimes, StartError> {
        let started_at = Utc::now();
        let start = Instant::now();
        let cfg = &cmd.config;
        let restart = cmd.restart();
        let fail = |reason: FailureReason, cause: anyhow::Error| StartError::new(reason, restart, cause);

        info!(instance_id = %cfg.instance, restart, "Starting instance");

        // Checked first: failing any later stage would otherwise delete an
        // instance that already exists.
        if tokio::fs::symlink_metadata(instance_dir).await.is_ok() {
            warn!(instance_id = %cfg.instance, path = %instance_dir.display(), "Instance already exists");
            return Err(fail(
                FailureReason::InstanceExists,
                anyhow!("Instance {} has already been created", cfg.instance),
            ));
        }

        if let Err(e) = vm.ensure_backing_image().await {
            error!(instance_id = %cfg.instance, error = %e, "Backing image unavailable");
            return Err(fail(FailureReason::ImageFailure, e));
        }
        let backing_image_check = Instant::now();

        let vnic = if self.config.networking_enabled {
            let vnic_cfg = vnic_config_for(cfg).map_err(|e| {
                error!(instance_id = %cfg.instance, error = %e, "Could not create VNIC config");
                fail(FailureReason::InvalidData, e)
            })?;
            let allocation = self.allocate_vnic(&vnic_cfg, conn).await.map_err(|e| {
                error!(instance_id = %cfg.instance, error = %e, "VNIC allocation failed");
                fail(FailureReason::NetworkFailure, e)
            })?;
            Some((vnic_cfg, allocation))
        } else {
            None
        };
        let network = Instant::now();

        let (bridge, gateway_ip) = match &vnic {
            Some((_, alloc)) => (alloc.bridge.clone(), alloc.gateway.to_string()),
            None => (String::new(), String::new()),
        };

        if let Err(e) = create_instance(
            vm,
            instance_dir,
            cfg,
            &bridge,
            &gateway_ip,
            &cmd.user_data,
            &cmd.meta_data,
        )
        .await
        {
            release(vnic, conn).await;
            return Err(fail(FailureReason::ImageFailure, e.into()));
        }
        let creation = Instant::now();

        // The fds move into the backend; the config stays here in case the
        // start fails and the VNIC has to be released.
        let (vnic_cfg, vnic_name, fds) = match vnic {
            Some((vnic_cfg, alloc)) => (Some(vnic_cfg), alloc.name, alloc.fds),
            None => (None, String::new(), Vec::new()),
        };

        if let Err(e) = vm
            .start_vm(
                &vnic_name,
                self.config.node_ip,
                self.config.storage_cluster_id.as_deref(),
                fds,
            )
            .await
        {
            error!(instance_id = %cfg.instance, error = %e, "Failed to start VM");
            if let Some(vnic_cfg) = &vnic_cfg {
                conn.destroy_vnic(vnic_cfg).await;
            }
            return Err(fail(FailureReason::LaunchFailure, e));
        }
        let run = Instant::now();

        let times = StartTimes {
            started_at,
            start,
            backing_image_check,
            network,
            creation,
            run,
        };
        let d = times.durations();
        info!(
            instance_id = %cfg.instance,
            backing_image_ms = d.backing_image_ms,
            network_ms = d.network_ms,
            creation_ms = d.creation_ms,
            run_ms = d.run_ms,
            total_ms = d.total_ms,
            "Instance started"
        );

        Ok(times)
    }

    /// Allocate a VNIC, bounded by the configured deadline.
    async fn allocate_vnic(
        &self,
        vnic_cfg: &VnicConfig,
        conn: &dyn ControllerConnection,
    ) -> anyhow::Result<VnicAllocation> {
        match tokio::time::timeout(self.config.vnic_timeout, conn.create_vnic(vnic_cfg)).await {
            Ok(Ok(allocation)) => {
                debug!(
                    instance_id = %vnic_cfg.instance_id,
                    vnic = %allocation.name,
                    bridge = %allocation.bridge,
                    gateway = %allocation.gateway,
                    "VNIC allocated"
                );
                Ok(allocation)
            }
            Ok(Err(e)) => Err(e.into()),
            // Connections undo a dropped allocation themselves.
            Err(_) => Err(anyhow!(
                "VNIC allocation timed out after {:?}",
                self.config.vnic_timeout
            )),
        }
    }
}

/// Release a VNIC after a failed stage. Dropping the allocation closes its fds.
async fn release(vnic: Option<(VnicConfig, VnicAllocation)>, conn: &dyn ControllerConnection) {
    if let Some((vnic_cfg, allocation)) = vnic {
        drop(allocation);
        conn.destroy_vnic(&vnic_cfg).await;
    }
}

#[cfg(test)]
mod tests {
    use nimbus_id::InstanceId;
    use tempfile::TempDir;
    use uuid::Uuid;

    use super::*;
    use crate::instance::{InstanceConfig, InstanceNetwork, Resources};
    use crate::network::MockConnection;
    use crate::virtualizer::{MockFault, MockVirtualizer, VirtualizerCall};

    fn launcher(networking_enabled: bool) -> Launcher {
        Launcher::new(LauncherConfig {
            networking_enabled,
            node_ip: "192.168.1.10".parse().unwrap(),
            storage_cluster_id: None,
            vnic_timeout: Duration::from_millis(200),
        })
    }

    fn command(id: &str) -> StartCommand {
        StartCommand::new(InstanceConfig {
            instance: InstanceId::parse(id).unwrap(),
            tenant: Uuid::from_u128(1),
            image: "alpine".to_string(),
            resources: Resources::default(),
            network: Some(InstanceNetwork {
                vnic_id: Uuid::from_u128(9),
                mac: "02:00:0a:00:00:07".to_string(),
                ip: "10.0.0.7".to_string(),
                subnet: "10.0.0.0/24".to_string(),
                subnet_key: 3,
                concentrator_ip: "192.168.0.2".to_string(),
                mtu: None,
            }),
            container: false,
            restart: false,
        })
    }

    #[tokio::test]
    async fn test_networked_start_hands_allocation_to_backend() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("vm-060");
        let vm = MockVirtualizer::new().with_instance_dir(&dir);
        let conn = MockConnection::new().with_fd_count(2);

        launcher(true)
            .start(&command("vm-060"), &dir, &vm, &conn)
            .await
            .unwrap();

        let calls = vm.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(
            &calls[1],
            VirtualizerCall::CreateImage { bridge, gateway_ip, .. }
                if bridge == "br00000003" && gateway_ip == "10.0.0.1"
        ));
        assert!(matches!(
            &calls[2],
            VirtualizerCall::StartVm { vnic_name, fd_count: 2, .. } if vnic_name.starts_with("vn")
        ));
        assert!(conn.destroyed().is_empty());
    }

    #[tokio::test]
    async fn test_existing_dir_is_left_alone() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("vm-061");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("keep"), b"x").unwrap();
        let vm = MockVirtualizer::new();
        let conn = MockConnection::new();

        let err = launcher(true)
            .start(&command("vm-061"), &dir, &vm, &conn)
            .await
            .unwrap_err();

        assert_eq!(err.reason(), FailureReason::InstanceExists);
        assert!(dir.join("keep").exists());
        assert!(vm.calls().is_empty());
        assert!(conn.calls().is_empty());
    }

    #[tokio::test]
    async fn test_launch_failure_releases_vnic() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("vm-062");
        let vm = MockVirtualizer::failing(MockFault::StartVm).with_instance_dir(&dir);
        let conn = MockConnection::new();

        let err = launcher(true)
            .start(&command("vm-062"), &dir, &vm, &conn)
            .await
            .unwrap_err();

        assert_eq!(err.reason(), FailureReason::LaunchFailure);
        assert_eq!(conn.destroyed(), conn.created());
        assert_eq!(conn.destroyed().len(), 1);
    }

    #[tokio::test]
    async fn test_allocation_timeout_is_network_failure() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("vm-063");
        let vm = MockVirtualizer::new();
        let conn = MockConnection::new().with_delay(Duration::from_secs(5));

        let err = launcher(true)
            .start(&command("vm-063"), &dir, &vm, &conn)
            .await
            .unwrap_err();

        assert_eq!(err.reason(), FailureReason::NetworkFailure);
        assert!(err.to_string().contains("timed out"));
        assert!(conn.destroyed().is_empty());
        assert!(!dir.exists());
    }
}

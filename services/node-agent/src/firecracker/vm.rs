//! Firecracker-backed virtualizer.
//!
//! Instance directory layout:
//!
//! ```text
//! <instance dir>/
//! ├── instance.json        persisted config (written by the pipeline)
//! ├── rootfs.ext4          private copy of the backing image
//! ├── seed/                user-data, meta-data, network.json
//! ├── firecracker.socket   API socket of the running VMM
//! └── firecracker.log      VMM stdout and stderr
//! ```

use std::collections::HashMap;
use std::net::IpAddr;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use nimbus_id::{BootId, InstanceId};
use nimbus_networking::MacAddr;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use super::api::FirecrackerClient;
use super::config::{
    BootSource, DriveConfig, GuestNetwork, MachineConfig, MmdsConfig, MmdsData, NetworkInterface,
};
use crate::instance::InstanceConfig;
use crate::network::vnic_config_for;
use crate::virtualizer::{Backend, Virtualizer};

pub const ROOTFS_FILE: &str = "rootfs.ext4";
pub const SEED_DIR: &str = "seed";
const SOCKET_FILE: &str = "firecracker.socket";
const LOG_FILE: &str = "firecracker.log";

/// How long a freshly spawned VMM gets to bring up its API.
const API_READY_TIMEOUT: Duration = Duration::from_secs(5);
const API_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound firecracker puts on `--id`.
const MAX_VMM_ID_LEN: usize = 64;

/// Configuration for the Firecracker backend.
#[derive(Debug, Clone)]
pub struct FirecrackerConfig {
    /// Path to the firecracker binary.
    pub firecracker_path: PathBuf,
    /// Guest kernel shared by all instances.
    pub kernel_path: PathBuf,
    /// Directory holding `<image>.ext4` backing images.
    pub images_dir: PathBuf,
}

/// A VMM this node started.
struct RunningVm {
    boot_id: BootId,
    #[allow(dead_code)]
    process: Child,
}

/// Builds [`FirecrackerVm`]s and keeps track of the VMMs they start.
#[derive(Clone)]
pub struct FirecrackerBackend {
    config: Arc<FirecrackerConfig>,
    running: Arc<Mutex<HashMap<InstanceId, RunningVm>>>,
}

impl FirecrackerBackend {
    pub fn new(config: FirecrackerConfig) -> Self {
        Self {
            config: Arc::new(config),
            running: Arc::default(),
        }
    }

    /// Instances with a VMM started by this backend.
    #[cfg(test)]
    fn running(&self) -> Vec<InstanceId> {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn register(&self, id: InstanceId, vm: RunningVm) {
        let replaced = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), vm);
        if let Some(old) = replaced {
            warn!(instance_id = %id, boot_id = %old.boot_id, "Replaced registry entry of a previous boot");
        }
    }
}

impl Backend for FirecrackerBackend {
    fn virtualizer(&self, config: &InstanceConfig, instance_dir: &Path) -> Box<dyn Virtualizer> {
        Box::new(FirecrackerVm {
            backend: self.clone(),
            instance: config.clone(),
            dir: instance_dir.to_path_buf(),
        })
    }
}

/// Firecracker virtualizer bound to one instance.
pub struct FirecrackerVm {
    backend: FirecrackerBackend,
    instance: InstanceConfig,
    dir: PathBuf,
}

impl FirecrackerVm {
    fn backing_image(&self) -> Result<PathBuf> {
        let image = &self.instance.image;
        if image.is_empty() || image.starts_with('.') || image.contains('/') {
            bail!("invalid image name '{image}'");
        }
        Ok(self.backend.config.images_dir.join(format!("{image}.ext4")))
    }

    /// Static addressing for the guest, from the instance's network section.
    fn guest_network(&self) -> Result<(GuestNetwork, MacAddr)> {
        let vnic = vnic_config_for(&self.instance)?;
        let gateway = vnic
            .gateway()
            .ok_or_else(|| anyhow!("subnet {} has no gateway", vnic.subnet))?;
        let guest = GuestNetwork {
            ip: vnic.ip,
            gateway,
            netmask: vnic.subnet.netmask(),
        };
        Ok((guest, vnic.mac))
    }

    /// Spawn the VMM and wait for its API to answer.
    async fn spawn(&self) -> Result<(Child, FirecrackerClient)> {
        let socket = self.dir.join(SOCKET_FILE);
        match tokio::fs::remove_file(&socket).await {
            Ok(()) => debug!(path = %socket.display(), "Removed stale API socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("failed to remove stale API socket"),
        }

        let log = std::fs::File::create(self.dir.join(LOG_FILE))
            .context("failed to create firecracker log")?;
        let log_err = log.try_clone()?;

        let mut child = Command::new(&self.backend.config.firecracker_path)
            .arg("--api-sock")
            .arg(&socket)
            .arg("--id")
            .arg(vmm_id(&self.instance.instance))
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .spawn()
            .with_context(|| {
                format!(
                    "failed to spawn {}",
                    self.backend.config.firecracker_path.display()
                )
            })?;

        let client = FirecrackerClient::new(&socket);
        if let Err(e) = wait_for_api(&client, &mut child).await {
            kill(&mut child, &self.instance.instance).await;
            return Err(e);
        }
        Ok((child, client))
    }

    async fn configure(
        &self,
        client: &FirecrackerClient,
        vnic_name: &str,
        guest: Option<&(GuestNetwork, MacAddr)>,
        node_ip: IpAddr,
        storage_cluster_id: Option<&str>,
        boot_id: BootId,
    ) -> Result<()> {
        let resources = self.instance.resources;
        client
            .put_machine_config(&MachineConfig::new(resources.vcpus, resources.mem_mib))
            .await
            .context("machine config")?;

        let boot = BootSource::new(
            self.backend.config.kernel_path.clone(),
            guest.map(|(net, _)| net),
        );
        client.put_boot_source(&boot).await.context("boot source")?;

        client
            .put_drive(&DriveConfig::root_disk(self.dir.join(ROOTFS_FILE)))
            .await
            .context("root drive")?;

        // The metadata service is reachable only through a guest interface.
        if let Some((_, mac)) = guest {
            client
                .put_network_interface(&NetworkInterface::new(vnic_name).with_mac(mac))
                .await
                .context("network interface")?;
            client
                .put_mmds_config(&MmdsConfig::default())
                .await
                .context("metadata service config")?;

            let data = MmdsData {
                instance_id: self.instance.instance.to_string(),
                boot_id: boot_id.to_string(),
                node_ip: node_ip.to_string(),
                storage_cluster_id: storage_cluster_id.map(str::to_string),
                user_data: STANDARD.encode(self.read_seed("user-data").await?),
                meta_data: STANDARD.encode(self.read_seed("meta-data").await?),
            };
            client.put_mmds(&data).await.context("metadata store")?;
        }

        client.start_instance().await.context("instance start")?;
        Ok(())
    }

    async fn read_seed(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.dir.join(SEED_DIR).join(name);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))
    }
}

#[async_trait]
impl Virtualizer for FirecrackerVm {
    async fn ensure_backing_image(&self) -> Result<()> {
        require_file(&self.backend.config.kernel_path, "kernel").await?;
        require_file(&self.backing_image()?, "backing image").await?;
        debug!(instance_id = %self.instance.instance, image = %self.instance.image, "Backing image present");
        Ok(())
    }

    async fn create_image(
        &self,
        bridge: &str,
        gateway_ip: &str,
        user_data: &[u8],
        meta_data: &[u8],
    ) -> Result<()> {
        let base = self.backing_image()?;
        let rootfs = self.dir.join(ROOTFS_FILE);

        tokio::fs::copy(&base, &rootfs)
            .await
            .with_context(|| format!("failed to copy {} to {}", base.display(), rootfs.display()))?;

        let disk_bytes = u64::from(self.instance.resources.disk_mib) * 1024 * 1024;
        if disk_bytes > 0 {
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&rootfs)
                .await?;
            if file.metadata().await?.len() < disk_bytes {
                file.set_len(disk_bytes)
                    .await
                    .context("failed to extend root disk")?;
            }
        }

        let seed = self.dir.join(SEED_DIR);
        tokio::fs::create_dir(&seed)
            .await
            .context("failed to create seed directory")?;
        tokio::fs::write(seed.join("user-data"), user_data).await?;
        tokio::fs::write(seed.join("meta-data"), meta_data).await?;

        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        let network = serde_json::json!({
            "bridge": non_empty(bridge),
            "gateway_ip": non_empty(gateway_ip),
            "interface": self.instance.network,
        });
        tokio::fs::write(seed.join("network.json"), serde_json::to_vec_pretty(&network)?).await?;

        info!(instance_id = %self.instance.instance, rootfs = %rootfs.display(), "Instance image created");
        Ok(())
    }

    async fn start_vm(
        &self,
        vnic_name: &str,
        node_ip: IpAddr,
        storage_cluster_id: Option<&str>,
        fds: Vec<OwnedFd>,
    ) -> Result<()> {
        let id = &self.instance.instance;

        // Firecracker attaches to the TAP by name, and a single-queue TAP
        // takes one attachment. The device is persistent and outlives the fd.
        if !fds.is_empty() {
            debug!(instance_id = %id, count = fds.len(), "Closing TAP queues before VMM start");
        }
        drop(fds);

        let guest = if vnic_name.is_empty() {
            None
        } else {
            Some(self.guest_network()?)
        };

        let boot_id = BootId::new();
        info!(instance_id = %id, boot_id = %boot_id, vnic = %vnic_name, "Starting Firecracker VM");

        let (mut process, client) = self.spawn().await?;

        if let Err(e) = self
            .configure(
                &client,
                vnic_name,
                guest.as_ref(),
                node_ip,
                storage_cluster_id,
                boot_id,
            )
            .await
        {
            error!(instance_id = %id, error = %e, "Failed to configure VM");
            kill(&mut process, id).await;
            return Err(e);
        }

        self.backend.register(
            id.clone(),
            RunningVm { boot_id, process },
        );
        info!(instance_id = %id, boot_id = %boot_id, "VM started");
        Ok(())
    }
}

async fn require_file(path: &Path, what: &str) -> Result<()> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("{what} {} not found", path.display()))?;
    if !meta.is_file() {
        bail!("{what} {} is not a regular file", path.display());
    }
    Ok(())
}

async fn wait_for_api(client: &FirecrackerClient, child: &mut Child) -> Result<()> {
    let deadline = tokio::time::Instant::now() + API_READY_TIMEOUT;
    loop {
        if let Some(status) = child.try_wait()? {
            bail!("firecracker exited before its API came up: {status}");
        }
        if client.socket_path().exists() && client.instance_info().await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("firecracker API did not come up within {API_READY_TIMEOUT:?}");
        }
        tokio::time::sleep(API_POLL_INTERVAL).await;
    }
}

async fn kill(child: &mut Child, id: &InstanceId) {
    if let Err(e) = child.kill().await {
        warn!(instance_id = %id, error = %e, "Failed to kill firecracker");
    }
}

/// VMM id for an instance: `[A-Za-z0-9-]`, at most 64 characters.
fn vmm_id(id: &InstanceId) -> String {
    id.as_str()
        .chars()
        .take(MAX_VMM_ID_LEN)
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

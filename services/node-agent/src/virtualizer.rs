//! Virtualization backend interface and mock implementation.
//!
//! A [`Virtualizer`] is bound to a single instance and knows how to:
//! - make sure the backing image the instance derives from is present
//! - create the instance's own image inside its directory
//! - start the machine
//!
//! A [`Backend`] builds virtualizers. A mock implementation of both is
//! provided for testing and development.

use std::net::IpAddr;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::instance::InstanceConfig;

/// Per-instance virtualization backend.
///
/// Network arguments are empty strings when cluster networking is disabled.
#[async_trait]
pub trait Virtualizer: Send + Sync {
    /// Make sure the backing image exists on this node.
    async fn ensure_backing_image(&self) -> Result<()>;

    /// Create the instance image inside the instance directory.
    ///
    /// Implementations may panic on unrecoverable internal faults; the
    /// caller contains the panic and removes the instance directory.
    async fn create_image(
        &self,
        bridge: &str,
        gateway_ip: &str,
        user_data: &[u8],
        meta_data: &[u8],
    ) -> Result<()>;

    /// Start the machine.
    ///
    /// `fds` are the kernel handles of the instance's network interface.
    /// They belong to the backend from here on, whether or not the start
    /// succeeds.
    async fn start_vm(
        &self,
        vnic_name: &str,
        node_ip: IpAddr,
        storage_cluster_id: Option<&str>,
        fds: Vec<OwnedFd>,
    ) -> Result<()>;
}

/// Builds per-instance virtualizers.
pub trait Backend: Send + Sync {
    fn virtualizer(&self, config: &InstanceConfig, instance_dir: &Path) -> Box<dyn Virtualizer>;
}

// =============================================================================
// Mock
// =============================================================================

/// A call observed by [`MockVirtualizer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VirtualizerCall {
    EnsureBackingImage,
    CreateImage {
        bridge: String,
        gateway_ip: String,
        user_data: Vec<u8>,
        meta_data: Vec<u8>,
    },
    StartVm {
        vnic_name: String,
        node_ip: IpAddr,
        storage_cluster_id: Option<String>,
        fd_count: usize,
    },
}

/// Where the mock should fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MockFault {
    #[default]
    None,
    EnsureBackingImage,
    CreateImage,
    /// Panic in the middle of `create_image`, after writing a partial image.
    CreateImagePanic,
    StartVm,
}

/// Name of the partial image file the mock writes during `create_image`.
pub const MOCK_IMAGE_FILE: &str = "disk.img";

/// Mock virtualizer for testing and development.
///
/// Clones share the call log, so a test can keep one handle while the
/// pipeline drives another. The fds of a started VM stay open until the
/// last clone is dropped.
#[derive(Debug, Clone, Default)]
pub struct MockVirtualizer {
    fault: MockFault,
    instance_dir: Option<PathBuf>,
    calls: Arc<Mutex<Vec<VirtualizerCall>>>,
    held_fds: Arc<Mutex<Vec<OwnedFd>>>,
}

impl MockVirtualizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock that fails at the given point.
    pub fn failing(fault: MockFault) -> Self {
        Self {
            fault,
            ..Self::default()
        }
    }

    /// Bind the mock to an instance directory so `create_image` leaves an
    /// artifact there.
    pub fn with_instance_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.instance_dir = Some(dir.into());
        self
    }

    /// Calls observed so far, across all clones.
    pub fn calls(&self) -> Vec<VirtualizerCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, call: VirtualizerCall) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }
}

#[async_trait]
impl Virtualizer for MockVirtualizer {
    async fn ensure_backing_image(&self) -> Result<()> {
        self.record(VirtualizerCall::EnsureBackingImage);
        if self.fault == MockFault::EnsureBackingImage {
            anyhow::bail!("Mock backing image missing");
        }
        debug!("[MOCK] Backing image present");
        Ok(())
    }

    async fn create_image(
        &self,
        bridge: &str,
        gateway_ip: &str,
        user_data: &[u8],
        meta_data: &[u8],
    ) -> Result<()> {
        self.record(VirtualizerCall::CreateImage {
            bridge: bridge.to_string(),
            gateway_ip: gateway_ip.to_string(),
            user_data: user_data.to_vec(),
            meta_data: meta_data.to_vec(),
        });

        if let Some(dir) = &self.instance_dir {
            tokio::fs::write(dir.join(MOCK_IMAGE_FILE), b"partial").await?;
        }

        match self.fault {
            MockFault::CreateImage => anyhow::bail!("Mock image creation failed"),
            MockFault::CreateImagePanic => panic!("mock backend aborted during image creation"),
            _ => {}
        }

        info!(bridge = %bridge, "[MOCK] Image created");
        Ok(())
    }

    async fn start_vm(
        &self,
        vnic_name: &str,
        node_ip: IpAddr,
        storage_cluster_id: Option<&str>,
        fds: Vec<OwnedFd>,
    ) -> Result<()> {
        self.record(VirtualizerCall::StartVm {
            vnic_name: vnic_name.to_string(),
            node_ip,
            storage_cluster_id: storage_cluster_id.map(str::to_string),
            fd_count: fds.len(),
        });

        if self.fault == MockFault::StartVm {
            anyhow::bail!("Mock runtime configured to fail");
        }

        self.held_fds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(fds);
        info!(vnic = %vnic_name, "[MOCK] VM started");
        Ok(())
    }
}

impl Backend for MockVirtualizer {
    fn virtualizer(&self, _config: &InstanceConfig, instance_dir: &Path) -> Box<dyn Virtualizer> {
        Box::new(self.clone().with_instance_dir(instance_dir))
    }
}

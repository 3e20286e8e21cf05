//! Firecracker microVM backend.
//!
//! - `api`: HTTP client for Firecracker's Unix socket API
//! - `config`: API configuration objects (machine, boot, drives, network, MMDS)
//! - `vm`: [`Backend`](crate::virtualizer::Backend) and
//!   [`Virtualizer`](crate::virtualizer::Virtualizer) implementations

mod api;
mod config;
mod vm;

pub use api::{ApiError, FirecrackerClient, InstanceInfo};
pub use config::{
    BootSource, DriveConfig, GuestNetwork, MachineConfig, MmdsConfig, MmdsData, NetworkInterface,
};
pub use vm::{FirecrackerBackend, FirecrackerConfig, FirecrackerVm, ROOTFS_FILE, SEED_DIR};

//! Instance resource creation.
//!
//! Creates the instance directory, asks the backend for the instance image
//! and persists the configuration. Once the directory exists, nothing that
//! goes wrong may leave it behind: errors, backend panics and cancellation
//! of the surrounding task all remove it.

use std::any::Any;
use std::os::unix::fs::PermissionsExt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};

use futures_util::FutureExt;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::instance::InstanceConfig;
use crate::virtualizer::Virtualizer;

/// Permissions of an instance directory: rwx for owner and group.
pub const INSTANCE_DIR_MODE: u32 = 0o775;

/// Errors from instance resource creation.
#[derive(Debug, Error)]
pub enum CreateError {
    #[error("cannot create instance directory {}: {source}", path.display())]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unable to set permissions on {}: {source}", path.display())]
    Permissions {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unable to create image: {0:#}")]
    Image(anyhow::Error),

    #[error("failed to store instance config: {0:#}")]
    Persist(anyhow::Error),

    #[error("backend aborted during image creation: {0}")]
    BackendAborted(String),
}

/// Create the instance directory, image and persisted config.
///
/// `bridge` and `gateway_ip` are empty when networking is disabled.
pub async fn create_instance(
    vm: &dyn Virtualizer,
    instance_dir: &Path,
    config: &InstanceConfig,
    bridge: &str,
    gateway_ip: &str,
    user_data: &[u8],
    meta_data: &[u8],
) -> Result<(), CreateError> {
    tokio::fs::DirBuilder::new()
        .recursive(true)
        .mode(INSTANCE_DIR_MODE)
        .create(instance_dir)
        .await
        .map_err(|source| {
            error!(path = %instance_dir.display(), error = %source, "Cannot create instance directory");
            CreateError::Directory {
                path: instance_dir.to_path_buf(),
                source,
            }
        })?;

    // The mode passed to mkdir is filtered by the umask.
    tokio::fs::set_permissions(
        instance_dir,
        std::fs::Permissions::from_mode(INSTANCE_DIR_MODE),
    )
    .await
    .map_err(|source| {
        error!(path = %instance_dir.display(), error = %source, "Unable to set instance directory permissions");
        CreateError::Permissions {
            path: instance_dir.to_path_buf(),
            source,
        }
    })?;

    let guard = InstanceDirGuard::new(instance_dir);

    let populate = async {
        vm.create_image(bridge, gateway_ip, user_data, meta_data)
            .await
            .map_err(|e| {
                error!(instance_id = %config.instance, error = %e, "Unable to create image");
                CreateError::Image(e)
            })?;

        config.save(instance_dir).await.map_err(|e| {
            error!(instance_id = %config.instance, error = %e, "Failed to store state information");
            CreateError::Persist(e)
        })
    };

    let result = match AssertUnwindSafe(populate).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(instance_id = %config.instance, panic = %message, "Backend aborted during image creation");
            Err(CreateError::BackendAborted(message))
        }
    };

    if result.is_ok() {
        guard.disarm();
        debug!(instance_id = %config.instance, "Instance resources created");
    }
    result
}

/// Removes an instance directory when dropped, unless disarmed.
struct InstanceDirGuard {
    path: Option<PathBuf>,
}

impl InstanceDirGuard {
    fn new(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
        }
    }

    fn disarm(mut self) {
        self.path = None;
    }
}

impl Drop for InstanceDirGuard {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        match std::fs::remove_dir_all(&path) {
            Ok(()) => debug!(path = %path.display(), "Removed instance directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove instance directory"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

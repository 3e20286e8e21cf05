//! Recording controller connection for tests and development.

use std::fs::File;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nimbus_networking::VnicConfig;
use tracing::info;

use super::{ControllerConnection, VnicAllocation, VnicError};

/// A call observed by [`MockConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionCall {
    CreateVnic(VnicConfig),
    DestroyVnic(VnicConfig),
}

/// Controller connection that allocates nothing real.
///
/// Allocations hand out handles to `/dev/null`, or the handles given to
/// [`with_handles`](Self::with_handles), so ownership of the fds can still be
/// observed.
#[derive(Debug, Clone)]
pub struct MockConnection {
    fail: bool,
    delay: Option<Duration>,
    fd_count: usize,
    handles: Arc<Mutex<Vec<OwnedFd>>>,
    calls: Arc<Mutex<Vec<ConnectionCall>>>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self {
            fail: false,
            delay: None,
            fd_count: 1,
            handles: Arc::default(),
            calls: Arc::default(),
        }
    }

    /// Create a mock whose allocations always fail.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    /// Delay every allocation by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_fd_count(mut self, count: usize) -> Self {
        self.fd_count = count;
        self
    }

    /// Hand out `fds` on the next allocation.
    pub fn with_handles(self, fds: Vec<OwnedFd>) -> Self {
        *self.handles.lock().unwrap_or_else(|e| e.into_inner()) = fds;
        self
    }

    pub fn calls(&self) -> Vec<ConnectionCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Configs passed to `create_vnic`.
    pub fn created(&self) -> Vec<VnicConfig> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ConnectionCall::CreateVnic(cfg) => Some(cfg),
                ConnectionCall::DestroyVnic(_) => None,
            })
            .collect()
    }

    /// Configs passed to `destroy_vnic`.
    pub fn destroyed(&self) -> Vec<VnicConfig> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ConnectionCall::DestroyVnic(cfg) => Some(cfg),
                ConnectionCall::CreateVnic(_) => None,
            })
            .collect()
    }

    fn record(&self, call: ConnectionCall) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControllerConnection for MockConnection {
    async fn create_vnic(&self, config: &VnicConfig) -> Result<VnicAllocation, VnicError> {
        self.record(ConnectionCall::CreateVnic(config.clone()));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(VnicError::Exhausted(format!(
                "[MOCK] no VNIC for subnet {}",
                config.subnet
            )));
        }

        let gateway = config
            .gateway()
            .ok_or_else(|| VnicError::InvalidConfig(format!("no gateway in {}", config.subnet)))?;
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        let fds = if handles.is_empty() {
            (0..self.fd_count)
                .map(|_| File::open("/dev/null").map(OwnedFd::from))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            handles
        };

        info!(instance_id = %config.instance_id, "[MOCK] VNIC allocated");
        Ok(VnicAllocation {
            name: config.tap_name(),
            bridge: config.bridge_name(),
            gateway,
            fds,
        })
    }

    async fn destroy_vnic(&self, config: &VnicConfig) {
        self.record(ConnectionCall::DestroyVnic(config.clone()));
        info!(instance_id = %config.instance_id, "[MOCK] VNIC released");
    }
}

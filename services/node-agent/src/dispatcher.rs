//! Concurrent start dispatch.
//!
//! Each submitted command runs the start pipeline on its own task. A
//! semaphore bounds how many starts run at once, and every command
//! produces exactly one [`StartReport`] on the report channel.

use std::path::PathBuf;
use std::sync::Arc;

use nimbus_id::InstanceId;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::command::StartCommand;
use crate::error::{FailureReason, StartFailure};
use crate::instance::instance_dir;
use crate::launcher::Launcher;
use crate::network::ControllerConnection;
use crate::timing::StartDurations;
use crate::virtualizer::Backend;

/// Outcome of one start command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartReport {
    Started {
        instance_id: InstanceId,
        durations: StartDurations,
    },
    Failed(StartFailure),
}

impl StartReport {
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            Self::Started { instance_id, .. } => instance_id,
            Self::Failed(failure) => &failure.instance_id,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Runs start commands concurrently, up to a fixed limit.
#[derive(Clone)]
pub struct StartDispatcher {
    launcher: Arc<Launcher>,
    backend: Arc<dyn Backend>,
    conn: Arc<dyn ControllerConnection>,
    instances_dir: PathBuf,
    permits: Arc<Semaphore>,
    reports: mpsc::UnboundedSender<StartReport>,
}

impl StartDispatcher {
    /// Create a dispatcher and the receiving end of its report channel.
    ///
    /// A limit of zero is treated as one.
    pub fn new(
        launcher: Arc<Launcher>,
        backend: Arc<dyn Backend>,
        conn: Arc<dyn ControllerConnection>,
        instances_dir: impl Into<PathBuf>,
        max_concurrent_starts: usize,
    ) -> (Self, mpsc::UnboundedReceiver<StartReport>) {
        let (reports, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            launcher,
            backend,
            conn,
            instances_dir: instances_dir.into(),
            permits: Arc::new(Semaphore::new(max_concurrent_starts.max(1))),
            reports,
        };
        (dispatcher, rx)
    }

    /// Start permits not currently held.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `cmd` on a new task. Its report arrives on the report channel.
    pub fn submit(&self, cmd: StartCommand) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let report = this.run(cmd).await;
            if this.reports.send(report).is_err() {
                warn!("Start report dropped, receiver closed");
            }
        })
    }

    async fn run(&self, cmd: StartCommand) -> StartReport {
        let instance_id = cmd.config.instance.clone();

        // The semaphore is never closed, so acquiring only fails if that changes.
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                return StartReport::Failed(StartFailure {
                    instance_id,
                    reason: FailureReason::LaunchFailure,
                    restart: cmd.restart(),
                    message: format!("start dispatcher closed: {e}"),
                });
            }
        };
        debug!(instance_id = %instance_id, "Start permit acquired");

        let dir = instance_dir(&self.instances_dir, &instance_id);
        let vm = self.backend.virtualizer(&cmd.config, &dir);

        match self
            .launcher
            .start(&cmd, &dir, vm.as_ref(), self.conn.as_ref())
            .await
        {
            Ok(times) => StartReport::Started {
                instance_id,
                durations: times.durations(),
            },
            Err(e) => StartReport::Failed(e.to_failure(&instance_id)),
        }
    }
}

//! Start pipeline checkpoints.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monotonic checkpoints of a successful start.
///
/// Only used for diagnostics; nothing in the pipeline branches on them.
#[derive(Debug, Clone, Copy)]
pub struct StartTimes {
    /// Wall-clock time the pipeline began, for correlating with logs.
    pub started_at: DateTime<Utc>,
    pub start: Instant,
    pub backing_image_check: Instant,
    pub network: Instant,
    pub creation: Instant,
    pub run: Instant,
}

impl StartTimes {
    /// Per-stage durations in milliseconds.
    pub fn durations(&self) -> StartDurations {
        let ms = |from: Instant, to: Instant| to.saturating_duration_since(from).as_millis() as u64;

        StartDurations {
            backing_image_ms: ms(self.start, self.backing_image_check),
            network_ms: ms(self.backing_image_check, self.network),
            creation_ms: ms(self.network, self.creation),
            run_ms: ms(self.creation, self.run),
            total_ms: ms(self.start, self.run),
        }
    }

    /// Checkpoints in pipeline order.
    pub fn checkpoints(&self) -> [Instant; 5] {
        [
            self.start,
            self.backing_image_check,
            self.network,
            self.creation,
            self.run,
        ]
    }
}

/// Stage durations reported alongside a successful start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartDurations {
    pub backing_image_ms: u64,
    pub network_ms: u64,
    pub creation_ms: u64,
    pub run_ms: u64,
    pub total_ms: u64,
}

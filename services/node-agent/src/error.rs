//! Start failure taxonomy.
//!
//! Every failed start request produces exactly one [`StartError`]. Its
//! [`FailureReason`] is part of the agent/controller protocol: the wire
//! strings below must never change meaning or spelling.

use std::fmt;
use std::str::FromStr;

use nimbus_id::InstanceId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a start request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The instance directory already exists on this node.
    InstanceExists,
    /// Backing image check, image creation or config persistence failed.
    ImageFailure,
    /// The command's network section could not be turned into a VNIC request.
    InvalidData,
    /// The network interface could not be allocated.
    NetworkFailure,
    /// The backend could not start the machine.
    LaunchFailure,
}

impl FailureReason {
    pub const ALL: [FailureReason; 5] = [
        FailureReason::InstanceExists,
        FailureReason::ImageFailure,
        FailureReason::InvalidData,
        FailureReason::NetworkFailure,
        FailureReason::LaunchFailure,
    ];

    /// Wire value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InstanceExists => "instance_exists",
            Self::ImageFailure => "image_failure",
            Self::InvalidData => "invalid_data",
            Self::NetworkFailure => "network_failure",
            Self::LaunchFailure => "launch_failure",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown failure reason '{0}'")]
pub struct UnknownFailureReason(String);

impl FromStr for FailureReason {
    type Err = UnknownFailureReason;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| UnknownFailureReason(s.to_string()))
    }
}

/// A classified start failure.
///
/// The restart hint is always the flag carried by the incoming command;
/// the agent leaves retry policy to the controller.
#[derive(Debug, Error)]
#[error("{reason}: {cause:#}")]
pub struct StartError {
    cause: anyhow::Error,
    reason: FailureReason,
    restart: bool,
}

impl StartError {
    pub fn new(reason: FailureReason, restart: bool, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            cause: cause.into(),
            reason,
            restart,
        }
    }

    pub fn reason(&self) -> FailureReason {
        self.reason
    }

    pub fn restart(&self) -> bool {
        self.restart
    }

    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }

    /// Wire form reported to the controller.
    pub fn to_failure(&self, instance_id: &InstanceId) -> StartFailure {
        StartFailure {
            instance_id: instance_id.clone(),
            reason: self.reason,
            restart: self.restart,
            message: format!("{:#}", self.cause),
        }
    }
}

/// Start failure as sent to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartFailure {
    pub instance_id: InstanceId,
    pub reason: FailureReason,
    pub restart: bool,
    pub message: String,
}

//! nimbus Node Agent Library
//!
//! The node agent runs on each compute node and turns start commands from
//! the controller into running instances.
//!
//! ## Start pipeline
//!
//! ```text
//! StartDispatcher
//! └── Launcher::start (one task per command)
//!     ├── existence check
//!     ├── Virtualizer::ensure_backing_image
//!     ├── ControllerConnection::create_vnic   (networking only)
//!     ├── creator::create_instance            (directory, image, instance.json)
//!     └── Virtualizer::start_vm
//! ```
//!
//! ## Modules
//!
//! - `launcher`: the start pipeline and its rollback rules
//! - `creator`: instance directory and image creation
//! - `network`: VNIC allocation (TAP provisioner and mock)
//! - `virtualizer`: backend interface and mock backend
//! - `firecracker`: Firecracker microVM backend
//! - `dispatcher`: bounded concurrent starts and their reports

pub mod command;
pub mod config;
pub mod creator;
pub mod dispatcher;
pub mod error;
pub mod firecracker;
pub mod instance;
pub mod launcher;
pub mod network;
pub mod timing;
pub mod virtualizer;

// Re-export commonly used types
pub use command::StartCommand;
pub use dispatcher::{StartDispatcher, StartReport};
pub use error::{FailureReason, StartError, StartFailure};
pub use instance::{InstanceConfig, InstanceNetwork, Resources};
pub use launcher::{Launcher, LauncherConfig};
pub use timing::{StartDurations, StartTimes};
pub use virtualizer::{Backend, MockVirtualizer, Virtualizer};

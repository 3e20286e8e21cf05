//! # nimbus-id
//!
//! Typed identifiers used by the nimbus node agent.
//!
//! Two families of IDs exist:
//!
//! - **Agent-generated IDs** (`NodeId`, `BootId`) use a prefixed ULID format,
//!   `{prefix}_{ulid}`, e.g. `node_01HV4Z2WQXKJNM8GPQY6VBKC3D`.
//! - **Caller-supplied IDs** (`InstanceId`) are chosen by the cluster
//!   controller and only validated here. An instance ID doubles as the name
//!   of the instance's directory on disk, so it must be a single, safe path
//!   component.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;

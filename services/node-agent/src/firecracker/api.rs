//! Firecracker HTTP API client.
//!
//! Talks to a single firecracker process over its Unix socket. Only the
//! pre-boot configuration calls and `InstanceStart` are needed to bring a
//! machine up.
//!
//! Reference: https://github.com/firecracker-microvm/firecracker/blob/main/src/api_server/swagger/firecracker.yaml

use std::path::{Path, PathBuf};

use hyper::{body::Buf, Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use super::config::{BootSource, DriveConfig, MachineConfig, MmdsConfig, NetworkInterface};

/// Errors from the Firecracker API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error {status} on {path}: {message}")]
    Api {
        path: String,
        status: u16,
        message: String,
    },
}

/// Firecracker API client for Unix socket communication.
pub struct FirecrackerClient {
    socket_path: PathBuf,
    client: Client<UnixConnector>,
}

impl FirecrackerClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            client: Client::unix(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn put_machine_config(&self, config: &MachineConfig) -> Result<(), ApiError> {
        self.put("/machine-config", config).await
    }

    pub async fn put_boot_source(&self, config: &BootSource) -> Result<(), ApiError> {
        self.put("/boot-source", config).await
    }

    pub async fn put_drive(&self, config: &DriveConfig) -> Result<(), ApiError> {
        self.put(&format!("/drives/{}", config.drive_id), config).await
    }

    pub async fn put_network_interface(&self, config: &NetworkInterface) -> Result<(), ApiError> {
        self.put(&format!("/network-interfaces/{}", config.iface_id), config)
            .await
    }

    /// Enable the metadata service on the given interfaces.
    pub async fn put_mmds_config(&self, config: &MmdsConfig) -> Result<(), ApiError> {
        self.put("/mmds/config", config).await
    }

    /// Replace the metadata store contents.
    pub async fn put_mmds<T: Serialize>(&self, data: &T) -> Result<(), ApiError> {
        self.put("/mmds", data).await
    }

    /// Boot the configured machine.
    pub async fn start_instance(&self) -> Result<(), ApiError> {
        #[derive(Serialize)]
        struct Action {
            action_type: &'static str,
        }
        self.put("/actions", &Action { action_type: "InstanceStart" })
            .await
    }

    /// Describe the firecracker process. Answers as soon as the API is up.
    pub async fn instance_info(&self) -> Result<InstanceInfo, ApiError> {
        let response = self.send(Method::GET, "/", Body::empty()).await?;
        Ok(serde_json::from_reader(response.reader())?)
    }

    async fn put<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<(), ApiError> {
        let body = Body::from(serde_json::to_vec(body)?);
        self.send(Method::PUT, path, body).await.map(drop)
    }

    async fn send(&self, method: Method, path: &str, body: Body) -> Result<impl Buf, ApiError> {
        debug!(method = %method, path = path, "Firecracker API request");

        let request = Request::builder()
            .method(method)
            .uri(Uri::new(&self.socket_path, path))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(body)?;

        let response = self.client.request(request).await?;
        let status = response.status();
        let mut body = hyper::body::aggregate(response.into_body()).await?;

        if status.is_success() {
            Ok(body)
        } else {
            let message = fault_message(body.copy_to_bytes(body.remaining()));
            error!(status = %status, path = path, message = %message, "Firecracker API error");
            Err(ApiError::Api {
                path: path.to_string(),
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// Process description returned by `GET /`.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceInfo {
    pub app_name: String,
    pub id: String,
    pub state: String,
    pub vmm_version: String,
}

/// Extract `fault_message` from an error body, falling back to the raw text.
fn fault_message(body: impl AsRef<[u8]>) -> String {
    #[derive(Deserialize)]
    struct Fault {
        fault_message: String,
    }
    let body = body.as_ref();
    serde_json::from_slice::<Fault>(body)
        .map(|f| f.fault_message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned())
}

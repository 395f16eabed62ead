pub mod client;
pub mod server;

pub use client::{SidecarApi, SidecarClient};

/// Generated wire types for `proto/sidecar.proto`.
pub mod pb {
    tonic::include_proto!("arl.sidecar.v1");
}

/// Unix socket the executor agent listens on inside every pool pod.
pub const EXEC_SOCKET_PATH: &str = "/var/run/arl/exec.sock";

/// Window the sidecar allows the executor agent to come up at startup.
pub const EXECUTOR_READY_WINDOW_SECS: u64 = 60;

/// `container` value routing a command through the executor agent.
pub const CONTAINER_EXECUTOR: &str = "executor";

/// Name of the injected sidecar container; a template container with this
/// name is taken as a user-supplied replacement and left unwrapped.
pub const CONTAINER_SIDECAR: &str = "sidecar";

/// Failure kinds surfaced to callers of the wire protocol. The client maps
/// transport-level detail onto these and never retries internally.
#[derive(Debug, thiserror::Error)]
pub enum SidecarError {
    #[error("sidecar unreachable at {endpoint}: {message}")]
    Unreachable { endpoint: String, message: String },

    #[error("sidecar deadline exceeded: {0}")]
    Timeout(String),

    #[error("sidecar protocol error: {0}")]
    ProtocolError(String),

    #[error("executor agent not ready: {0}")]
    ExecutorNotReady(String),
}

impl SidecarError {
    pub(crate) fn from_status(endpoint: &str, status: tonic::Status) -> Self {
        use tonic::Code;
        match status.code() {
            Code::DeadlineExceeded => SidecarError::Timeout(status.message().to_string()),
            Code::Unavailable => SidecarError::Unreachable {
                endpoint: endpoint.to_string(),
                message: status.message().to_string(),
            },
            Code::FailedPrecondition => {
                SidecarError::ExecutorNotReady(status.message().to_string())
            }
            _ => SidecarError::ProtocolError(format!("{}: {}", status.code(), status.message())),
        }
    }
}

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};

use super::{SidecarError, pb};

/// The two wire operations the task executor drives. Kept as a trait so step
/// execution can be tested against a scripted fake.
#[async_trait]
pub trait SidecarApi: Send + Sync {
    async fn update_files(
        &self,
        base_path: &str,
        files: BTreeMap<String, String>,
    ) -> Result<pb::UpdateFilesResponse, SidecarError>;

    async fn execute(
        &self,
        request: pb::ExecuteRequest,
    ) -> Result<pb::ExecuteResponse, SidecarError>;
}

/// Thin client over one pod's RPC endpoint. Stateless; a clone per call is
/// cheap because `Channel` multiplexes.
#[derive(Clone)]
pub struct SidecarClient {
    channel: Channel,
    endpoint: String,
}

impl SidecarClient {
    /// Connect to `(pod_ip, port)`. `timeout` caps every RPC issued through
    /// this client; longer-running commands pass their own deadline in the
    /// request and the server enforces it.
    pub async fn connect(
        pod_ip: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Self, SidecarError> {
        let endpoint = format!("http://{pod_ip}:{port}");
        let channel = Endpoint::try_from(endpoint.clone())
            .map_err(|e| SidecarError::ProtocolError(format!("bad endpoint {endpoint}: {e}")))?
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .connect()
            .await
            .map_err(|e| SidecarError::Unreachable {
                endpoint: endpoint.clone(),
                message: e.to_string(),
            })?;
        Ok(Self { channel, endpoint })
    }

    /// Wrap an already-established channel (unix-socket dials in tests).
    pub fn from_channel(channel: Channel, endpoint: String) -> Self {
        Self { channel, endpoint }
    }

    fn stub(&self) -> pb::sidecar_client::SidecarClient<Channel> {
        pb::sidecar_client::SidecarClient::new(self.channel.clone())
    }

    pub async fn signal_process(&self, pid: i32, signal: i32) -> Result<(), SidecarError> {
        self.stub()
            .signal_process(pb::SignalProcessRequest { pid, signal })
            .await
            .map(|_| ())
            .map_err(|s| SidecarError::from_status(&self.endpoint, s))
    }

    pub async fn reset(&self) -> Result<pb::ResetResponse, SidecarError> {
        self.stub()
            .reset(pb::ResetRequest {})
            .await
            .map(|r| r.into_inner())
            .map_err(|s| SidecarError::from_status(&self.endpoint, s))
    }

    /// Open the bidirectional shell stream. The caller owns both directions:
    /// feed frames through `input`, read echoes/output from the returned
    /// stream, and drop either end to terminate.
    pub async fn interactive_shell(
        &self,
        input: impl tokio_stream::Stream<Item = pb::ShellFrame> + Send + 'static,
    ) -> Result<tonic::Streaming<pb::ShellFrame>, SidecarError> {
        self.stub()
            .interactive_shell(input)
            .await
            .map(|r| r.into_inner())
            .map_err(|s| SidecarError::from_status(&self.endpoint, s))
    }
}

#[async_trait]
impl SidecarApi for SidecarClient {
    async fn update_files(
        &self,
        base_path: &str,
        files: BTreeMap<String, String>,
    ) -> Result<pb::UpdateFilesResponse, SidecarError> {
        self.stub()
            .update_files(pb::UpdateFilesRequest {
                base_path: base_path.to_string(),
                files: files.into_iter().collect(),
                patch: false,
            })
            .await
            .map(|r| r.into_inner())
            .map_err(|s| SidecarError::from_status(&self.endpoint, s))
    }

    async fn execute(
        &self,
        request: pb::ExecuteRequest,
    ) -> Result<pb::ExecuteResponse, SidecarError> {
        self.stub()
            .execute(request)
            .await
            .map(|r| r.into_inner())
            .map_err(|s| SidecarError::from_status(&self.endpoint, s))
    }
}

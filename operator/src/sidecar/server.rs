use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint, Server};
use tonic::{Request, Response, Status, Streaming};

use super::{CONTAINER_EXECUTOR, SidecarError, pb};

/// Bound on the drain of in-flight RPCs once shutdown is requested.
pub const SHUTDOWN_WINDOW: Duration = Duration::from_secs(10);

const DEFAULT_EXEC_TIMEOUT_SECS: i64 = 30;

/// Exit code reported when a command outlives its deadline, matching the
/// coreutils `timeout` convention.
const TIMEOUT_EXIT_CODE: i32 = 124;

/// The in-pod half of the wire protocol: executes against the local
/// filesystem and process table, and proxies `container = "executor"` calls
/// over the agent's unix socket.
pub struct SidecarService {
    workspace_dir: PathBuf,
    executor_socket: PathBuf,
}

impl SidecarService {
    pub fn new(workspace_dir: impl Into<PathBuf>, executor_socket: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            executor_socket: executor_socket.into(),
        }
    }

    fn resolve(&self, base_path: &str, rel_path: &str) -> PathBuf {
        let rel = Path::new(rel_path);
        if rel.is_absolute() {
            return rel.to_path_buf();
        }
        if base_path.is_empty() {
            self.workspace_dir.join(rel)
        } else {
            Path::new(base_path).join(rel)
        }
    }

    async fn execute_local(&self, req: pb::ExecuteRequest) -> Result<pb::ExecuteResponse, Status> {
        let Some((program, args)) = req.command.split_first() else {
            return Err(Status::invalid_argument("execute: empty command"));
        };
        let timeout_secs = if req.timeout_seconds > 0 {
            req.timeout_seconds
        } else {
            DEFAULT_EXEC_TIMEOUT_SECS
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(req.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if !req.work_dir.is_empty() {
            command.current_dir(&req.work_dir);
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                // Shell-style: a command that cannot start is exit 127, not a
                // protocol failure.
                return Ok(pb::ExecuteResponse {
                    stdout: String::new(),
                    stderr: format!("failed to start {program}: {e}"),
                    exit_code: 127,
                    done: true,
                });
            }
        };

        let deadline = Duration::from_secs(timeout_secs as u64);
        // On timeout the dropped future takes the child with it (kill_on_drop).
        match tokio::time::timeout(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(pb::ExecuteResponse {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code().unwrap_or(-1),
                done: true,
            }),
            Ok(Err(e)) => Err(Status::internal(format!("wait for {program}: {e}"))),
            Err(_) => Ok(pb::ExecuteResponse {
                stdout: String::new(),
                stderr: format!("command timed out after {timeout_secs}s"),
                exit_code: TIMEOUT_EXIT_CODE,
                done: true,
            }),
        }
    }

    async fn execute_via_agent(
        &self,
        mut req: pb::ExecuteRequest,
    ) -> Result<pb::ExecuteResponse, Status> {
        req.container.clear();
        let channel = uds_channel(self.executor_socket.clone()).await.map_err(|e| {
            Status::failed_precondition(format!(
                "executor agent unavailable at {}: {e}",
                self.executor_socket.display()
            ))
        })?;
        let mut client = pb::sidecar_client::SidecarClient::new(channel);
        client.execute(req).await.map(|r| r.into_inner())
    }
}

#[tonic::async_trait]
impl pb::sidecar_server::Sidecar for SidecarService {
    async fn update_files(
        &self,
        request: Request<pb::UpdateFilesRequest>,
    ) -> Result<Response<pb::UpdateFilesResponse>, Status> {
        let req = request.into_inner();
        for (rel_path, content) in &req.files {
            let target = self.resolve(&req.base_path, rel_path);
            if let Err(e) = write_atomic(&target, content).await {
                return Ok(Response::new(pb::UpdateFilesResponse {
                    success: false,
                    message: format!("write {}: {e}", target.display()),
                }));
            }
        }
        Ok(Response::new(pb::UpdateFilesResponse {
            success: true,
            message: format!("wrote {} file(s)", req.files.len()),
        }))
    }

    async fn execute(
        &self,
        request: Request<pb::ExecuteRequest>,
    ) -> Result<Response<pb::ExecuteResponse>, Status> {
        let req = request.into_inner();
        let resp = if req.container == CONTAINER_EXECUTOR {
            self.execute_via_agent(req).await?
        } else {
            self.execute_local(req).await?
        };
        Ok(Response::new(resp))
    }

    async fn signal_process(
        &self,
        request: Request<pb::SignalProcessRequest>,
    ) -> Result<Response<pb::SignalProcessResponse>, Status> {
        let req = request.into_inner();
        // Best-effort; the ack does not promise delivery.
        let _ = Command::new("kill")
            .arg(format!("-{}", req.signal))
            .arg(req.pid.to_string())
            .status()
            .await;
        Ok(Response::new(pb::SignalProcessResponse {}))
    }

    async fn reset(
        &self,
        _request: Request<pb::ResetRequest>,
    ) -> Result<Response<pb::ResetResponse>, Status> {
        match clear_dir(&self.workspace_dir).await {
            Ok(removed) => Ok(Response::new(pb::ResetResponse {
                success: true,
                message: format!("removed {removed} entrie(s)"),
            })),
            Err(e) => Ok(Response::new(pb::ResetResponse {
                success: false,
                message: format!("reset {}: {e}", self.workspace_dir.display()),
            })),
        }
    }

    type InteractiveShellStream = Pin<Box<dyn Stream<Item = Result<pb::ShellFrame, Status>> + Send>>;

    async fn interactive_shell(
        &self,
        request: Request<Streaming<pb::ShellFrame>>,
    ) -> Result<Response<Self::InteractiveShellStream>, Status> {
        let mut inbound = request.into_inner();

        let mut child = Command::new("/bin/sh")
            .current_dir(&self.workspace_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Status::internal(format!("spawn shell: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Status::internal("shell stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Status::internal("shell stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Status::internal("shell stderr unavailable"))?;

        let (tx, rx) = mpsc::channel::<Result<pb::ShellFrame, Status>>(32);

        // Input pump: client frames -> shell stdin. Dropping stdin on client
        // close is what lets the shell exit on its own.
        tokio::spawn(async move {
            // Keep the child owned here so kill_on_drop covers client aborts.
            let mut child = child;
            while let Ok(Some(frame)) = inbound.message().await {
                match frame.frame {
                    Some(pb::shell_frame::Frame::Input(bytes)) => {
                        if stdin.write_all(&bytes).await.is_err() {
                            break;
                        }
                        let _ = stdin.flush().await;
                    }
                    // No pty behind the pipes; resize frames are acknowledged
                    // by consuming them.
                    Some(pb::shell_frame::Frame::Resize(_)) => {}
                    _ => {}
                }
            }
            drop(stdin);
            let _ = child.wait().await;
        });

        spawn_output_pump(stdout, tx.clone());
        spawn_output_pump(stderr, tx);

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

fn spawn_output_pump(
    mut source: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    tx: mpsc::Sender<Result<pb::ShellFrame, Status>>,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            match source.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let frame = pb::ShellFrame {
                        frame: Some(pb::shell_frame::Frame::Output(buf[..n].to_vec())),
                    };
                    if tx.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

async fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let tmp = path.with_file_name(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, content).await?;
    match tokio::fs::rename(&tmp, path).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(e)
        }
    }
}

async fn clear_dir(dir: &Path) -> std::io::Result<usize> {
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let file_type = entry.file_type().await?;
        if file_type.is_dir() {
            tokio::fs::remove_dir_all(entry.path()).await?;
        } else {
            tokio::fs::remove_file(entry.path()).await?;
        }
        removed += 1;
    }
    Ok(removed)
}

/// Dial a wire-protocol endpoint over a unix socket (the executor agent).
pub async fn uds_channel(path: PathBuf) -> Result<Channel, tonic::transport::Error> {
    // The URI is ignored by the connector; it only satisfies http plumbing.
    Endpoint::from_static("http://localhost")
        .connect_with_connector(tower::service_fn(move |_| {
            let path = path.clone();
            async move {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(stream))
            }
        }))
        .await
}

/// Block until the executor agent's socket accepts, or the window elapses.
pub async fn await_executor_ready(path: &Path, window: Duration) -> Result<(), SidecarError> {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::net::UnixStream::connect(path).await {
            Ok(_) => return Ok(()),
            Err(e) => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(SidecarError::ExecutorNotReady(format!(
                        "{} not accepting after {window:?}: {e}",
                        path.display()
                    )));
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Serve the wire protocol until `shutdown` fires, draining in-flight calls
/// for at most `SHUTDOWN_WINDOW` before dropping them.
pub async fn serve(
    addr: std::net::SocketAddr,
    service: SidecarService,
    shutdown: CancellationToken,
) -> Result<(), tonic::transport::Error> {
    let drain = shutdown.clone();
    let graceful = Server::builder()
        .add_service(pb::sidecar_server::SidecarServer::new(service))
        .serve_with_shutdown(addr, async move { drain.cancelled().await });
    tokio::pin!(graceful);
    tokio::select! {
        res = &mut graceful => res,
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(SHUTDOWN_WINDOW).await;
        } => {
            eprintln!("sidecar shutdown window elapsed; dropping in-flight calls");
            Ok(())
        }
    }
}

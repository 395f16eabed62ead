//! Drives the sidecar wire protocol end to end: real gRPC server on a
//! loopback port, real filesystem, real child processes.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;

use arl_operator::sidecar::server::SidecarService;
use arl_operator::sidecar::{SidecarClient, SidecarApi, SidecarError, pb};

async fn start_server(workspace: PathBuf) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let token = CancellationToken::new();
    let shutdown = token.clone();
    // The executor socket points nowhere; executor-routed calls must fail
    // with FailedPrecondition.
    let service = SidecarService::new(workspace, "/nonexistent/arl/exec.sock");
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(pb::sidecar_server::SidecarServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown.cancelled().await
            })
            .await
            .unwrap();
    });
    (addr, token)
}

async fn connect(addr: SocketAddr) -> SidecarClient {
    SidecarClient::connect(&addr.ip().to_string(), addr.port(), Duration::from_secs(30))
        .await
        .expect("connect to in-process sidecar")
}

fn exec_request(argv: &[&str]) -> pb::ExecuteRequest {
    pb::ExecuteRequest {
        command: argv.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

#[tokio::test]
async fn update_files_creates_parents_and_writes_exact_content() {
    let workspace = tempfile::tempdir().unwrap();
    let (addr, _guard) = start_server(workspace.path().to_path_buf()).await;
    let client = connect(addr).await;

    let files = [(
        "src/train/main.py".to_string(),
        "print('hello')\n".to_string(),
    )]
    .into_iter()
    .collect();
    let resp = client
        .update_files(workspace.path().to_str().unwrap(), files)
        .await
        .unwrap();
    assert!(resp.success, "{}", resp.message);
    let written = workspace.path().join("src/train/main.py");
    assert_eq!(
        std::fs::read_to_string(written).unwrap(),
        "print('hello')\n"
    );
}

#[tokio::test]
async fn update_files_absolute_path_bypasses_base() {
    let workspace = tempfile::tempdir().unwrap();
    let elsewhere = tempfile::tempdir().unwrap();
    let (addr, _guard) = start_server(workspace.path().to_path_buf()).await;
    let client = connect(addr).await;

    let target = elsewhere.path().join("config.yaml");
    let files = [(target.to_str().unwrap().to_string(), "a: 1\n".to_string())]
        .into_iter()
        .collect();
    let resp = client
        .update_files(workspace.path().to_str().unwrap(), files)
        .await
        .unwrap();
    assert!(resp.success);
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "a: 1\n");
    assert!(
        !workspace.path().join(target.file_name().unwrap()).exists(),
        "absolute writes must not land under the base path"
    );
}

#[tokio::test]
async fn update_files_overwrites_existing_content() {
    let workspace = tempfile::tempdir().unwrap();
    std::fs::write(workspace.path().join("x.txt"), "old").unwrap();
    let (addr, _guard) = start_server(workspace.path().to_path_buf()).await;
    let client = connect(addr).await;

    let files = [("x.txt".to_string(), "new".to_string())]
        .into_iter()
        .collect();
    let resp = client
        .update_files(workspace.path().to_str().unwrap(), files)
        .await
        .unwrap();
    assert!(resp.success);
    assert_eq!(
        std::fs::read_to_string(workspace.path().join("x.txt")).unwrap(),
        "new"
    );
}

#[tokio::test]
async fn execute_captures_stdout_stderr_and_exit_code() {
    let workspace = tempfile::tempdir().unwrap();
    let (addr, _guard) = start_server(workspace.path().to_path_buf()).await;
    let client = connect(addr).await;

    let ok = client
        .execute(exec_request(&["sh", "-c", "echo hi"]))
        .await
        .unwrap();
    assert_eq!(ok.exit_code, 0);
    assert_eq!(ok.stdout, "hi\n");
    assert!(ok.done);

    let failing = client
        .execute(exec_request(&["sh", "-c", "echo broken >&2; exit 3"]))
        .await
        .unwrap();
    assert_eq!(failing.exit_code, 3);
    assert_eq!(failing.stderr, "broken\n");
}

#[tokio::test]
async fn execute_applies_env_and_work_dir() {
    let workspace = tempfile::tempdir().unwrap();
    let (addr, _guard) = start_server(workspace.path().to_path_buf()).await;
    let client = connect(addr).await;

    let mut request = exec_request(&["sh", "-c", "echo \"$GREETING\" && pwd"]);
    request.env = [("GREETING".to_string(), "bonjour".to_string())]
        .into_iter()
        .collect();
    request.work_dir = workspace.path().to_str().unwrap().to_string();
    let resp = client.execute(request).await.unwrap();
    assert_eq!(resp.exit_code, 0);
    assert!(resp.stdout.starts_with("bonjour\n"));
    let reported = PathBuf::from(resp.stdout.lines().nth(1).unwrap());
    assert_eq!(
        std::fs::canonicalize(&reported).unwrap(),
        std::fs::canonicalize(workspace.path()).unwrap()
    );
}

#[tokio::test]
async fn execute_timeout_reports_nonzero_exit_with_explanation() {
    let workspace = tempfile::tempdir().unwrap();
    let (addr, _guard) = start_server(workspace.path().to_path_buf()).await;
    let client = connect(addr).await;

    let mut request = exec_request(&["sleep", "30"]);
    request.timeout_seconds = 1;
    let resp = client.execute(request).await.unwrap();
    assert_ne!(resp.exit_code, 0);
    assert!(resp.stderr.contains("timed out after 1s"), "{}", resp.stderr);
}

#[tokio::test]
async fn execute_missing_binary_reports_shell_style_127() {
    let workspace = tempfile::tempdir().unwrap();
    let (addr, _guard) = start_server(workspace.path().to_path_buf()).await;
    let client = connect(addr).await;

    let resp = client
        .execute(exec_request(&["definitely-not-a-binary-anywhere"]))
        .await
        .unwrap();
    assert_eq!(resp.exit_code, 127);
}

#[tokio::test]
async fn execute_empty_command_is_a_protocol_error() {
    let workspace = tempfile::tempdir().unwrap();
    let (addr, _guard) = start_server(workspace.path().to_path_buf()).await;
    let client = connect(addr).await;

    let err = client.execute(exec_request(&[])).await.unwrap_err();
    assert!(matches!(err, SidecarError::ProtocolError(_)), "{err:?}");
}

#[tokio::test]
async fn executor_route_fails_precondition_until_agent_appears() {
    let workspace = tempfile::tempdir().unwrap();
    let (addr, _guard) = start_server(workspace.path().to_path_buf()).await;
    let client = connect(addr).await;

    let mut request = exec_request(&["true"]);
    request.container = "executor".to_string();
    let err = client.execute(request).await.unwrap_err();
    assert!(matches!(err, SidecarError::ExecutorNotReady(_)), "{err:?}");
}

#[tokio::test]
async fn reset_empties_the_workspace_but_keeps_the_directory() {
    let workspace = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(workspace.path().join("nested/deep")).unwrap();
    std::fs::write(workspace.path().join("nested/deep/f.txt"), "x").unwrap();
    std::fs::write(workspace.path().join("top.txt"), "y").unwrap();
    let (addr, _guard) = start_server(workspace.path().to_path_buf()).await;
    let client = connect(addr).await;

    let resp = client.reset().await.unwrap();
    assert!(resp.success, "{}", resp.message);
    assert!(workspace.path().exists());
    assert_eq!(
        std::fs::read_dir(workspace.path()).unwrap().count(),
        0,
        "workspace must be empty after reset"
    );
}

#[tokio::test]
async fn connect_to_dead_endpoint_is_unreachable() {
    let err = SidecarClient::connect("127.0.0.1", 1, Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(err, SidecarError::Unreachable { .. }), "{err:?}");
}

#[tokio::test]
async fn interactive_shell_round_trips_and_ends_on_client_close() {
    let workspace = tempfile::tempdir().unwrap();
    let (addr, _guard) = start_server(workspace.path().to_path_buf()).await;
    let client = connect(addr).await;

    let (tx, rx) = tokio::sync::mpsc::channel::<pb::ShellFrame>(8);
    let mut output = client
        .interactive_shell(ReceiverStream::new(rx))
        .await
        .unwrap();

    tx.send(pb::ShellFrame {
        frame: Some(pb::shell_frame::Frame::Input(
            b"echo shell-works\n".to_vec(),
        )),
    })
    .await
    .unwrap();

    let mut seen = String::new();
    while !seen.contains("shell-works") {
        let frame = tokio::time::timeout(Duration::from_secs(10), output.message())
            .await
            .expect("shell output within 10s")
            .unwrap()
            .expect("stream should stay open while we hold the sender");
        if let Some(pb::shell_frame::Frame::Output(bytes)) = frame.frame {
            seen.push_str(&String::from_utf8_lossy(&bytes));
        }
    }

    // Closing our end tears the session down.
    drop(tx);
    let end = tokio::time::timeout(Duration::from_secs(10), async {
        while let Ok(Some(_)) = output.message().await {}
    })
    .await;
    assert!(end.is_ok(), "stream must terminate after client close");
}

#[tokio::test]
async fn executor_readiness_window_expires() {
    let missing = Path::new("/nonexistent/arl/exec.sock");
    let err = arl_operator::sidecar::server::await_executor_ready(
        missing,
        Duration::from_millis(50),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, SidecarError::ExecutorNotReady(_)));
}

use clap::Parser;
use owo_colors::OwoColorize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use arl_operator::sidecar::{self, server::SidecarService};

/// In-pod sidecar: health HTTP endpoint plus the wire-protocol RPC server
/// every pool pod exposes.
#[derive(Parser, Debug)]
struct SidecarArgs {
    #[arg(long, env = "WORKSPACE_DIR", default_value = "/workspace")]
    workspace_dir: String,

    #[arg(long, env = "SIDECAR_GRPC_PORT", default_value_t = 9090)]
    grpc_port: u16,

    #[arg(long, env = "SIDECAR_HTTP_PORT", default_value_t = 8686)]
    http_port: u16,

    #[arg(long, env = "EXEC_SOCKET", default_value = sidecar::EXEC_SOCKET_PATH)]
    exec_socket: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    arl_common::init();
    let args = SidecarArgs::parse();

    let shutdown = CancellationToken::new();
    tokio::spawn(arl_common::shutdown::cancel_on_signal(shutdown.clone()));
    arl_common::metrics::maybe_spawn_metrics_server(Some(args.http_port), shutdown.clone());

    // Startup window for the executor agent. Sidecar-container commands keep
    // working either way; executor-routed calls fail FailedPrecondition
    // until the socket accepts.
    if let Err(e) = sidecar::server::await_executor_ready(
        &args.exec_socket,
        Duration::from_secs(sidecar::EXECUTOR_READY_WINDOW_SECS),
    )
    .await
    {
        eprintln!("{}", format!("{e}").yellow());
    }

    arl_common::signal_ready();
    let addr: SocketAddr = format!("0.0.0.0:{}", args.grpc_port).parse()?;
    println!(
        "{}{}",
        "🔌 Serving sidecar RPC • addr=".green(),
        addr.green().dimmed(),
    );
    let service = SidecarService::new(&args.workspace_dir, &args.exec_socket);
    sidecar::server::serve(addr, service, shutdown).await?;
    Ok(())
}

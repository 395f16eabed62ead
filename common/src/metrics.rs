use axum::{Router, routing::get};
use owo_colors::OwoColorize;
use prometheus::{Encoder, TextEncoder};
use std::sync::OnceLock;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

static SERVER_STARTED: OnceLock<()> = OnceLock::new();

/// Spawns the health/metrics server once, no matter how often it is called.
/// The server drains when `shutdown` fires, together with the controllers.
pub fn maybe_spawn_metrics_server(port: Option<u16>, shutdown: CancellationToken) {
    let Some(port) = port else {
        return;
    };
    // Set the panic hook to exit the process with a non-zero exit code
    // when a panic occurs on any thread. This is desired behavior when
    // running in a container, as the metrics server or controller may
    // panic and we always want to restart the container in that case.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    if SERVER_STARTED.set(()).is_ok() {
        tokio::spawn(run_metrics_server(port, shutdown));
    }
}

pub async fn run_metrics_server(port: u16, shutdown: CancellationToken) {
    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .route("/metrics", get(|| async { render_metrics() }));
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| {
            eprintln!("🛑 Failed to bind metrics server to {}: {}", addr, e);
            e
        })
        .unwrap();
    println!(
        "{}{}",
        "📈 Starting metrics server • port=".green(),
        format!("{}", port).green().dimmed(),
    );
    let started = Instant::now();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .expect("Failed to serve metrics");
    println!(
        "{} {}",
        "🛑 Metrics server stopped gracefully • uptime was".red(),
        format!("{:.2?}", started.elapsed()).red().dimmed()
    );
}

fn render_metrics() -> String {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buf) {
        eprintln!("{}", format!("Failed to encode metrics: {e}").red());
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

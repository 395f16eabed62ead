use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

/// Cancels `token` on the first SIGTERM (kubelet) or SIGINT (operator at a
/// terminal). Controllers, servers and in-flight reconciliations all hang
/// off the token, so one signal drains the whole process.
pub async fn cancel_on_signal(token: CancellationToken) {
    let signal_name = wait_for_signal().await;
    eprintln!(
        "{}",
        format!("🛑 {signal_name} received; draining controllers").red()
    );
    token.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    tokio::signal::ctrl_c().await.expect("install Ctrl+C handler");
    "Ctrl+C"
}

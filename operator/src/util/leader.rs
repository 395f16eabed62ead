use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use super::Error;

/// One lease for the whole operator process. The allocator's pod-label claim
/// and the maintainer's scaling decisions must come from the same replica,
/// so the controllers are gated together rather than per-controller.
pub async fn run_leader_elected<F>(
    client: Client,
    namespace: &str,
    lease_name: &str,
    shutdown: CancellationToken,
    spawn_controllers: F,
) -> Result<(), Error>
where
    F: Fn(CancellationToken) -> tokio::task::JoinHandle<()>,
{
    // Unique identity per replica (Downward API POD_NAME is ideal).
    // Fallback to hostname if not present.
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("{lease_name}-{}", uuid::Uuid::new_v4()));
    // TTL: how long leadership is considered valid without renewal.
    // Renew should happen well before TTL expires.
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client,
        namespace,
        LeaseLockParams {
            holder_id,
            lease_name: lease_name.to_string(),
            lease_ttl,
        },
    );

    // We run indefinitely; only the leader runs the controllers.
    // On leadership loss, we stop them and go back to standby.
    let mut running: Option<(CancellationToken, tokio::task::JoinHandle<()>)> = None;
    let mut tick = tokio::time::interval(renew_every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some((token, task)) = running.take() {
                    token.cancel();
                    task.await.ok();
                }
                break Ok(());
            },
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                // If we can't talk to the apiserver / update Lease, assume we are not safe to lead.
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some((token, task)) = running.take() {
                    token.cancel();
                    task.abort();
                    eprintln!("stopped controllers due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if running.is_none() {
                println!("{}", "👑 Acquired leadership; starting controllers".green());
                let token = shutdown.child_token();
                let task = spawn_controllers(token.clone());
                running = Some((token, task));
            }
        } else if let Some((token, task)) = running.take() {
            // We are NOT leader; ensure the controllers are stopped
            eprintln!("lost leadership; stopping controllers");
            token.cancel();
            task.abort();
        }
    }
}

use clap::Parser;
use kube::Client;
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use arl_common::args::OperatorArgs;
use arl_common::metrics::maybe_spawn_metrics_server;
use arl_operator::middleware::{Chain, Hook, LoggingHook};
use arl_operator::scheduler::{self, ImageLocality};
use arl_operator::sinks::{
    AuditSink, HttpAuditSink, MetricsSink, NoopAudit, NoopMetrics, PrometheusMetrics, Sinks,
};
use arl_operator::util::leader;
use arl_operator::{pools, tasks, workspaces};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = OperatorArgs::parse();
    // Refuse to start on invalid configuration, before any I/O happens.
    args.validate()?;
    arl_common::init();

    let shutdown = CancellationToken::new();
    tokio::spawn(arl_common::shutdown::cancel_on_signal(shutdown.clone()));

    if args.enable_metrics {
        maybe_spawn_metrics_server(args.metrics_port, shutdown.clone());
    }

    let metrics: Arc<dyn MetricsSink> = if args.enable_metrics {
        Arc::new(PrometheusMetrics)
    } else {
        Arc::new(NoopMetrics)
    };
    let audit: Arc<dyn AuditSink> = match (args.audit_enabled, &args.audit_endpoint) {
        (true, Some(endpoint)) => Arc::new(HttpAuditSink::new(
            endpoint.clone(),
            Duration::from_secs(args.http_client_timeout_seconds),
        )?),
        _ => Arc::new(NoopAudit),
    };
    let sinks = Sinks::new(metrics, audit);

    let chain = if args.enable_middleware {
        Chain::new(vec![Arc::new(LoggingHook) as Arc<dyn Hook>])
    } else {
        Chain::disabled()
    };

    let client = Client::try_default().await?;
    let locality = Arc::new(ImageLocality::new());

    arl_common::signal_ready();
    println!("{}", "🌱 Starting ARL operator...".green());

    let lease_client = client.clone();
    let namespace = args.namespace.clone();
    leader::run_leader_elected(
        lease_client,
        &namespace,
        "arl-operator-lock",
        shutdown,
        move |token| {
            let client = client.clone();
            let args = args.clone();
            let sinks = sinks.clone();
            let chain = chain.clone();
            let locality = locality.clone();
            tokio::spawn(async move {
                let node_watch = {
                    let client = client.clone();
                    let locality = locality.clone();
                    let token = token.clone();
                    async move {
                        if let Err(e) = scheduler::run_node_watch(client, locality, token).await {
                            eprintln!("{}", format!("node watch terminated: {e}").red());
                        }
                    }
                };
                tokio::join!(
                    node_watch,
                    pools::run(
                        client.clone(),
                        args.clone(),
                        sinks.clone(),
                        chain.clone(),
                        locality.clone(),
                        token.clone(),
                    ),
                    workspaces::run(
                        client.clone(),
                        args.clone(),
                        sinks.clone(),
                        chain.clone(),
                        token.clone(),
                    ),
                    tasks::run(
                        client.clone(),
                        args.clone(),
                        sinks.clone(),
                        chain.clone(),
                        token.clone(),
                    ),
                    tasks::run_reaper(client, args, sinks, token),
                );
            })
        },
    )
    .await?;
    println!("{}", "👋 ARL operator stopped.".red());
    Ok(())
}

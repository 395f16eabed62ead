use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    Api, ResourceExt,
    api::ListParams,
    client::Client,
    runtime::{
        Controller,
        controller::{Action, Config},
    },
};
use owo_colors::OwoColorize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use arl_common::args::OperatorArgs;
use arl_common::labels;
use arl_common::wait::{TokenBucket, backoff_full_jitter};
use arl_types::Pool;

use super::census::{self, PoolCensus};
use super::{actions, template};
use crate::middleware::{Chain, ReconcileRequest};
use crate::scheduler::{ImageLocality, spread_count};
use crate::sinks::Sinks;
use crate::util::{self, Error, colors::{FG1, FG2}};

/// Entrypoint for the `Pool` controller: keeps every pool at its desired
/// count of warm pods and records startup telemetry along the way.
pub async fn run(
    client: Client,
    args: OperatorArgs,
    sinks: Sinks,
    chain: Chain,
    locality: Arc<ImageLocality>,
    shutdown: CancellationToken,
) {
    println!("{}", "⚙️ Starting Pool controller...".green());
    let namespace = args.namespace.clone();
    let max_concurrent = args.pool_max_concurrent;
    let context = Arc::new(ContextData::new(client.clone(), args, sinks, chain, locality));
    let pools: Api<Pool> = Api::namespaced(client.clone(), &namespace);
    let pods: Api<Pod> = Api::namespaced(client, &namespace);
    Controller::new(pools, Default::default())
        .owns(pods, Default::default())
        .with_config(Config::default().concurrency(max_concurrent))
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, on_error, context)
        .for_each(|_res| async move {})
        .await;
    println!("{}", "🛑 Pool controller stopped.".red());
}

struct ScaleEvent {
    started: Instant,
    first_pod_recorded: bool,
}

/// Context injected with each `reconcile` and `on_error` method invocation.
struct ContextData {
    client: Client,
    args: OperatorArgs,
    sinks: Sinks,
    chain: Chain,
    locality: Arc<ImageLocality>,
    bucket: TokenBucket,

    /// Pod UIDs whose startup latencies were already emitted.
    recorded_pods: Mutex<HashSet<String>>,
    /// `(uid, container, reason)` triples already counted as pull errors.
    recorded_errors: Mutex<HashSet<(String, String, String)>>,
    /// Last observed desired count per `(namespace, pool)`.
    observed_desired: Mutex<HashMap<(String, String), i32>>,
    /// Open scale-up events per `(namespace, pool)`.
    scale_events: Mutex<HashMap<(String, String), ScaleEvent>>,
    /// Consecutive reconcile failures per `(namespace, pool)`.
    failures: Mutex<HashMap<(String, String), usize>>,
}

impl ContextData {
    fn new(
        client: Client,
        args: OperatorArgs,
        sinks: Sinks,
        chain: Chain,
        locality: Arc<ImageLocality>,
    ) -> Self {
        let bucket = TokenBucket::new(args.pool_rate_limit_qps, args.pool_rate_limit_burst);
        ContextData {
            client,
            args,
            sinks,
            chain,
            locality,
            bucket,
            recorded_pods: Mutex::new(HashSet::new()),
            recorded_errors: Mutex::new(HashSet::new()),
            observed_desired: Mutex::new(HashMap::new()),
            scale_events: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }
}

async fn reconcile(pool: Arc<Pool>, context: Arc<ContextData>) -> Result<Action, Error> {
    let namespace = pool.namespace().ok_or_else(|| {
        Error::UserInput("Expected Pool resource to be namespaced.".to_owned())
    })?;
    let name = pool.name_any();
    let request = ReconcileRequest::new("Pool", namespace.clone(), name.clone());
    let chain = context.chain.clone();
    let result = chain
        .wrap(&request, reconcile_pool(pool, context.clone(), &namespace, &name))
        .await;
    if result.is_ok() {
        context
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(namespace, name));
    }
    result
}

async fn reconcile_pool(
    pool: Arc<Pool>,
    context: Arc<ContextData>,
    namespace: &str,
    name: &str,
) -> Result<Action, Error> {
    // Owned pods are garbage collected through the owner references; a
    // deleting pool needs nothing from us.
    if pool.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let client = context.client.clone();
    let desired = pool
        .spec
        .replicas
        .unwrap_or(context.args.default_pool_replicas)
        .max(0);

    let pods_api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let selector = format!("{}={}", labels::POOL, name);
    let pods = pods_api
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(|e| Error::api("list pods of Pool", namespace, name, e))?;
    let expected_hash = template::template_hash(&pool);
    let census = census::take_census(&pods.items, &expected_hash);

    let key = (namespace.to_string(), name.to_string());
    record_scale_start(&context, &key, desired);
    record_startup_telemetry(&context, &key, name, &pods.items);
    record_image_pull_errors(&context, name, &census);
    prune_recorded(&context, &pods.items);
    maybe_finish_scale(&context, &key, name, desired, &census);

    let needed = i64::from(desired) - census.total as i64;
    if needed > 0 {
        let spread_factor = pool
            .spec
            .image_locality
            .as_ref()
            .and_then(|p| p.spread_factor)
            .unwrap_or(context.args.image_locality_spread_factor);
        let preferred = template::primary_image(&pool)
            .map(|image| {
                context
                    .locality
                    .top_k(image, spread_count(desired, spread_factor))
            })
            .unwrap_or_default();
        let pod = template::build_pod(&pool, &context.args, &preferred)?;
        println!(
            "🔧 {}{}{}{}{}",
            namespace.color(FG2),
            "/".color(FG1),
            name.color(FG2),
            " scale up by ".color(FG1),
            needed.color(FG2),
        );
        actions::create_pods(
            client.clone(),
            namespace,
            name,
            &pod,
            needed as usize,
            &context.bucket,
            &context.sinks,
        )
        .await;
    } else if needed < 0 {
        // Only idle pods are eligible victims; allocated ones belong to a
        // workspace until it releases them.
        let excess = (-needed) as usize;
        let victims: Vec<String> = census.idle.iter().take(excess).cloned().collect();
        if victims.len() < excess {
            println!(
                "{}",
                format!(
                    "pool {namespace}/{name}: {} excess pods but only {} idle; the rest drain via workspace release",
                    excess,
                    victims.len()
                )
                .yellow()
            );
        }
        actions::delete_pods(
            client.clone(),
            namespace,
            name,
            &victims,
            "scale-down",
            &context.bucket,
            &context.sinks,
        )
        .await;
    } else if !census.drifted_idle.is_empty() {
        // Stale-template idle pods are replaced through the deficit path:
        // delete now, recreate on the next reconciliation.
        actions::delete_pods(
            client.clone(),
            namespace,
            name,
            &census.drifted_idle,
            "template-drift",
            &context.bucket,
            &context.sinks,
        )
        .await;
    }

    context
        .sinks
        .metrics
        .pool_utilization(name, census.idle_ready as i64, census.allocated as i64);
    context
        .sinks
        .metrics
        .pending_pods(name, census.pending as i64);

    let desired_status = actions::desired_status(&census, desired, census.allocated as i32);
    if actions::status_changed(pool.status.as_ref(), &desired_status) {
        actions::update_status(client, &pool, desired_status).await?;
    }

    // Requeue policy: an empty, zero-replica pool sleeps until spec changes;
    // a saturated healthy pool polls lazily (the pod watch still delivers
    // events immediately); everything else re-checks at the standard delay.
    let delay = Duration::from_secs(context.args.default_requeue_delay_seconds);
    let saturated =
        census.idle_ready as i64 >= i64::from(desired) - census.allocated as i64;
    if desired == 0 && census.total == 0 {
        Ok(Action::await_change())
    } else if needed == 0 && census.is_healthy() && saturated {
        Ok(Action::requeue(delay * 6))
    } else {
        Ok(Action::requeue(delay))
    }
}

fn record_scale_start(context: &ContextData, key: &(String, String), desired: i32) {
    let previous = context
        .observed_desired
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(key.clone(), desired)
        .unwrap_or(0);
    if desired > previous {
        context
            .scale_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                key.clone(),
                ScaleEvent {
                    started: Instant::now(),
                    first_pod_recorded: false,
                },
            );
    }
}

/// Emit schedule/ready/container-start latencies exactly once per pod UID.
fn record_startup_telemetry(
    context: &ContextData,
    key: &(String, String),
    pool_name: &str,
    pods: &[Pod],
) {
    let mut recorded = context
        .recorded_pods
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    for pod in pods {
        let Some(uid) = pod.uid() else { continue };
        if recorded.contains(&uid) {
            continue;
        }
        let Some(status) = pod.status.as_ref() else {
            continue;
        };
        if status.phase.as_deref() != Some("Running") {
            continue;
        }
        let Some(ready_at) = condition_time(pod, "Ready") else {
            continue;
        };
        let Some(created) = pod.metadata.creation_timestamp.as_ref() else {
            continue;
        };

        if let Some(scheduled_at) = condition_time(pod, "PodScheduled") {
            context
                .sinks
                .metrics
                .schedule_latency(pool_name, util::seconds_between(created, &scheduled_at));
        }
        let ready_latency = util::seconds_between(created, &ready_at);
        context.sinks.metrics.ready_latency(pool_name, ready_latency);

        let pod_started = status.start_time.as_ref().unwrap_or(created);
        for cs in status.container_statuses.iter().flatten() {
            if let Some(started_at) = cs
                .state
                .as_ref()
                .and_then(|s| s.running.as_ref())
                .and_then(|r| r.started_at.as_ref())
            {
                context.sinks.metrics.container_start_latency(
                    pool_name,
                    &cs.name,
                    util::seconds_between(pod_started, started_at),
                );
            }
        }

        recorded.insert(uid);

        let mut events = context
            .scale_events
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(event) = events.get_mut(key)
            && !event.first_pod_recorded
        {
            context
                .sinks
                .metrics
                .first_pod_ready(pool_name, event.started.elapsed().as_secs_f64());
            event.first_pod_recorded = true;
        }
    }
}

/// One counter increment per unique `(uid, container, reason)`.
fn record_image_pull_errors(context: &ContextData, pool_name: &str, census: &PoolCensus) {
    let mut recorded = context
        .recorded_errors
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    for failure in &census.image_pull_errors {
        let entry = (
            failure.uid.clone(),
            failure.container.clone(),
            failure.reason.clone(),
        );
        if recorded.insert(entry) {
            context
                .sinks
                .metrics
                .image_pull_error(pool_name, &failure.reason);
        }
    }
}

/// Drop dedup entries for pods that no longer exist, keeping memory bounded.
fn prune_recorded(context: &ContextData, pods: &[Pod]) {
    let live: HashSet<String> = pods.iter().filter_map(|p| p.uid()).collect();
    context
        .recorded_pods
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .retain(|uid| live.contains(uid));
    context
        .recorded_errors
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .retain(|(uid, _, _)| live.contains(uid));
}

fn maybe_finish_scale(
    context: &ContextData,
    key: &(String, String),
    pool_name: &str,
    desired: i32,
    census: &PoolCensus,
) {
    if desired <= 0 || (census.idle_ready as i64) < i64::from(desired) {
        return;
    }
    if let Some(event) = context
        .scale_events
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(key)
    {
        context
            .sinks
            .metrics
            .all_pods_ready(pool_name, event.started.elapsed().as_secs_f64());
    }
}

fn condition_time(
    pod: &Pod,
    condition_type: &str,
) -> Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::Time> {
    pod.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == condition_type && c.status == "True")?
        .last_transition_time
        .clone()
}

/// Requeue with full-jitter exponential backoff scaled by how often this key
/// has failed in a row.
fn on_error(pool: Arc<Pool>, error: &Error, context: Arc<ContextData>) -> Action {
    let key = (pool.namespace().unwrap_or_default(), pool.name_any());
    let attempt = {
        let mut failures = context.failures.lock().unwrap_or_else(|e| e.into_inner());
        let entry = failures.entry(key).or_insert(0);
        *entry += 1;
        *entry
    };
    eprintln!(
        "{}",
        format!(
            "Reconciliation error for Pool {}/{} (attempt {attempt}): {error}",
            pool.namespace().unwrap_or_default(),
            pool.name_any()
        )
        .red()
    );
    Action::requeue(backoff_full_jitter(
        Duration::from_millis(context.args.pool_base_delay_ms),
        Duration::from_millis(context.args.pool_max_delay_ms),
        attempt.saturating_sub(1),
    ))
}

use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    Api, ResourceExt,
    client::Client,
    runtime::{
        Controller,
        controller::{Action, Config},
        reflector::ObjectRef,
    },
};
use owo_colors::OwoColorize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use arl_common::WORKSPACE_FINALIZER;
use arl_common::args::OperatorArgs;
use arl_common::wait::backoff_full_jitter;
use arl_types::{Pool, Workspace, WorkspacePhase};

use super::actions;
use crate::middleware::{Chain, ReconcileRequest};
use crate::sinks::{Sinks, WorkspaceAuditRecord};
use crate::util::{self, Error, colors::{FG1, FG2}};

const SHORT_REQUEUE: Duration = Duration::from_millis(500);

/// Entrypoint for the `Workspace` controller: binds idle pods to workspaces,
/// walks the phase machine, and reclaims pods on release.
pub async fn run(
    client: Client,
    args: OperatorArgs,
    sinks: Sinks,
    chain: Chain,
    shutdown: CancellationToken,
) {
    println!("{}", "⚙️ Starting Workspace controller...".green());
    let namespace = args.namespace.clone();
    let max_concurrent = args.workspace_max_concurrent;
    let context = Arc::new(ContextData::new(client.clone(), args, sinks, chain));
    let workspaces: Api<Workspace> = Api::namespaced(client.clone(), &namespace);
    let pods: Api<Pod> = Api::namespaced(client, &namespace);
    Controller::new(workspaces, Default::default())
        .watches(pods, Default::default(), |pod: Pod| {
            // A pod points back at its workspace through the reserved label;
            // label churn is what advances Bound -> Ready.
            let namespace = pod.namespace();
            pod.labels()
                .get(arl_common::labels::WORKSPACE)
                .map(|workspace| {
                    let mut reference = ObjectRef::new(workspace);
                    if let Some(ns) = namespace {
                        reference = reference.within(&ns);
                    }
                    reference
                })
        })
        .with_config(Config::default().concurrency(max_concurrent))
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, on_error, context)
        .for_each(|_res| async move {})
        .await;
    println!("{}", "🛑 Workspace controller stopped.".red());
}

struct ContextData {
    client: Client,
    args: OperatorArgs,
    sinks: Sinks,
    chain: Chain,
    failures: Mutex<HashMap<(String, String), usize>>,
}

impl ContextData {
    fn new(client: Client, args: OperatorArgs, sinks: Sinks, chain: Chain) -> Self {
        ContextData {
            client,
            args,
            sinks,
            chain,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

async fn reconcile(
    workspace: Arc<Workspace>,
    context: Arc<ContextData>,
) -> Result<Action, Error> {
    let namespace = workspace.namespace().ok_or_else(|| {
        Error::UserInput("Expected Workspace resource to be namespaced.".to_owned())
    })?;
    let name = workspace.name_any();
    let request = ReconcileRequest::new("Workspace", namespace.clone(), name.clone());
    let chain = context.chain.clone();
    let result = chain
        .wrap(
            &request,
            reconcile_workspace(workspace, context.clone(), &namespace, &name),
        )
        .await;
    match result {
        Ok(action) => {
            context
                .failures
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&(namespace, name));
            Ok(action)
        }
        // Somebody raced us on the pod labels or the status subresource; a
        // fresh read next pass resolves it.
        Err(e) if e.is_conflict() => Ok(Action::requeue(SHORT_REQUEUE)),
        // The rejection is recorded as a condition; the stored phase is
        // untouched and the next pass re-evaluates from it.
        Err(Error::InvalidPhaseTransition { object, from, to }) => {
            eprintln!(
                "{}",
                format!("workspace {object}: rejected transition {from:?} -> {to}").yellow()
            );
            Ok(Action::requeue(Duration::from_secs(
                context.args.default_requeue_delay_seconds,
            )))
        }
        Err(e) => Err(e),
    }
}

async fn reconcile_workspace(
    workspace: Arc<Workspace>,
    context: Arc<ContextData>,
    namespace: &str,
    name: &str,
) -> Result<Action, Error> {
    let client = context.client.clone();

    if workspace.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&workspace, &context, namespace, name).await;
    }

    // The finalizer must be on before any pod is claimed, otherwise a fast
    // delete could leak the claim.
    if !workspace
        .finalizers()
        .iter()
        .any(|f| f == WORKSPACE_FINALIZER)
    {
        actions::add_finalizer(client, &workspace).await?;
        return Ok(Action::requeue(SHORT_REQUEUE));
    }

    let phase = workspace.status.as_ref().and_then(|s| s.phase);
    match phase {
        None => {
            actions::set_phase(client, &workspace, WorkspacePhase::Pending, |_| {}).await?;
            audit(&context, &workspace, "Pending").await;
            Ok(Action::requeue(SHORT_REQUEUE))
        }
        Some(WorkspacePhase::Pending) => {
            handle_pending(&workspace, &context, namespace, name).await
        }
        Some(WorkspacePhase::Bound) => handle_bound(&workspace, &context, namespace, name).await,
        Some(WorkspacePhase::Ready) => handle_ready(&workspace, &context, namespace, name).await,
        // Terminal and absorbing.
        Some(WorkspacePhase::Failed) => Ok(Action::await_change()),
    }
}

async fn handle_pending(
    workspace: &Workspace,
    context: &ContextData,
    namespace: &str,
    name: &str,
) -> Result<Action, Error> {
    let client = context.client.clone();
    let pool_ref = workspace.spec.pool_ref.clone();

    // A dangling poolRef is a terminal failure, not something to wait out.
    let pools: Api<Pool> = Api::namespaced(client.clone(), namespace);
    match pools.get(&pool_ref).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            actions::set_phase(client, workspace, WorkspacePhase::Failed, move |status| {
                util::upsert_condition(
                    &mut status.conditions,
                    util::condition(
                        "Failed",
                        true,
                        "PoolMissing",
                        &format!("pool not found: {pool_ref}"),
                    ),
                );
            })
            .await?;
            audit(context, workspace, "Failed").await;
            return Ok(Action::await_change());
        }
        Err(e) => return Err(Error::api("get Pool for Workspace", namespace, name, e)),
    }

    let claimed =
        actions::claim_idle_pod(client.clone(), namespace, &pool_ref, name).await?;
    let Some(pod) = claimed else {
        context.sinks.metrics.no_idle_pods(&pool_ref);
        return Ok(Action::requeue(Duration::from_secs(
            context.args.pod_wait_requeue_delay_seconds,
        )));
    };

    let pod_name = pod.name_any();
    let pod_ip = pod.status.as_ref().and_then(|s| s.pod_ip.clone());
    let work_dir = context.args.workspace_dir.clone();
    actions::set_phase(client, workspace, WorkspacePhase::Bound, move |status| {
        status.pod_name = Some(pod_name);
        status.pod_ip = pod_ip;
        status.work_dir = Some(work_dir);
    })
    .await?;
    println!(
        "🪄 {}{}{}{}{}",
        namespace.color(FG2),
        "/".color(FG1),
        name.color(FG2),
        " bound to pod ".color(FG1),
        pod.name_any().color(FG2),
    );
    audit(context, workspace, "Bound").await;
    Ok(Action::requeue(SHORT_REQUEUE))
}

async fn handle_bound(
    workspace: &Workspace,
    context: &ContextData,
    namespace: &str,
    name: &str,
) -> Result<Action, Error> {
    let client = context.client.clone();
    let Some(pod_name) = workspace
        .status
        .as_ref()
        .and_then(|s| s.pod_name.clone())
    else {
        actions::set_phase(client, workspace, WorkspacePhase::Failed, |_| {}).await?;
        audit(context, workspace, "Failed").await;
        return Ok(Action::await_change());
    };

    let Some(pod) = actions::get_pod(client.clone(), namespace, &pod_name).await? else {
        actions::set_phase(client, workspace, WorkspacePhase::Failed, |status| {
            util::upsert_condition(
                &mut status.conditions,
                util::condition("Failed", true, "PodMissing", "bound pod disappeared"),
            );
        })
        .await?;
        audit(context, workspace, "Failed").await;
        return Ok(Action::await_change());
    };

    let all_ready = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .is_some_and(|statuses| !statuses.is_empty() && statuses.iter().all(|cs| cs.ready));
    if !all_ready {
        return Ok(Action::requeue(Duration::from_secs(
            context.args.workspace_check_interval_seconds,
        )));
    }

    let pod_ip = pod.status.as_ref().and_then(|s| s.pod_ip.clone());
    actions::set_phase(client, workspace, WorkspacePhase::Ready, move |status| {
        status.pod_ip = pod_ip;
        status.last_task_time = Some(util::now());
    })
    .await?;
    if let Some(created) = workspace.metadata.creation_timestamp.as_ref() {
        context
            .sinks
            .metrics
            .workspace_allocation_seconds(
                &workspace.spec.pool_ref,
                util::seconds_between(created, &util::now()),
            );
    }
    println!(
        "✅ {}{}{}{}",
        namespace.color(FG2),
        "/".color(FG1),
        name.color(FG2),
        " is Ready".color(FG1),
    );
    audit(context, workspace, "Ready").await;
    Ok(Action::requeue(Duration::from_secs(
        context.args.workspace_check_interval_seconds,
    )))
}

async fn handle_ready(
    workspace: &Workspace,
    context: &ContextData,
    namespace: &str,
    name: &str,
) -> Result<Action, Error> {
    let client = context.client.clone();
    let api: Api<Workspace> = Api::namespaced(client, namespace);
    let check_interval = Duration::from_secs(context.args.workspace_check_interval_seconds);

    let max_lifetime = resolve_timeout(
        workspace.spec.max_lifetime_seconds,
        context.args.workspace_max_lifetime_seconds,
    );
    if let Some(max_lifetime) = max_lifetime
        && let Some(created) = workspace.metadata.creation_timestamp.as_ref()
        && let Some(age) = util::age_of(created)
        && age >= max_lifetime
    {
        println!(
            "{}",
            format!("workspace {namespace}/{name} exceeded max lifetime; deleting").yellow()
        );
        api.delete(name, &Default::default())
            .await
            .map_err(|e| Error::api("delete expired Workspace", namespace, name, e))?;
        return Ok(Action::await_change());
    }

    if context.args.enable_auto_cleanup
        && !workspace.spec.keep_alive
        && actions::has_condition(workspace, actions::CONDITION_READY_FOR_CLEANUP)
    {
        api.delete(name, &Default::default())
            .await
            .map_err(|e| Error::api("delete drained Workspace", namespace, name, e))?;
        return Ok(Action::await_change());
    }

    let idle_timeout = resolve_timeout(
        workspace.spec.idle_timeout_seconds,
        context.args.workspace_idle_timeout_seconds,
    );
    let mut requeue = check_interval;
    if let Some(idle_timeout) = idle_timeout {
        let idle_for = workspace
            .status
            .as_ref()
            .and_then(|s| s.last_task_time.as_ref())
            .and_then(util::age_of)
            .unwrap_or(Duration::ZERO);
        if idle_for >= idle_timeout {
            println!(
                "{}",
                format!(
                    "workspace {namespace}/{name} idle for {idle_for:?} (limit {idle_timeout:?}); deleting"
                )
                .yellow()
            );
            api.delete(name, &Default::default())
                .await
                .map_err(|e| Error::api("delete idle Workspace", namespace, name, e))?;
            return Ok(Action::await_change());
        }
        requeue = requeue.min(idle_timeout - idle_for);
    }
    if let Some(max_lifetime) = max_lifetime
        && let Some(age) = workspace
            .metadata
            .creation_timestamp
            .as_ref()
            .and_then(util::age_of)
    {
        requeue = requeue.min(max_lifetime.saturating_sub(age));
    }
    Ok(Action::requeue(requeue.max(Duration::from_secs(1))))
}

/// Release path: the pod is deleted outright (full cleanup of the ephemeral
/// workspace), the idle time is observed, an audit record is written, and
/// only then does the finalizer come off.
async fn handle_deletion(
    workspace: &Workspace,
    context: &ContextData,
    namespace: &str,
    name: &str,
) -> Result<Action, Error> {
    let client = context.client.clone();
    if let Some(pod_name) = workspace.status.as_ref().and_then(|s| s.pod_name.as_deref()) {
        let deleted = actions::delete_pod(client.clone(), namespace, pod_name).await?;
        if deleted {
            println!(
                "🗑️ {}{}{}{}{}",
                namespace.color(FG2),
                "/".color(FG1),
                name.color(FG2),
                " released pod ".color(FG1),
                pod_name.color(FG2),
            );
        }
    }

    if let Some(last_task) = workspace
        .status
        .as_ref()
        .and_then(|s| s.last_task_time.as_ref())
        && let Some(idle_for) = util::age_of(last_task)
    {
        context
            .sinks
            .metrics
            .workspace_idle_seconds(&workspace.spec.pool_ref, idle_for.as_secs_f64());
    }

    audit(context, workspace, "Released").await;
    actions::remove_finalizer(client, workspace).await?;
    Ok(Action::await_change())
}

/// Explicit spec field beats the controller-wide default; a non-positive
/// result disables the timeout entirely.
fn resolve_timeout(spec_seconds: Option<i64>, default_seconds: i64) -> Option<Duration> {
    let seconds = spec_seconds.unwrap_or(default_seconds);
    (seconds > 0).then(|| Duration::from_secs(seconds as u64))
}

async fn audit(context: &ContextData, workspace: &Workspace, event: &str) {
    let status = workspace.status.as_ref();
    context
        .sinks
        .audit_workspace(WorkspaceAuditRecord {
            namespace: workspace.namespace().unwrap_or_default(),
            name: workspace.name_any(),
            pool_ref: workspace.spec.pool_ref.clone(),
            phase: status
                .and_then(|s| s.phase)
                .map(|p| p.to_string())
                .unwrap_or_default(),
            pod_name: status.and_then(|s| s.pod_name.clone()),
            event: event.to_string(),
        })
        .await;
}

fn on_error(workspace: Arc<Workspace>, error: &Error, context: Arc<ContextData>) -> Action {
    let key = (
        workspace.namespace().unwrap_or_default(),
        workspace.name_any(),
    );
    let attempt = {
        let mut failures = context.failures.lock().unwrap_or_else(|e| e.into_inner());
        let entry = failures.entry(key).or_insert(0);
        *entry += 1;
        *entry
    };
    eprintln!(
        "{}",
        format!(
            "Reconciliation error for Workspace {}/{} (attempt {attempt}): {error}",
            workspace.namespace().unwrap_or_default(),
            workspace.name_any()
        )
        .red()
    );
    Action::requeue(backoff_full_jitter(
        Duration::from_millis(context.args.pool_base_delay_ms),
        Duration::from_millis(context.args.pool_max_delay_ms),
        attempt.saturating_sub(1),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_spec_timeout_wins_over_default() {
        assert_eq!(
            resolve_timeout(Some(5), 600),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn zero_disables_even_when_default_is_set() {
        assert_eq!(resolve_timeout(Some(0), 600), None);
    }

    #[test]
    fn absent_spec_falls_back_to_controller_default() {
        assert_eq!(
            resolve_timeout(None, 600),
            Some(Duration::from_secs(600))
        );
        assert_eq!(resolve_timeout(None, 0), None);
    }
}

use futures::stream::StreamExt;
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
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use arl_common::args::OperatorArgs;
use arl_common::wait::backoff_full_jitter;
use arl_types::{Task, TaskState, TaskStatus, Workspace, WorkspacePhase, WorkspaceStatus};

use super::steps::{self, StepOutcome};
use crate::middleware::{Chain, ReconcileRequest};
use crate::sidecar::SidecarClient;
use crate::sinks::{Sinks, TaskAuditRecord};
use crate::util::{self, Error, colors::{FG1, FG2}, patch::patch_status};
use crate::workspaces::actions as workspace_actions;

const WORKSPACE_WAIT: Duration = Duration::from_secs(2);
const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Entrypoint for the `Task` controller: runs step sequences against Ready
/// workspaces over the sidecar wire protocol.
pub async fn run(
    client: Client,
    args: OperatorArgs,
    sinks: Sinks,
    chain: Chain,
    shutdown: CancellationToken,
) {
    println!("{}", "⚙️ Starting Task controller...".green());
    let namespace = args.namespace.clone();
    let max_concurrent = args.workspace_max_concurrent;
    let context = Arc::new(ContextData::new(client.clone(), args, sinks, chain));
    let tasks: Api<Task> = Api::namespaced(client, &namespace);
    Controller::new(tasks, Default::default())
        .with_config(Config::default().concurrency(max_concurrent))
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, on_error, context)
        .for_each(|_res| async move {})
        .await;
    println!("{}", "🛑 Task controller stopped.".red());
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

async fn reconcile(task: Arc<Task>, context: Arc<ContextData>) -> Result<Action, Error> {
    let namespace = task.namespace().ok_or_else(|| {
        Error::UserInput("Expected Task resource to be namespaced.".to_owned())
    })?;
    let name = task.name_any();
    let request = ReconcileRequest::new("Task", namespace.clone(), name.clone());
    let chain = context.chain.clone();
    let result = chain
        .wrap(
            &request,
            reconcile_task(task, context.clone(), &namespace, &name),
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
        Err(e) if e.is_conflict() => Ok(Action::requeue(Duration::from_millis(500))),
        Err(e) => Err(e),
    }
}

async fn reconcile_task(
    task: Arc<Task>,
    context: Arc<ContextData>,
    namespace: &str,
    name: &str,
) -> Result<Action, Error> {
    let client = context.client.clone();
    if task.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let state = task.status.as_ref().and_then(|s| s.state);
    if state.is_some_and(|s| s.is_terminal()) {
        return Ok(Action::await_change());
    }

    // Resolve the workspace; a missing reference is a terminal failure, not
    // something to retry.
    let workspaces: Api<Workspace> = Api::namespaced(client.clone(), namespace);
    let workspace = match workspaces.get(&task.spec.workspace_ref).await {
        Ok(workspace) => workspace,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            let updated = patch_status(
                client,
                "fail Task for missing Workspace",
                &*task,
                |status: &mut TaskStatus| {
                    status.state = Some(TaskState::Failed);
                    status.exit_code = Some(1);
                    status.stderr = Some(format!(
                        "workspace not found: {}",
                        task.spec.workspace_ref
                    ));
                    status.completion_time = Some(util::now());
                },
            )
            .await?;
            context.sinks.metrics.task_state("Failed");
            finish_audit(&context, &updated).await;
            return Ok(Action::await_change());
        }
        Err(e) => return Err(Error::api("get Workspace for Task", namespace, name, e)),
    };

    let ws_status = workspace.status.clone().unwrap_or_default();
    let ready = ws_status.phase == Some(WorkspacePhase::Ready);
    let endpoint = match (&ws_status.pod_ip, &ws_status.work_dir) {
        (Some(pod_ip), Some(work_dir)) if ready => Some((pod_ip.clone(), work_dir.clone())),
        _ => None,
    };
    let Some((pod_ip, work_dir)) = endpoint else {
        if state != Some(TaskState::Pending) {
            patch_status(
                client,
                "park Task until Workspace is ready",
                &*task,
                |status: &mut TaskStatus| {
                    status.state = Some(TaskState::Pending);
                },
            )
            .await?;
            context.sinks.metrics.task_state("Pending");
        }
        return Ok(Action::requeue(WORKSPACE_WAIT));
    };

    // First run: stamp Running + startTime before any RPC goes out.
    let running = if state.is_none() || state == Some(TaskState::Pending) {
        let updated = patch_status(
            client.clone(),
            "mark Task running",
            &*task,
            |status: &mut TaskStatus| {
                status.state = Some(TaskState::Running);
                status.start_time = Some(util::now());
            },
        )
        .await?;
        context.sinks.metrics.task_state("Running");
        updated
    } else {
        (*task).clone()
    };

    let step_timeout = resolve_step_timeout(task.spec.timeout.as_deref())?;
    let outcome = match SidecarClient::connect(
        &pod_ip,
        context.args.sidecar_grpc_port,
        Duration::from_secs(context.args.http_client_timeout_seconds),
    )
    .await
    {
        Ok(sidecar) => steps::run_steps(&sidecar, &work_dir, step_timeout, &task.spec.steps).await,
        // Unreachable pods fail the task immediately; the allocator notices
        // the dead pod on its own schedule.
        Err(e) => StepOutcome {
            exit_code: 1,
            stdout: String::new(),
            stderr: format!("{e}\n"),
            steps_run: 0,
        },
    };

    let completion = util::now();
    let final_state = if outcome.succeeded() {
        TaskState::Succeeded
    } else {
        TaskState::Failed
    };
    let start_time = running
        .status
        .as_ref()
        .and_then(|s| s.start_time.clone())
        .unwrap_or_else(util::now);
    let duration_seconds = util::seconds_between(&start_time, &completion);
    let completion_for_status = completion.clone();
    let updated = patch_status(
        client.clone(),
        "record Task outcome",
        &running,
        move |status: &mut TaskStatus| {
            status.state = Some(final_state);
            status.exit_code = Some(outcome.exit_code);
            status.stdout = Some(outcome.stdout);
            status.stderr = Some(outcome.stderr);
            status.duration = Some(format!("{duration_seconds:.3}s"));
            status.completion_time = Some(completion_for_status);
        },
    )
    .await?;
    context.sinks.metrics.task_duration_seconds(duration_seconds);
    context.sinks.metrics.task_state(&final_state.to_string());
    println!(
        "🏁 {}{}{}{}{}",
        namespace.color(FG2),
        "/".color(FG1),
        name.color(FG2),
        " finished: ".color(FG1),
        final_state.color(FG2),
    );

    // Refresh the idle clock; a conflict here only delays reclamation.
    let completion_for_workspace = completion.clone();
    if let Err(e) = patch_status(
        client.clone(),
        "refresh lastTaskTime on Workspace",
        &workspace,
        move |status: &mut WorkspaceStatus| {
            status.last_task_time = Some(completion_for_workspace);
        },
    )
    .await
    {
        eprintln!(
            "{}",
            format!(
                "failed to update lastTaskTime on workspace {namespace}/{}: {e}",
                workspace.name_any()
            )
            .yellow()
        );
    }

    finish_audit(&context, &updated).await;
    flag_workspace_cleanup(&context, &workspace, namespace, &task).await?;
    Ok(Action::await_change())
}

/// Per-command timeout: the task's human-readable duration, or 30 s.
fn resolve_step_timeout(spec_timeout: Option<&str>) -> Result<Duration, Error> {
    match spec_timeout {
        Some(raw) => Ok(parse_duration::parse(raw)?),
        None => Ok(DEFAULT_STEP_TIMEOUT),
    }
}

/// TTL-less tasks are audited right away; tasks with a TTL are audited by
/// the reaper so the record is written exactly once.
async fn finish_audit(context: &ContextData, task: &Task) {
    if task.spec.ttl_seconds_after_finished.is_some() {
        return;
    }
    context.sinks.audit_task(audit_record(task)).await;
}

/// When every task targeting the workspace is terminal and it is not kept
/// alive, flag it for the allocator to delete.
async fn flag_workspace_cleanup(
    context: &ContextData,
    workspace: &Workspace,
    namespace: &str,
    just_finished: &Task,
) -> Result<(), Error> {
    if !context.args.enable_auto_cleanup || workspace.spec.keep_alive {
        return Ok(());
    }
    let tasks: Api<Task> = Api::namespaced(context.client.clone(), namespace);
    let all = tasks
        .list(&ListParams::default())
        .await
        .map_err(|e| {
            Error::api(
                "list Tasks for Workspace cleanup",
                namespace,
                &workspace.name_any(),
                e,
            )
        })?;
    let workspace_name = workspace.name_any();
    let finished_uid = just_finished.uid();
    let all_terminal = all
        .items
        .iter()
        .filter(|t| t.spec.workspace_ref == workspace_name)
        // The list may still show the pre-patch state of the task we just
        // finished; we know it is terminal.
        .filter(|t| t.uid() != finished_uid)
        .all(|t| {
            t.status
                .as_ref()
                .and_then(|s| s.state)
                .is_some_and(|s| s.is_terminal())
        });
    if all_terminal {
        workspace_actions::mark_ready_for_cleanup(context.client.clone(), workspace).await?;
    }
    Ok(())
}

/// The completion record both the executor and the reaper ship to the audit
/// sink, built purely from the task's persisted state.
pub(crate) fn audit_record(task: &Task) -> TaskAuditRecord {
    let status = task.status.clone().unwrap_or_default();
    let duration_seconds = match (status.start_time.as_ref(), status.completion_time.as_ref()) {
        (Some(start), Some(end)) => util::seconds_between(start, end),
        _ => 0.0,
    };
    TaskAuditRecord {
        trace_id: task.spec.trace_id.clone(),
        namespace: task.namespace().unwrap_or_default(),
        name: task.name_any(),
        workspace_ref: task.spec.workspace_ref.clone(),
        state: status
            .state
            .map(|s| s.to_string())
            .unwrap_or_default(),
        exit_code: status.exit_code.unwrap_or_default(),
        duration_seconds,
        step_count: task.spec.steps.len(),
        input: serde_json::to_string(&task.spec.steps).unwrap_or_default(),
        stdout: status.stdout.unwrap_or_default(),
        stderr: status.stderr.unwrap_or_default(),
        start_time: status.start_time.map(|t| t.0.to_string()),
        completion_time: status.completion_time.map(|t| t.0.to_string()),
    }
}

fn on_error(task: Arc<Task>, error: &Error, context: Arc<ContextData>) -> Action {
    let key = (task.namespace().unwrap_or_default(), task.name_any());
    let attempt = {
        let mut failures = context.failures.lock().unwrap_or_else(|e| e.into_inner());
        let entry = failures.entry(key).or_insert(0);
        *entry += 1;
        *entry
    };
    eprintln!(
        "{}",
        format!(
            "Reconciliation error for Task {}/{} (attempt {attempt}): {error}",
            task.namespace().unwrap_or_default(),
            task.name_any()
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
    use arl_types::TaskSpec;

    #[test]
    fn step_timeout_defaults_to_thirty_seconds() {
        assert_eq!(resolve_step_timeout(None).unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn step_timeout_parses_human_durations() {
        assert_eq!(
            resolve_step_timeout(Some("5m")).unwrap(),
            Duration::from_secs(300)
        );
        assert_eq!(
            resolve_step_timeout(Some("90s")).unwrap(),
            Duration::from_secs(90)
        );
        assert!(resolve_step_timeout(Some("not a duration")).is_err());
    }

    #[test]
    fn audit_record_reflects_persisted_status() {
        let mut task = Task::new(
            "t1",
            TaskSpec {
                workspace_ref: "ws".to_string(),
                trace_id: Some("trace-7".to_string()),
                ..Default::default()
            },
        );
        task.metadata.namespace = Some("default".to_string());
        let start = util::now();
        task.status = Some(TaskStatus {
            state: Some(TaskState::Succeeded),
            exit_code: Some(0),
            stdout: Some("hi\n".to_string()),
            start_time: Some(start.clone()),
            completion_time: Some(start),
            ..Default::default()
        });
        let record = audit_record(&task);
        assert_eq!(record.state, "Succeeded");
        assert_eq!(record.trace_id.as_deref(), Some("trace-7"));
        assert_eq!(record.exit_code, 0);
        assert_eq!(record.stdout, "hi\n");
        assert!(record.start_time.is_some());
    }
}

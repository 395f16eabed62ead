use futures::stream::StreamExt;
use kube::{
    Api, ResourceExt,
    client::Client,
    runtime::{Controller, controller::Action},
};
use owo_colors::OwoColorize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use arl_common::args::OperatorArgs;
use arl_types::Task;

use super::reconcile::audit_record;
use crate::sinks::Sinks;
use crate::util::{self, Error};

/// Entrypoint for the TTL reaper: deletes finished tasks once their
/// `ttlSecondsAfterFinished` elapses, writing the terminal audit record
/// first.
pub async fn run_reaper(
    client: Client,
    args: OperatorArgs,
    sinks: Sinks,
    shutdown: CancellationToken,
) {
    println!("{}", "⚙️ Starting Task TTL reaper...".green());
    let namespace = args.namespace.clone();
    let context = Arc::new(ContextData {
        client: client.clone(),
        sinks,
        audited: Mutex::new(HashSet::new()),
    });
    let tasks: Api<Task> = Api::namespaced(client, &namespace);
    Controller::new(tasks, Default::default())
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, on_error, context)
        .for_each(|_res| async move {})
        .await;
    println!("{}", "🛑 Task TTL reaper stopped.".red());
}

struct ContextData {
    client: Client,
    sinks: Sinks,
    /// Task UIDs whose audit record was already shipped, so a failed delete
    /// retried later does not write a second record.
    audited: Mutex<HashSet<String>>,
}

async fn reconcile(task: Arc<Task>, context: Arc<ContextData>) -> Result<Action, Error> {
    let namespace = task.namespace().ok_or_else(|| {
        Error::UserInput("Expected Task resource to be namespaced.".to_owned())
    })?;
    let name = task.name_any();

    if task.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let is_terminal = task
        .status
        .as_ref()
        .and_then(|s| s.state)
        .is_some_and(|s| s.is_terminal());
    let Some(ttl) = task.spec.ttl_seconds_after_finished.filter(|_| is_terminal) else {
        return Ok(Action::await_change());
    };
    let Some(completed_at) = task
        .status
        .as_ref()
        .and_then(|s| s.completion_time.as_ref())
    else {
        return Ok(Action::await_change());
    };

    let ttl = Duration::from_secs(ttl.max(0) as u64);
    let age = util::age_of(completed_at).unwrap_or(Duration::ZERO);
    if age < ttl {
        return Ok(Action::requeue(ttl - age));
    }

    // Audit before delete so the record survives even if the delete has to
    // be retried; the dedup set keeps it single-shot across retries.
    let newly_audited = task
        .uid()
        .map(|uid| {
            context
                .audited
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(uid)
        })
        .unwrap_or(true);
    if newly_audited {
        context.sinks.audit_task(audit_record(&task)).await;
    }

    let api: Api<Task> = Api::namespaced(context.client.clone(), &namespace);
    match api.delete(&name, &Default::default()).await {
        Ok(_) => {
            context.sinks.metrics.task_cleanup();
            println!(
                "{} {}",
                "🧹 Reaped finished task".green(),
                format!("{namespace}/{name}").green().dimmed(),
            );
            if let Some(uid) = task.uid() {
                context
                    .audited
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&uid);
            }
            Ok(Action::await_change())
        }
        // Already gone: nothing to reap, nothing to count.
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(Action::await_change()),
        Err(e) => Err(Error::api("delete expired Task", &namespace, &name, e)),
    }
}

fn on_error(task: Arc<Task>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!(
            "TTL reaper error for Task {}/{}: {error}",
            task.namespace().unwrap_or_default(),
            task.name_any()
        )
        .red()
    );
    Action::requeue(Duration::from_secs(5))
}

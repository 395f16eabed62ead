use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::ResourceExt;

use arl_common::{annotations, labels};

/// Container waiting reasons treated as startup failures.
pub const ERROR_WAITING_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerError",
];

/// Subset of `ERROR_WAITING_REASONS` counted as image pull errors.
pub const IMAGE_PULL_REASONS: &[&str] = &["ImagePullBackOff", "ErrImagePull"];

const MAX_RESTARTS: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodFailure {
    pub pod: String,
    pub uid: String,
    pub container: String,
    pub reason: String,
    pub message: String,
}

/// One pass over a pool's pods, bucketed by `status` label, runtime phase and
/// container health. Terminating pods are invisible to every bucket so a
/// deleted pod's deficit is re-detected immediately.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PoolCensus {
    /// Non-terminating pods regardless of health.
    pub total: usize,
    /// Names of idle-labeled pods, sorted, deletion candidates first-to-last.
    pub idle: Vec<String>,
    /// Idle pods whose `Ready` condition is `True`.
    pub idle_ready: usize,
    pub allocated: usize,
    pub pending: usize,
    pub running: usize,
    pub failed: usize,
    /// Startup failures (crash loops, pull errors, create errors, restarts).
    pub failing: Vec<PodFailure>,
    /// Failing entries whose reason is an image pull error.
    pub image_pull_errors: Vec<PodFailure>,
    /// Idle pods built from an outdated template hash.
    pub drifted_idle: Vec<String>,
}

impl PoolCensus {
    pub fn is_healthy(&self) -> bool {
        self.failing.is_empty()
    }
}

pub fn take_census(pods: &[Pod], expected_hash: &str) -> PoolCensus {
    let mut census = PoolCensus::default();
    for pod in pods {
        if pod.metadata.deletion_timestamp.is_some() {
            continue;
        }
        census.total += 1;

        let status_label = pod
            .labels()
            .get(labels::STATUS)
            .map(String::as_str)
            .unwrap_or_default();
        match status_label {
            labels::STATUS_IDLE => {
                census.idle.push(pod.name_any());
                if pod_is_ready(pod) {
                    census.idle_ready += 1;
                }
                if pod
                    .annotations()
                    .get(annotations::SPEC_HASH)
                    .is_none_or(|h| h != expected_hash)
                {
                    census.drifted_idle.push(pod.name_any());
                }
            }
            labels::STATUS_ALLOCATED => census.allocated += 1,
            _ => {}
        }

        match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("Pending") => census.pending += 1,
            Some("Running") => census.running += 1,
            Some("Failed") => census.failed += 1,
            _ => {}
        }

        let failures = pod_failures(pod);
        census.image_pull_errors.extend(
            failures
                .iter()
                .filter(|f| IMAGE_PULL_REASONS.contains(&f.reason.as_str()))
                .cloned(),
        );
        census.failing.extend(failures);
    }
    census.idle.sort();
    census.drifted_idle.sort();
    census
}

fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.type_ == "Ready"))
        .is_some_and(|c| c.status == "True")
}

fn pod_failures(pod: &Pod) -> Vec<PodFailure> {
    let mut failures = Vec::new();
    let Some(status) = pod.status.as_ref() else {
        return failures;
    };
    let statuses = status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten());
    for cs in statuses {
        if let Some(failure) = container_failure(pod, cs) {
            failures.push(failure);
        }
    }
    failures
}

fn container_failure(pod: &Pod, cs: &ContainerStatus) -> Option<PodFailure> {
    let uid = pod.uid().unwrap_or_default();
    if let Some(waiting) = cs.state.as_ref().and_then(|s| s.waiting.as_ref()) {
        let reason = waiting.reason.as_deref().unwrap_or_default();
        if ERROR_WAITING_REASONS.contains(&reason) {
            return Some(PodFailure {
                pod: pod.name_any(),
                uid,
                container: cs.name.clone(),
                reason: reason.to_string(),
                message: waiting
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("container '{}' is waiting: {reason}", cs.name)),
            });
        }
    }
    if cs.restart_count > MAX_RESTARTS
        && let Some(terminated) = cs
            .last_state
            .as_ref()
            .and_then(|last| last.terminated.as_ref())
    {
        return Some(PodFailure {
            pod: pod.name_any(),
            uid,
            container: cs.name.clone(),
            reason: terminated
                .reason
                .clone()
                .unwrap_or_else(|| "Restarting".to_string()),
            message: format!(
                "container '{}' restarted {} times (last exit code {})",
                cs.name, cs.restart_count, terminated.exit_code
            ),
        });
    }
    None
}

use async_trait::async_trait;
use owo_colors::OwoColorize;
use serde::Serialize;
use std::sync::Arc;

pub mod audit;
pub mod metrics;

pub use audit::HttpAuditSink;
pub use metrics::PrometheusMetrics;

/// Workspace lifecycle audit record (§ release, bind, phase changes).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceAuditRecord {
    pub namespace: String,
    pub name: String,
    pub pool_ref: String,
    pub phase: String,
    pub pod_name: Option<String>,
    pub event: String,
}

/// Task completion audit record, written exactly once per task: immediately
/// when no TTL is set, otherwise by the reaper.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAuditRecord {
    pub trace_id: Option<String>,
    pub namespace: String,
    pub name: String,
    pub workspace_ref: String,
    pub state: String,
    pub exit_code: i32,
    pub duration_seconds: f64,
    pub step_count: usize,
    pub input: String,
    pub stdout: String,
    pub stderr: String,
    pub start_time: Option<String>,
    pub completion_time: Option<String>,
}

/// Telemetry events the controllers emit. One method per event named in the
/// interface contract; implementations must be cheap and non-blocking.
pub trait MetricsSink: Send + Sync {
    fn pool_utilization(&self, pool: &str, ready: i64, allocated: i64);
    fn pending_pods(&self, pool: &str, pending: i64);
    fn pod_created(&self, pool: &str, reason: &str);
    fn pod_deleted(&self, pool: &str, reason: &str);
    fn schedule_latency(&self, pool: &str, seconds: f64);
    fn ready_latency(&self, pool: &str, seconds: f64);
    fn first_pod_ready(&self, pool: &str, seconds: f64);
    fn all_pods_ready(&self, pool: &str, seconds: f64);
    fn container_start_latency(&self, pool: &str, container: &str, seconds: f64);
    fn image_pull_error(&self, pool: &str, reason: &str);
    fn no_idle_pods(&self, pool: &str);
    fn workspace_allocation_seconds(&self, pool: &str, seconds: f64);
    fn workspace_idle_seconds(&self, pool: &str, seconds: f64);
    fn task_duration_seconds(&self, seconds: f64);
    fn task_state(&self, state: &str);
    fn task_cleanup(&self);
    fn audit_write_error(&self, kind: &str);
}

pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn pool_utilization(&self, _: &str, _: i64, _: i64) {}
    fn pending_pods(&self, _: &str, _: i64) {}
    fn pod_created(&self, _: &str, _: &str) {}
    fn pod_deleted(&self, _: &str, _: &str) {}
    fn schedule_latency(&self, _: &str, _: f64) {}
    fn ready_latency(&self, _: &str, _: f64) {}
    fn first_pod_ready(&self, _: &str, _: f64) {}
    fn all_pods_ready(&self, _: &str, _: f64) {}
    fn container_start_latency(&self, _: &str, _: &str, _: f64) {}
    fn image_pull_error(&self, _: &str, _: &str) {}
    fn no_idle_pods(&self, _: &str) {}
    fn workspace_allocation_seconds(&self, _: &str, _: f64) {}
    fn workspace_idle_seconds(&self, _: &str, _: f64) {}
    fn task_duration_seconds(&self, _: f64) {}
    fn task_state(&self, _: &str) {}
    fn task_cleanup(&self) {}
    fn audit_write_error(&self, _: &str) {}
}

/// Best-effort delivery of audit records; failures are the caller's to count,
/// never to propagate into reconciliation.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn workspace_event(&self, record: &WorkspaceAuditRecord) -> anyhow::Result<()>;
    async fn task_completion(&self, record: &TaskAuditRecord) -> anyhow::Result<()>;
}

pub struct NoopAudit;

#[async_trait]
impl AuditSink for NoopAudit {
    async fn workspace_event(&self, _: &WorkspaceAuditRecord) -> anyhow::Result<()> {
        Ok(())
    }

    async fn task_completion(&self, _: &TaskAuditRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The sink pair every controller context carries. Which implementations sit
/// behind the trait objects is decided once at startup.
#[derive(Clone)]
pub struct Sinks {
    pub metrics: Arc<dyn MetricsSink>,
    pub audit: Arc<dyn AuditSink>,
}

impl Sinks {
    pub fn noop() -> Self {
        Self {
            metrics: Arc::new(NoopMetrics),
            audit: Arc::new(NoopAudit),
        }
    }

    pub fn new(metrics: Arc<dyn MetricsSink>, audit: Arc<dyn AuditSink>) -> Self {
        Self { metrics, audit }
    }

    /// Deliver a workspace audit record, folding failures into the error
    /// counter so reconciliation never blocks on the sink.
    pub async fn audit_workspace(&self, record: WorkspaceAuditRecord) {
        if let Err(e) = self.audit.workspace_event(&record).await {
            self.metrics.audit_write_error("workspace");
            eprintln!(
                "{}",
                format!(
                    "audit write failed for workspace {}/{}: {e}",
                    record.namespace, record.name
                )
                .yellow()
            );
        }
    }

    pub async fn audit_task(&self, record: TaskAuditRecord) {
        if let Err(e) = self.audit.task_completion(&record).await {
            self.metrics.audit_write_error("task");
            eprintln!(
                "{}",
                format!(
                    "audit write failed for task {}/{}: {e}",
                    record.namespace, record.name
                )
                .yellow()
            );
        }
    }
}

use lazy_static::lazy_static;
use prometheus::{
    HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, histogram_opts, opts,
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge_vec,
};

use super::MetricsSink;

/// 50ms .. ~27min, covering label writes through cold image pulls.
fn latency_buckets() -> Vec<f64> {
    prometheus::exponential_buckets(0.05, 2.0, 15).unwrap()
}

lazy_static! {
    static ref READY_REPLICAS: IntGaugeVec = register_int_gauge_vec!(
        opts!("arl_warmpool_ready_replicas", "Idle pods ready to be claimed"),
        &["pool"]
    )
    .unwrap();
    static ref ALLOCATED_REPLICAS: IntGaugeVec = register_int_gauge_vec!(
        opts!("arl_warmpool_allocated_replicas", "Pods bound to workspaces"),
        &["pool"]
    )
    .unwrap();
    static ref PENDING_PODS: IntGaugeVec = register_int_gauge_vec!(
        opts!("arl_warmpool_pending_pods", "Pool pods not yet running"),
        &["pool"]
    )
    .unwrap();
    static ref POD_CREATED: IntCounterVec = register_int_counter_vec!(
        opts!("arl_warmpool_pod_created_total", "Pods created, by reason"),
        &["pool", "reason"]
    )
    .unwrap();
    static ref POD_DELETED: IntCounterVec = register_int_counter_vec!(
        opts!("arl_warmpool_pod_deleted_total", "Pods deleted, by reason"),
        &["pool", "reason"]
    )
    .unwrap();
    static ref SCHEDULE_LATENCY: HistogramVec = register_histogram_vec!(
        histogram_opts!(
            "arl_warmpool_pod_schedule_seconds",
            "Pod creation to PodScheduled",
            latency_buckets()
        ),
        &["pool"]
    )
    .unwrap();
    static ref READY_LATENCY: HistogramVec = register_histogram_vec!(
        histogram_opts!(
            "arl_warmpool_pod_ready_seconds",
            "Pod creation to Ready",
            latency_buckets()
        ),
        &["pool"]
    )
    .unwrap();
    static ref FIRST_POD_READY: HistogramVec = register_histogram_vec!(
        histogram_opts!(
            "arl_warmpool_first_pod_ready_seconds",
            "Scale-up start to first pod Ready",
            latency_buckets()
        ),
        &["pool"]
    )
    .unwrap();
    static ref ALL_PODS_READY: HistogramVec = register_histogram_vec!(
        histogram_opts!(
            "arl_warmpool_all_pods_ready_seconds",
            "Scale-up start to full pool Ready",
            latency_buckets()
        ),
        &["pool"]
    )
    .unwrap();
    static ref CONTAINER_START: HistogramVec = register_histogram_vec!(
        histogram_opts!(
            "arl_warmpool_container_start_seconds",
            "Pod start to container running",
            latency_buckets()
        ),
        &["pool", "container"]
    )
    .unwrap();
    static ref IMAGE_PULL_ERRORS: IntCounterVec = register_int_counter_vec!(
        opts!(
            "arl_warmpool_image_pull_errors_total",
            "Image pull failures, once per (pod, container, reason)"
        ),
        &["pool", "reason"]
    )
    .unwrap();
    static ref NO_IDLE_PODS: IntCounterVec = register_int_counter_vec!(
        opts!(
            "arl_workspace_no_idle_pods_total",
            "Allocation attempts that found the pool drained"
        ),
        &["pool"]
    )
    .unwrap();
    static ref WORKSPACE_ALLOCATION: HistogramVec = register_histogram_vec!(
        histogram_opts!(
            "arl_workspace_allocation_seconds",
            "Workspace creation to Ready, end to end",
            latency_buckets()
        ),
        &["pool"]
    )
    .unwrap();
    static ref WORKSPACE_IDLE: HistogramVec = register_histogram_vec!(
        histogram_opts!(
            "arl_workspace_idle_seconds",
            "Idle time of reclaimed workspaces",
            latency_buckets()
        ),
        &["pool"]
    )
    .unwrap();
    static ref TASK_DURATION: prometheus::Histogram = register_histogram!(histogram_opts!(
        "arl_task_duration_seconds",
        "Wall-clock task duration",
        latency_buckets()
    ))
    .unwrap();
    static ref TASK_STATE: IntCounterVec = register_int_counter_vec!(
        opts!("arl_task_state_total", "Task state transitions"),
        &["state"]
    )
    .unwrap();
    static ref TASK_CLEANUP: IntCounter = register_int_counter!(opts!(
        "arl_task_cleanup_total",
        "Tasks deleted by the TTL reaper"
    ))
    .unwrap();
    static ref AUDIT_WRITE_ERRORS: IntCounterVec = register_int_counter_vec!(
        opts!(
            "arl_audit_write_errors_total",
            "Audit records dropped by sink failures"
        ),
        &["kind"]
    )
    .unwrap();
}

/// `MetricsSink` backed by the process-wide prometheus registry that the
/// exposition server in `arl-common` renders.
pub struct PrometheusMetrics;

impl MetricsSink for PrometheusMetrics {
    fn pool_utilization(&self, pool: &str, ready: i64, allocated: i64) {
        READY_REPLICAS.with_label_values(&[pool]).set(ready);
        ALLOCATED_REPLICAS.with_label_values(&[pool]).set(allocated);
    }

    fn pending_pods(&self, pool: &str, pending: i64) {
        PENDING_PODS.with_label_values(&[pool]).set(pending);
    }

    fn pod_created(&self, pool: &str, reason: &str) {
        POD_CREATED.with_label_values(&[pool, reason]).inc();
    }

    fn pod_deleted(&self, pool: &str, reason: &str) {
        POD_DELETED.with_label_values(&[pool, reason]).inc();
    }

    fn schedule_latency(&self, pool: &str, seconds: f64) {
        SCHEDULE_LATENCY.with_label_values(&[pool]).observe(seconds);
    }

    fn ready_latency(&self, pool: &str, seconds: f64) {
        READY_LATENCY.with_label_values(&[pool]).observe(seconds);
    }

    fn first_pod_ready(&self, pool: &str, seconds: f64) {
        FIRST_POD_READY.with_label_values(&[pool]).observe(seconds);
    }

    fn all_pods_ready(&self, pool: &str, seconds: f64) {
        ALL_PODS_READY.with_label_values(&[pool]).observe(seconds);
    }

    fn container_start_latency(&self, pool: &str, container: &str, seconds: f64) {
        CONTAINER_START
            .with_label_values(&[pool, container])
            .observe(seconds);
    }

    fn image_pull_error(&self, pool: &str, reason: &str) {
        IMAGE_PULL_ERRORS.with_label_values(&[pool, reason]).inc();
    }

    fn no_idle_pods(&self, pool: &str) {
        NO_IDLE_PODS.with_label_values(&[pool]).inc();
    }

    fn workspace_allocation_seconds(&self, pool: &str, seconds: f64) {
        WORKSPACE_ALLOCATION
            .with_label_values(&[pool])
            .observe(seconds);
    }

    fn workspace_idle_seconds(&self, pool: &str, seconds: f64) {
        WORKSPACE_IDLE.with_label_values(&[pool]).observe(seconds);
    }

    fn task_duration_seconds(&self, seconds: f64) {
        TASK_DURATION.observe(seconds);
    }

    fn task_state(&self, state: &str) {
        TASK_STATE.with_label_values(&[state]).inc();
    }

    fn task_cleanup(&self) {
        TASK_CLEANUP.inc();
    }

    fn audit_write_error(&self, kind: &str) {
        AUDIT_WRITE_ERRORS.with_label_values(&[kind]).inc();
    }
}

use k8s_openapi::api::core::v1::Container;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{fmt, str::FromStr};

fn default_enabled() -> bool {
    true
}

/// Pod template a `Pool` stamps out. User labels are preserved on every pod;
/// the `pool`, `status` and `workspace` labels are reserved for the operator.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    pub containers: Vec<Container>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub node_selector: Option<BTreeMap<String, String>>,
    pub service_account_name: Option<String>,
}

/// A tool provisioned into the shared tools volume without building an image.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InlineTool {
    pub name: String,
    pub entrypoint: String,
    /// Filename -> file content, written next to the generated manifest.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    pub runtime: Option<String>,
    pub description: Option<String>,
    /// JSON-schema-ish parameter description, passed through to the manifest.
    pub parameters: Option<serde_json::Value>,
    pub timeout_seconds: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolsBundle {
    /// Images whose `/tools/*` trees are copied into the shared volume.
    #[serde(default)]
    pub images: Vec<String>,
    /// ConfigMaps mounted and copied, one directory per ConfigMap.
    #[serde(default)]
    pub config_maps: Vec<String>,
    #[serde(default)]
    pub inline: Vec<InlineTool>,
}

impl ToolsBundle {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.config_maps.is_empty() && self.inline.is_empty()
    }
}

/// Per-pool override of the image-locality advisor. The advisor only ever
/// emits *preferred* node affinity; the cluster scheduler keeps final say.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageLocalityPolicy {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Fraction of replicas to spread across, (0, 1].
    pub spread_factor: Option<f64>,
    /// Preferred-affinity weight, [1, 100].
    pub weight: Option<i32>,
}

impl Default for ImageLocalityPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            spread_factor: None,
            weight: None,
        }
    }
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "arl.dev",
    version = "v1alpha1",
    kind = "Pool",
    plural = "pools",
    derive = "PartialEq",
    status = "PoolStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.replicas\", \"name\": \"REPLICAS\", \"type\": \"integer\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.readyReplicas\", \"name\": \"READY\", \"type\": \"integer\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.allocatedReplicas\", \"name\": \"ALLOCATED\", \"type\": \"integer\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    /// Desired count of warm pods, idle plus allocated; the operator-wide
    /// default applies when unset.
    pub replicas: Option<i32>,
    pub template: PodTemplate,
    pub tools: Option<ToolsBundle>,
    pub image_locality: Option<ImageLocalityPolicy>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub allocated_replicas: i32,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub last_updated: Option<Time>,
}

/// Resource hints forwarded to schedulers and dashboards; the pod itself is
/// already created, so these never resize anything.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceHints {
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "arl.dev",
    version = "v1alpha1",
    kind = "Workspace",
    plural = "workspaces",
    derive = "PartialEq",
    status = "WorkspaceStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.podName\", \"name\": \"POD\", \"type\": \"string\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSpec {
    /// Name of the Pool to claim an idle pod from, same namespace.
    pub pool_ref: String,
    /// Keep the workspace alive after all tasks finish.
    #[serde(default)]
    pub keep_alive: bool,
    /// Seconds without task activity before release; 0 or absent = never.
    pub idle_timeout_seconds: Option<i64>,
    /// Hard cap on workspace age in seconds; 0 or absent = unbounded.
    pub max_lifetime_seconds: Option<i64>,
    #[serde(default)]
    pub resources: ResourceHints,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStatus {
    pub phase: Option<WorkspacePhase>,
    pub pod_name: Option<String>,
    pub pod_ip: Option<String>,
    pub work_dir: Option<String>,
    pub last_task_time: Option<Time>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub last_updated: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum WorkspacePhase {
    #[default]
    Pending,
    Bound,
    Ready,
    Failed,
}

impl WorkspacePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkspacePhase::Failed)
    }
}

impl FromStr for WorkspacePhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(WorkspacePhase::Pending),
            "Bound" => Ok(WorkspacePhase::Bound),
            "Ready" => Ok(WorkspacePhase::Ready),
            "Failed" => Ok(WorkspacePhase::Failed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for WorkspacePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspacePhase::Pending => write!(f, "Pending"),
            WorkspacePhase::Bound => write!(f, "Bound"),
            WorkspacePhase::Ready => write!(f, "Ready"),
            WorkspacePhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Write `content` to `path`, relative to the workspace directory unless
/// absolute.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilePatchStep {
    pub path: String,
    pub content: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepTarget {
    /// Run inside the sidecar container (default).
    #[default]
    Sidecar,
    /// Route through the executor agent's unix socket.
    Executor,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommandStep {
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub work_dir: Option<String>,
    pub container: Option<StepTarget>,
}

/// One step of a task. Exactly one of `file_patch` / `command` is set; a step
/// with both or neither is rejected by the executor.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskStep {
    pub name: String,
    pub file_patch: Option<FilePatchStep>,
    pub command: Option<CommandStep>,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "arl.dev",
    version = "v1alpha1",
    kind = "Task",
    plural = "tasks",
    derive = "PartialEq",
    status = "TaskStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.state\", \"name\": \"STATE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.exitCode\", \"name\": \"EXIT\", \"type\": \"integer\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.duration\", \"name\": \"DURATION\", \"type\": \"string\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// Name of the Workspace the steps run against, same namespace.
    pub workspace_ref: String,
    /// Per-command timeout as a human duration ("30s", "5m"); default 30s.
    pub timeout: Option<String>,
    #[serde(default)]
    pub steps: Vec<TaskStep>,
    /// Reserved for retry policies, bounded to [0, 10].
    pub retries: Option<i32>,
    pub ttl_seconds_after_finished: Option<i64>,
    /// Opaque correlation id carried into the audit record.
    pub trace_id: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub state: Option<TaskState>,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub duration: Option<String>,
    pub start_time: Option<Time>,
    pub completion_time: Option<Time>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub last_updated: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

impl FromStr for TaskState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(TaskState::Pending),
            "Running" => Ok(TaskState::Running),
            "Succeeded" => Ok(TaskState::Succeeded),
            "Failed" => Ok(TaskState::Failed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => write!(f, "Pending"),
            TaskState::Running => write!(f, "Running"),
            TaskState::Succeeded => write!(f, "Succeeded"),
            TaskState::Failed => write!(f, "Failed"),
        }
    }
}

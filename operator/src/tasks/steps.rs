use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use arl_types::{StepTarget, TaskStep};

use crate::sidecar::{CONTAINER_EXECUTOR, SidecarApi, pb};

/// Accumulated result of a step walk. `exit_code` is zero until the first
/// failing step, after which no further step is invoked.
#[derive(Debug, Default)]
pub struct StepOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub steps_run: usize,
}

impl StepOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    fn fail(&mut self, message: String) {
        self.stderr.push_str(&message);
        if !message.ends_with('\n') {
            self.stderr.push('\n');
        }
        self.exit_code = 1;
    }
}

/// Drive the task's steps in order over the sidecar. An empty step list is a
/// success with exit code 0.
pub async fn run_steps(
    sidecar: &dyn SidecarApi,
    work_dir: &str,
    default_timeout: Duration,
    steps: &[TaskStep],
) -> StepOutcome {
    let mut outcome = StepOutcome::default();
    for step in steps {
        outcome.steps_run += 1;
        match (&step.file_patch, &step.command) {
            (Some(patch), None) => {
                let (base, rel) = split_patch_path(work_dir, &patch.path);
                let files = BTreeMap::from([(rel, patch.content.clone())]);
                match sidecar.update_files(&base, files).await {
                    Ok(resp) if resp.success => {}
                    Ok(resp) => outcome.fail(format!("step '{}': {}", step.name, resp.message)),
                    Err(e) => outcome.fail(format!("step '{}': {e}", step.name)),
                }
            }
            (None, Some(command)) => {
                let request = pb::ExecuteRequest {
                    command: command.command.clone(),
                    env: command.env.clone().into_iter().collect(),
                    work_dir: command
                        .work_dir
                        .clone()
                        .unwrap_or_else(|| work_dir.to_string()),
                    timeout_seconds: default_timeout.as_secs() as i64,
                    container: match command.container {
                        Some(StepTarget::Executor) => CONTAINER_EXECUTOR.to_string(),
                        _ => String::new(),
                    },
                };
                match sidecar.execute(request).await {
                    Ok(resp) => {
                        outcome.stdout.push_str(&resp.stdout);
                        outcome.stderr.push_str(&resp.stderr);
                        outcome.exit_code = resp.exit_code;
                    }
                    Err(e) => outcome.fail(format!("step '{}': {e}", step.name)),
                }
            }
            _ => outcome.fail(format!(
                "step '{}': exactly one of filePatch or command must be set",
                step.name
            )),
        }
        if outcome.exit_code != 0 {
            break;
        }
    }
    outcome
}

/// Effective `(base, relative)` pair for a file patch: relative paths resolve
/// under the workspace, absolute paths inside the workspace are re-rooted,
/// and absolute paths outside it pass through with an empty base.
fn split_patch_path(work_dir: &str, path: &str) -> (String, String) {
    let p = Path::new(path);
    if !p.is_absolute() {
        return (work_dir.to_string(), path.to_string());
    }
    if !work_dir.is_empty()
        && let Ok(rel) = p.strip_prefix(work_dir)
    {
        return (work_dir.to_string(), rel.to_string_lossy().into_owned());
    }
    (String::new(), path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sidecar::SidecarError;
    use arl_types::{CommandStep, FilePatchStep};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        UpdateFiles { base: String, rel: String },
        Execute { command: Vec<String>, work_dir: String, timeout: i64, container: String },
    }

    /// Scripted sidecar: pops one response per `execute` call, records
    /// everything it is asked to do.
    struct FakeSidecar {
        calls: Mutex<Vec<Call>>,
        exec_exit_codes: Mutex<Vec<i32>>,
        fail_transport: bool,
        reject_files: bool,
    }

    impl FakeSidecar {
        fn new(exec_exit_codes: Vec<i32>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                exec_exit_codes: Mutex::new(exec_exit_codes),
                fail_transport: false,
                reject_files: false,
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SidecarApi for FakeSidecar {
        async fn update_files(
            &self,
            base_path: &str,
            files: std::collections::BTreeMap<String, String>,
        ) -> Result<pb::UpdateFilesResponse, SidecarError> {
            if self.fail_transport {
                return Err(SidecarError::Unreachable {
                    endpoint: "http://10.0.0.1:9090".into(),
                    message: "connection refused".into(),
                });
            }
            for rel in files.keys() {
                self.calls.lock().unwrap().push(Call::UpdateFiles {
                    base: base_path.to_string(),
                    rel: rel.clone(),
                });
            }
            Ok(pb::UpdateFilesResponse {
                success: !self.reject_files,
                message: if self.reject_files {
                    "read-only file system".into()
                } else {
                    String::new()
                },
            })
        }

        async fn execute(
            &self,
            request: pb::ExecuteRequest,
        ) -> Result<pb::ExecuteResponse, SidecarError> {
            if self.fail_transport {
                return Err(SidecarError::Timeout("deadline exceeded".into()));
            }
            self.calls.lock().unwrap().push(Call::Execute {
                command: request.command.clone(),
                work_dir: request.work_dir.clone(),
                timeout: request.timeout_seconds,
                container: request.container.clone(),
            });
            let exit_code = self.exec_exit_codes.lock().unwrap().remove(0);
            Ok(pb::ExecuteResponse {
                stdout: format!("{}\n", request.command.join(" ")),
                stderr: String::new(),
                exit_code,
                done: true,
            })
        }
    }

    fn command_step(name: &str, argv: &[&str]) -> TaskStep {
        TaskStep {
            name: name.to_string(),
            command: Some(CommandStep {
                command: argv.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn patch_step(name: &str, path: &str) -> TaskStep {
        TaskStep {
            name: name.to_string(),
            file_patch: Some(FilePatchStep {
                path: path.to_string(),
                content: "data".to_string(),
            }),
            ..Default::default()
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn empty_steps_succeed_with_exit_zero() {
        let sidecar = FakeSidecar::new(vec![]);
        let outcome = run_steps(&sidecar, "/workspace", TIMEOUT, &[]).await;
        assert!(outcome.succeeded());
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.steps_run, 0);
    }

    #[tokio::test]
    async fn first_failure_short_circuits_the_rest() {
        let sidecar = FakeSidecar::new(vec![0, 1]);
        let steps = vec![
            command_step("ok", &["true"]),
            command_step("boom", &["false"]),
            command_step("never", &["echo", "never"]),
        ];
        let outcome = run_steps(&sidecar, "/workspace", TIMEOUT, &steps).await;
        assert!(!outcome.succeeded());
        assert_eq!(outcome.steps_run, 2);
        assert_eq!(sidecar.calls().len(), 2);
        assert!(!outcome.stdout.contains("never"));
    }

    #[tokio::test]
    async fn steps_run_in_declaration_order() {
        let sidecar = FakeSidecar::new(vec![0]);
        let steps = vec![patch_step("write", "train.py"), command_step("run", &["python", "train.py"])];
        let outcome = run_steps(&sidecar, "/workspace", TIMEOUT, &steps).await;
        assert!(outcome.succeeded());
        let calls = sidecar.calls();
        assert!(matches!(&calls[0], Call::UpdateFiles { .. }));
        assert!(matches!(&calls[1], Call::Execute { .. }));
    }

    #[tokio::test]
    async fn patch_paths_are_normalized() {
        let sidecar = FakeSidecar::new(vec![]);
        let steps = vec![
            patch_step("relative", "src/main.py"),
            patch_step("inside", "/workspace/data/x.json"),
            patch_step("outside", "/etc/hosts"),
        ];
        let outcome = run_steps(&sidecar, "/workspace", TIMEOUT, &steps).await;
        assert!(outcome.succeeded());
        assert_eq!(
            sidecar.calls(),
            vec![
                Call::UpdateFiles { base: "/workspace".into(), rel: "src/main.py".into() },
                Call::UpdateFiles { base: "/workspace".into(), rel: "data/x.json".into() },
                Call::UpdateFiles { base: "".into(), rel: "/etc/hosts".into() },
            ]
        );
    }

    #[tokio::test]
    async fn command_resolves_work_dir_timeout_and_container() {
        let sidecar = FakeSidecar::new(vec![0, 0]);
        let mut custom = command_step("custom", &["ls"]);
        custom.command.as_mut().unwrap().work_dir = Some("/tmp".to_string());
        custom.command.as_mut().unwrap().container = Some(StepTarget::Executor);
        let steps = vec![custom, command_step("default", &["pwd"])];
        let outcome = run_steps(&sidecar, "/workspace", Duration::from_secs(90), &steps).await;
        assert!(outcome.succeeded());
        assert_eq!(
            sidecar.calls(),
            vec![
                Call::Execute {
                    command: vec!["ls".into()],
                    work_dir: "/tmp".into(),
                    timeout: 90,
                    container: "executor".into(),
                },
                Call::Execute {
                    command: vec!["pwd".into()],
                    work_dir: "/workspace".into(),
                    timeout: 90,
                    container: "".into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn transport_failure_fails_the_step() {
        let mut sidecar = FakeSidecar::new(vec![]);
        sidecar.fail_transport = true;
        let steps = vec![command_step("run", &["true"]), command_step("after", &["true"])];
        let outcome = run_steps(&sidecar, "/workspace", TIMEOUT, &steps).await;
        assert_eq!(outcome.exit_code, 1);
        assert_eq!(outcome.steps_run, 1);
        assert!(outcome.stderr.contains("deadline exceeded"));
    }

    #[tokio::test]
    async fn rejected_file_write_fails_the_step() {
        let mut sidecar = FakeSidecar::new(vec![]);
        sidecar.reject_files = true;
        let outcome =
            run_steps(&sidecar, "/workspace", TIMEOUT, &[patch_step("w", "x.txt")]).await;
        assert_eq!(outcome.exit_code, 1);
        assert!(outcome.stderr.contains("read-only file system"));
    }

    #[tokio::test]
    async fn malformed_step_fails_without_rpc() {
        let sidecar = FakeSidecar::new(vec![]);
        let steps = vec![TaskStep {
            name: "nothing".to_string(),
            ..Default::default()
        }];
        let outcome = run_steps(&sidecar, "/workspace", TIMEOUT, &steps).await;
        assert_eq!(outcome.exit_code, 1);
        assert!(sidecar.calls().is_empty());
        assert!(outcome.stderr.contains("exactly one of"));
    }
}

use k8s_openapi::api::core::v1::{
    Affinity, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, HTTPGetAction,
    NodeAffinity, NodeSelectorRequirement, NodeSelectorTerm, Pod, PodSpec,
    PreferredSchedulingTerm, Probe, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{ObjectMeta, Resource};
use std::collections::BTreeMap;

use arl_common::args::OperatorArgs;
use arl_common::{annotations, labels};
use arl_types::{InlineTool, Pool};

use crate::sidecar::{CONTAINER_SIDECAR, EXEC_SOCKET_PATH};
use crate::util::{self, Error};

pub const VOLUME_WORKSPACE: &str = "workspace";
pub const VOLUME_BIN: &str = "arl-bin";
pub const VOLUME_SOCKET: &str = "arl-socket";
pub const VOLUME_TOOLS: &str = "arl-tools";

const BIN_MOUNT: &str = "/arl/bin";
const SOCKET_MOUNT: &str = "/var/run/arl";
const TOOLS_MOUNT: &str = "/arl/tools";
const TOOLS_STAGING_MOUNT: &str = "/arl/tools-src";
const AGENT_PATH: &str = "/arl/bin/arl-agent";

/// Shell image for generated provisioning scripts.
const SCRIPT_IMAGE: &str = "busybox:1.37";

const TOOL_NAME_PATTERN: &str = "^[a-zA-Z0-9][a-zA-Z0-9_.-]*$";

/// Hash of everything that shapes a pod, stamped onto each pod as the
/// spec-hash annotation. Replica-count changes must not invalidate running
/// pods, so only the template and tools feed the digest.
pub fn template_hash(pool: &Pool) -> String {
    use sha2::{Digest, Sha256};
    let mut digest = Sha256::new();
    digest.update(serde_json::to_vec(&pool.spec.template).unwrap_or_default());
    digest.update([0u8]);
    digest.update(serde_json::to_vec(&pool.spec.tools).unwrap_or_default());
    hex::encode(digest.finalize())
}

/// The image the locality advisor should pull pods toward: the first
/// container the agent gets injected into.
pub fn primary_image(pool: &Pool) -> Option<&str> {
    pool.spec
        .template
        .containers
        .iter()
        .find(|c| c.name != CONTAINER_SIDECAR)
        .and_then(|c| c.image.as_deref())
}

/// Materialize one concrete pod for the pool: agent + sidecar + tools
/// injection, shared volumes, and advisory node affinity.
pub fn build_pod(
    pool: &Pool,
    args: &OperatorArgs,
    preferred_nodes: &[String],
) -> Result<Pod, Error> {
    let name = pool
        .meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("Pool is missing metadata.name".to_string()))?;
    let namespace = pool
        .meta()
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("Pool is missing metadata.namespace".to_string()))?;
    if pool.spec.template.containers.is_empty() {
        return Err(Error::UserInput(format!(
            "Pool {namespace}/{name} template has no containers"
        )));
    }

    let tools = pool.spec.tools.clone().unwrap_or_default();
    let has_tools = !tools.is_empty();

    let mut pod_labels: BTreeMap<String, String> = pool
        .spec
        .template
        .labels
        .iter()
        .filter(|(k, _)| !labels::RESERVED.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    pod_labels.insert(labels::POOL.to_string(), name.to_string());
    pod_labels.insert(
        labels::STATUS.to_string(),
        labels::STATUS_IDLE.to_string(),
    );

    let mut volumes = vec![
        empty_dir_volume(VOLUME_WORKSPACE),
        empty_dir_volume(VOLUME_BIN),
        empty_dir_volume(VOLUME_SOCKET),
    ];
    if has_tools {
        volumes.push(empty_dir_volume(VOLUME_TOOLS));
    }

    let mut init_containers = vec![agent_install_container(args)];
    for (i, image) in tools.images.iter().enumerate() {
        init_containers.push(tools_image_container(i, image));
    }
    for (i, config_map) in tools.config_maps.iter().enumerate() {
        volumes.push(config_map_volume(config_map));
        init_containers.push(tools_config_map_container(i, config_map));
    }
    for (i, tool) in tools.inline.iter().enumerate() {
        init_containers.push(inline_tool_container(i, tool)?);
    }
    if has_tools {
        init_containers.push(registry_container());
    }

    let mut containers: Vec<Container> = Vec::new();
    let mut user_sidecar = false;
    for container in &pool.spec.template.containers {
        if container.name == CONTAINER_SIDECAR {
            user_sidecar = true;
            containers.push(container.clone());
        } else {
            containers.push(wrap_container(container.clone(), args, has_tools));
        }
    }
    if !user_sidecar {
        containers.push(sidecar_container(args));
    }

    let affinity = locality_affinity(pool, args, preferred_nodes);

    Ok(Pod {
        metadata: ObjectMeta {
            generate_name: Some(format!("{name}-")),
            namespace: Some(namespace.to_string()),
            labels: Some(pod_labels),
            annotations: Some(BTreeMap::from([
                (annotations::SPEC_HASH.to_string(), template_hash(pool)),
                (
                    annotations::CREATED_BY.to_string(),
                    util::MANAGER_NAME.to_string(),
                ),
            ])),
            owner_references: Some(vec![pool.controller_owner_ref(&()).unwrap()]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            init_containers: Some(init_containers),
            containers,
            volumes: Some(volumes),
            affinity,
            node_selector: pool.spec.template.node_selector.clone(),
            service_account_name: pool.spec.template.service_account_name.clone(),
            restart_policy: Some("Always".to_string()),
            ..Default::default()
        }),
        status: None,
    })
}

/// Quote a word for safe embedding in a `sh -c` script.
pub fn sh_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

pub fn sh_quote_join(words: impl IntoIterator<Item = impl AsRef<str>>) -> String {
    words
        .into_iter()
        .map(|w| sh_quote(w.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Rewrite a user container so the executor agent is PID 1: the original
/// entrypoint keeps running in the background and the agent takes over the
/// foreground, serving the unix socket the sidecar dials.
fn wrap_container(mut container: Container, args: &OperatorArgs, has_tools: bool) -> Container {
    let original: Vec<String> = container
        .command
        .take()
        .unwrap_or_default()
        .into_iter()
        .chain(container.args.take().unwrap_or_default())
        .collect();
    let agent = format!("exec {AGENT_PATH} --socket {EXEC_SOCKET_PATH}");
    let script = if original.is_empty() {
        agent
    } else {
        format!("{} & {agent}", sh_quote_join(&original))
    };
    container.command = Some(vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        script,
    ]);
    container.args = None;

    let mut mounts = container.volume_mounts.take().unwrap_or_default();
    mounts.push(mount(VOLUME_WORKSPACE, &args.workspace_dir, false));
    mounts.push(mount(VOLUME_BIN, BIN_MOUNT, true));
    mounts.push(mount(VOLUME_SOCKET, SOCKET_MOUNT, false));
    if has_tools {
        mounts.push(mount(VOLUME_TOOLS, TOOLS_MOUNT, true));
    }
    container.volume_mounts = Some(mounts);
    container
}

fn sidecar_container(args: &OperatorArgs) -> Container {
    Container {
        name: CONTAINER_SIDECAR.to_string(),
        image: Some(args.sidecar_image.clone()),
        ports: Some(vec![
            ContainerPort {
                name: Some("http".to_string()),
                container_port: i32::from(args.sidecar_http_port),
                ..Default::default()
            },
            ContainerPort {
                name: Some("grpc".to_string()),
                container_port: i32::from(args.sidecar_grpc_port),
                ..Default::default()
            },
        ]),
        env: Some(vec![
            env_var("WORKSPACE_DIR", &args.workspace_dir),
            env_var("SIDECAR_HTTP_PORT", &args.sidecar_http_port.to_string()),
            env_var("SIDECAR_GRPC_PORT", &args.sidecar_grpc_port.to_string()),
        ]),
        volume_mounts: Some(vec![
            mount(VOLUME_WORKSPACE, &args.workspace_dir, false),
            mount(VOLUME_SOCKET, SOCKET_MOUNT, false),
        ]),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/readyz".to_string()),
                port: IntOrString::String("http".to_string()),
                ..Default::default()
            }),
            period_seconds: Some(5),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn agent_install_container(args: &OperatorArgs) -> Container {
    Container {
        name: "arl-agent-install".to_string(),
        image: Some(args.executor_agent_image.clone()),
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("cp /usr/local/bin/arl-agent {AGENT_PATH} && chmod 0755 {AGENT_PATH}"),
        ]),
        volume_mounts: Some(vec![mount(VOLUME_BIN, BIN_MOUNT, false)]),
        ..Default::default()
    }
}

fn tools_image_container(index: usize, image: &str) -> Container {
    Container {
        name: format!("tools-image-{index}"),
        image: Some(image.to_string()),
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("mkdir -p {TOOLS_MOUNT} && cp -a /tools/. {TOOLS_MOUNT}/"),
        ]),
        volume_mounts: Some(vec![mount(VOLUME_TOOLS, TOOLS_MOUNT, false)]),
        ..Default::default()
    }
}

fn tools_config_map_container(index: usize, config_map: &str) -> Container {
    let staging = format!("{TOOLS_STAGING_MOUNT}/{config_map}");
    let target = format!("{TOOLS_MOUNT}/{config_map}");
    Container {
        name: format!("tools-cm-{index}"),
        image: Some(SCRIPT_IMAGE.to_string()),
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("mkdir -p {target} && cp -aL {staging}/. {target}/"),
        ]),
        volume_mounts: Some(vec![
            mount(VOLUME_TOOLS, TOOLS_MOUNT, false),
            mount(&config_map_volume_name(config_map), &staging, true),
        ]),
        ..Default::default()
    }
}

/// Script provisioning one inline tool: writes the generated manifest plus
/// each declared file, refusing any name that escapes the validation pattern
/// or carries a path separator.
fn inline_tool_container(index: usize, tool: &InlineTool) -> Result<Container, Error> {
    let manifest = serde_json::to_string_pretty(&serde_json::json!({
        "name": tool.name,
        "entrypoint": tool.entrypoint,
        "runtime": tool.runtime,
        "description": tool.description,
        "parameters": tool.parameters,
        "timeoutSeconds": tool.timeout_seconds,
        "files": tool.files.keys().collect::<Vec<_>>(),
    }))?;

    let mut script = String::new();
    script.push_str("set -e\n");
    script.push_str("check() {\n");
    script.push_str("    case \"$1\" in\n");
    script.push_str("        */*) echo \"invalid tool file name: $1\" >&2; exit 1 ;;\n");
    script.push_str("    esac\n");
    script.push_str(&format!(
        "    printf '%s\\n' \"$1\" | grep -Eq '{TOOL_NAME_PATTERN}' || {{\n"
    ));
    script.push_str("        echo \"invalid tool file name: $1\" >&2\n");
    script.push_str("        exit 1\n");
    script.push_str("    }\n");
    script.push_str("}\n");
    script.push_str(&format!("name={}\n", sh_quote(&tool.name)));
    script.push_str("check \"$name\"\n");
    script.push_str(&format!("dir={TOOLS_MOUNT}/\"$name\"\n"));
    script.push_str("mkdir -p \"$dir\"\n");
    script.push_str(&format!(
        "printf '%s' {} > \"$dir\"/manifest.json\n",
        sh_quote(&manifest)
    ));
    for (file_name, content) in &tool.files {
        script.push_str(&format!("check {}\n", sh_quote(file_name)));
        script.push_str(&format!(
            "printf '%s' {} > \"$dir\"/{}\n",
            sh_quote(content),
            sh_quote(file_name)
        ));
    }

    Ok(Container {
        name: format!("tools-inline-{index}"),
        image: Some(SCRIPT_IMAGE.to_string()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), script]),
        volume_mounts: Some(vec![mount(VOLUME_TOOLS, TOOLS_MOUNT, false)]),
        ..Default::default()
    })
}

/// Aggregates every provisioned `*/manifest.json` into one `registry.json`
/// the executor agent serves to its runtime.
fn registry_container() -> Container {
    let script = concat!(
        "set -e\n",
        "cd /arl/tools\n",
        "out=registry.json\n",
        "printf '{\"tools\":[' > \"$out\".tmp\n",
        "first=1\n",
        "for m in */manifest.json; do\n",
        "    [ -e \"$m\" ] || continue\n",
        "    if [ $first -eq 0 ]; then printf ',' >> \"$out\".tmp; fi\n",
        "    cat \"$m\" >> \"$out\".tmp\n",
        "    first=0\n",
        "done\n",
        "printf ']}' >> \"$out\".tmp\n",
        "mv \"$out\".tmp \"$out\"\n",
    );
    Container {
        name: "tools-registry".to_string(),
        image: Some(SCRIPT_IMAGE.to_string()),
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ]),
        volume_mounts: Some(vec![mount(VOLUME_TOOLS, TOOLS_MOUNT, false)]),
        ..Default::default()
    }
}

fn locality_affinity(
    pool: &Pool,
    args: &OperatorArgs,
    preferred_nodes: &[String],
) -> Option<Affinity> {
    let policy = pool.spec.image_locality.clone().unwrap_or_default();
    if !policy.enabled || preferred_nodes.is_empty() {
        return None;
    }
    let weight = policy
        .weight
        .unwrap_or(args.image_locality_weight)
        .clamp(1, 100);
    Some(Affinity {
        node_affinity: Some(NodeAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                PreferredSchedulingTerm {
                    weight,
                    preference: NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: "kubernetes.io/hostname".to_string(),
                            operator: "In".to_string(),
                            values: Some(preferred_nodes.to_vec()),
                        }]),
                        ..Default::default()
                    },
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn empty_dir_volume(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn config_map_volume_name(config_map: &str) -> String {
    format!("tools-cm-{config_map}")
}

fn config_map_volume(config_map: &str) -> Volume {
    Volume {
        name: config_map_volume_name(config_map),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(volume: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: volume.to_string(),
        mount_path: path.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

fn env_var(name: &str, value: &str) -> k8s_openapi::api::core::v1::EnvVar {
    k8s_openapi::api::core::v1::EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arl_types::{ImageLocalityPolicy, PodTemplate, PoolSpec, ToolsBundle};
    use clap::Parser;

    fn operator_args() -> OperatorArgs {
        OperatorArgs::parse_from(["arl-operator"])
    }

    fn pool_with(template: PodTemplate, tools: Option<ToolsBundle>) -> Pool {
        let mut pool = Pool::new(
            "train",
            PoolSpec {
                replicas: Some(2),
                template,
                tools,
                image_locality: None,
            },
        );
        pool.metadata.namespace = Some("default".to_string());
        pool.metadata.uid = Some("pool-uid".to_string());
        pool
    }

    fn simple_template() -> PodTemplate {
        PodTemplate {
            containers: vec![Container {
                name: "main".to_string(),
                image: Some("py:3".to_string()),
                command: Some(vec!["python".to_string(), "-m".to_string(), "http.server".to_string()]),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn quoting_survives_hostile_words() {
        assert_eq!(sh_quote("plain-word"), "plain-word");
        assert_eq!(sh_quote("has space"), "'has space'");
        assert_eq!(sh_quote("it's"), "'it'\\''s'");
        assert_eq!(sh_quote(""), "''");
        assert_eq!(
            sh_quote_join(["echo", "a b", "c'd"]),
            "echo 'a b' 'c'\\''d'"
        );
    }

    #[test]
    fn wraps_entrypoint_and_execs_agent() {
        let pod = build_pod(&pool_with(simple_template(), None), &operator_args(), &[]).unwrap();
        let spec = pod.spec.unwrap();
        let main = spec.containers.iter().find(|c| c.name == "main").unwrap();
        let command = main.command.as_ref().unwrap();
        assert_eq!(command[0], "/bin/sh");
        assert_eq!(command[1], "-c");
        assert!(command[2].contains("python -m http.server &"));
        assert!(command[2].contains("exec /arl/bin/arl-agent --socket /var/run/arl/exec.sock"));
        assert!(main.args.is_none());
    }

    #[test]
    fn container_without_command_just_runs_agent() {
        let template = PodTemplate {
            containers: vec![Container {
                name: "main".to_string(),
                image: Some("py:3".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pod = build_pod(&pool_with(template, None), &operator_args(), &[]).unwrap();
        let main = &pod.spec.unwrap().containers[0];
        let script = &main.command.as_ref().unwrap()[2];
        assert!(script.starts_with("exec /arl/bin/arl-agent"));
        assert!(!script.contains('&'));
    }

    #[test]
    fn sidecar_appended_once() {
        let pod = build_pod(&pool_with(simple_template(), None), &operator_args(), &[]).unwrap();
        let spec = pod.spec.unwrap();
        let sidecars: Vec<_> = spec
            .containers
            .iter()
            .filter(|c| c.name == CONTAINER_SIDECAR)
            .collect();
        assert_eq!(sidecars.len(), 1);
        assert_eq!(
            sidecars[0].ports.as_ref().unwrap().len(),
            2,
            "http + grpc ports"
        );
    }

    #[test]
    fn user_supplied_sidecar_is_left_alone() {
        let mut template = simple_template();
        template.containers.push(Container {
            name: "sidecar".to_string(),
            image: Some("custom-sidecar:1".to_string()),
            ..Default::default()
        });
        let pod = build_pod(&pool_with(template, None), &operator_args(), &[]).unwrap();
        let spec = pod.spec.unwrap();
        let sidecar = spec
            .containers
            .iter()
            .find(|c| c.name == CONTAINER_SIDECAR)
            .unwrap();
        assert_eq!(sidecar.image.as_deref(), Some("custom-sidecar:1"));
        assert!(sidecar.command.is_none(), "no entrypoint rewrite");
    }

    #[test]
    fn reserved_labels_cannot_be_overridden() {
        let mut template = simple_template();
        template.labels.insert("status".to_string(), "allocated".to_string());
        template.labels.insert("team".to_string(), "rl".to_string());
        let pod = build_pod(&pool_with(template, None), &operator_args(), &[]).unwrap();
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get("status").map(String::as_str), Some("idle"));
        assert_eq!(labels.get("pool").map(String::as_str), Some("train"));
        assert_eq!(labels.get("team").map(String::as_str), Some("rl"));
    }

    #[test]
    fn shared_volumes_follow_tools_presence() {
        let bare = build_pod(&pool_with(simple_template(), None), &operator_args(), &[]).unwrap();
        let names: Vec<String> = bare
            .spec
            .unwrap()
            .volumes
            .unwrap()
            .into_iter()
            .map(|v| v.name)
            .collect();
        assert_eq!(names, vec!["workspace", "arl-bin", "arl-socket"]);

        let tools = ToolsBundle {
            images: vec!["tools:1".to_string()],
            ..Default::default()
        };
        let with_tools =
            build_pod(&pool_with(simple_template(), Some(tools)), &operator_args(), &[]).unwrap();
        let names: Vec<String> = with_tools
            .spec
            .unwrap()
            .volumes
            .unwrap()
            .into_iter()
            .map(|v| v.name)
            .collect();
        assert!(names.contains(&"arl-tools".to_string()));
    }

    #[test]
    fn tools_mount_is_read_only_on_executor_container() {
        let tools = ToolsBundle {
            images: vec!["tools:1".to_string()],
            ..Default::default()
        };
        let pod =
            build_pod(&pool_with(simple_template(), Some(tools)), &operator_args(), &[]).unwrap();
        let spec = pod.spec.unwrap();
        let main = spec.containers.iter().find(|c| c.name == "main").unwrap();
        let tools_mount = main
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .find(|m| m.name == VOLUME_TOOLS)
            .unwrap();
        assert_eq!(tools_mount.read_only, Some(true));
    }

    #[test]
    fn inline_tool_script_validates_names() {
        let tool = InlineTool {
            name: "grep-logs".to_string(),
            entrypoint: "main.py".to_string(),
            files: [("main.py".to_string(), "print('hi')".to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let container = inline_tool_container(0, &tool).unwrap();
        let script = &container.command.as_ref().unwrap()[2];
        assert!(script.contains(TOOL_NAME_PATTERN));
        assert!(script.contains("*/*)"), "path separators rejected");
        assert!(script.contains("check 'main.py'") || script.contains("check main.py"));
        assert!(script.contains("manifest.json"));
    }

    #[test]
    fn registry_generator_appended_when_tools_present() {
        let tools = ToolsBundle {
            inline: vec![InlineTool {
                name: "t".to_string(),
                entrypoint: "t.sh".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pod =
            build_pod(&pool_with(simple_template(), Some(tools)), &operator_args(), &[]).unwrap();
        let inits = pod.spec.unwrap().init_containers.unwrap();
        assert_eq!(inits.last().unwrap().name, "tools-registry");
        assert_eq!(inits.first().unwrap().name, "arl-agent-install");
    }

    #[test]
    fn affinity_prefers_advised_nodes() {
        let nodes = vec!["node-a".to_string(), "node-b".to_string()];
        let pod = build_pod(&pool_with(simple_template(), None), &operator_args(), &nodes).unwrap();
        let term = &pod
            .spec
            .unwrap()
            .affinity
            .unwrap()
            .node_affinity
            .unwrap()
            .preferred_during_scheduling_ignored_during_execution
            .unwrap()[0];
        assert_eq!(term.weight, 50);
        let expr = &term.preference.match_expressions.as_ref().unwrap()[0];
        assert_eq!(expr.key, "kubernetes.io/hostname");
        assert_eq!(expr.values.as_ref().unwrap(), &nodes);
    }

    #[test]
    fn pool_can_disable_affinity() {
        let mut pool = pool_with(simple_template(), None);
        pool.spec.image_locality = Some(ImageLocalityPolicy {
            enabled: false,
            spread_factor: None,
            weight: None,
        });
        let pod = build_pod(&pool, &operator_args(), &["node-a".to_string()]).unwrap();
        assert!(pod.spec.unwrap().affinity.is_none());
    }

    #[test]
    fn hash_ignores_replicas_but_not_template() {
        let pool_a = pool_with(simple_template(), None);
        let mut pool_b = pool_a.clone();
        pool_b.spec.replicas = Some(9);
        assert_eq!(template_hash(&pool_a), template_hash(&pool_b));
        let mut pool_c = pool_a.clone();
        pool_c.spec.template.containers[0].image = Some("py:4".to_string());
        assert_ne!(template_hash(&pool_a), template_hash(&pool_c));
    }
}

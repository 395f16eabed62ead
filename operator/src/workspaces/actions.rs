use k8s_openapi::api::core::v1::Pod;
use kube::{
    Api, Client, ResourceExt,
    api::{ListParams, Patch, PatchParams, PostParams},
};
use serde_json::json;

use arl_common::{WORKSPACE_FINALIZER, labels};
use arl_types::{Workspace, WorkspacePhase, WorkspaceStatus};

use super::phase::transition_allowed;
use crate::util::{self, Error, patch::patch_status};

/// Condition type recording attempted phase edges, legal or not.
pub const CONDITION_PHASE_TRANSITION: &str = "PhaseTransition";
pub const REASON_INVALID_TRANSITION: &str = "InvalidTransition";

/// Set by the task executor once every task is terminal and the workspace is
/// not kept alive; consumed by the allocator's Ready handler.
pub const CONDITION_READY_FOR_CLEANUP: &str = "ReadyForCleanup";

/// Guarded phase write. An illegal edge appends exactly one
/// `PhaseTransition/InvalidTransition` condition, leaves the stored phase
/// untouched, and surfaces the rejection to the caller.
pub async fn set_phase(
    client: Client,
    workspace: &Workspace,
    to: WorkspacePhase,
    mutate: impl FnOnce(&mut WorkspaceStatus),
) -> Result<Workspace, Error> {
    let from = workspace.status.as_ref().and_then(|s| s.phase);
    if !transition_allowed(from, to) {
        let object = format!(
            "{}/{}",
            workspace.namespace().unwrap_or_default(),
            workspace.name_any()
        );
        patch_status(
            client,
            "record invalid transition on Workspace",
            workspace,
            |status: &mut WorkspaceStatus| {
                status.conditions.push(util::condition(
                    CONDITION_PHASE_TRANSITION,
                    false,
                    REASON_INVALID_TRANSITION,
                    &format!(
                        "rejected transition {} -> {to}",
                        from.map(|p| p.to_string()).unwrap_or_else(|| "∅".to_string())
                    ),
                ));
            },
        )
        .await?;
        return Err(Error::InvalidPhaseTransition { object, from, to });
    }
    patch_status(
        client,
        "advance phase of Workspace",
        workspace,
        |status: &mut WorkspaceStatus| {
            status.phase = Some(to);
            mutate(status);
        },
    )
    .await
}

pub async fn add_finalizer(client: Client, workspace: &Workspace) -> Result<(), Error> {
    let namespace = workspace.namespace().unwrap_or_default();
    let name = workspace.name_any();
    let mut finalizers = workspace.finalizers().to_vec();
    if finalizers.iter().any(|f| f == WORKSPACE_FINALIZER) {
        return Ok(());
    }
    finalizers.push(WORKSPACE_FINALIZER.to_string());
    let api: Api<Workspace> = Api::namespaced(client, &namespace);
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| Error::api("add finalizer to Workspace", &namespace, &name, e))?;
    Ok(())
}

/// Idempotent: removing an already-removed finalizer is a no-op, so the
/// deletion handler completes exactly once even when requeued.
pub async fn remove_finalizer(client: Client, workspace: &Workspace) -> Result<(), Error> {
    let namespace = workspace.namespace().unwrap_or_default();
    let name = workspace.name_any();
    if !workspace
        .finalizers()
        .iter()
        .any(|f| f == WORKSPACE_FINALIZER)
    {
        return Ok(());
    }
    let remaining: Vec<&String> = workspace
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != WORKSPACE_FINALIZER)
        .collect();
    let api: Api<Workspace> = Api::namespaced(client, &namespace);
    let patch = json!({ "metadata": { "finalizers": remaining } });
    match api
        .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(Error::api(
            "remove finalizer from Workspace",
            &namespace,
            &name,
            e,
        )),
    }
}

/// The atomic claim: flip one idle pod's labels to
/// `{status=allocated, workspace=<name>}` through a resource-version-carrying
/// replace. A 409 means somebody else claimed it first; the caller requeues
/// and retries against a fresh list.
pub async fn claim_idle_pod(
    client: Client,
    namespace: &str,
    pool_ref: &str,
    workspace_name: &str,
) -> Result<Option<Pod>, Error> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let selector = format!(
        "{}={},{}={}",
        labels::POOL,
        pool_ref,
        labels::STATUS,
        labels::STATUS_IDLE
    );
    let pods = api
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(|e| Error::api("list idle pods for Workspace", namespace, workspace_name, e))?;

    let mut candidates: Vec<&Pod> = pods
        .items
        .iter()
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .filter(|p| {
            p.status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                == Some("Running")
        })
        .collect();
    candidates.sort_by_key(|p| p.name_any());
    let Some(chosen) = candidates.first() else {
        return Ok(None);
    };

    let mut claimed = (*chosen).clone();
    let pod_labels = claimed.metadata.labels.get_or_insert_with(Default::default);
    pod_labels.insert(
        labels::STATUS.to_string(),
        labels::STATUS_ALLOCATED.to_string(),
    );
    pod_labels.insert(labels::WORKSPACE.to_string(), workspace_name.to_string());
    claimed.status = None;
    // The clone still carries the observed resourceVersion, so this replace
    // is a compare-and-swap at the API server.
    let updated = api
        .replace(&chosen.name_any(), &PostParams::default(), &claimed)
        .await
        .map_err(|e| Error::api("claim idle pod for Workspace", namespace, workspace_name, e))?;
    Ok(Some(updated))
}

pub async fn get_pod(
    client: Client,
    namespace: &str,
    name: &str,
) -> Result<Option<Pod>, Error> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    match api.get(name).await {
        Ok(pod) => Ok(Some(pod)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Delete the workspace's pod during release. Returns whether a pod was
/// actually deleted; 404 means it was already gone.
pub async fn delete_pod(client: Client, namespace: &str, name: &str) -> Result<bool, Error> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    match api.delete(name, &Default::default()).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub fn has_condition(workspace: &Workspace, condition_type: &str) -> bool {
    workspace
        .status
        .as_ref()
        .map(|s| {
            s.conditions
                .iter()
                .any(|c| c.type_ == condition_type && c.status == "True")
        })
        .unwrap_or(false)
}

/// Annotate the workspace as drained; only the allocator deletes it.
pub async fn mark_ready_for_cleanup(client: Client, workspace: &Workspace) -> Result<(), Error> {
    if has_condition(workspace, CONDITION_READY_FOR_CLEANUP) {
        return Ok(());
    }
    patch_status(
        client,
        "mark Workspace ready for cleanup",
        workspace,
        |status: &mut WorkspaceStatus| {
            util::upsert_condition(
                &mut status.conditions,
                util::condition(
                    CONDITION_READY_FOR_CLEANUP,
                    true,
                    "AllTasksTerminal",
                    "every task targeting this workspace finished",
                ),
            );
        },
    )
    .await?;
    Ok(())
}

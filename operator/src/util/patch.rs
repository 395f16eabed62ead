use super::{Error, MANAGER_NAME};
use arl_types::*;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    Api, Client,
    api::{Patch, PatchParams, Resource},
    core::NamespaceResourceScope,
};
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Debug;

pub trait Object<S: Status> {
    /// Mutable status, materialized with defaults when the resource has
    /// never been reconciled.
    fn mut_status(&mut self) -> &mut S;
}

pub trait Status {
    fn set_last_updated(&mut self, last_updated: Time);
}

impl Object<PoolStatus> for Pool {
    fn mut_status(&mut self) -> &mut PoolStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl Status for PoolStatus {
    fn set_last_updated(&mut self, last_updated: Time) {
        self.last_updated = Some(last_updated);
    }
}

impl Object<WorkspaceStatus> for Workspace {
    fn mut_status(&mut self) -> &mut WorkspaceStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl Status for WorkspaceStatus {
    fn set_last_updated(&mut self, last_updated: Time) {
        self.last_updated = Some(last_updated);
    }
}

impl Object<TaskStatus> for Task {
    fn mut_status(&mut self) -> &mut TaskStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl Status for TaskStatus {
    fn set_last_updated(&mut self, last_updated: Time) {
        self.last_updated = Some(last_updated);
    }
}

/// Apply `mutate` to a copy of the resource's status and persist exactly the
/// resulting delta as a JSON patch against the status subresource.
///
/// `operation` names what the caller was doing; it is woven into any error
/// together with the namespaced name, so failures read as
/// "`bind Workspace default/ws-1: …`" without per-call-site wrapping. A 409
/// comes back as a conflict error the reconcile wrappers translate into a
/// requeue, which is the CAS retry path for every status write in the
/// operator.
pub async fn patch_status<S: Status, T>(
    client: Client,
    operation: &'static str,
    instance: &T,
    mutate: impl FnOnce(&mut S),
) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone
        + Resource
        + Object<S>
        + Serialize
        + DeserializeOwned
        + Debug
        + Resource<Scope = NamespaceResourceScope>,
{
    let name = instance
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::UserInput(format!("{operation}: resource has no name")))?;
    let namespace = instance
        .meta()
        .namespace
        .clone()
        .ok_or_else(|| Error::UserInput(format!("{operation} {name}: resource has no namespace")))?;

    let observed = serde_json::to_value(instance)?;
    let mut desired = instance.clone();
    mutate(desired.mut_status());
    desired.mut_status().set_last_updated(super::now());
    let delta = json_patch::diff(&observed, &serde_json::to_value(&desired)?);

    let api: Api<T> = Api::namespaced(client, &namespace);
    api.patch_status(&name, &PatchParams::apply(MANAGER_NAME), &Patch::Json::<T>(delta))
        .await
        .map_err(|e| Error::api(operation, &namespace, &name, e))
}

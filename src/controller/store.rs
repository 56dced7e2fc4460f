//! Explicit create-or-update and annotation patching
//!
//! The upsert takes the current object (fetched by the caller), applies the
//! desired mutation to a copy and reports whether anything was written. The
//! pre-mutation snapshot comparison keeps redundant writes out of the API
//! server, which is what stops a reconcile from retriggering itself.

use std::fmt::Debug;

use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, PostParams},
    Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;

use super::finalizers::MANAGER;
use crate::error::Result;

/// Outcome of a [`create_or_update`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationResult {
    Created,
    Updated,
    Unchanged,
}

impl OperationResult {
    pub fn wrote(self) -> bool {
        !matches!(self, OperationResult::Unchanged)
    }
}

/// Owner reference marking `owner` as the managing controller of a dependent.
pub fn controller_reference<K>(owner: &K) -> k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.name_any(),
        uid: owner.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Create the object if absent, otherwise update it in place when the
/// mutation changed anything. `current` is the caller's fetched state
/// (`None` means not found); `init` produces the initial object for the
/// create path.
pub async fn create_or_update<K>(
    api: &Api<K>,
    name: &str,
    current: Option<K>,
    init: impl FnOnce() -> K,
    mutate: impl Fn(&mut K),
) -> Result<OperationResult>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    match current {
        None => {
            let mut obj = init();
            mutate(&mut obj);
            api.create(&PostParams::default(), &obj).await?;
            Ok(OperationResult::Created)
        }
        Some(mut obj) => {
            let snapshot = serde_json::to_value(&obj)?;
            mutate(&mut obj);
            if serde_json::to_value(&obj)? == snapshot {
                return Ok(OperationResult::Unchanged);
            }
            api.replace(name, &PostParams::default(), &obj).await?;
            Ok(OperationResult::Updated)
        }
    }
}

/// Patch a single annotation on the object, but only when its value differs
/// from what is already stored. Returns whether a patch was sent.
pub async fn patch_annotation_if_changed<K>(
    api: &Api<K>,
    obj: &K,
    key: &str,
    value: &str,
) -> Result<bool>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    if obj.annotations().get(key).map(String::as_str) == Some(value) {
        return Ok(false);
    }

    let patch = json!({
        "metadata": {
            "annotations": {
                key: value
            }
        }
    });
    api.patch(
        &obj.name_any(),
        &PatchParams::apply(MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(true)
}

/// ObjectMeta for a dependent living at the owner's namespace/name.
pub fn dependent_meta<K>(owner: &K) -> ObjectMeta
where
    K: Resource<DynamicType = ()>,
{
    ObjectMeta {
        name: Some(owner.name_any()),
        namespace: owner.namespace(),
        owner_references: Some(vec![controller_reference(owner)]),
        ..Default::default()
    }
}

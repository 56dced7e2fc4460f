//! Shared finalizer state machine
//!
//! Both reconcilers wrap their bodies in [`handle`]. An object without a
//! deletion timestamp is Active: the finalizer token is persisted before the
//! reconcile body runs, so the store can never silently remove an object the
//! body has acted on. An object with a deletion timestamp is Terminating: the
//! finalize body runs and, on success, the token is removed, unblocking
//! deletion. A missing token during finalization is a no-op.

use std::fmt::Debug;
use std::future::Future;

use kube::{
    api::{Api, Patch, PatchParams},
    Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use crate::error::Result;

pub const MANAGER: &str = "pki-operator";

/// Whether the object carries the finalizer token.
pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Whether deletion has been requested for the object.
pub fn is_terminating<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

fn without<'a>(finalizers: &'a [String], finalizer: &str) -> Vec<&'a String> {
    finalizers
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .collect()
}

async fn patch_finalizers<K>(api: &Api<K>, name: &str, finalizers: &[&String]) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let patch = json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(name, &PatchParams::apply(MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Run `reconcile` or `finalize` depending on the object's deletion state,
/// maintaining the finalizer token around the body.
pub async fn handle<K, R, RFut, F, FFut>(
    api: &Api<K>,
    finalizer: &str,
    obj: &K,
    reconcile: R,
    finalize: F,
) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    R: FnOnce() -> RFut,
    RFut: Future<Output = Result<()>>,
    F: FnOnce() -> FFut,
    FFut: Future<Output = Result<()>>,
{
    let name = obj.name_any();

    if !is_terminating(obj) {
        if !has_finalizer(obj, finalizer) {
            let token = finalizer.to_string();
            let mut finalizers: Vec<&String> = obj.finalizers().iter().collect();
            finalizers.push(&token);
            patch_finalizers(api, &name, &finalizers).await?;
            debug!(%name, finalizer, "Added finalizer");
        }
        return reconcile().await;
    }

    if !has_finalizer(obj, finalizer) {
        return Ok(());
    }

    finalize().await?;
    patch_finalizers(api, &name, &without(obj.finalizers(), finalizer)).await?;
    debug!(%name, finalizer, "Removed finalizer");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{KeyPair, KEY_PAIR_FINALIZER};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;

    fn key_pair(finalizers: Vec<String>, terminating: bool) -> KeyPair {
        KeyPair {
            metadata: ObjectMeta {
                name: Some("kp".to_string()),
                namespace: Some("default".to_string()),
                finalizers: Some(finalizers),
                deletion_timestamp: terminating.then(|| Time(chrono::Utc::now())),
                ..Default::default()
            },
            spec: Default::default(),
        }
    }

    #[test]
    fn test_has_finalizer() {
        let kp = key_pair(vec![KEY_PAIR_FINALIZER.to_string()], false);
        assert!(has_finalizer(&kp, KEY_PAIR_FINALIZER));
        assert!(!has_finalizer(&kp, "other/finalizer"));
        assert!(!has_finalizer(&key_pair(vec![], false), KEY_PAIR_FINALIZER));
    }

    #[test]
    fn test_is_terminating() {
        assert!(is_terminating(&key_pair(vec![], true)));
        assert!(!is_terminating(&key_pair(vec![], false)));
    }

    #[test]
    fn test_without_preserves_foreign_tokens() {
        let finalizers = vec![
            "other/finalizer".to_string(),
            KEY_PAIR_FINALIZER.to_string(),
        ];
        let remaining = without(&finalizers, KEY_PAIR_FINALIZER);
        assert_eq!(remaining, vec![&"other/finalizer".to_string()]);

        // removal is idempotent
        let none: Vec<String> = vec![];
        assert!(without(&none, KEY_PAIR_FINALIZER).is_empty());
    }
}

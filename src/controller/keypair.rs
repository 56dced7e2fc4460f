//! KeyPair reconciler
//!
//! Converges each KeyPair onto a backing secret holding PKCS#1 PEM encoded
//! RSA-2048 key material, then records a checksum of that material as an
//! annotation on the KeyPair. Dependent certificate reconciles key off the
//! checksum annotation, so it only moves when the persisted bytes do.
//! An unusable private key (missing or malformed PEM) is replaced with
//! freshly generated keys; the public half is re-derived from the private
//! key every pass, so damage there is repaired without rotation.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::Api,
    runtime::{
        controller::{Action, Controller},
        watcher,
    },
    Client, ResourceExt,
};
use tracing::{debug, info, instrument, warn};

use super::{error_policy, events, finalizers, keys, store, Context};
use crate::crd::{KeyPair, SecretsMode, EVENT_GENERATING_KEY, KEY_PAIR_CHECKSUM_KEY, KEY_PAIR_FINALIZER};
use crate::error::{Error, Result};

#[instrument(skip_all, fields(name = %key_pair.name_any(), namespace = %key_pair.namespace().unwrap_or_default()))]
pub async fn reconcile(key_pair: Arc<KeyPair>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = key_pair
        .namespace()
        .ok_or_else(|| Error::Validation("KeyPair without a namespace".to_string()))?;
    let key_pairs: Api<KeyPair> = Api::namespaced(ctx.client.clone(), &namespace);

    let active = key_pair.clone();
    let active_ctx = ctx.clone();
    finalizers::handle(
        &key_pairs,
        KEY_PAIR_FINALIZER,
        key_pair.as_ref(),
        move || reconcile_key_material(active, active_ctx),
        || async { Ok(()) },
    )
    .await?;

    Ok(Action::await_change())
}

async fn reconcile_key_material(key_pair: Arc<KeyPair>, ctx: Arc<Context>) -> Result<()> {
    if key_pair.spec.secrets == SecretsMode::SelfProvisioned {
        debug!("Key material is provisioned externally, nothing to do");
        return Ok(());
    }

    let namespace = key_pair.namespace().unwrap_or_default();
    let name = key_pair.name_any();
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
    let current = secrets.get_opt(&name).await?;

    let private_key = match current.as_ref().map(keys::read_secret) {
        Some(Ok(key)) => key,
        stored => {
            if let Some(Err(e)) = stored {
                warn!("Stored key material is unusable, regenerating: {e}");
            }
            info!("Generating a new RSA key pair");
            events::publish(
                &ctx.client,
                key_pair.as_ref(),
                events::EVENT_TYPE_NORMAL,
                EVENT_GENERATING_KEY,
                "Generating a new key pair",
            )
            .await;
            keys::generate_key()?
        }
    };

    let (private_pem, public_pem) = keys::encode_key_pair(&private_key)?;
    let checksum = keys::compute_checksum(&private_pem, &public_pem)?;

    let outcome = store::create_or_update(
        &secrets,
        &name,
        current,
        || Secret {
            metadata: store::dependent_meta(key_pair.as_ref()),
            ..Default::default()
        },
        |secret| keys::update_secret(secret, private_pem.clone(), public_pem.clone()),
    )
    .await?;
    if outcome.wrote() {
        info!(?outcome, "Persisted key material secret");
    }

    let key_pairs: Api<KeyPair> = Api::namespaced(ctx.client.clone(), &namespace);
    if store::patch_annotation_if_changed(&key_pairs, key_pair.as_ref(), KEY_PAIR_CHECKSUM_KEY, &checksum)
        .await?
    {
        info!(%checksum, "Updated key pair checksum annotation");
    }

    Ok(())
}

/// Run the KeyPair controller until shutdown.
pub async fn run(client: Client) {
    let key_pairs: Api<KeyPair> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client.clone());
    let context = Arc::new(Context { client });

    Controller::new(key_pairs, watcher::Config::default())
        .owns(secrets, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!("Reconciled {:?}", obj),
                Err(e) => warn!("Reconciliation dispatch error: {:?}", e),
            }
        })
        .await;
}

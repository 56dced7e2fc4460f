//! Certificate reconciler
//!
//! Converges each Certificate onto a backing secret holding the signed DER.
//! The first pass pins down generated spec fields (a linked KeyPair, serial
//! number and validity window) so issuance is reproducible afterwards. A
//! certificate without a parent is self-signed; with a parent it is signed
//! by the parent's key, which chains root, intermediate and leaf together.
//! Missing parent artifacts are a not-ready condition and requeue; a parent
//! without a key pair link can never sign and fails permanently.

use std::sync::Arc;

use chrono::{Months, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{Api, ObjectMeta, PostParams},
    runtime::{
        controller::{Action, Controller},
        reflector, watcher, WatchStreamExt,
    },
    Client, ResourceExt,
};
use rand::{rngs::OsRng, Rng};
use rcgen::KeyPair as SigningKey;
use tracing::{debug, info, instrument, warn};

use super::{error_policy, events, finalizers, keys, mapper, store, x509, Context};
use crate::crd::{
    Certificate, CertificateInfo, KeyPair, KeyPairSpec, LocalObjectReference,
    CERTIFICATE_CHECKSUM_KEY, CERTIFICATE_FINALIZER, EVENT_GENERATE_CERTIFICATE_ERROR,
    EVENT_GENERATING_CERTIFICATE,
};
use crate::error::{Error, Result};

/// Validity applied when the spec leaves the window open: ten years.
const DEFAULT_VALIDITY_MONTHS: u32 = 120;

#[instrument(skip_all, fields(name = %cert.name_any(), namespace = %cert.namespace().unwrap_or_default()))]
pub async fn reconcile(cert: Arc<Certificate>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = cert
        .namespace()
        .ok_or_else(|| Error::Validation("Certificate without a namespace".to_string()))?;
    let certificates: Api<Certificate> = Api::namespaced(ctx.client.clone(), &namespace);

    let active = cert.clone();
    let active_ctx = ctx.clone();
    finalizers::handle(
        &certificates,
        CERTIFICATE_FINALIZER,
        cert.as_ref(),
        move || reconcile_certificate(active, active_ctx),
        || async { Ok(()) },
    )
    .await?;

    Ok(Action::await_change())
}

async fn reconcile_certificate(cert: Arc<Certificate>, ctx: Arc<Context>) -> Result<()> {
    let namespace = cert.namespace().unwrap_or_default();
    let name = cert.name_any();
    let certificates: Api<Certificate> = Api::namespaced(ctx.client.clone(), &namespace);
    let key_pairs: Api<KeyPair> = Api::namespaced(ctx.client.clone(), &namespace);
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);

    let cert = apply_defaults(cert.as_ref(), &certificates, &key_pairs).await?;

    let key_pair_ref = cert
        .spec
        .key_pair
        .as_ref()
        .ok_or_else(|| Error::NotReady("key pair link not established yet".to_string()))?;
    let key_secret = secrets.get_opt(&key_pair_ref.name).await?.ok_or_else(|| {
        Error::NotReady(format!("key pair secret {} not found", key_pair_ref.name))
    })?;
    let own_rsa = keys::read_secret(&key_secret).map_err(|e| {
        Error::NotReady(format!(
            "key pair secret {} not usable yet: {e}",
            key_pair_ref.name
        ))
    })?;
    let own_key = x509::signing_key(&own_rsa)?;

    events::publish(
        &ctx.client,
        &cert,
        events::EVENT_TYPE_NORMAL,
        EVENT_GENERATING_CERTIFICATE,
        "Generating certificate",
    )
    .await;

    let der = match generate_certificate(&cert, &own_key, &certificates, &secrets).await {
        Ok(der) => der,
        Err(e) => {
            if emits_generation_warning(&e) {
                events::publish(
                    &ctx.client,
                    &cert,
                    events::EVENT_TYPE_WARNING,
                    EVENT_GENERATE_CERTIFICATE_ERROR,
                    &format!("Certificate generation failed: {e}"),
                )
                .await;
            }
            return Err(e);
        }
    };

    let checksum = x509::compute_checksum(&der);
    let current = secrets.get_opt(&name).await?;
    let outcome = store::create_or_update(
        &secrets,
        &name,
        current,
        || Secret {
            metadata: store::dependent_meta(&cert),
            ..Default::default()
        },
        |secret| x509::update_secret(secret, der.clone()),
    )
    .await?;
    if outcome.wrote() {
        info!(?outcome, "Persisted certificate secret");
    }

    if store::patch_annotation_if_changed(&certificates, &cert, CERTIFICATE_CHECKSUM_KEY, &checksum)
        .await?
    {
        info!(%checksum, "Updated certificate checksum annotation");
    }

    Ok(())
}

/// Pin down spec fields left open by the author. A missing key pair link is
/// filled by creating an owned KeyPair with a generated name; serial and
/// validity come from [`fill_generated_fields`]. Persisting the defaulted
/// spec is best effort: when the write fails the in-memory copy still
/// drives this pass and a later pass retries the write.
async fn apply_defaults(
    cert: &Certificate,
    certificates: &Api<Certificate>,
    key_pairs: &Api<KeyPair>,
) -> Result<Certificate> {
    let mut desired = cert.clone();

    if desired.spec.key_pair.is_none() {
        let stub = KeyPair {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-keypair-", cert.name_any())),
                namespace: cert.namespace(),
                owner_references: Some(vec![store::controller_reference(cert)]),
                ..Default::default()
            },
            spec: KeyPairSpec::default(),
        };
        let created = key_pairs.create(&PostParams::default(), &stub).await?;
        info!(key_pair = %created.name_any(), "Created key pair for certificate");
        desired.spec.key_pair = Some(LocalObjectReference::new(created.name_any()));
    }

    fill_generated_fields(&mut desired.spec.info)?;

    if desired.spec != cert.spec {
        if let Err(e) = certificates
            .replace(&cert.name_any(), &PostParams::default(), &desired)
            .await
        {
            warn!("Could not persist defaulted spec, continuing with in-memory copy: {e}");
        }
    }

    Ok(desired)
}

/// Default the generated issuance parameters in place. Fields already set
/// are left untouched, so a second call is a no-op.
fn fill_generated_fields(info: &mut CertificateInfo) -> Result<()> {
    if info.serial_number.is_none() {
        info.serial_number = Some(OsRng.gen::<u128>().to_string());
    }

    let not_before = match info.not_before {
        Some(t) => t,
        None => {
            let now = Utc::now();
            info.not_before = Some(now);
            now
        }
    };
    if info.not_after.is_none() {
        let not_after = not_before
            .checked_add_months(Months::new(DEFAULT_VALIDITY_MONTHS))
            .ok_or_else(|| Error::Validation("default validity window out of range".to_string()))?;
        info.not_after = Some(not_after);
    }

    Ok(())
}

/// Template construction, signer resolution and signing as one step, so a
/// failure anywhere in it carries the same event treatment.
async fn generate_certificate(
    cert: &Certificate,
    own_key: &SigningKey,
    certificates: &Api<Certificate>,
    secrets: &Api<Secret>,
) -> Result<Vec<u8>> {
    let template = x509::build_template(cert)?;
    match resolve_issuer(cert, certificates, secrets).await? {
        None => x509::issue_self_signed(template, own_key),
        Some((parent_der, parent_key)) => {
            x509::issue_signed_by(template, own_key, &parent_der, &parent_key)
        }
    }
}

/// Unconverged dependencies requeue quietly; every other generation
/// failure is surfaced as a Warning event.
fn emits_generation_warning(error: &Error) -> bool {
    !matches!(error, Error::NotReady(_))
}

/// Collect the parent's signing material, or `None` for a self-signed
/// certificate. Artifacts the parent's own reconcile has not produced yet
/// surface as not-ready; a parent spec with no key pair link is permanent.
async fn resolve_issuer(
    cert: &Certificate,
    certificates: &Api<Certificate>,
    secrets: &Api<Secret>,
) -> Result<Option<(Vec<u8>, SigningKey)>> {
    let Some(parent_ref) = cert.spec.parent.as_ref() else {
        return Ok(None);
    };

    let parent = certificates.get_opt(&parent_ref.name).await?.ok_or_else(|| {
        Error::NotReady(format!("parent certificate {} not found", parent_ref.name))
    })?;
    let parent_key_pair = parent.spec.key_pair.as_ref().ok_or_else(|| {
        Error::Validation("parent certificate does not have a key pair linked to it".to_string())
    })?;

    let key_secret = secrets
        .get_opt(&parent_key_pair.name)
        .await?
        .ok_or_else(|| {
            Error::NotReady(format!(
                "parent key pair secret {} not found",
                parent_key_pair.name
            ))
        })?;
    let parent_rsa = keys::read_secret(&key_secret).map_err(|e| {
        Error::NotReady(format!(
            "parent key pair secret {} not usable yet: {e}",
            parent_key_pair.name
        ))
    })?;
    let parent_key = x509::signing_key(&parent_rsa)?;

    let parent_name = parent.name_any();
    let cert_secret = secrets
        .get_opt(&parent_name)
        .await?
        .ok_or_else(|| Error::NotReady(format!("parent certificate secret {parent_name} not found")))?;
    let parent_der = x509::read_secret(&cert_secret).map_err(|e| {
        Error::NotReady(format!("parent certificate secret {parent_name} not usable yet: {e}"))
    })?;

    Ok(Some((parent_der, parent_key)))
}

/// Run the Certificate controller until shutdown.
///
/// The certificate watch is reflected into a store read by the dependency
/// mappers, which translate KeyPair and Certificate changes into reconcile
/// requests for the certificates depending on them.
pub async fn run(client: Client) {
    let certificates: Api<Certificate> = Api::all(client.clone());
    let key_pairs: Api<KeyPair> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client.clone());
    let context = Arc::new(Context {
        client: client.clone(),
    });

    let (reader, writer) = reflector::store();
    let certificate_stream = watcher(certificates, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .applied_objects();

    let key_pair_reader = reader.clone();
    let child_reader = reader.clone();

    Controller::for_stream(certificate_stream, reader)
        .owns(secrets, watcher::Config::default())
        .watches(key_pairs, watcher::Config::default(), move |key_pair| {
            mapper::map_key_pair(&key_pair_reader, key_pair)
        })
        .watches(
            Api::<Certificate>::all(client),
            watcher::Config::default(),
            move |cert| mapper::map_certificate(&child_reader, cert),
        )
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CertificateSubject;
    use chrono::{DateTime, Datelike};

    fn info() -> CertificateInfo {
        CertificateInfo {
            subject: CertificateSubject {
                common_name: "example.test".to_string(),
                organization: vec![],
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_fill_generated_fields_defaults_everything() {
        let mut info = info();
        fill_generated_fields(&mut info).unwrap();

        let serial = info.serial_number.as_deref().unwrap();
        serial.parse::<u128>().unwrap();

        let not_before = info.not_before.unwrap();
        let not_after = info.not_after.unwrap();
        assert!(not_before < not_after);
        assert_eq!(not_after.year(), not_before.year() + 10);
    }

    #[test]
    fn test_fill_generated_fields_is_idempotent() {
        let mut info = info();
        fill_generated_fields(&mut info).unwrap();
        let first = info.clone();
        fill_generated_fields(&mut info).unwrap();
        assert_eq!(info, first);
    }

    #[test]
    fn test_fill_generated_fields_preserves_explicit_values() {
        let mut info = info();
        info.serial_number = Some("42".to_string());
        info.not_before = Some(DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().into());
        info.not_after = Some(DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z").unwrap().into());
        fill_generated_fields(&mut info).unwrap();
        assert_eq!(info.serial_number.as_deref(), Some("42"));
        assert_eq!(info.not_after.unwrap().year(), 2025);
    }

    #[test]
    fn test_generation_warning_skips_not_ready() {
        assert!(!emits_generation_warning(&Error::NotReady(
            "parent certificate root-ca not found".to_string()
        )));
        assert!(emits_generation_warning(&Error::Validation(
            "invalid serial number".to_string()
        )));
        assert!(emits_generation_warning(&Error::CertGen(
            rcgen::Error::CouldNotParseCertificate
        )));
    }

    #[test]
    fn test_default_window_starts_at_not_before() {
        let mut info = info();
        info.not_before = Some(DateTime::parse_from_rfc3339("2024-06-15T12:00:00Z").unwrap().into());
        fill_generated_fields(&mut info).unwrap();
        let not_after = info.not_after.unwrap();
        assert_eq!(not_after.year(), 2034);
        assert_eq!(not_after.month(), 6);
        assert_eq!(not_after.day(), 15);
    }
}

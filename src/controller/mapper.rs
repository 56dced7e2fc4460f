//! Dependency fan-out between KeyPairs and Certificates
//!
//! Mapping functions translate a change on one object into the set of
//! Certificates that must be re-reconciled. They read the certificate
//! reflector store and are best effort: an unready or empty store simply
//! yields no extra requests. Only direct children are requeued on a
//! certificate change; deeper descendants converge across later passes as
//! each requeued child's own mutation retriggers the mapper.

use std::sync::Arc;

use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use tracing::debug;

use crate::crd::{Certificate, KeyPair};

/// Certificates in the key pair's namespace whose `keyPair` reference names
/// it.
pub fn certificates_for_key_pair(
    certificates: &[Arc<Certificate>],
    key_pair: &KeyPair,
) -> Vec<ObjectRef<Certificate>> {
    let namespace = key_pair.namespace();
    let name = key_pair.name_any();
    certificates
        .iter()
        .filter(|c| c.namespace() == namespace)
        .filter(|c| {
            c.spec
                .key_pair
                .as_ref()
                .is_some_and(|reference| reference.name == name)
        })
        .map(|c| ObjectRef::from_obj(c.as_ref()))
        .collect()
}

/// The changed certificate itself plus every certificate in its namespace
/// whose `parent` reference names it.
pub fn dependent_certificates(
    certificates: &[Arc<Certificate>],
    changed: &Certificate,
) -> Vec<ObjectRef<Certificate>> {
    let namespace = changed.namespace();
    let name = changed.name_any();
    let mut requests = vec![ObjectRef::from_obj(changed)];
    requests.extend(
        certificates
            .iter()
            .filter(|c| c.namespace() == namespace)
            .filter(|c| {
                c.spec
                    .parent
                    .as_ref()
                    .is_some_and(|reference| reference.name == name)
            })
            .map(|c| ObjectRef::from_obj(c.as_ref())),
    );
    requests
}

/// Store-backed wrapper for the KeyPair watch.
pub fn map_key_pair(store: &Store<Certificate>, key_pair: KeyPair) -> Vec<ObjectRef<Certificate>> {
    let requests = certificates_for_key_pair(&store.state(), &key_pair);
    debug!(
        keypair = %key_pair.name_any(),
        count = requests.len(),
        "Mapped key pair change to certificates"
    );
    requests
}

/// Store-backed wrapper for the Certificate watch.
pub fn map_certificate(
    store: &Store<Certificate>,
    changed: Certificate,
) -> Vec<ObjectRef<Certificate>> {
    let requests = dependent_certificates(&store.state(), &changed);
    debug!(
        certificate = %changed.name_any(),
        count = requests.len(),
        "Mapped certificate change to dependents"
    );
    requests
}

//! Reconcilers and their supporting machinery
//!
//! Two controllers run side by side: one converging KeyPairs onto RSA key
//! secrets, one converging Certificates onto signed X.509 secrets. They
//! share the finalizer state machine, the upsert helpers, event emission
//! and the error policy below.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::warn;

use crate::error::Error;

pub mod certificate;
pub mod events;
pub mod finalizers;
pub mod keypair;
pub mod keys;
pub mod mapper;
pub mod store;
pub mod x509;

/// Requeue delay for failures expected to clear on their own.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(15);
/// Requeue delay for failures that need a spec or secret change first.
pub const STALL_INTERVAL: Duration = Duration::from_secs(60);

/// State shared by every reconcile invocation.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
}

/// Map a failed reconcile to its requeue schedule.
pub fn error_policy<K>(obj: Arc<K>, error: &Error, _ctx: Arc<Context>) -> Action
where
    K: Resource,
{
    warn!(
        name = %obj.name_any(),
        retriable = error.is_retriable(),
        "Reconcile failed: {error}"
    );
    if error.is_retriable() {
        Action::requeue(RETRY_INTERVAL)
    } else {
        Action::requeue(STALL_INTERVAL)
    }
}

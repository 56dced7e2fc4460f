//! KeyPair Custom Resource Definition
//!
//! A KeyPair represents an RSA private/public key pair persisted in a
//! backing secret of the same namespace and name.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How the key material backing a KeyPair is provisioned.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum SecretsMode {
    /// The operator generates and rotates the key material.
    #[default]
    Normal,

    /// Key material is managed externally; the operator leaves the backing
    /// secret untouched.
    SelfProvisioned,
}

impl std::fmt::Display for SecretsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecretsMode::Normal => write!(f, "Normal"),
            SecretsMode::SelfProvisioned => write!(f, "SelfProvisioned"),
        }
    }
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "pki.operator.dev",
    version = "v1alpha1",
    kind = "KeyPair",
    namespaced,
    shortname = "kp",
    printcolumn = r#"{"name":"Secrets","type":"string","jsonPath":".spec.secrets"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KeyPairSpec {
    #[serde(default)]
    pub secrets: SecretsMode,
}

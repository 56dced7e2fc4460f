//! Certificate Custom Resource Definition
//!
//! A Certificate carries the issuance parameters for a single X.509
//! certificate. The signed DER is persisted in a backing secret of the same
//! namespace and name. A Certificate without a `parent` is self-signed; one
//! with a `parent` is signed by the parent's key pair, forming a chain.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to an object in the same namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    pub name: String,
}

impl LocalObjectReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// The role a certificate plays, determining its X.509 extensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum CertificateType {
    /// Certification authority; may sign other certificates.
    CACert,
    /// TLS server certificate.
    ServerCert,
    /// TLS client certificate.
    ClientCert,
    /// Certificate valid for both server and client authentication.
    ServerClientCert,
}

impl std::fmt::Display for CertificateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CertificateType::CACert => write!(f, "CACert"),
            CertificateType::ServerCert => write!(f, "ServerCert"),
            CertificateType::ClientCert => write!(f, "ClientCert"),
            CertificateType::ServerClientCert => write!(f, "ServerClientCert"),
        }
    }
}

/// Key usage bits a certificate type adds on top of the baseline
/// (DigitalSignature, KeyEncipherment).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtraKeyUsage {
    CertSign,
    CrlSign,
}

/// Extended key usages a certificate type carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtendedUsage {
    ServerAuth,
    ClientAuth,
}

/// Per-type template policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TemplatePolicy {
    pub is_ca: bool,
    pub extra_key_usages: &'static [ExtraKeyUsage],
    pub extended_usages: &'static [ExtendedUsage],
}

impl CertificateType {
    /// Lookup table mapping each type to its X.509 template policy.
    pub fn policy(self) -> TemplatePolicy {
        match self {
            CertificateType::CACert => TemplatePolicy {
                is_ca: true,
                extra_key_usages: &[ExtraKeyUsage::CertSign, ExtraKeyUsage::CrlSign],
                extended_usages: &[],
            },
            CertificateType::ServerCert => TemplatePolicy {
                is_ca: false,
                extra_key_usages: &[],
                extended_usages: &[ExtendedUsage::ServerAuth],
            },
            CertificateType::ClientCert => TemplatePolicy {
                is_ca: false,
                extra_key_usages: &[],
                extended_usages: &[ExtendedUsage::ClientAuth],
            },
            CertificateType::ServerClientCert => TemplatePolicy {
                is_ca: false,
                extra_key_usages: &[],
                extended_usages: &[ExtendedUsage::ServerAuth, ExtendedUsage::ClientAuth],
            },
        }
    }
}

/// X.509 subject fields.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSubject {
    pub common_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organization: Vec<String>,
}

/// Issuance parameters. Unset fields are defaulted by the reconciler on the
/// first pass and then never changed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateInfo {
    /// Decimal representation of a 128-bit serial number. Immutable once set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,

    pub subject: CertificateSubject,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,

    /// IP SANs as strings; parsed at issuance time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,
}

#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "pki.operator.dev",
    version = "v1alpha1",
    kind = "Certificate",
    namespaced,
    shortname = "cert",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Parent","type":"string","jsonPath":".spec.parent.name"}"#,
    printcolumn = r#"{"name":"KeyPair","type":"string","jsonPath":".spec.keyPair.name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    #[serde(rename = "type")]
    pub cert_type: CertificateType,

    pub info: CertificateInfo,

    /// KeyPair holding this certificate's own key material. Auto-created and
    /// linked by the reconciler when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_pair: Option<LocalObjectReference>,

    /// Signing certificate. Unset means self-signed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<LocalObjectReference>,
}

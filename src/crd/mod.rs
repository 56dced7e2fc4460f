//! Custom Resource Definitions for the PKI operator
//!
//! Defines the `KeyPair` and `Certificate` resources plus the constants
//! shared between the two reconcilers: backing-secret data keys, checksum
//! annotations, finalizer names and event reasons.

mod certificate;
mod key_pair;


pub use certificate::{
    Certificate, CertificateInfo, CertificateSpec, CertificateSubject, CertificateType,
    ExtendedUsage, ExtraKeyUsage, LocalObjectReference, TemplatePolicy,
};
pub use key_pair::{KeyPair, KeyPairSpec, SecretsMode};

/// Data key for the PKCS#1 PEM private key in a KeyPair's backing secret.
pub const PRIVATE_KEY_DATA_KEY: &str = "private-key";
/// Data key for the PKCS#1 PEM public key in a KeyPair's backing secret.
pub const PUBLIC_KEY_DATA_KEY: &str = "public-key";
/// Data key for the DER certificate in a Certificate's backing secret.
pub const CERTIFICATE_DATA_KEY: &str = "certificate";

/// Annotation holding the checksum of the last persisted key material.
pub const KEY_PAIR_CHECKSUM_KEY: &str = "keypair.pki.operator.dev/checksum";
/// Annotation holding the checksum of the last issued certificate bytes.
pub const CERTIFICATE_CHECKSUM_KEY: &str = "certificate.pki.operator.dev/checksum";

/// Finalizer token guarding KeyPair deletion.
pub const KEY_PAIR_FINALIZER: &str = "keypair.pki.operator.dev/finalizer";
/// Finalizer token guarding Certificate deletion.
pub const CERTIFICATE_FINALIZER: &str = "certificate.pki.operator.dev/finalizer";

/// Event reason emitted when fresh RSA key material is generated.
pub const EVENT_GENERATING_KEY: &str = "GeneratingKey";
/// Event reason emitted before a certificate signing attempt.
pub const EVENT_GENERATING_CERTIFICATE: &str = "GeneratingCertificate";
/// Event reason emitted when certificate generation fails.
pub const EVENT_GENERATE_CERTIFICATE_ERROR: &str = "GenerateCertificateError";

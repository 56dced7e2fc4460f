//! Error types shared across the operator

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Stored key material could not be decoded (missing field, malformed
    /// PEM, wrong block type)
    #[error("Invalid key material: {0}")]
    KeyCodec(String),

    /// Certificate construction or signing failed
    #[error("Certificate generation error: {0}")]
    CertGen(#[from] rcgen::Error),

    /// The spec is malformed (bad IP address, bad serial, inverted validity)
    #[error("Validation error: {0}")]
    Validation(String),

    /// A required dependency has not converged yet; a later requeue will
    /// retry once it has
    #[error("Dependency not ready: {0}")]
    NotReady(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl Error {
    /// Whether a short requeue is worth it. Unconverged dependencies and
    /// API errors resolve on their own; validation and codec errors need a
    /// spec or secret change first.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::NotReady(_) | Error::KubeError(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

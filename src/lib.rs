//! pki-operator: Kubernetes operator for X.509 certificate lifecycles
//!
//! This crate provides a Kubernetes operator managing RSA key pairs and
//! chained X.509 certificates (root, intermediate, leaf) as custom
//! resources backed by secrets.

pub mod controller;
pub mod crd;
pub mod error;

pub use crate::error::{Error, Result};

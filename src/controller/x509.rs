//! X.509 template construction and certificate issuance
//!
//! Templates are built from the Certificate spec plus the per-type policy
//! table. Signing goes through rcgen; RSA keys from the KeyPair secrets are
//! bridged in as PKCS#8 DER. For a chained certificate the issuer is
//! reconstructed from the parent's stored DER, so issuer fields always match
//! the parent's subject.
//!
//! RSA PKCS#1 v1.5 signatures are deterministic, so re-issuing an unchanged
//! spec with unchanged keys reproduces the exact same DER bytes. The
//! checksum annotation relies on that.

use std::net::IpAddr;

use k8s_openapi::api::core::v1::Secret;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair as SigningKey, KeyUsagePurpose, SanType, SerialNumber, PKCS_RSA_SHA256,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls_pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::crd::{Certificate, ExtendedUsage, ExtraKeyUsage, CERTIFICATE_DATA_KEY};
use crate::error::{Error, Result};

/// Bridge an RSA private key into an rcgen signing key (RSA-SHA256).
pub fn signing_key(key: &RsaPrivateKey) -> Result<SigningKey> {
    let pkcs8 = key
        .to_pkcs8_der()
        .map_err(|e| Error::KeyCodec(format!("could not encode signing key: {e}")))?;
    let der = PrivatePkcs8KeyDer::from(pkcs8.as_bytes());
    Ok(SigningKey::from_pkcs8_der_and_sign_algo(
        &der,
        &PKCS_RSA_SHA256,
    )?)
}

/// Build the certificate template for a Certificate whose defaults have been
/// filled. Serial, validity window and any IP SANs are validated here.
pub fn build_template(cert: &Certificate) -> Result<CertificateParams> {
    let info = &cert.spec.info;

    let serial = info
        .serial_number
        .as_deref()
        .ok_or_else(|| Error::Validation("serial number not set".to_string()))?;
    let serial: u128 = serial
        .parse()
        .map_err(|_| Error::Validation(format!("invalid serial number {serial:?}")))?;

    let not_before = info
        .not_before
        .ok_or_else(|| Error::Validation("notBefore not set".to_string()))?;
    let not_after = info
        .not_after
        .ok_or_else(|| Error::Validation("notAfter not set".to_string()))?;
    if not_before > not_after {
        return Err(Error::Validation(format!(
            "notBefore {not_before} is after notAfter {not_after}"
        )));
    }

    let mut params = CertificateParams::default();
    params.serial_number = Some(SerialNumber::from_slice(&serial.to_be_bytes()));
    params.not_before = time::OffsetDateTime::from_unix_timestamp(not_before.timestamp())
        .map_err(|e| Error::Validation(format!("notBefore out of range: {e}")))?;
    params.not_after = time::OffsetDateTime::from_unix_timestamp(not_after.timestamp())
        .map_err(|e| Error::Validation(format!("notAfter out of range: {e}")))?;

    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, info.subject.common_name.clone());
    // rcgen keeps a single value per DN attribute type, so additional
    // organization values cannot be emitted; reject instead of dropping them.
    if info.subject.organization.len() > 1 {
        return Err(Error::Validation(format!(
            "at most one organization value is supported, got {}",
            info.subject.organization.len()
        )));
    }
    if let Some(organization) = info.subject.organization.first() {
        params
            .distinguished_name
            .push(DnType::OrganizationName, organization.clone());
    }

    for name in &info.dns_names {
        let ia5 = name
            .clone()
            .try_into()
            .map_err(|_| Error::Validation(format!("invalid DNS name {name:?}")))?;
        params.subject_alt_names.push(SanType::DnsName(ia5));
    }
    for address in &info.ip_addresses {
        let ip: IpAddr = address
            .parse()
            .map_err(|_| Error::Validation(format!("invalid IP address {address:?}")))?;
        params.subject_alt_names.push(SanType::IpAddress(ip));
    }

    params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    params.key_usages.push(KeyUsagePurpose::KeyEncipherment);

    let policy = cert.spec.cert_type.policy();
    for usage in policy.extra_key_usages {
        params.key_usages.push(match usage {
            ExtraKeyUsage::CertSign => KeyUsagePurpose::KeyCertSign,
            ExtraKeyUsage::CrlSign => KeyUsagePurpose::CrlSign,
        });
    }
    for usage in policy.extended_usages {
        params.extended_key_usages.push(match usage {
            ExtendedUsage::ServerAuth => ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedUsage::ClientAuth => ExtendedKeyUsagePurpose::ClientAuth,
        });
    }
    params.is_ca = if policy.is_ca {
        IsCa::Ca(BasicConstraints::Unconstrained)
    } else {
        IsCa::ExplicitNoCa
    };

    Ok(params)
}

/// Issue a self-signed certificate: issuer equals subject, signed with the
/// certificate's own key.
pub fn issue_self_signed(template: CertificateParams, key: &SigningKey) -> Result<Vec<u8>> {
    let cert = template.self_signed(key)?;
    Ok(cert.der().to_vec())
}

/// Issue a certificate signed by a parent. The issuer is reconstructed from
/// the parent's stored DER so issuer fields match the parent's subject
/// exactly, with the parent's private key doing the signing.
pub fn issue_signed_by(
    template: CertificateParams,
    subject_key: &SigningKey,
    parent_der: &[u8],
    parent_key: &SigningKey,
) -> Result<Vec<u8>> {
    let issuer_params = CertificateParams::from_ca_cert_der(&CertificateDer::from(parent_der))?;
    let issuer = issuer_params.self_signed(parent_key)?;
    let cert = template.signed_by(subject_key, &issuer, parent_key)?;
    Ok(cert.der().to_vec())
}

/// Extract the DER bytes from a Certificate's backing secret, validating
/// that they parse as an X.509 certificate.
pub fn read_secret(secret: &Secret) -> Result<Vec<u8>> {
    let data = secret
        .data
        .as_ref()
        .and_then(|d| d.get(CERTIFICATE_DATA_KEY))
        .ok_or_else(|| Error::Validation("certificate data missing".to_string()))?;
    X509Certificate::from_der(&data.0)
        .map_err(|e| Error::Validation(format!("stored certificate is not valid DER: {e}")))?;
    Ok(data.0.clone())
}

/// Write the DER bytes into the secret's data map.
pub fn update_secret(secret: &mut Secret, cert_data: Vec<u8>) {
    secret
        .data
        .get_or_insert_with(Default::default)
        .insert(
            CERTIFICATE_DATA_KEY.to_string(),
            k8s_openapi::ByteString(cert_data),
        );
}

/// Checksum over the issued artifact: lowercase hex SHA-256 of the DER bytes.
pub fn compute_checksum(cert_data: &[u8]) -> String {
    hex::encode(Sha256::digest(cert_data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        CertificateInfo, CertificateSpec, CertificateSubject, CertificateType,
        LocalObjectReference,
    };
    use chrono::{Duration, Utc};
    use kube::api::ObjectMeta;

    fn keys() -> (&'static RsaPrivateKey, &'static RsaPrivateKey) {
        use std::sync::OnceLock;
        static KEYS: OnceLock<(RsaPrivateKey, RsaPrivateKey)> = OnceLock::new();
        let (a, b) = KEYS.get_or_init(|| {
            let mut rng = rand::rngs::OsRng;
            (
                RsaPrivateKey::new(&mut rng, 2048).unwrap(),
                RsaPrivateKey::new(&mut rng, 2048).unwrap(),
            )
        });
        (a, b)
    }

    fn cert(name: &str, cert_type: CertificateType, parent: Option<&str>) -> Certificate {
        let not_before = Utc::now();
        Certificate {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: CertificateSpec {
                cert_type,
                info: CertificateInfo {
                    serial_number: Some("12345678901234567890".to_string()),
                    not_before: Some(not_before),
                    not_after: Some(not_before + Duration::days(365)),
                    subject: CertificateSubject {
                        common_name: name.to_string(),
                        organization: vec!["acme".to_string()],
                    },
                    dns_names: vec![format!("{name}.example.com")],
                    ip_addresses: vec!["10.0.0.1".to_string()],
                },
                key_pair: Some(LocalObjectReference::new(format!("{name}-keypair"))),
                parent: parent.map(LocalObjectReference::new),
            },
        }
    }

    fn parse(der: &[u8]) -> X509Certificate<'_> {
        let (rest, parsed) = X509Certificate::from_der(der).unwrap();
        assert!(rest.is_empty());
        parsed
    }

    #[test]
    fn test_self_signed_ca_issuer_equals_subject() {
        let (key, _) = keys();
        let ca = cert("root-ca", CertificateType::CACert, None);
        let signer = signing_key(key).unwrap();
        let der = issue_self_signed(build_template(&ca).unwrap(), &signer).unwrap();

        let parsed = parse(&der);
        assert_eq!(parsed.issuer(), parsed.subject());
        assert!(parsed.basic_constraints().unwrap().unwrap().value.ca);

        let ku = parsed.key_usage().unwrap().unwrap().value;
        assert!(ku.digital_signature());
        assert!(ku.key_encipherment());
        assert!(ku.key_cert_sign());
        assert!(ku.crl_sign());

        // self-signature verifies under its own key
        parsed.verify_signature(None).unwrap();
    }

    #[test]
    fn test_server_cert_extensions() {
        let (key, _) = keys();
        let server = cert("web", CertificateType::ServerCert, None);
        let signer = signing_key(key).unwrap();
        let der = issue_self_signed(build_template(&server).unwrap(), &signer).unwrap();

        let parsed = parse(&der);
        assert!(!parsed.basic_constraints().unwrap().unwrap().value.ca);
        let eku = parsed.extended_key_usage().unwrap().unwrap().value;
        assert!(eku.server_auth);
        assert!(!eku.client_auth);
        let ku = parsed.key_usage().unwrap().unwrap().value;
        assert!(!ku.key_cert_sign());
    }

    #[test]
    fn test_chained_cert_signed_by_parent() {
        let (parent_key, child_key) = keys();
        let ca = cert("root-ca", CertificateType::CACert, None);
        let parent_signer = signing_key(parent_key).unwrap();
        let parent_der = issue_self_signed(build_template(&ca).unwrap(), &parent_signer).unwrap();

        let leaf = cert("web", CertificateType::ServerClientCert, Some("root-ca"));
        let child_signer = signing_key(child_key).unwrap();
        let leaf_der = issue_signed_by(
            build_template(&leaf).unwrap(),
            &child_signer,
            &parent_der,
            &parent_signer,
        )
        .unwrap();

        let parent = parse(&parent_der);
        let parsed = parse(&leaf_der);
        assert_eq!(parsed.issuer(), parent.subject());
        assert_ne!(parsed.issuer(), parsed.subject());
        parsed.verify_signature(Some(parent.public_key())).unwrap();

        let eku = parsed.extended_key_usage().unwrap().unwrap().value;
        assert!(eku.server_auth);
        assert!(eku.client_auth);
    }

    #[test]
    fn test_template_carries_serial_validity_and_sans() {
        let (key, _) = keys();
        let subject = cert("web", CertificateType::ServerCert, None);
        let signer = signing_key(key).unwrap();
        let der = issue_self_signed(build_template(&subject).unwrap(), &signer).unwrap();

        let parsed = parse(&der);
        assert_eq!(
            parsed.tbs_certificate.serial.to_str_radix(10),
            "12345678901234567890"
        );
        assert_eq!(
            parsed.validity().not_before.timestamp(),
            subject.spec.info.not_before.unwrap().timestamp()
        );
        assert_eq!(
            parsed.validity().not_after.timestamp(),
            subject.spec.info.not_after.unwrap().timestamp()
        );

        let san = parsed.subject_alternative_name().unwrap().unwrap().value;
        assert_eq!(san.general_names.len(), 2);
    }

    #[test]
    fn test_issuance_is_deterministic() {
        let (key, _) = keys();
        let subject = cert("web", CertificateType::ServerCert, None);
        let signer = signing_key(key).unwrap();
        let a = issue_self_signed(build_template(&subject).unwrap(), &signer).unwrap();
        let b = issue_self_signed(build_template(&subject).unwrap(), &signer).unwrap();
        assert_eq!(a, b);
        assert_eq!(compute_checksum(&a), compute_checksum(&b));
    }

    #[test]
    fn test_subject_carries_organization() {
        let (key, _) = keys();
        let subject = cert("web", CertificateType::ServerCert, None);
        let signer = signing_key(key).unwrap();
        let der = issue_self_signed(build_template(&subject).unwrap(), &signer).unwrap();

        let parsed = parse(&der);
        let organizations: Vec<_> = parsed
            .subject()
            .iter_organization()
            .map(|attr| attr.as_str().unwrap())
            .collect();
        assert_eq!(organizations, vec!["acme"]);
    }

    #[test]
    fn test_template_rejects_multiple_organizations() {
        let mut multi = cert("x", CertificateType::ServerCert, None);
        multi.spec.info.subject.organization =
            vec!["acme".to_string(), "acme-holdings".to_string()];
        assert!(build_template(&multi).is_err());
    }

    #[test]
    fn test_template_rejects_bad_specs() {
        let mut bad_serial = cert("x", CertificateType::ServerCert, None);
        bad_serial.spec.info.serial_number = Some("not-a-number".to_string());
        assert!(build_template(&bad_serial).is_err());

        let mut inverted = cert("x", CertificateType::ServerCert, None);
        inverted.spec.info.not_after =
            Some(inverted.spec.info.not_before.unwrap() - Duration::days(1));
        assert!(build_template(&inverted).is_err());

        let mut bad_ip = cert("x", CertificateType::ServerCert, None);
        bad_ip.spec.info.ip_addresses = vec!["300.1.1.1".to_string()];
        assert!(build_template(&bad_ip).is_err());
    }

    #[test]
    fn test_secret_round_trip_and_checksum() {
        let (key, _) = keys();
        let subject = cert("web", CertificateType::ServerCert, None);
        let signer = signing_key(key).unwrap();
        let der = issue_self_signed(build_template(&subject).unwrap(), &signer).unwrap();

        let mut secret = Secret::default();
        update_secret(&mut secret, der.clone());
        assert_eq!(read_secret(&secret).unwrap(), der);

        let mut garbage = Secret::default();
        update_secret(&mut garbage, vec![0xde, 0xad]);
        assert!(read_secret(&garbage).is_err());
        assert!(read_secret(&Secret::default()).is_err());

        let checksum = compute_checksum(&der);
        assert_eq!(checksum.len(), 64);
        assert_eq!(checksum, checksum.to_lowercase());
    }
}

//! Certificate authority operations for agent identity.
//!
//! The server owns one root CA. Agents generate their own key pair and send
//! a CSR carrying their DNS names and/or IP addresses; the server verifies
//! the CSR signature and signs a leaf certificate with the root.

use std::net::IpAddr;

use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DnType,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
    SanType,
};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};

use crate::error::CertError;

/// Root certificate lifetime.
const CA_VALIDITY_DAYS: i64 = 30 * 365;

/// Lifetime of certificates issued to agents and to the server.
const LEAF_VALIDITY_DAYS: i64 = 30 * 365;

/// CA material: PEM encodings plus a ready-to-use issuer.
pub struct CaBundle {
    /// PEM-encoded CA certificate.
    pub cert_pem: String,
    /// PEM-encoded PKCS#8 CA private key.
    pub key_pem: String,
    issuer: Issuer<'static, KeyPair>,
}

impl CaBundle {
    /// Rebuild the CA from stored PEM material.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CertError> {
        let key_pair = KeyPair::from_pem(key_pem).map_err(|e| CertError::InvalidCa(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| CertError::InvalidCa(e.to_string()))?;
        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            issuer,
        })
    }
}

/// A certificate signed by the CA.
pub struct IssuedCert {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// SHA-256 over the certificate DER.
    pub fingerprint: [u8; 32],
}

/// Server certificate and key (PEM).
pub struct ServerCertBundle {
    pub cert_pem: String,
    pub key_pem: String,
}

fn generate_p256() -> Result<KeyPair, CertError> {
    KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(|e| CertError::Generation(e.to_string()))
}

/// Generate a self-signed root CA.
pub fn generate_ca(org_name: &str) -> Result<CaBundle, CertError> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, format!("{org_name} Root CA"));
    params
        .distinguished_name
        .push(DnType::OrganizationName, org_name);
    params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    params.key_usages.push(KeyUsagePurpose::CrlSign);
    params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

    let key_pair = generate_p256()?;
    let ca_cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(CaBundle {
        cert_pem: ca_cert.pem(),
        key_pem: key_pair.serialize_pem(),
        issuer: Issuer::new(params, key_pair),
    })
}

/// Verify an agent CSR and sign it with the CA.
///
/// The issued certificate keeps the DNS names and IP addresses requested in
/// the CSR, is never a CA, and is usable for both client and server auth.
pub fn sign_agent_csr(ca: &CaBundle, csr_pem: &str) -> Result<IssuedCert, CertError> {
    let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
        .map_err(|e| CertError::InvalidCsr(e.to_string()))?;

    let now = OffsetDateTime::now_utc();
    csr.params.is_ca = IsCa::ExplicitNoCa;
    csr.params.not_before = now;
    csr.params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);
    csr.params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    csr.params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];

    let cert = csr
        .signed_by(&ca.issuer)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(IssuedCert {
        fingerprint: cert_fingerprint(cert.der()),
        cert_pem: cert.pem(),
    })
}

/// Generate the server's own certificate signed by the CA.
pub fn generate_server_cert(
    ca: &CaBundle,
    dns_names: &[&str],
    ip_addresses: &[IpAddr],
) -> Result<ServerCertBundle, CertError> {
    let mut params = leaf_params(dns_names, ip_addresses)?;
    params
        .distinguished_name
        .push(DnType::CommonName, "Stork Server");
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let key = generate_p256()?;
    let cert = params
        .signed_by(&key, &ca.issuer)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(ServerCertBundle {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// Build a CSR the way an agent does (key pair + PEM request).
///
/// Returns `(csr_pem, key_pem)`.
pub fn generate_csr(
    dns_names: &[&str],
    ip_addresses: &[IpAddr],
) -> Result<(String, String), CertError> {
    let mut params = leaf_params(dns_names, ip_addresses)?;
    if let Some(name) = dns_names.first() {
        params.distinguished_name.push(DnType::CommonName, *name);
    }
    let key = generate_p256()?;
    let csr = params
        .serialize_request(&key)
        .map_err(|e| CertError::Generation(e.to_string()))?;
    let pem = csr.pem().map_err(|e| CertError::Generation(e.to_string()))?;
    Ok((pem, key.serialize_pem()))
}

fn leaf_params(
    dns_names: &[&str],
    ip_addresses: &[IpAddr],
) -> Result<CertificateParams, CertError> {
    let mut params = CertificateParams::default();
    for name in dns_names {
        let name = (*name)
            .try_into()
            .map_err(|e: rcgen::Error| CertError::Generation(e.to_string()))?;
        params.subject_alt_names.push(SanType::DnsName(name));
    }
    for ip in ip_addresses {
        params.subject_alt_names.push(SanType::IpAddress(*ip));
    }
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);
    Ok(params)
}

/// SHA-256 fingerprint of a DER-encoded certificate.
pub fn cert_fingerprint(der: &[u8]) -> [u8; 32] {
    Sha256::digest(der).into()
}

/// Render a fingerprint as colon-separated upper-case hex.
pub fn format_fingerprint(fingerprint: &[u8; 32]) -> String {
    fingerprint
        .iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::needless_pass_by_value
)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use x509_parser::extensions::GeneralName;
    use x509_parser::pem::parse_x509_pem;

    #[test]
    fn generate_ca_produces_valid_pem() {
        let ca = generate_ca("Stork Test").unwrap();
        assert!(ca.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(ca.key_pem.contains("BEGIN PRIVATE KEY"));

        let (_, pem) = parse_x509_pem(ca.cert_pem.as_bytes()).unwrap();
        let cert = pem.parse_x509().unwrap();
        assert!(cert.is_ca());
        let validity = cert.validity();
        let years = (validity.not_after.timestamp() - validity.not_before.timestamp())
            / (365 * 24 * 3600);
        assert_eq!(years, 30);
    }

    #[test]
    fn agent_csr_round_trip() {
        let ca = generate_ca("Stork Test").unwrap();
        let agent_ip = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        let (csr_pem, _key) = generate_csr(&["name"], &[agent_ip]).unwrap();

        let issued = sign_agent_csr(&ca, &csr_pem).unwrap();

        let (_, pem) = parse_x509_pem(issued.cert_pem.as_bytes()).unwrap();
        let cert = pem.parse_x509().unwrap();
        assert!(!cert.is_ca());

        let san = cert.subject_alternative_name().unwrap().unwrap();
        let dns: Vec<&str> = san
            .value
            .general_names
            .iter()
            .filter_map(|n| match n {
                GeneralName::DNSName(d) => Some(*d),
                _ => None,
            })
            .collect();
        assert_eq!(dns[0], "name");
        let has_ip = san
            .value
            .general_names
            .iter()
            .any(|n| matches!(n, GeneralName::IPAddress(b) if *b == [192, 0, 2, 1]));
        assert!(has_ip);

        let (_, ca_pem) = parse_x509_pem(ca.cert_pem.as_bytes()).unwrap();
        let ca_cert = ca_pem.parse_x509().unwrap();
        cert.verify_signature(Some(ca_cert.public_key())).unwrap();

        assert_eq!(issued.fingerprint, cert_fingerprint(&pem.contents));
    }

    #[test]
    fn tampered_csr_is_rejected() {
        let ca = generate_ca("Stork Test").unwrap();
        let (csr_pem, _key) = generate_csr(&["agent"], &[]).unwrap();
        assert!(sign_agent_csr(&ca, "not a csr").is_err());

        // Flip a character in the base64 body so the signature no longer verifies.
        let lines: Vec<&str> = csr_pem.lines().collect();
        let mut body = lines[1].to_string();
        let replaced = if body.starts_with('A') { "B" } else { "A" };
        body.replace_range(0..1, replaced);
        let mut tampered = lines.clone();
        tampered[1] = &body;
        let tampered = tampered.join("\n");
        assert!(sign_agent_csr(&ca, &tampered).is_err());
    }

    #[test]
    fn ca_reloads_from_pem() {
        let ca = generate_ca("Stork Test").unwrap();
        let reloaded = CaBundle::from_pem(&ca.cert_pem, &ca.key_pem).unwrap();
        let (csr_pem, _) = generate_csr(&["agent"], &[]).unwrap();
        let issued = sign_agent_csr(&reloaded, &csr_pem).unwrap();

        let (_, pem) = parse_x509_pem(issued.cert_pem.as_bytes()).unwrap();
        let cert = pem.parse_x509().unwrap();
        let (_, ca_pem) = parse_x509_pem(ca.cert_pem.as_bytes()).unwrap();
        let ca_cert = ca_pem.parse_x509().unwrap();
        cert.verify_signature(Some(ca_cert.public_key())).unwrap();
    }

    #[test]
    fn server_cert_signed_by_ca() {
        let ca = generate_ca("Stork Test").unwrap();
        let bundle =
            generate_server_cert(&ca, &["localhost"], &[IpAddr::V4(Ipv4Addr::LOCALHOST)]).unwrap();
        assert!(bundle.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(bundle.key_pem.contains("BEGIN PRIVATE KEY"));
        assert_ne!(bundle.cert_pem, ca.cert_pem);
    }

    #[test]
    fn fingerprint_formatting() {
        let fp = cert_fingerprint(b"abc");
        let text = format_fingerprint(&fp);
        assert_eq!(text.len(), 32 * 3 - 1);
        assert!(text.starts_with("BA:78:16:BF"));
    }
}

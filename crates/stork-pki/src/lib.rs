//! Stork PKI
//!
//! Server-side certificate authority used to secure server-agent traffic:
//!
//! - **CA**: self-signed ECDSA P-256 root valid for 30 years
//! - **Agents**: certificates minted from agent-originated CSRs after the
//!   CSR signature has been verified
//! - **Fingerprints**: SHA-256 over the DER of an issued certificate

pub mod certs;
pub mod error;

pub use certs::{
    CaBundle, IssuedCert, ServerCertBundle, cert_fingerprint, format_fingerprint, generate_ca,
    generate_csr, generate_server_cert, sign_agent_csr,
};
pub use error::CertError;

//! Certificate error types.

/// Certificate generation and signing errors.
#[derive(Debug, thiserror::Error)]
pub enum CertError {
    /// An error occurred during key or certificate generation.
    #[error("Certificate generation error: {0}")]
    Generation(String),

    /// The CSR could not be parsed or its signature did not verify.
    #[error("Invalid certificate signing request: {0}")]
    InvalidCsr(String),

    /// Stored CA material could not be loaded.
    #[error("Invalid CA material: {0}")]
    InvalidCa(String),
}

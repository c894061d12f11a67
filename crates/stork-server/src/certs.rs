//! Server CA and server certificate kept in the `secrets` table.

use stork_pki::{CaBundle, CertError, generate_ca, generate_server_cert};
use thiserror::Error;
use tracing::info;

use crate::storage::{DatabaseError, ServerDatabase};

pub const CA_CERT_SECRET: &str = "ca_cert";
pub const CA_KEY_SECRET: &str = "ca_key";
pub const SERVER_CERT_SECRET: &str = "server_cert";
pub const SERVER_KEY_SECRET: &str = "server_key";

#[derive(Debug, Error)]
pub enum CaSetupError {
    #[error(transparent)]
    Cert(#[from] CertError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Load the server CA, creating it and the server certificate on first start.
pub async fn setup_server_ca(
    db: &ServerDatabase,
    organization: &str,
) -> Result<CaBundle, CaSetupError> {
    let cert = db.get_secret(CA_CERT_SECRET).await?;
    let key = db.get_secret(CA_KEY_SECRET).await?;
    let ca = if let (Some(cert), Some(key)) = (cert, key) {
        CaBundle::from_pem(&cert, &key)?
    } else {
        let ca = generate_ca(organization)?;
        db.set_secret(CA_CERT_SECRET, &ca.cert_pem).await?;
        db.set_secret(CA_KEY_SECRET, &ca.key_pem).await?;
        info!(organization, "Created server certificate authority");
        ca
    };

    if db.get_secret(SERVER_CERT_SECRET).await?.is_none() {
        let server = generate_server_cert(&ca, &["localhost"], &[])?;
        db.set_secret(SERVER_CERT_SECRET, &server.cert_pem).await?;
        db.set_secret(SERVER_KEY_SECRET, &server.key_pem).await?;
        info!("Created server certificate");
    }
    Ok(ca)
}

//! SSH host key management
//!
//! Loads the PEM-encoded host key from disk, or generates a temporary
//! Ed25519 key when none is configured.

use anyhow::{Context, Result};
use std::path::Path;

use russh::keys::{HashAlg, PrivateKey};

/// Load the host key from a file.
///
/// Supports RSA and Ed25519 keys in PEM/OpenSSH encodings.
pub fn load_host_key(path: &Path) -> Result<PrivateKey> {
    let key_data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read host key from {:?}", path))?;

    parse_host_key(&key_data)
}

/// Parse a host key from a PEM string.
pub fn parse_host_key(pem_data: &str) -> Result<PrivateKey> {
    russh::keys::decode_secret_key(pem_data, None).context("Failed to parse private key")
}

/// Generate a new Ed25519 host key.
pub fn generate_ed25519_key() -> Result<PrivateKey> {
    use rand::rngs::OsRng;
    use russh::keys::ssh_key::private::Ed25519Keypair;

    let keypair = Ed25519Keypair::random(&mut OsRng);
    Ok(PrivateKey::from(keypair))
}

/// SHA256 fingerprint of the key's public half.
pub fn key_fingerprint(key: &PrivateKey) -> String {
    key.public_key().fingerprint(HashAlg::Sha256).to_string()
}

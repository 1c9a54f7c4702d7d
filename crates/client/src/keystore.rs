//! On-disk storage for the local key pair.
//!
//! The key file is the JSON object produced by [`KeyPair::to_json`]:
//! `{"privateKey": "<base64>", "publicKey": "<base64>"}`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use protocol::KeyPair;

/// Loads the key pair at `path`, or generates and stores a new one.
pub fn load_or_generate(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        return load(path);
    }

    let keys = KeyPair::generate();
    save(path, &keys)?;
    tracing::info!(path = %path.display(), fingerprint = %keys.public_key().fingerprint(), "generated new key pair");
    Ok(keys)
}

/// Loads and validates the key pair at `path`.
pub fn load(path: &Path) -> Result<KeyPair> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read key file: {}", path.display()))?;
    let keys = KeyPair::from_json(&contents)
        .with_context(|| format!("Invalid key file: {}", path.display()))?;
    tracing::debug!(path = %path.display(), fingerprint = %keys.public_key().fingerprint(), "loaded key pair");
    Ok(keys)
}

/// Writes `keys` to `path`, creating parent directories.
pub fn save(path: &Path, keys: &KeyPair) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create key directory: {}", parent.display()))?;
    }

    let json = keys.to_json().context("Failed to encode key pair")?;
    fs::write(path, json).with_context(|| format!("Failed to write key file: {}", path.display()))?;
    restrict_permissions(path)?;
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to restrict key file permissions: {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

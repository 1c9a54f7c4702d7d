//! Key-agreement key pairs for TermRelay peers.
//!
//! This module provides X25519 key generation, base64 import/export with
//! derivation checks, and the public-only [`PublicKey`] used to address a
//! remote peer.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::{ProtocolError, Result};

/// Length of both the private scalar and the public point, in bytes.
pub const KEY_LENGTH: usize = 32;

/// Number of key bytes shown in a fingerprint.
const FINGERPRINT_BYTES: usize = 8;

/// Decodes a base64 key and checks its length.
fn decode_key(encoded: &str, what: &'static str) -> Result<[u8; KEY_LENGTH]> {
    let bytes = BASE64.decode(encoded)?;
    if bytes.len() != KEY_LENGTH {
        return Err(ProtocolError::InvalidLength {
            what,
            expected: KEY_LENGTH,
            got: bytes.len(),
        });
    }
    let mut key = [0u8; KEY_LENGTH];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// A 32-byte X25519 public key.
///
/// This is all that is known about a remote peer: it is pinned at pairing
/// time and used as the counterpart when sealing and opening envelopes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_LENGTH]);

impl PublicKey {
    /// Creates a public key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Creates a public key from a slice, checking its length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LENGTH] =
            bytes
                .try_into()
                .map_err(|_| ProtocolError::InvalidLength {
                    what: "public key",
                    expected: KEY_LENGTH,
                    got: bytes.len(),
                })?;
        Ok(Self(key))
    }

    /// Decodes a standard-alphabet base64 public key.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        decode_key(encoded, "public key").map(Self)
    }

    /// Returns the raw bytes of this key.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// Encodes the key as standard-alphabet base64.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Short human-readable form, e.g. `a1b2:c3d4:e5f6:7890`.
    pub fn fingerprint(&self) -> String {
        self.0[..FINGERPRINT_BYTES]
            .chunks(2)
            .map(|chunk| format!("{:02x}{:02x}", chunk[0], chunk[1]))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PublicKey").field(&self.fingerprint()).finish()
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// Base64 form of a key pair, as stored on disk and exchanged with
/// collaborators: `{"privateKey": "...", "publicKey": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedKeyPair {
    /// Base64 private scalar.
    #[serde(rename = "privateKey")]
    pub private_key: String,
    /// Base64 public point.
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

/// Lenient mirror of [`EncodedKeyPair`] so absent keys surface as
/// argument errors naming the key instead of a generic JSON error.
#[derive(Deserialize)]
struct RawEncodedKeyPair {
    #[serde(rename = "privateKey")]
    private_key: Option<String>,
    #[serde(rename = "publicKey")]
    public_key: Option<String>,
}

/// A local X25519 key pair.
///
/// The public key is always derived from the private key; it is never
/// accepted independently. The private bytes are wiped on drop.
#[derive(Clone)]
pub struct KeyPair {
    private_key: [u8; KEY_LENGTH],
    public_key: PublicKey,
}

impl KeyPair {
    /// Generates a new random key pair using the operating system's
    /// cryptographically secure random number generator.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Creates a key pair from raw private key bytes, deriving the public key.
    pub fn from_private_key_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = X25519PublicKey::from(&secret);
        Self {
            private_key: secret.to_bytes(),
            public_key: PublicKey(public.to_bytes()),
        }
    }

    /// Imports a key pair from its base64 form.
    ///
    /// Both keys must decode to 32 bytes and the public key must be the
    /// derivation of the private key; a mismatched pair is rejected.
    pub fn from_base64(encoded: &EncodedKeyPair) -> Result<Self> {
        let private_key = decode_key(&encoded.private_key, "private key")?;
        let supplied_public = decode_key(&encoded.public_key, "public key")?;

        let pair = Self::from_private_key_bytes(private_key);
        if pair.public_key.as_bytes() != &supplied_public {
            return Err(ProtocolError::InvalidArgument(
                "public key does not match the private key".to_string(),
            ));
        }
        Ok(pair)
    }

    /// Exports the key pair as base64 strings.
    pub fn to_base64(&self) -> EncodedKeyPair {
        EncodedKeyPair {
            private_key: BASE64.encode(self.private_key),
            public_key: self.public_key.to_base64(),
        }
    }

    /// Parses a JSON object of the form produced by [`KeyPair::to_json`].
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawEncodedKeyPair = serde_json::from_str(json)?;
        let encoded = EncodedKeyPair {
            private_key: raw.private_key.ok_or(ProtocolError::MissingField("privateKey"))?,
            public_key: raw.public_key.ok_or(ProtocolError::MissingField("publicKey"))?,
        };
        Self::from_base64(&encoded)
    }

    /// Serializes the key pair to a JSON object of base64 strings.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_base64())?)
    }

    /// Returns the private key bytes.
    ///
    /// **Security Warning**: The private key should be kept confidential.
    /// Only use this method for key agreement or secure storage.
    pub fn private_key_bytes(&self) -> [u8; KEY_LENGTH] {
        self.private_key
    }

    /// Returns the public half of this key pair.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.private_key == other.private_key && self.public_key == other.public_key
    }
}

impl Eq for KeyPair {}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

//! NaCl `crypto_box` authenticated encryption between two key pairs.
//!
//! Sealed payloads are laid out as `nonce (24) || tag (16) || ciphertext`,
//! the byte order produced by libsodium and PyNaCl `Box.encrypt`. The shared
//! key is X25519 followed by HSalsa20; the cipher is XSalsa20-Poly1305.
//! Every call to [`seal`] draws a fresh random nonce.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::{Aead, AeadCore, OsRng};
use crypto_box::{PublicKey as BoxPublicKey, SalsaBox, SecretKey};

use crate::crypto::{KeyPair, PublicKey};
use crate::error::{ProtocolError, Result};

/// XSalsa20 nonce length in bytes.
pub const NONCE_LENGTH: usize = 24;

/// Poly1305 authentication tag length in bytes.
pub const TAG_LENGTH: usize = 16;

/// Smallest valid sealed payload: an empty plaintext.
pub const MIN_SEALED_LENGTH: usize = NONCE_LENGTH + TAG_LENGTH;

fn salsa_box(own: &KeyPair, peer: &PublicKey) -> SalsaBox {
    let secret = SecretKey::from(own.private_key_bytes());
    let public = BoxPublicKey::from(*peer.as_bytes());
    SalsaBox::new(&public, &secret)
}

/// Encrypts `plaintext` from `sender` to `recipient`.
///
/// Returns `nonce || tag || ciphertext`.
pub fn seal(plaintext: &[u8], sender: &KeyPair, recipient: &PublicKey) -> Result<Vec<u8>> {
    let nonce = SalsaBox::generate_nonce(&mut OsRng);
    let ciphertext = salsa_box(sender, recipient)
        .encrypt(&nonce, plaintext)
        .map_err(|_| ProtocolError::Encryption("XSalsa20-Poly1305 encryption failed".to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypts a payload produced by [`seal`].
///
/// The length is checked before any cryptographic work. The tag is verified
/// before any plaintext is released; a tampered payload or a key mismatch
/// yields [`ProtocolError::Decryption`].
pub fn open(sealed: &[u8], recipient: &KeyPair, sender: &PublicKey) -> Result<Vec<u8>> {
    if sealed.len() < MIN_SEALED_LENGTH {
        return Err(ProtocolError::InvalidLength {
            what: "sealed payload",
            expected: MIN_SEALED_LENGTH,
            got: sealed.len(),
        });
    }

    let (nonce, ciphertext) = sealed.split_at(NONCE_LENGTH);
    salsa_box(recipient, sender)
        .decrypt(GenericArray::from_slice(nonce), ciphertext)
        .map_err(|_| {
            ProtocolError::Decryption(
                "authentication failed: payload was modified or keys do not match".to_string(),
            )
        })
}

/// Encrypts UTF-8 text and returns the sealed payload as base64.
pub fn encrypt(plaintext: &str, sender: &KeyPair, recipient: &PublicKey) -> Result<String> {
    let sealed = seal(plaintext.as_bytes(), sender, recipient)?;
    Ok(BASE64.encode(sealed))
}

/// Decodes a base64 sealed payload and decrypts it to UTF-8 text.
pub fn decrypt(encoded: &str, recipient: &KeyPair, sender: &PublicKey) -> Result<String> {
    let sealed = BASE64.decode(encoded)?;
    let plaintext = open(&sealed, recipient, sender)?;
    String::from_utf8(plaintext).map_err(|e| {
        ProtocolError::InvalidFormat(format!("decrypted payload is not UTF-8: {}", e))
    })
}

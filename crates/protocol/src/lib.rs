//! # TermRelay Protocol Library
//!
//! Wire protocol and cryptographic primitives for talking to a remote
//! terminal host through an untrusted relay.
//!
//! ## Overview
//!
//! - **Key Pairs**: X25519 key generation and base64 import/export
//! - **Sealed Boxes**: NaCl `crypto_box` authenticated encryption, byte
//!   compatible with libsodium and PyNaCl
//! - **Envelopes**: typed, timestamped JSON frames wrapping a sealed payload
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            JSON Payload Object          │  terminal_input, resize, ...
//! ├─────────────────────────────────────────┤
//! │              Sealed Box                 │  XSalsa20-Poly1305
//! ├─────────────────────────────────────────┤
//! │               Envelope                  │  JSON text frame
//! ├─────────────────────────────────────────┤
//! │          Transport (WebSocket)          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Envelope, KeyPair, MessageType};
//! use protocol::messages::TerminalInput;
//!
//! let alice = KeyPair::generate();
//! let bob = KeyPair::generate();
//!
//! let input = TerminalInput { input: "ls -la".to_string() };
//! let envelope = Envelope::seal(MessageType::TerminalInput, &input, &alice, bob.public_key()).unwrap();
//! let wire = envelope.to_json().unwrap();
//!
//! let received = Envelope::from_json(&wire).unwrap();
//! let opened: TerminalInput = received.open_as(&bob, alice.public_key()).unwrap();
//! assert_eq!(opened, input);
//! ```
//!
//! ## Modules
//!
//! - [`crypto`]: Key pairs and public keys
//! - [`sealed_box`]: Authenticated encryption
//! - [`messages`]: Message types, envelopes and payloads
//! - [`error`]: Error types

pub mod crypto;
pub mod error;
pub mod messages;
pub mod sealed_box;

pub use crypto::{EncodedKeyPair, KeyPair, PublicKey, KEY_LENGTH};
pub use error::{ErrorKind, ProtocolError, Result};
pub use messages::{Envelope, MessageType, Payload};
pub use sealed_box::{MIN_SEALED_LENGTH, NONCE_LENGTH, TAG_LENGTH};

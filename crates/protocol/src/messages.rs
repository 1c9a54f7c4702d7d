//! Wire message definitions for TermRelay.
//!
//! Every frame on the relay connection is a JSON [`Envelope`] carrying a
//! [`MessageType`] tag, a sealed payload, the sender's public key and a UTC
//! timestamp. The payload itself is a JSON object encrypted with
//! [`crate::sealed_box`]; the relay can route it but never read it.

use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crypto::{KeyPair, PublicKey};
use crate::error::{ProtocolError, Result};
use crate::sealed_box;

/// Decrypted payload: an arbitrary JSON object.
pub type Payload = Map<String, Value>;

/// Closed set of message types carried over the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Keystrokes or command text from the client.
    #[serde(rename = "terminal_input")]
    TerminalInput,
    /// Terminal output from the remote host.
    #[serde(rename = "terminal_output")]
    TerminalOutput,
    /// Terminal window size change.
    #[serde(rename = "resize")]
    Resize,
    /// Pairing handshake request.
    #[serde(rename = "pairing_request")]
    PairingRequest,
    /// Chunk of captured audio.
    #[serde(rename = "voice.audio_frame")]
    VoiceAudioFrame,
    /// Transcript produced from voice audio.
    #[serde(rename = "voice.transcript")]
    VoiceTranscript,
    /// Voice session control command.
    #[serde(rename = "voice.control")]
    VoiceControl,
    /// Voice session status report.
    #[serde(rename = "voice.status")]
    VoiceStatus,
}

impl MessageType {
    /// Every message type, in wire-declaration order.
    pub const ALL: [MessageType; 8] = [
        MessageType::TerminalInput,
        MessageType::TerminalOutput,
        MessageType::Resize,
        MessageType::PairingRequest,
        MessageType::VoiceAudioFrame,
        MessageType::VoiceTranscript,
        MessageType::VoiceControl,
        MessageType::VoiceStatus,
    ];

    /// The wire string for this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::TerminalInput => "terminal_input",
            MessageType::TerminalOutput => "terminal_output",
            MessageType::Resize => "resize",
            MessageType::PairingRequest => "pairing_request",
            MessageType::VoiceAudioFrame => "voice.audio_frame",
            MessageType::VoiceTranscript => "voice.transcript",
            MessageType::VoiceControl => "voice.control",
            MessageType::VoiceStatus => "voice.status",
        }
    }

    /// Whether this type belongs to the voice session family.
    pub fn is_voice(&self) -> bool {
        matches!(
            self,
            MessageType::VoiceAudioFrame
                | MessageType::VoiceTranscript
                | MessageType::VoiceControl
                | MessageType::VoiceStatus
        )
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownMessageType(s.to_string()))
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Formats a timestamp losslessly: milliseconds when that is exact,
/// otherwise as many fractional digits as needed.
fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    let format = if timestamp.timestamp_subsec_nanos() % 1_000_000 == 0 {
        SecondsFormat::Millis
    } else {
        SecondsFormat::AutoSi
    };
    timestamp.to_rfc3339_opts(format, true)
}

/// Parses an ISO-8601 timestamp. Values without an offset are taken as UTC.
fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(value) {
        Ok(parsed) => Ok(parsed.with_timezone(&Utc)),
        Err(rfc_err) => NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|_| ProtocolError::from(rfc_err)),
    }
}

/// Outgoing wire shape of an envelope.
#[derive(Serialize)]
struct WireEnvelope<'a> {
    #[serde(rename = "type")]
    message_type: MessageType,
    payload: &'a str,
    sender_public_key: String,
    timestamp: String,
}

/// Reads a required string field from a wire object.
fn required_str<'a>(object: &'a Map<String, Value>, field: &'static str) -> Result<&'a str> {
    match object.get(field) {
        None | Some(Value::Null) => Err(ProtocolError::MissingField(field)),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(ProtocolError::InvalidArgument(format!(
            "field {} must be a string, got {}",
            field, other
        ))),
    }
}

/// A typed, timestamped, sender-identified sealed message.
///
/// Envelopes are immutable values. Opening one never mutates it and may be
/// repeated any number of times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    message_type: MessageType,
    payload: String,
    sender_public_key: PublicKey,
    timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Seals `payload` from `sender` to `recipient`.
    ///
    /// The payload must serialize to a JSON object; anything else is an
    /// argument error. The timestamp is the current UTC time truncated to
    /// milliseconds.
    pub fn seal<T>(
        message_type: MessageType,
        payload: &T,
        sender: &KeyPair,
        recipient: &PublicKey,
    ) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(payload).map_err(|e| {
            ProtocolError::InvalidArgument(format!("payload is not JSON-encodable: {}", e))
        })?;
        let Value::Object(object) = value else {
            return Err(ProtocolError::InvalidArgument(format!(
                "{} payload must be a JSON object",
                message_type
            )));
        };

        // serde_json maps are key-ordered, so this text is canonical.
        let plaintext = serde_json::to_string(&object)?;
        let sealed = sealed_box::encrypt(&plaintext, sender, recipient)?;

        tracing::trace!(%message_type, sealed_len = sealed.len(), "sealed envelope");

        Ok(Self {
            message_type,
            payload: sealed,
            sender_public_key: *sender.public_key(),
            timestamp: Utc::now().trunc_subsecs(3),
        })
    }

    /// Decrypts the payload with the local key pair and the remote sender's
    /// public key, returning the original JSON object.
    pub fn open(&self, own: &KeyPair, remote: &PublicKey) -> Result<Payload> {
        let plaintext = sealed_box::decrypt(&self.payload, own, remote)?;
        match serde_json::from_str::<Value>(&plaintext)? {
            Value::Object(object) => Ok(object),
            other => Err(ProtocolError::InvalidFormat(format!(
                "decrypted payload is not a JSON object: {}",
                other
            ))),
        }
    }

    /// Like [`Envelope::open`], deserializing into a typed payload.
    pub fn open_as<T: DeserializeOwned>(&self, own: &KeyPair, remote: &PublicKey) -> Result<T> {
        let object = self.open(own, remote)?;
        Ok(serde_json::from_value(Value::Object(object))?)
    }

    /// Serializes the envelope to its JSON wire form.
    pub fn to_json(&self) -> Result<String> {
        let wire = WireEnvelope {
            message_type: self.message_type,
            payload: &self.payload,
            sender_public_key: self.sender_public_key.to_base64(),
            timestamp: format_timestamp(&self.timestamp),
        };
        Ok(serde_json::to_string(&wire)?)
    }

    /// Parses an envelope from its JSON wire form.
    ///
    /// Missing fields and unknown message types are argument errors naming
    /// the field or value; malformed JSON or timestamps are format errors.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        let Value::Object(object) = value else {
            return Err(ProtocolError::InvalidFormat(
                "envelope must be a JSON object".to_string(),
            ));
        };

        let message_type = required_str(&object, "type")?.parse::<MessageType>()?;
        let payload = required_str(&object, "payload")?.to_string();
        let sender_public_key = PublicKey::from_base64(required_str(&object, "sender_public_key")?)?;
        let timestamp = match object.get("timestamp") {
            None | Some(Value::Null) => return Err(ProtocolError::MissingField("timestamp")),
            Some(Value::String(text)) => parse_timestamp(text)?,
            Some(other) => {
                return Err(ProtocolError::InvalidFormat(format!(
                    "timestamp must be an ISO-8601 string, got {}",
                    other
                )))
            }
        };

        Ok(Self {
            message_type,
            payload,
            sender_public_key,
            timestamp,
        })
    }

    /// The message type tag.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// The base64 sealed payload as carried on the wire.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// The decoded sealed payload bytes (`nonce || tag || ciphertext`).
    pub fn sealed_payload(&self) -> Result<Vec<u8>> {
        Ok(BASE64.decode(&self.payload)?)
    }

    /// The public key the sender claims to have sealed with.
    pub fn sender_public_key(&self) -> &PublicKey {
        &self.sender_public_key
    }

    /// When the envelope was sealed.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

// ============================================================================
// Payload Types
// ============================================================================

/// Text typed into the remote terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalInput {
    pub input: String,
}

/// Output produced by the remote terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalOutput {
    pub output: String,
}

/// Terminal size change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resize {
    pub cols: u16,
    pub rows: u16,
}

/// Request to pair this client with the host behind a pairing code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingRequest {
    pub pairing_code: String,
    /// Base64 public key of the requesting client.
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

/// One chunk of captured audio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceAudioFrame {
    /// Position of this frame in the capture stream.
    pub sequence: u64,
    /// Base64 audio bytes.
    pub data: String,
}

impl VoiceAudioFrame {
    /// Wraps raw audio bytes from the capture device.
    pub fn from_bytes(sequence: u64, audio: &[u8]) -> Self {
        Self {
            sequence,
            data: BASE64.encode(audio),
        }
    }

    /// Decodes the raw audio bytes.
    pub fn decode_audio(&self) -> Result<Vec<u8>> {
        Ok(BASE64.decode(&self.data)?)
    }
}

/// Transcript text for a voice session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceTranscript {
    pub text: String,
    /// False for interim hypotheses that may still change.
    #[serde(default)]
    pub is_final: bool,
}

/// Voice session control actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceAction {
    Start,
    Stop,
    Cancel,
}

/// Voice session control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceControl {
    pub action: VoiceAction,
}

/// Voice session status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStatus {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

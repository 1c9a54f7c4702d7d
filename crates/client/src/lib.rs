//! TermRelay client library.
//!
//! Connects to a relay over WebSocket, exchanges sealed [`protocol::Envelope`]s
//! with a paired peer and keeps the connection alive with heartbeats and
//! exponential-backoff reconnection.
//!
//! # Modules
//!
//! - [`client`]: [`RelayClient`] connection lifecycle and message transport
//! - [`state`]: [`ConnectionStateManager`] and change notification
//! - [`reconnect`]: backoff policy
//! - [`config`]: TOML configuration
//! - [`keystore`]: key file storage

pub mod client;
pub mod config;
pub mod keystore;
pub mod reconnect;
pub mod state;

pub use client::{
    validate_pairing_code, ErrorEvent, ErrorStream, MessageStream, RelayClient, RelayClientConfig,
};
pub use config::{Config, ConfigError};
pub use reconnect::ReconnectPolicy;
pub use state::{ConnectionState, ConnectionStateManager, ListenerId, StateSnapshot};

//! # Relay Wire Protocol
//!
//! Shared wire-format crate for the relay fabric. Used by the server for both
//! ingress streams and outward gateway connections. Contains:
//!
//! - [`envelope`] — the message envelope and its typed payloads
//! - [`wrapping`] — PlainText / Sign-Only / Encrypt transport wrappings
//! - [`keys`]     — RSA key material and the gateway handshake hash
//! - [`error`]    — codec error type

pub mod envelope;
pub mod error;
pub mod keys;
pub mod wrapping;

pub use envelope::{
    AuthGatewayMessage, AuthMessage, AuthResultMessage, ClientRegistration, ClientType,
    ControlRequest, ControlResponse, Envelope, MessageType, ProxyMessage, WelcomeMessage,
};
pub use error::CodecError;
pub use keys::{handshake_hash, NodeKeyPair, PeerPublicKey};
pub use wrapping::Wrapping;

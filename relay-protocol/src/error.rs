//! # Codec Errors
//!
//! Error type for envelope encoding, decoding and key handling.

use thiserror::Error;

/// Errors produced by the wrapping codec and key material loaders.
///
/// Decryption and signature failures collapse into the single
/// [`CodecError::InvalidConnectionStateForAuthentication`] variant so a peer
/// probing the node cannot distinguish a bad key from a bad ciphertext.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The wire bytes do not have the shape the expected wrapping requires
    /// (not JSON where PlainText was expected, wrong number of JOSE segments,
    /// unparseable header).
    #[error("malformed envelope")]
    MalformedEnvelope,

    /// Uniform failure for any cryptographic rejection: signature mismatch,
    /// decryption failure, authentication tag mismatch.
    #[error("invalid connection state for authentication")]
    InvalidConnectionStateForAuthentication,

    /// Encrypt wrapping was requested without a recipient public key.
    #[error("recipient public key required for encrypt wrapping")]
    RecipientKeyRequired,

    /// The envelope payload is missing or does not deserialize into the
    /// type the behavior requires.
    #[error("envelope payload missing or malformed: {0}")]
    MalformedPayload(String),

    /// PEM or DER key material could not be parsed or generated.
    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

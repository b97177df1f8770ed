//! # Server Errors
//!
//! Error taxonomy for the relay node. The receive loop cares about exactly
//! one distinction: a [`BehaviorError::Policy`] closes the offending stream
//! with a 1008 close frame, everything else is logged and the loop goes on.

use relay_protocol::CodecError;
use thiserror::Error;

/// Failure of a behavior run against one inbound envelope.
#[derive(Debug, Error)]
pub enum BehaviorError {
    /// Protocol violation. The receive loop closes the stream with close
    /// code 1008 and this reason.
    #[error("{0}")]
    Policy(String),

    /// Envelope or payload could not be handled cryptographically or
    /// structurally. Treated as a policy violation by the receive loop.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A side effect failed (registry write, bus publish, peer send). Logged
    /// and swallowed; never fails the triggering request.
    #[error("transient: {0}")]
    Transient(String),
}

impl BehaviorError {
    /// Shorthand for a policy violation with a reason string.
    pub fn policy(reason: impl Into<String>) -> Self {
        BehaviorError::Policy(reason.into())
    }

    /// Whether this failure must close the stream.
    pub fn closes_stream(&self) -> bool {
        matches!(self, BehaviorError::Policy(_) | BehaviorError::Codec(_))
    }

    /// The reason string placed in the close frame.
    pub fn close_reason(&self) -> String {
        match self {
            BehaviorError::Policy(reason) => reason.clone(),
            BehaviorError::Codec(e) => e.to_string(),
            BehaviorError::Transient(reason) => reason.clone(),
        }
    }
}

/// Fatal startup failures: missing required configuration or unusable key
/// material. These abort the process before any listener binds.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("missing required config: {0}")]
    MissingConfig(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("key material: {0}")]
    Keys(#[from] CodecError),
}

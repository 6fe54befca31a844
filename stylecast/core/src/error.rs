//! Error Types and Failure Policy
//!
//! Each kind of failure in a streaming session has its own type, and the type
//! decides what happens to the session:
//!
//! - [`EngineError`] from the ingress probe: the frame is dropped and nothing
//!   is sent for it.
//! - [`FallbackReason`]: the engine failed, timed out or panicked. The
//!   original frame is sent back instead of a styled one.
//! - [`ControlError`]: the control message is answered with an error notice
//!   and the control state is left alone.
//! - [`SessionError`]: the transport failed. The session is torn down.
//!
//! Only transport failures end a session. Everything else degrades to
//! unmodified video.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::engine::EngineError;

/// A rejected control message
#[derive(Debug, Error)]
pub enum ControlError {
    /// The text message was not a valid control message
    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// `set_model` carried an empty name
    #[error("model name must not be empty")]
    EmptyModel,

    /// `set_model` named a model the engine does not provide
    #[error("unsupported model '{model}' (available: {available})")]
    UnsupportedModel {
        /// The requested model
        model: String,
        /// Comma-separated list of models the engine accepts
        available: String,
    },
}

/// Why a frame was answered with the original bytes
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FallbackReason {
    /// The engine reported an error
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The engine did not answer within the configured timeout
    #[error("transform timed out after {0:?}")]
    Timeout(Duration),

    /// The engine task panicked or was cancelled
    #[error("transform task failed: {0}")]
    Crashed(String),
}

impl FallbackReason {
    /// Short tag for logs and counters
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Engine(EngineError::Decode(_)) => "decode",
            Self::Engine(EngineError::Inference(_)) => "inference",
            Self::Engine(EngineError::UnknownModel(_)) => "unknown_model",
            Self::Timeout(_) => "timeout",
            Self::Crashed(_) => "crashed",
        }
    }
}

/// Transport failure that ends a session
#[derive(Debug, Error)]
pub enum SessionError {
    /// Reading from the peer failed
    #[error("receive failed: {0}")]
    Receive(#[source] tungstenite::Error),

    /// Writing to the peer failed
    #[error("send failed: {0}")]
    Send(#[source] tungstenite::Error),
}

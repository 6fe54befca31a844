//! Style Engine Abstraction
//!
//! The engine is the collaborator that actually restyles a frame. The
//! streaming core never looks inside it: it hands over the content frame, the
//! active style image and the model label, and gets back encoded bytes or an
//! [`EngineError`].
//!
//! # Design Philosophy
//!
//! The engine is injected into every connection handler as an
//! `Arc<dyn StyleEngine>`, so tests can swap in stub engines (echo, always
//! failing, deliberately slow) without touching the scheduling code.
//!
//! `transform` is a plain synchronous call. The dispatcher runs it on tokio's
//! blocking pool, so implementations are free to burn CPU.

pub mod color;

use std::sync::Arc;

use thiserror::Error;

pub use color::{ColorTransferConfig, ColorTransferEngine};

/// Errors raised by a style engine
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Image bytes could not be decoded (content or style)
    #[error("decode failed: {0}")]
    Decode(String),

    /// The model failed while producing the styled frame
    #[error("inference failed: {0}")]
    Inference(String),

    /// The requested model is not provided by this engine
    #[error("unknown model '{0}'")]
    UnknownModel(String),
}

/// Input for a single transformation
///
/// Built per worker iteration from the taken frame and the control snapshot
/// that travelled with it. Buffers are shared, not copied.
#[derive(Clone, Debug)]
pub struct TransformRequest {
    /// Encoded content frame
    pub content: Arc<[u8]>,
    /// Encoded style image
    pub style: Arc<[u8]>,
    /// Model label, opaque to the core
    pub model: String,
}

impl TransformRequest {
    /// Create a new request
    pub fn new(content: Arc<[u8]>, style: Arc<[u8]>, model: impl Into<String>) -> Self {
        Self {
            content,
            style,
            model: model.into(),
        }
    }
}

/// Style engine trait
///
/// Implementations must be callable from several sessions at once; any
/// internal caching is the engine's own business.
pub trait StyleEngine: Send + Sync + 'static {
    /// Engine name for logs
    fn name(&self) -> &str;

    /// Model labels this engine accepts
    fn models(&self) -> Vec<String>;

    /// Check whether a model label is accepted
    fn supports_model(&self, model: &str) -> bool {
        self.models().iter().any(|m| m == model)
    }

    /// Cheap ingress check that the bytes look like an encoded image
    ///
    /// The default sniffs the container magic bytes; it does not decode pixels.
    fn probe(&self, data: &[u8]) -> Result<(), EngineError> {
        image::guess_format(data)
            .map(|_| ())
            .map_err(|e| EngineError::Decode(e.to_string()))
    }

    /// Restyle the content frame with the style image
    fn transform(&self, request: &TransformRequest) -> Result<Vec<u8>, EngineError>;
}

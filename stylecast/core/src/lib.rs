//! Stylecast Core - Live Video Style Transfer Streaming
//!
//! This crate is the per-connection scheduling core of the stylecast daemon.
//! Clients stream encoded video frames over a WebSocket and get restyled
//! frames back; they can swap the style image or the model mid-stream.
//!
//! The interesting part is not the restyling (an injected [`StyleEngine`])
//! but deciding which frames get restyled when frames arrive faster than the
//! engine can keep up.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────── one connection ────────────────────────┐
//! │                                                                 │
//! │   WebSocket ──▶ ConnectionHandler                               │
//! │                   │                                             │
//! │                   ├── control ──────────────▶ Session           │
//! │                   │                          ┌───────────────┐  │
//! │                   └── frame ─▶ RateLimiter ─▶│ Mailbox (1)   │  │
//! │                                              │ control state │  │
//! │                                              │ worker flag   │  │
//! │                                              └──────┬────────┘  │
//! │                                                     │           │
//! │                                       Worker (at most one)      │
//! │                                                     │           │
//! │                                          StyleEngine::transform │
//! │                                                     │           │
//! │   WebSocket ◀── egress ◀────────────────────────────┘           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Backpressure comes from three places: the rate limiter drops frames that
//! arrive too soon, the mailbox keeps only the newest waiting frame, and only
//! one transform per session is ever in flight.
//!
//! # Failure Policy
//!
//! - Unrecognisable frame at ingress: dropped, nothing sent
//! - No style set: frame returned unchanged
//! - Engine error, timeout or panic: original frame returned, session continues
//! - Socket error: session ends
//!
//! # Module Overview
//!
//! - [`config`]: TOML, environment and CLI configuration
//! - [`dispatch`]: Latest-wins mailbox and single-flight worker
//! - [`engine`]: Style engine trait and the built-in colour transfer engine
//! - [`error`]: Error types and the failure policy
//! - [`frame`]: Admitted frame type
//! - [`handler`]: Per-connection WebSocket loop
//! - [`messages`]: Wire messages
//! - [`rate_limit`]: Ingress frame rate limiter
//! - [`session`]: Per-connection session state

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod frame;
pub mod handler;
pub mod messages;
pub mod rate_limit;
pub mod session;

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, ServerSettings, StreamSettings, StylecastConfig, StylecastToml,
};

pub use dispatch::{Dispatcher, FrameResult, Mailbox};
pub use engine::{
    ColorTransferConfig, ColorTransferEngine, EngineError, StyleEngine, TransformRequest,
};
pub use error::{ControlError, FallbackReason, SessionError};
pub use frame::Frame;
pub use handler::{ConnectionHandler, HandlerConfig};
pub use messages::{ControlMessage, Inbound, Outbound, ServerNotice};
pub use rate_limit::{FrameRateConfig, FrameRateLimiter, RateLimitResult};
pub use session::{
    ConnectionId, ControlSnapshot, DepositOutcome, Job, Session, SessionClosed, SessionStats,
    SessionStatsSnapshot,
};

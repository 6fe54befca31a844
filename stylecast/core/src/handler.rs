//! Connection Handler
//!
//! Runs one WebSocket connection from accept to teardown. The handler owns
//! the session and the ingress loop; results come back from the worker over
//! a small bounded channel and are written to the socket by the same loop.
//!
//! ```text
//!            ┌────────────── ConnectionHandler::run ──────────────┐
//!  socket ──▶│ classify ─┬─ control ──▶ validate ──▶ Session      │
//!            │           └─ frame ──▶ probe ──▶ rate limit ──┐    │
//!            │                                   Dispatcher ◀┘    │
//!  socket ◀──│ egress_rx ◀──────────── worker ◀─────┘             │
//!            └────────────────────────────────────────────────────┘
//! ```
//!
//! The loop never awaits the engine. Transport errors end the session;
//! everything else is absorbed here or in the worker.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace, warn};

use crate::config::StreamSettings;
use crate::dispatch::Dispatcher;
use crate::engine::StyleEngine;
use crate::error::{ControlError, SessionError};
use crate::frame::Frame;
use crate::messages::{ControlMessage, Inbound, Outbound};
use crate::rate_limit::{FrameRateConfig, FrameRateLimiter, RateLimitResult};
use crate::session::{ConnectionId, Session, SessionStats, SessionStatsSnapshot};

/// Settings for one connection
#[derive(Clone, Debug)]
pub struct HandlerConfig {
    /// Ingress rate limiting
    pub rate: FrameRateConfig,
    /// Model a new session starts with
    pub default_model: String,
    /// Per-transform timeout
    pub transform_timeout: Option<Duration>,
    /// Result frames buffered between worker and socket
    pub egress_capacity: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self::from(&StreamSettings::default())
    }
}

impl From<&StreamSettings> for HandlerConfig {
    fn from(settings: &StreamSettings) -> Self {
        Self {
            rate: settings.rate_config(),
            default_model: settings.default_model.clone(),
            transform_timeout: settings.transform_timeout(),
            egress_capacity: settings.egress_capacity,
        }
    }
}

impl HandlerConfig {
    /// Set the rate limiting configuration
    #[must_use]
    pub fn with_rate(mut self, rate: FrameRateConfig) -> Self {
        self.rate = rate;
        self
    }

    /// Set the default model
    #[must_use]
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Set the per-transform timeout
    #[must_use]
    pub fn with_transform_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.transform_timeout = timeout;
        self
    }
}

/// Handles one client connection
pub struct ConnectionHandler {
    conn_id: ConnectionId,
    config: HandlerConfig,
    engine: Arc<dyn StyleEngine>,
}

impl ConnectionHandler {
    /// Create a handler
    pub fn new(conn_id: ConnectionId, config: HandlerConfig, engine: Arc<dyn StyleEngine>) -> Self {
        Self {
            conn_id,
            config,
            engine,
        }
    }

    /// Serve the connection until the peer leaves or the transport fails
    ///
    /// A clean close, including a peer that drops the TCP connection without
    /// a closing handshake, returns the session's final counters.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when reading or writing the socket fails.
    pub async fn run<S>(self, stream: WebSocketStream<S>) -> Result<SessionStatsSnapshot, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let session = Arc::new(Session::new(self.conn_id, self.config.default_model.clone()));
        let (egress_tx, mut egress_rx) = mpsc::channel(self.config.egress_capacity.max(1));
        let mut ingress = Ingress {
            engine: Arc::clone(&self.engine),
            limiter: FrameRateLimiter::new(&self.config.rate),
            dispatcher: Dispatcher::new(
                Arc::clone(&session),
                Arc::clone(&self.engine),
                egress_tx,
                self.config.transform_timeout,
            ),
            session: Arc::clone(&session),
            next_seq: 0,
        };

        info!(
            engine = self.engine.name(),
            model = %self.config.default_model,
            max_fps = self.config.rate.max_fps,
            "Session started"
        );

        let (mut sink, mut source) = stream.split();

        let result = loop {
            tokio::select! {
                incoming = source.next() => {
                    let message = match incoming {
                        Some(Ok(message)) => message,
                        Some(Err(e)) if is_disconnect(&e) => {
                            debug!(error = %e, "Peer went away");
                            break Ok(());
                        }
                        Some(Err(e)) => break Err(SessionError::Receive(e)),
                        None => break Ok(()),
                    };

                    let reply = match Inbound::classify(message) {
                        Inbound::Frame(data) => {
                            ingress.on_frame(data);
                            None
                        }
                        Inbound::Control(control) => ingress.on_control(control),
                        Inbound::Invalid(e) => Some(ingress.reject(&e)),
                        Inbound::Close => {
                            debug!("Peer sent close");
                            break Ok(());
                        }
                        Inbound::Ignore => None,
                    };

                    if let Some(reply) = reply {
                        if let Err(e) = sink.send(reply.into_message()).await {
                            break send_failed(e);
                        }
                    }
                }

                Some(outbound) = egress_rx.recv() => {
                    if let Err(e) = sink.send(outbound.into_message()).await {
                        break send_failed(e);
                    }
                }
            }
        };

        // Teardown: nothing produced from here on reaches the peer
        ingress.dispatcher.shutdown();
        drop(ingress);
        drop(egress_rx);
        if let Err(e) = sink.close().await {
            trace!(error = %e, "Close handshake not completed");
        }

        let stats = session.stats().snapshot();
        match &result {
            Ok(()) => info!(
                received = stats.received,
                processed = stats.processed,
                styled = stats.styled,
                fallbacks = stats.fallbacks,
                rate_dropped = stats.rate_dropped,
                superseded = stats.superseded,
                undecodable = stats.undecodable,
                "Session closed"
            ),
            Err(e) => warn!(error = %e, processed = stats.processed, "Session terminated"),
        }
        result.map(|()| stats)
    }
}

/// Ingress side of one session
struct Ingress {
    engine: Arc<dyn StyleEngine>,
    session: Arc<Session>,
    limiter: FrameRateLimiter,
    dispatcher: Dispatcher,
    next_seq: u64,
}

impl Ingress {
    fn on_frame(&mut self, data: Vec<u8>) {
        let stats = self.session.stats();
        SessionStats::bump(&stats.received);

        if let Err(e) = self.engine.probe(&data) {
            SessionStats::bump(&stats.undecodable);
            debug!(len = data.len(), error = %e, "Dropping undecodable frame");
            return;
        }

        let now = Instant::now();
        if let RateLimitResult::Dropped { retry_after } = self.limiter.admit(now) {
            SessionStats::bump(&stats.rate_dropped);
            trace!(retry_after_ms = retry_after.as_millis() as u64, "Frame rate limited");
            return;
        }

        self.next_seq += 1;
        if let Err(e) = self.dispatcher.submit(Frame::new(self.next_seq, data, now)) {
            debug!(seq = self.next_seq, error = %e, "Frame arrived after teardown");
        }
    }

    fn on_control(&mut self, control: ControlMessage) -> Option<Outbound> {
        if let Err(e) = self.validate(&control) {
            return Some(self.reject(&e));
        }

        let kind = control.kind();
        let snapshot = self.session.apply_control(control);
        info!(
            kind,
            model = %snapshot.model,
            style_bytes = snapshot.style.as_ref().map_or(0, |s| s.len()),
            revision = snapshot.revision,
            "Control applied"
        );
        None
    }

    fn validate(&self, control: &ControlMessage) -> Result<(), ControlError> {
        match control {
            ControlMessage::SetModel { model } if model.trim().is_empty() => {
                Err(ControlError::EmptyModel)
            }
            ControlMessage::SetModel { model } if !self.engine.supports_model(model) => {
                Err(ControlError::UnsupportedModel {
                    model: model.clone(),
                    available: self.engine.models().join(", "),
                })
            }
            _ => Ok(()),
        }
    }

    fn reject(&self, error: &ControlError) -> Outbound {
        SessionStats::bump(&self.session.stats().control_rejected);
        warn!(error = %error, "Rejected control message");
        Outbound::error(error.to_string())
    }
}

fn is_disconnect(error: &tungstenite::Error) -> bool {
    match error {
        tungstenite::Error::ConnectionClosed
        | tungstenite::Error::AlreadyClosed
        | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        tungstenite::Error::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}

fn send_failed(error: tungstenite::Error) -> Result<(), SessionError> {
    if is_disconnect(&error) {
        debug!(error = %error, "Peer went away during send");
        Ok(())
    } else {
        Err(SessionError::Send(error))
    }
}

//! Frame Dispatch
//!
//! Moves admitted frames from the ingress loop to the style engine, one at a
//! time per session, always choosing the newest frame.
//!
//! ```text
//!   ingress ──submit──▶ Session mailbox ──next_job──▶ worker ──▶ engine
//!                        (latest wins)                  │
//!                                                       ▼
//!                                               egress channel ──▶ client
//! ```
//!
//! The [`Dispatcher`] belongs to a single connection handler. It starts a
//! worker task only when the session reports that none is running, which
//! together with the session lock gives at most one in-flight transform per
//! session. [`Dispatcher::shutdown`] closes the session and aborts the worker;
//! anything the engine finishes afterwards is dropped.

pub mod mailbox;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, Instrument};

use crate::engine::StyleEngine;
use crate::error::FallbackReason;
use crate::frame::Frame;
use crate::messages::Outbound;
use crate::session::{DepositOutcome, Session, SessionClosed};

pub use mailbox::Mailbox;

/// What the worker produced for one frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameResult {
    /// The engine restyled the frame
    Styled {
        /// Encoded styled frame
        bytes: Vec<u8>,
    },
    /// No style was active
    Passthrough {
        /// The original frame
        bytes: Arc<[u8]>,
    },
    /// The engine failed; the original frame goes back
    Fallback {
        /// The original frame
        bytes: Arc<[u8]>,
        /// What went wrong
        reason: FallbackReason,
    },
}

impl FrameResult {
    /// Bytes to send to the client
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Styled { bytes } => bytes,
            Self::Passthrough { bytes } | Self::Fallback { bytes, .. } => bytes.to_vec(),
        }
    }

    /// Short label for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Styled { .. } => "styled",
            Self::Passthrough { .. } => "passthrough",
            Self::Fallback { .. } => "fallback",
        }
    }
}

/// Per-connection frame dispatcher
pub struct Dispatcher {
    session: Arc<Session>,
    engine: Arc<dyn StyleEngine>,
    egress: mpsc::Sender<Outbound>,
    transform_timeout: Option<Duration>,
    worker: Option<AbortHandle>,
}

impl Dispatcher {
    /// Create a dispatcher for one session
    ///
    /// `transform_timeout` of `None` lets the engine take as long as it needs.
    pub fn new(
        session: Arc<Session>,
        engine: Arc<dyn StyleEngine>,
        egress: mpsc::Sender<Outbound>,
        transform_timeout: Option<Duration>,
    ) -> Self {
        Self {
            session,
            engine,
            egress,
            transform_timeout,
            worker: None,
        }
    }

    /// The session this dispatcher feeds
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Hand an admitted frame to the session
    ///
    /// Never waits on the engine. Starts a worker if none is running.
    pub fn submit(&mut self, frame: Frame) -> Result<DepositOutcome, SessionClosed> {
        let seq = frame.seq();
        let outcome = self.session.deposit(frame)?;
        if let Some(superseded) = outcome.superseded {
            debug!(seq, superseded, "Frame superseded before processing");
        }
        if outcome.spawn_worker {
            self.spawn_worker();
        }
        Ok(outcome)
    }

    fn spawn_worker(&mut self) {
        let context = worker::WorkerContext {
            session: Arc::clone(&self.session),
            engine: Arc::clone(&self.engine),
            egress: self.egress.clone(),
            transform_timeout: self.transform_timeout,
        };
        let handle = tokio::spawn(worker::run_worker(context).in_current_span());
        self.worker = Some(handle.abort_handle());
    }

    /// Close the session and stop the worker
    ///
    /// An engine call already on the blocking pool runs to completion, but
    /// its result is discarded.
    pub fn shutdown(&mut self) {
        self.session.close();
        if let Some(handle) = self.worker.take() {
            handle.abort();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, TransformRequest};
    use crate::messages::ControlMessage;
    use crate::session::ConnectionId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    /// Prefixes output with the style bytes; tracks concurrency
    struct SlowEcho {
        delay: Duration,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl SlowEcho {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }
        }
    }

    impl StyleEngine for SlowEcho {
        fn name(&self) -> &str {
            "slow-echo"
        }

        fn models(&self) -> Vec<String> {
            vec!["adain".into()]
        }

        fn transform(&self, request: &TransformRequest) -> Result<Vec<u8>, EngineError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.active.fetch_sub(1, Ordering::SeqCst);
            let mut out = request.style.to_vec();
            out.extend_from_slice(&request.content);
            Ok(out)
        }
    }

    struct Failing;

    impl StyleEngine for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn models(&self) -> Vec<String> {
            vec!["adain".into()]
        }

        fn transform(&self, _request: &TransformRequest) -> Result<Vec<u8>, EngineError> {
            Err(EngineError::Inference("no gpu".into()))
        }
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(seq, vec![seq as u8], Instant::now())
    }

    fn styled_session() -> Arc<Session> {
        let session = Arc::new(Session::new(ConnectionId::new(), "adain"));
        session.apply_control(ControlMessage::SetStyle {
            style: Some(b"S".to_vec()),
        });
        session
    }

    #[test]
    fn test_frame_result_bytes() {
        let original: Arc<[u8]> = Arc::from(&b"orig"[..]);
        assert_eq!(
            FrameResult::Styled {
                bytes: b"new".to_vec()
            }
            .into_bytes(),
            b"new"
        );
        let fallback = FrameResult::Fallback {
            bytes: original.clone(),
            reason: FallbackReason::Timeout(Duration::from_millis(1)),
        };
        assert_eq!(fallback.kind(), "fallback");
        assert_eq!(fallback.into_bytes(), b"orig");
        assert_eq!(
            FrameResult::Passthrough { bytes: original }.into_bytes(),
            b"orig"
        );
    }

    #[tokio::test]
    async fn test_passthrough_without_style() {
        let session = Arc::new(Session::new(ConnectionId::new(), "adain"));
        let (tx, mut rx) = mpsc::channel(4);
        let engine = Arc::new(SlowEcho::new(Duration::ZERO));
        let mut dispatcher = Dispatcher::new(session.clone(), engine.clone(), tx, None);

        dispatcher.submit(frame(7)).unwrap();
        assert_eq!(rx.recv().await, Some(Outbound::Frame(vec![7])));
        assert_eq!(engine.max_active.load(Ordering::SeqCst), 0);
        assert_eq!(session.stats().snapshot().passthrough, 1);
    }

    #[tokio::test]
    async fn test_styled_frame() {
        let session = styled_session();
        let (tx, mut rx) = mpsc::channel(4);
        let mut dispatcher =
            Dispatcher::new(session.clone(), Arc::new(SlowEcho::new(Duration::ZERO)), tx, None);

        dispatcher.submit(frame(1)).unwrap();
        assert_eq!(rx.recv().await, Some(Outbound::Frame(b"S\x01".to_vec())));
        assert_eq!(session.stats().snapshot().styled, 1);
    }

    #[tokio::test]
    async fn test_engine_error_falls_back_to_original() {
        let session = styled_session();
        let (tx, mut rx) = mpsc::channel(4);
        let mut dispatcher = Dispatcher::new(session.clone(), Arc::new(Failing), tx, None);

        dispatcher.submit(frame(3)).unwrap();
        assert_eq!(rx.recv().await, Some(Outbound::Frame(vec![3])));
        assert!(!session.is_closed());

        let stats = session.stats().snapshot();
        assert_eq!(stats.fallbacks, 1);
        assert_eq!(stats.processed, 1);
    }

    #[tokio::test]
    async fn test_timeout_falls_back_to_original() {
        let session = styled_session();
        let (tx, mut rx) = mpsc::channel(4);
        let engine = Arc::new(SlowEcho::new(Duration::from_millis(300)));
        let mut dispatcher =
            Dispatcher::new(session.clone(), engine, tx, Some(Duration::from_millis(20)));

        dispatcher.submit(frame(4)).unwrap();
        assert_eq!(rx.recv().await, Some(Outbound::Frame(vec![4])));
        assert_eq!(session.stats().snapshot().fallbacks, 1);
    }

    #[tokio::test]
    async fn test_timeout_sends_fallback_without_waiting_for_engine() {
        let session = styled_session();
        let (tx, mut rx) = mpsc::channel(4);
        let engine = Arc::new(SlowEcho::new(Duration::from_secs(1)));
        let mut dispatcher =
            Dispatcher::new(session.clone(), engine.clone(), tx, Some(Duration::from_millis(20)));

        dispatcher.submit(frame(9)).unwrap();
        let sent = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("fallback held back by the abandoned transform");
        assert_eq!(sent, Some(Outbound::Frame(vec![9])));

        // The abandoned call still owns the session's engine slot
        assert_eq!(engine.active.load(Ordering::SeqCst), 1);
        assert!(session.worker_active());
    }

    #[tokio::test]
    async fn test_timeout_keeps_single_flight() {
        let session = styled_session();
        let (tx, mut rx) = mpsc::channel(4);
        let engine = Arc::new(SlowEcho::new(Duration::from_millis(200)));
        let mut dispatcher =
            Dispatcher::new(session.clone(), engine.clone(), tx, Some(Duration::from_millis(20)));

        assert!(dispatcher.submit(frame(1)).unwrap().spawn_worker);
        for seq in 1..=6u8 {
            assert_eq!(rx.recv().await, Some(Outbound::Frame(vec![seq])));
            if seq < 6 {
                // The worker is still waiting out the timed-out call
                let outcome = dispatcher.submit(frame(u64::from(seq) + 1)).unwrap();
                assert!(!outcome.spawn_worker);
            }
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while session.worker_active() {
            assert!(Instant::now() < deadline, "worker never went idle");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(engine.max_active.load(Ordering::SeqCst), 1, "transforms overlapped");
        assert_eq!(engine.active.load(Ordering::SeqCst), 0);
        let stats = session.stats().snapshot();
        assert_eq!(stats.fallbacks, 6);
        assert_eq!(stats.superseded, 0);
    }

    #[tokio::test]
    async fn test_single_flight_and_latest_wins() {
        let session = styled_session();
        let (tx, mut rx) = mpsc::channel(16);
        let engine = Arc::new(SlowEcho::new(Duration::from_millis(100)));
        let mut dispatcher = Dispatcher::new(session.clone(), engine.clone(), tx, None);

        let first = dispatcher.submit(frame(1)).unwrap();
        assert!(first.spawn_worker);

        // Let the worker pick up frame 1
        tokio::time::sleep(Duration::from_millis(30)).await;
        for seq in 2..=5 {
            assert!(!dispatcher.submit(frame(seq)).unwrap().spawn_worker);
        }

        assert_eq!(rx.recv().await, Some(Outbound::Frame(b"S\x01".to_vec())));
        assert_eq!(rx.recv().await, Some(Outbound::Frame(b"S\x05".to_vec())));

        // Give the worker a moment to go idle
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!session.worker_active());
        assert_eq!(engine.max_active.load(Ordering::SeqCst), 1);

        let stats = session.stats().snapshot();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.superseded, 3);
    }

    #[tokio::test]
    async fn test_shutdown_discards_late_result() {
        let session = styled_session();
        let (tx, mut rx) = mpsc::channel(4);
        let engine = Arc::new(SlowEcho::new(Duration::from_millis(100)));
        let mut dispatcher = Dispatcher::new(session.clone(), engine, tx, None);

        dispatcher.submit(frame(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher.shutdown();
        drop(dispatcher);

        // Worker aborted, sender dropped: nothing arrives
        assert_eq!(rx.recv().await, None);
        assert!(session.is_closed());
        assert!(!session.worker_active());
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let session = styled_session();
        let (tx, _rx) = mpsc::channel(4);
        let mut dispatcher = Dispatcher::new(session, Arc::new(Failing), tx, None);
        dispatcher.shutdown();
        assert_eq!(dispatcher.submit(frame(1)), Err(SessionClosed));
    }
}

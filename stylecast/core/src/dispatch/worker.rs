//! Per-session worker task
//!
//! Drains the session mailbox until it is empty, then exits. The engine call
//! runs on the blocking pool so the ingress loop keeps receiving while a frame
//! is being restyled.
//!
//! A timed-out transform cannot be cancelled. Its fallback frame is sent
//! straight away, but the worker waits for the abandoned call to return
//! before taking the next job, so a session never has two engine calls
//! running.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::FrameResult;
use crate::engine::{EngineError, StyleEngine, TransformRequest};
use crate::error::FallbackReason;
use crate::messages::Outbound;
use crate::session::{Job, Session, SessionStats};

type TransformTask = JoinHandle<Result<Vec<u8>, EngineError>>;

pub(super) struct WorkerContext {
    pub session: Arc<Session>,
    pub engine: Arc<dyn StyleEngine>,
    pub egress: mpsc::Sender<Outbound>,
    pub transform_timeout: Option<Duration>,
}

/// Clears the worker flag if the worker leaves without going idle
struct ActiveWorker<'a> {
    session: &'a Session,
    armed: bool,
}

impl<'a> ActiveWorker<'a> {
    fn new(session: &'a Session) -> Self {
        Self {
            session,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ActiveWorker<'_> {
    fn drop(&mut self) {
        if self.armed && self.session.release_worker() {
            // Picked up by the worker the next deposit starts
            warn!("Worker exited with a frame still pending");
        }
    }
}

pub(super) async fn run_worker(context: WorkerContext) {
    let mut guard = ActiveWorker::new(&context.session);
    trace!("Worker started");

    // next_job clears the flag itself when it returns None
    while let Some(job) = context.session.next_job() {
        let seq = job.frame.seq();
        let (result, abandoned) = process_job(&context, job).await;
        record(context.session.stats(), &result);

        if context.session.is_closed() {
            debug!(seq, "Session closed, discarding result");
            continue;
        }

        trace!(seq, kind = result.kind(), "Sending frame");
        if context
            .egress
            .send(Outbound::Frame(result.into_bytes()))
            .await
            .is_err()
        {
            debug!(seq, "Egress closed, stopping worker");
            context.session.close();
            continue;
        }

        if let Some(task) = abandoned {
            settle(seq, task).await;
        }
    }

    guard.disarm();
    trace!("Worker idle");
}

/// Run one job
///
/// On timeout the still-running engine call is handed back so the caller can
/// wait it out.
async fn process_job(context: &WorkerContext, job: Job) -> (FrameResult, Option<TransformTask>) {
    let Job { frame, control } = job;
    let seq = frame.seq();

    let Some(style) = control.style else {
        let result = FrameResult::Passthrough {
            bytes: Arc::clone(frame.data()),
        };
        return (result, None);
    };

    let request = TransformRequest::new(Arc::clone(frame.data()), style, control.model);
    let engine = Arc::clone(&context.engine);
    let started = tokio::time::Instant::now();
    let mut task = tokio::task::spawn_blocking(move || engine.transform(&request));

    let joined = match context.transform_timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                let result = fallback(seq, frame.data(), FallbackReason::Timeout(limit));
                return (result, Some(task));
            }
        },
        None => task.await,
    };

    let result = match joined {
        Ok(Ok(bytes)) => {
            debug!(
                seq,
                elapsed_ms = started.elapsed().as_millis() as u64,
                latency_ms = frame.arrived_at().elapsed().as_millis() as u64,
                "Frame styled"
            );
            FrameResult::Styled { bytes }
        }
        Ok(Err(e)) => fallback(seq, frame.data(), e.into()),
        Err(e) => fallback(seq, frame.data(), FallbackReason::Crashed(e.to_string())),
    };
    (result, None)
}

/// Wait for a timed-out engine call to return, discarding its output
async fn settle(seq: u64, task: TransformTask) {
    let started = tokio::time::Instant::now();
    let outcome = match task.await {
        Ok(Ok(_)) => "finished",
        Ok(Err(_)) => "failed",
        Err(_) => "crashed",
    };
    debug!(
        seq,
        outcome,
        waited_ms = started.elapsed().as_millis() as u64,
        "Abandoned transform returned"
    );
}

fn fallback(seq: u64, original: &Arc<[u8]>, reason: FallbackReason) -> FrameResult {
    warn!(seq, reason = reason.tag(), error = %reason, "Transform failed, sending original frame");
    FrameResult::Fallback {
        bytes: Arc::clone(original),
        reason,
    }
}

fn record(stats: &SessionStats, result: &FrameResult) {
    SessionStats::bump(&stats.processed);
    match result {
        FrameResult::Styled { .. } => SessionStats::bump(&stats.styled),
        FrameResult::Passthrough { .. } => SessionStats::bump(&stats.passthrough),
        FrameResult::Fallback { .. } => SessionStats::bump(&stats.fallbacks),
    }
}

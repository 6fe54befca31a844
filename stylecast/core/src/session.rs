//! Per-Connection Session State
//!
//! A [`Session`] exists for exactly one connection and dies with it. It owns
//! everything the ingress loop and the worker share:
//!
//! - the control state (active style image, active model)
//! - the latest-wins frame mailbox
//! - the worker-active flag
//!
//! # Synchronization
//!
//! All three live behind one `parking_lot::Mutex`. Every operation takes the
//! lock, does a few field updates, and releases it before returning; the lock
//! is never held across an `.await` or an engine call. Because the deposit
//! and the "is a worker running?" decision happen in the same critical
//! section, and so do "mailbox is empty" and "worker goes idle", a frame can
//! never be left in the mailbox with no worker to pick it up.
//!
//! ```text
//!   ingress                          worker
//!   ───────                          ──────
//!   lock                             lock
//!   mailbox <- frame                 job <- mailbox.take()
//!   if !worker_active:               if job is None:
//!       worker_active = true             worker_active = false
//!       => spawn worker              unlock
//!   unlock
//! ```
//!
//! Nothing here is shared between sessions.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::mailbox::Mailbox;
use crate::frame::Frame;
use crate::messages::ControlMessage;

/// Unique identifier for a client connection
///
/// Process-unique and stable for the lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new unique connection ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Immutable view of the control state
///
/// Cheap to clone: the style image is shared.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlSnapshot {
    /// Active style image, `None` means passthrough
    pub style: Option<Arc<[u8]>>,
    /// Active model label
    pub model: String,
    /// Incremented on every applied control message
    pub revision: u64,
}

impl ControlSnapshot {
    /// Whether frames processed under this snapshot pass through unchanged
    #[must_use]
    pub fn is_passthrough(&self) -> bool {
        self.style.is_none()
    }
}

/// A frame paired with the control state it is to be processed under
///
/// The control state is captured when the frame is deposited, not when the
/// worker takes it. A frame always sees every control message that arrived
/// before it and none that arrived after. The flip side: a `set_style` that
/// clears the style while a frame waits in the mailbox does not affect that
/// frame, which is still styled once.
#[derive(Clone, Debug)]
pub struct Job {
    /// The frame
    pub frame: Frame,
    /// Control state committed when the frame was deposited
    pub control: ControlSnapshot,
}

/// Result of depositing a frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DepositOutcome {
    /// The caller must start a worker; the flag is already set
    pub spawn_worker: bool,
    /// Sequence number of the frame that was overwritten, if any
    pub superseded: Option<u64>,
}

/// The session was torn down
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("session is closed")]
pub struct SessionClosed;

struct SessionState {
    style: Option<Arc<[u8]>>,
    model: String,
    revision: u64,
    mailbox: Mailbox<Job>,
    worker_active: bool,
    closed: bool,
}

impl SessionState {
    fn snapshot(&self) -> ControlSnapshot {
        ControlSnapshot {
            style: self.style.clone(),
            model: self.model.clone(),
            revision: self.revision,
        }
    }
}

/// Per-connection session
pub struct Session {
    id: ConnectionId,
    state: Mutex<SessionState>,
    stats: SessionStats,
}

impl Session {
    /// Create a session with no style and the given default model
    pub fn new(id: ConnectionId, default_model: impl Into<String>) -> Self {
        Self {
            id,
            state: Mutex::new(SessionState {
                style: None,
                model: default_model.into(),
                revision: 0,
                mailbox: Mailbox::new(),
                worker_active: false,
                closed: false,
            }),
            stats: SessionStats::default(),
        }
    }

    /// Connection this session belongs to
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Counters for this session
    #[must_use]
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    // =========================================================================
    // Control state
    // =========================================================================

    /// Apply a control message and return the new control state
    ///
    /// Frames already deposited keep the snapshot they were deposited with.
    pub fn apply_control(&self, message: ControlMessage) -> ControlSnapshot {
        let mut state = self.state.lock();
        match message {
            ControlMessage::SetStyle { style } => state.style = style.map(Arc::from),
            ControlMessage::SetModel { model } => state.model = model,
        }
        state.revision += 1;
        self.stats.control_updates.fetch_add(1, Ordering::Relaxed);
        state.snapshot()
    }

    /// Current control state
    #[must_use]
    pub fn control(&self) -> ControlSnapshot {
        self.state.lock().snapshot()
    }

    // =========================================================================
    // Mailbox and worker flag
    // =========================================================================

    /// Deposit an admitted frame
    ///
    /// Overwrites any frame still waiting. When no worker is running, marks
    /// one as running and tells the caller to spawn it.
    pub fn deposit(&self, frame: Frame) -> Result<DepositOutcome, SessionClosed> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SessionClosed);
        }

        let job = Job {
            frame,
            control: state.snapshot(),
        };
        let superseded = state.mailbox.put(job).map(|old| old.frame.seq());
        if superseded.is_some() {
            self.stats.superseded.fetch_add(1, Ordering::Relaxed);
        }

        let spawn_worker = !state.worker_active;
        state.worker_active = true;

        Ok(DepositOutcome {
            spawn_worker,
            superseded,
        })
    }

    /// Take the next job, or go idle when there is none
    ///
    /// Returning `None` clears the worker-active flag in the same critical
    /// section that observed the empty mailbox. A closed session always
    /// returns `None`.
    pub fn next_job(&self) -> Option<Job> {
        let mut state = self.state.lock();
        let job = if state.closed {
            None
        } else {
            state.mailbox.take()
        };
        if job.is_none() {
            state.worker_active = false;
        }
        job
    }

    /// Clear the worker flag after a worker exited without going idle
    ///
    /// Returns `true` if a frame is still waiting in the mailbox.
    pub(crate) fn release_worker(&self) -> bool {
        let mut state = self.state.lock();
        state.worker_active = false;
        !state.closed && !state.mailbox.is_empty()
    }

    /// Tear the session down
    ///
    /// Discards any waiting frame and refuses further deposits.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.mailbox.take();
    }

    /// Whether the session was torn down
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Whether a worker is marked as running
    #[must_use]
    pub fn worker_active(&self) -> bool {
        self.state.lock().worker_active
    }

    /// Whether a frame is waiting in the mailbox
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.state.lock().mailbox.is_empty()
    }

    /// Sequence number of the waiting frame, if any
    #[must_use]
    pub fn pending_seq(&self) -> Option<u64> {
        self.state.lock().mailbox.peek().map(|job| job.frame.seq())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("model", &state.model)
            .field("has_style", &state.style.is_some())
            .field("pending", &!state.mailbox.is_empty())
            .field("worker_active", &state.worker_active)
            .field("closed", &state.closed)
            .finish()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Lock-free counters for one session
#[derive(Debug, Default)]
pub struct SessionStats {
    pub(crate) received: AtomicU64,
    pub(crate) rate_dropped: AtomicU64,
    pub(crate) undecodable: AtomicU64,
    pub(crate) superseded: AtomicU64,
    pub(crate) processed: AtomicU64,
    pub(crate) styled: AtomicU64,
    pub(crate) passthrough: AtomicU64,
    pub(crate) fallbacks: AtomicU64,
    pub(crate) control_updates: AtomicU64,
    pub(crate) control_rejected: AtomicU64,
}

impl SessionStats {
    /// Copy the counters out
    #[must_use]
    pub fn snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            rate_dropped: self.rate_dropped.load(Ordering::Relaxed),
            undecodable: self.undecodable.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            styled: self.styled.load(Ordering::Relaxed),
            passthrough: self.passthrough.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            control_updates: self.control_updates.load(Ordering::Relaxed),
            control_rejected: self.control_rejected.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`SessionStats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatsSnapshot {
    /// Binary frames received
    pub received: u64,
    /// Frames dropped by the rate limiter
    pub rate_dropped: u64,
    /// Frames dropped because they were not recognisable images
    pub undecodable: u64,
    /// Frames overwritten in the mailbox before a worker took them
    pub superseded: u64,
    /// Frames the worker finished (styled, passthrough or fallback)
    pub processed: u64,
    /// Frames sent back styled
    pub styled: u64,
    /// Frames sent back unchanged because no style was active
    pub passthrough: u64,
    /// Frames sent back unchanged because the engine failed
    pub fallbacks: u64,
    /// Control messages applied
    pub control_updates: u64,
    /// Control messages rejected
    pub control_rejected: u64,
}

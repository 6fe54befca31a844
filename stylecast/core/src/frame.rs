//! Frame type
//!
//! A frame is the encoded image bytes of one admitted video frame plus its
//! arrival time. Bytes are reference counted so the worker can hand them to
//! the engine and still fall back to them if the engine fails.

use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;

/// One admitted video frame
#[derive(Clone)]
pub struct Frame {
    seq: u64,
    data: Arc<[u8]>,
    arrived_at: Instant,
}

impl Frame {
    /// Create a frame
    ///
    /// `seq` is the per-session admission number, used for logging and tests.
    pub fn new(seq: u64, data: impl Into<Arc<[u8]>>, arrived_at: Instant) -> Self {
        Self {
            seq,
            data: data.into(),
            arrived_at,
        }
    }

    /// Admission sequence number
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Encoded bytes
    #[must_use]
    pub fn data(&self) -> &Arc<[u8]> {
        &self.data
    }

    /// When the frame arrived at ingress
    #[must_use]
    pub fn arrived_at(&self) -> Instant {
        self.arrived_at
    }

    /// Size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the frame carries no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("seq", &self.seq)
            .field("len", &self.data.len())
            .finish_non_exhaustive()
    }
}

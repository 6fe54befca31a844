//! Ingress Frame Rate Limiting
//!
//! Caps how many frames per second a session admits, independently of how
//! fast the client sends them. Frames over the cap are dropped on the spot;
//! nothing is delayed or queued.
//!
//! # Design
//!
//! The limiter keeps a single timestamp, the last admission. A frame arriving
//! at `now` is admitted when `now - last_admitted >= 1 / max_fps`, and the
//! timestamp moves to `now`. The first frame of a session is always admitted.
//!
//! The limiter is owned by the connection's ingress loop, so it needs no
//! synchronization.
//!
//! # Usage
//!
//! ```
//! use stylecast_core::rate_limit::{FrameRateConfig, FrameRateLimiter, RateLimitResult};
//! use tokio::time::{Duration, Instant};
//!
//! let mut limiter = FrameRateLimiter::new(&FrameRateConfig::new().with_max_fps(2.0));
//! let start = Instant::now();
//!
//! assert_eq!(limiter.admit(start), RateLimitResult::Admitted);
//! assert_eq!(
//!     limiter.admit(start + Duration::from_millis(100)),
//!     RateLimitResult::Dropped { retry_after: Duration::from_millis(400) }
//! );
//! assert_eq!(limiter.admit(start + Duration::from_millis(600)), RateLimitResult::Admitted);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for ingress frame rate limiting
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameRateConfig {
    /// Ceiling on admitted frames per second (0 = unlimited)
    pub max_fps: f64,

    /// Whether rate limiting is enabled (can be disabled for testing)
    pub enabled: bool,
}

impl Default for FrameRateConfig {
    fn default() -> Self {
        Self {
            max_fps: 15.0,
            enabled: true,
        }
    }
}

impl FrameRateConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the frames-per-second ceiling
    #[must_use]
    pub fn with_max_fps(mut self, max_fps: f64) -> Self {
        self.max_fps = max_fps;
        self
    }

    /// Enable or disable rate limiting
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Create a disabled configuration (for testing)
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Minimum spacing between admitted frames
    ///
    /// `None` when limiting is disabled or the cap is zero, negative or not
    /// finite. A cap so small that its interval does not fit a `Duration`
    /// saturates, so only the first frame is ever admitted.
    #[must_use]
    pub fn min_interval(&self) -> Option<Duration> {
        if !self.enabled || !self.max_fps.is_finite() || self.max_fps <= 0.0 {
            return None;
        }
        Some(Duration::try_from_secs_f64(self.max_fps.recip()).unwrap_or(Duration::MAX))
    }
}

// =============================================================================
// Result
// =============================================================================

/// Result of a rate limit check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitResult {
    /// The frame may proceed
    Admitted,

    /// The frame is dropped
    Dropped {
        /// Time until the next frame would be admitted
        retry_after: Duration,
    },
}

// =============================================================================
// Per-Session Limiter
// =============================================================================

/// Minimum-interval limiter for one session
#[derive(Debug)]
pub struct FrameRateLimiter {
    min_interval: Option<Duration>,
    last_admitted_at: Option<Instant>,
}

impl FrameRateLimiter {
    /// Create a new limiter
    #[must_use]
    pub fn new(config: &FrameRateConfig) -> Self {
        Self {
            min_interval: config.min_interval(),
            last_admitted_at: None,
        }
    }

    /// Decide whether a frame arriving at `now` is admitted
    ///
    /// Deterministic: only `now` and the last admission time are consulted.
    /// Dropped frames do not move the window.
    pub fn admit(&mut self, now: Instant) -> RateLimitResult {
        if let (Some(interval), Some(last)) = (self.min_interval, self.last_admitted_at) {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < interval {
                return RateLimitResult::Dropped {
                    retry_after: interval - elapsed,
                };
            }
        }
        self.last_admitted_at = Some(now);
        RateLimitResult::Admitted
    }
}

// =============================================================================
// Tests
// =============================================================================

//! Metrics collection using metrics-rs.

use metrics::{counter, Counter, Unit};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const FRAMES_SUBMITTED: &str = "hwvideo_frames_submitted";
const PACKETS_PRODUCED: &str = "hwvideo_packets_produced";
const BUSY_RETRIES: &str = "hwvideo_busy_retries";
const STALLS: &str = "hwvideo_stalls";
const POOL_EXHAUSTED: &str = "hwvideo_pool_exhausted";
const RECONFIGURES: &str = "hwvideo_reconfigures";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return; // Already initialized
    }

    metrics::describe_counter!(
        FRAMES_SUBMITTED,
        Unit::Count,
        "Total frames submitted to codec components"
    );
    metrics::describe_counter!(
        PACKETS_PRODUCED,
        Unit::Count,
        "Total encoded packets or decoded frames delivered to callbacks"
    );
    metrics::describe_counter!(
        BUSY_RETRIES,
        Unit::Count,
        "Busy responses absorbed by the retry loop"
    );
    metrics::describe_counter!(STALLS, Unit::Count, "Submissions abandoned at the retry ceiling");
    metrics::describe_counter!(
        POOL_EXHAUSTED,
        Unit::Count,
        "Surface acquisitions rejected with no free slot"
    );
    metrics::describe_counter!(
        RECONFIGURES,
        Unit::Count,
        "Mid-stream parameter changes applied"
    );
}

/// Record a frame handed to a component.
#[inline]
pub fn record_frame_submitted(direction: &'static str) {
    counter!(FRAMES_SUBMITTED, "direction" => direction).increment(1);
}

/// Record an artifact delivered to a callback.
#[inline]
pub fn record_packet_produced(direction: &'static str) {
    counter!(PACKETS_PRODUCED, "direction" => direction).increment(1);
}

/// Record one busy retry iteration.
#[inline]
pub fn record_busy_retry() {
    counter!(BUSY_RETRIES).increment(1);
}

/// Record a stall (retry ceiling reached).
#[inline]
pub fn record_stall() {
    counter!(STALLS).increment(1);
}

/// Record a failed surface acquisition.
#[inline]
pub fn record_pool_exhausted() {
    counter!(POOL_EXHAUSTED).increment(1);
}

/// Record an applied reconfiguration.
#[inline]
pub fn record_reconfigure(property: &'static str) {
    counter!(RECONFIGURES, "property" => property).increment(1);
}

/// Per-session metric handles with pre-bound labels.
#[derive(Clone)]
pub struct SessionMetrics {
    frames_in: Counter,
    artifacts_out: Counter,
}

// Counter handles carry no introspectable state.
impl std::fmt::Debug for SessionMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMetrics").finish_non_exhaustive()
    }
}

impl SessionMetrics {
    /// Create handles for one session.
    pub fn new(direction: &'static str) -> Self {
        Self {
            frames_in: counter!(FRAMES_SUBMITTED, "direction" => direction),
            artifacts_out: counter!(PACKETS_PRODUCED, "direction" => direction),
        }
    }

    /// Record a submitted frame.
    #[inline]
    pub fn record_in(&self) {
        self.frames_in.increment(1);
    }

    /// Record a delivered artifact.
    #[inline]
    pub fn record_out(&self) {
        self.artifacts_out.increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_metrics();
        init_metrics();
    }

    #[test]
    fn recording_without_recorder_does_not_panic() {
        record_frame_submitted("encode");
        record_packet_produced("decode");
        record_busy_retry();
        record_stall();
        record_pool_exhausted();
        record_reconfigure("bitrate");

        let m = SessionMetrics::new("encode");
        m.record_in();
        m.record_out();
    }

    #[test]
    fn session_metrics_debug_is_opaque() {
        let m = SessionMetrics::new("encode");
        assert_eq!(format!("{m:?}"), "SessionMetrics { .. }");
    }
}

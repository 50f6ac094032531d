//! Metrics and tracing support.

mod metrics;

pub use metrics::{
    init_metrics, record_busy_retry, record_frame_submitted, record_packet_produced,
    record_pool_exhausted, record_reconfigure, record_stall, SessionMetrics,
};

use tracing::Level;

/// Log a session state transition.
#[inline]
pub fn trace_state_change(session: &str, from: &str, to: &str) {
    tracing::debug!(
        session = %session,
        from = %from,
        to = %to,
        "session state changed"
    );
}

/// Log a per-frame error that did not kill the session.
#[inline]
pub fn trace_frame_error(session: &str, error: &dyn std::error::Error) {
    tracing::warn!(
        session = %session,
        error = %error,
        "frame error"
    );
}

/// Create a span for one session's lifetime.
#[inline]
pub fn span_session(direction: &str, codec: &str) -> tracing::Span {
    tracing::span!(Level::INFO, "codec_session", direction = %direction, codec = %codec)
}

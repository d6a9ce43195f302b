//! Process-wide ingestion counters.
//!
//! Non-fatal anomalies (missing SDP attributes, out-of-order sequence
//! numbers, unknown NAL types) are only visible through these counters
//! and the log; there is no caller to report them to once a push
//! connection is accepted.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($name:ident),* $(,)?) => {
        /// Atomic counters shared by every connection.
        #[derive(Debug, Default)]
        pub struct Metrics {
            $(pub $name: AtomicU64,)*
        }

        /// Point-in-time copy of [`Metrics`].
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct MetricsSnapshot {
            $(pub $name: u64,)*
        }

        impl Metrics {
            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters!(
    connections_accepted,
    connections_rejected,
    framing_errors,
    auth_failures,
    tokens_expired,
    tokens_from_future,
    sessions_started,
    sessions_completed,
    missing_resolution,
    missing_framerate,
    missing_bandwidth,
    out_of_order,
    unknown_nal,
    forbidden_bit,
    rtcp_dropped,
    non_video_dropped,
    idle_timeouts,
);

/// Increment a counter by one.
pub fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

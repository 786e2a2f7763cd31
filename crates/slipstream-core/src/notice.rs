//! Structured notice sink.
//!
//! The engine reports operational events (corruption recoveries, record
//! updates, available-region reports) through this interface rather than
//! logging directly, so the embedding application owns delivery. The
//! kind set is closed on purpose: collaborators match on methods, not on
//! message text.

use tracing::{info, warn};

/// Receiver for engine notices. Implementations must be cheap and
/// non-blocking; the engine may emit notices while holding a write
/// transaction.
pub trait NoticeSink: Send + Sync {
    /// An unexpected but survivable condition (corruption skipped, retry
    /// in progress, shutdown cleanup failure).
    fn alert(&self, message: &str);

    /// Informational progress (record updated, target entry in use).
    fn info(&self, message: &str);

    /// The set of egress regions for which connection candidates exist.
    fn available_egress_regions(&self, regions: &[String]);
}

/// Notice sink that forwards to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNoticeSink;

impl NoticeSink for TracingNoticeSink {
    fn alert(&self, message: &str) {
        warn!(target: "slipstream::notice", "{message}");
    }

    fn info(&self, message: &str) {
        info!(target: "slipstream::notice", "{message}");
    }

    fn available_egress_regions(&self, regions: &[String]) {
        info!(target: "slipstream::notice", ?regions, "available egress regions");
    }
}

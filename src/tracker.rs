//! Per-attempt connect tracking and external health truth (spec §6).

use std::time::Instant;

use crate::error::ConnectErrorKind;

/// Observes per-connection-attempt latency and outcome. Implemented by the
/// instrumented factory's caller-supplied collaborator (often the same
/// object as a [`HealthIndicator`]).
pub trait ConnectTracker: Send + Sync {
    /// Record the start of a connect attempt, returning a timestamp to pass
    /// back into [`on_connect_success`](ConnectTracker::on_connect_success)
    /// or [`on_connect_error`](ConnectTracker::on_connect_error).
    fn before_connect_start(&self) -> Instant {
        Instant::now()
    }

    /// The attempt that started at `start` completed successfully.
    fn on_connect_success(&self, _start: Instant) {}

    /// The attempt that started at `start` failed, classified as `kind`.
    fn on_connect_error(&self, _start: Instant, _kind: ConnectErrorKind) {}
}

/// Marker trait for per-request observations published alongside a
/// [`ConnectTracker`]. Kept distinct from `ConnectTracker` per spec §6's
/// naming, even though today it carries no additional methods beyond what
/// `ConnectTracker` already provides.
pub trait RequestTracker: ConnectTracker {}

impl<T: ConnectTracker> RequestTracker for T {}

/// External source of health truth, used as a secondary gate in
/// [`crate::host::Host::is_healthy`]. A `HealthIndicator` is stashed in the
/// request [`crate::context::Context`] under its own type for the duration
/// of a connect attempt (spec §6, "well-known context key").
pub trait HealthIndicator: RequestTracker {
    /// Whether the external source currently considers the host healthy.
    fn is_healthy(&self) -> bool;

    /// A relative score used by the outer balancer; higher is better.
    fn score(&self) -> i64;

    /// Release any resources the indicator holds (e.g. a subscription).
    fn cancel(&self);

    /// Borrow this indicator as a plain [`ConnectTracker`], for passing to
    /// the instrumented factory. `dyn HealthIndicator` cannot coerce to
    /// `dyn ConnectTracker` directly (no trait upcasting on this edition),
    /// so each implementer gets this default forwarding method instead.
    fn as_connect_tracker(&self) -> &dyn ConnectTracker {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

    struct FakeIndicator {
        healthy: AtomicBool,
        score: AtomicI64,
        cancelled: AtomicBool,
    }

    impl ConnectTracker for FakeIndicator {
        fn on_connect_success(&self, _start: Instant) {
            self.healthy.store(true, Ordering::SeqCst);
        }
        fn on_connect_error(&self, _start: Instant, _kind: ConnectErrorKind) {
            self.healthy.store(false, Ordering::SeqCst);
        }
    }

    impl HealthIndicator for FakeIndicator {
        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
        fn score(&self) -> i64 {
            self.score.load(Ordering::SeqCst)
        }
        fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn tracker_methods_update_health_indicator() {
        let indicator = FakeIndicator {
            healthy: AtomicBool::new(true),
            score: AtomicI64::new(5),
            cancelled: AtomicBool::new(false),
        };

        let start = indicator.before_connect_start();
        indicator.on_connect_error(start, ConnectErrorKind::ConnectError);
        assert!(!indicator.is_healthy());

        indicator.on_connect_success(start);
        assert!(indicator.is_healthy());
        assert_eq!(indicator.score(), 5);

        indicator.cancel();
        assert!(indicator.cancelled.load(Ordering::SeqCst));
    }
}

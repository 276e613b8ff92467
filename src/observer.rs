//! Host-level lifecycle observer, used for metrics (spec §6).
//!
//! All methods have no-op default bodies so implementers only override the
//! events they care about, the same way `bal`'s `HostObserver`-shaped
//! collaborators (e.g. `ProtectionMode`'s snapshot consumers) are optional
//! to wire up.

use std::panic::{self, AssertUnwindSafe};

use crate::error::ConnectError;

/// Observes host-level lifecycle transitions. The core never lets an
/// observer panic propagate (spec §7: "the core never throws from observer
/// callbacks") — see [`notify`].
pub trait HostObserver: Send + Sync {
    /// The host crossed the consecutive-failure threshold and entered
    /// `Unhealthy`.
    fn on_host_marked_unhealthy(&self, _cause: &ConnectError) {}

    /// The host left `Unhealthy` and returned to `Active`.
    fn on_host_revived(&self) {}

    /// The host was marked `Expired` by service discovery. `connections` is
    /// the pool size observed at the moment of the transition.
    fn on_host_marked_expired(&self, _connections: usize) {}

    /// An `Expired` host was marked active again by service discovery.
    fn on_expired_host_revived(&self, _connections: usize) {}

    /// An `Expired` host's last connection closed and it transitioned to
    /// `Closed`.
    fn on_expired_host_removed(&self, _connections: usize) {}

    /// An `Active`/`Unhealthy` host was force-closed via `closeAsync`.
    fn on_active_host_removed(&self, _connections: usize) {}
}

/// An observer that ignores every event. Useful as a default when the
/// caller has no metrics backend wired up yet.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl HostObserver for NoopObserver {}

/// Invoke an observer callback, catching and logging any panic so a
/// misbehaving observer cannot corrupt an unrelated caller's call stack.
pub(crate) fn notify<F: FnOnce()>(event: &str, f: F) {
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    if let Err(payload) = result {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic payload>".to_string());
        log::warn!("host observer panicked while handling {event}: {msg}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingObserver {
        revived: AtomicUsize,
    }

    impl HostObserver for CountingObserver {
        fn on_host_revived(&self) {
            self.revived.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn default_methods_are_no_ops() {
        let observer = NoopObserver;
        observer.on_host_marked_unhealthy(&ConnectError::Timeout);
        observer.on_host_revived();
        observer.on_host_marked_expired(0);
        observer.on_expired_host_revived(0);
        observer.on_expired_host_removed(0);
        observer.on_active_host_removed(0);
    }

    #[test]
    fn overridden_method_fires() {
        let observer = CountingObserver { revived: AtomicUsize::new(0) };
        observer.on_host_revived();
        assert_eq!(observer.revived.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn notify_swallows_panics() {
        notify("test-event", || panic!("boom"));
        // Reaching here means the panic did not propagate.
    }
}

//! The in-flight health check handle and its background retry loop
//! (spec §4.4).
//!
//! A [`HealthCheck`] is created optimistically by `Host` before a CAS
//! attempt that would enter `Unhealthy`; if the CAS loses the race, the
//! caller cancels the handle and the spawned task exits on its next poll.
//! `HealthCheck` itself only tracks identity (`generation`), cancellation,
//! and the last failure cause for diagnostics — it has no idea how to
//! reach the host it's attached to. `Host` supplies that via the `attempt`
//! closure passed to [`spawn_retry_loop`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ConnectError;

/// A single in-flight health check for a host that has crossed the
/// consecutive-failure threshold. Two handles are never equal by value —
/// identity is `generation`, assigned by the owning `Host` so that a
/// success reported by a stale (already-cancelled) check can be told apart
/// from the current one (spec §4.4, "markHealthy only if still current").
pub struct HealthCheck {
    generation: u64,
    cancel: CancellationToken,
    last_cause: Mutex<Option<ConnectError>>,
}

impl HealthCheck {
    /// Build a handle identified by `generation`. Callers are expected to
    /// hand out generations from a single monotonic counter per host.
    pub fn new(generation: u64) -> Self {
        HealthCheck {
            generation,
            cancel: CancellationToken::new(),
            last_cause: Mutex::new(None),
        }
    }

    /// The generation this handle was created with.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Signal the background task to stop retrying. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The most recent connect failure observed by the retry loop, for
    /// diagnostics (e.g. surfaced on a snapshot).
    pub fn last_failure_cause(&self) -> Option<ConnectError> {
        self.last_cause.lock().expect("health check lock poisoned").clone()
    }

    fn record_failure(&self, cause: ConnectError) {
        *self.last_cause.lock().expect("health check lock poisoned") = Some(cause);
    }
}

/// What the retry loop decided after its attempt closure settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// A retry attempt succeeded; the caller should demote to `Active` if
    /// this handle is still the current one.
    Success,
    /// The attempt returned an error outside the normal connect-failure
    /// taxonomy (or some other unexpected scheduler condition). Per spec
    /// §4.4 this is treated as a safety fallback: the caller should force
    /// the host back to `Active` rather than retry forever against a
    /// condition retrying cannot fix.
    FatalError,
}

fn is_ordinary_connect_failure(err: &ConnectError) -> bool {
    matches!(
        err,
        ConnectError::Connect(_) | ConnectError::Timeout | ConnectError::Rejected { .. }
    )
}

/// `interval ± jitter`, per spec: a random duration uniformly distributed
/// around `interval`, never negative.
fn jittered(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    let jitter_secs = jitter.as_secs_f64();
    let offset: f64 = rand::thread_rng().gen_range(-jitter_secs..=jitter_secs);
    let total = interval.as_secs_f64() + offset;
    Duration::from_secs_f64(total.max(0.0))
}

/// Spawn the background retry loop for `health_check`.
///
/// Each iteration: sleep `interval ± jitter` (checked against cancellation
/// first so a cancel during the sleep exits promptly), then call
/// `attempt` — which is expected to build a fresh
/// [`crate::context::Context`] per call, since stray values from a prior
/// failed attempt must not leak into the next one. A successful attempt
/// reports [`RetryOutcome::Success`] and stops; an ordinary connect
/// failure records the cause and re-enters the sleep; anything else
/// reports [`RetryOutcome::FatalError`] and stops (spec §4.4 step 5: an
/// unexpected scheduler error force-transitions the host back to `Active`
/// rather than retrying forever).
pub(crate) fn spawn_retry_loop(
    health_check: std::sync::Arc<HealthCheck>,
    interval: Duration,
    jitter: Duration,
    attempt: impl Fn() -> Pin<Box<dyn Future<Output = Result<(), ConnectError>> + Send>> + Send + Sync + 'static,
    on_outcome: impl Fn(RetryOutcome) + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cancel = health_check.cancellation_token();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(jittered(interval, jitter)) => {}
            }

            match attempt().await {
                Ok(()) => {
                    on_outcome(RetryOutcome::Success);
                    return;
                }
                Err(err) if is_ordinary_connect_failure(&err) => {
                    log::debug!("health check retry failed: {err}");
                    health_check.record_failure(err);
                }
                Err(err) => {
                    log::warn!("health check retry hit an unexpected error, forcing host active: {err}");
                    health_check.record_failure(err);
                    on_outcome(RetryOutcome::FatalError);
                    return;
                }
            }
        }
    })
}

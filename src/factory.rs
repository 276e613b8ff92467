//! External connection factory and the instrumentation wrapper around it
//! (spec §4.6, §6).

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::ConnectError;
use crate::tracker::ConnectTracker;

/// Capability supplied by the transport layer: opens one connection to
/// `addr`. Out of scope for this crate beyond this interface (spec §1).
#[async_trait]
pub trait ConnectionFactory<Addr, C>: Send + Sync
where
    Addr: Send + Sync,
    C: Send + Sync,
{
    /// Open a new connection to `addr`. `context` is mutable so the factory
    /// (or filters it delegates to) can stash per-attempt values.
    async fn new_connection(&self, addr: &Addr, context: &mut Context) -> Result<C, ConnectError>;
}

/// Wraps an external [`ConnectionFactory`], reporting connect-start /
/// success / failure / cancel to a [`ConnectTracker`] without ever
/// swallowing the underlying signal (spec §4.6).
pub struct InstrumentedFactory<Addr, C> {
    inner: Arc<dyn ConnectionFactory<Addr, C>>,
}

impl<Addr, C> InstrumentedFactory<Addr, C>
where
    Addr: Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    /// Wrap `inner` so every call to [`connect`](Self::connect) is reported
    /// to `tracker`.
    pub fn new(inner: Arc<dyn ConnectionFactory<Addr, C>>) -> Self {
        Self { inner }
    }

    /// Open a connection, racing the factory future against `cancel` and
    /// reporting the outcome to `tracker`.
    ///
    /// Classification (spec §4.6):
    /// - completes successfully -> `on_connect_success`
    /// - `cancel` fires first -> `Cancelled`, reported as `Cancelled`
    /// - factory returns `Timeout` -> reported as `ConnectTimeout`
    /// - any other factory error -> reported as `ConnectError`
    pub async fn connect(
        &self,
        addr: &Addr,
        context: &mut Context,
        tracker: Option<&(dyn ConnectTracker)>,
        cancel: &CancellationToken,
    ) -> Result<C, ConnectError> {
        let start = tracker
            .map(|t| t.before_connect_start())
            .unwrap_or_else(Instant::now);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if let Some(tracker) = tracker {
                    tracker.on_connect_error(start, crate::error::ConnectErrorKind::Cancelled);
                }
                Err(ConnectError::Cancelled)
            }
            result = self.inner.new_connection(addr, context) => {
                match &result {
                    Ok(_) => {
                        if let Some(tracker) = tracker {
                            tracker.on_connect_success(start);
                        }
                    }
                    Err(err) => {
                        if let (Some(tracker), Some(kind)) = (tracker, err.tracker_kind()) {
                            tracker.on_connect_error(start, kind);
                        }
                    }
                }
                result
            }
        }
    }
}

//! Capability a connection handle must provide so `Host` can reserve,
//! drain, and reap it without knowing anything about the transport
//! underneath (spec §4.2 step 4, §4.3, §4.5).

use async_trait::async_trait;

/// A connection failed to close cleanly. The shutdown orchestrator collects
/// these across a whole drain rather than letting one failure stop the rest
/// (spec §4.5 step 4).
#[derive(Debug, Clone, thiserror::Error)]
#[error("connection close failed: {0}")]
pub struct CloseError(pub String);

/// What `Host` needs from a live connection handle `C`. The transport layer
/// supplies the concrete type; the core only ever holds it by value behind
/// `Clone + PartialEq` for pool membership tests.
#[async_trait]
pub trait ConnectionHandle: Clone + PartialEq + Send + Sync + 'static {
    /// Attempt to reserve this connection for exclusive forced use (spec
    /// §4.2 step 4, `forceNewAndReserve`). Default accepts — most
    /// connections have no concept of exclusive reservation.
    fn try_reserve(&self) -> bool {
        true
    }

    /// Force-close immediately, dropping any in-flight work.
    async fn close(&self) -> Result<(), CloseError>;

    /// Close, letting in-flight work drain first. Defaults to an immediate
    /// close for handles with no graceful-drain concept of their own.
    async fn close_gracefully(&self) -> Result<(), CloseError> {
        self.close().await
    }

    /// Resolves when this connection has terminated on its own — peer
    /// closed, I/O error, whatever the transport calls "done" — independent
    /// of an explicit `close`/`close_gracefully` call. `Host` awaits this
    /// per tracked connection to schedule pool removal (spec §4.3, "Subscribe
    /// to connection.onClose").
    async fn closed(&self);
}

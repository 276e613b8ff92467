//! Error taxonomy surfaced outside the host core.
//!
//! The core wraps only its own rejections; factory errors are propagated
//! verbatim (see `Host::new_connection`).

use std::fmt;

/// Errors that can escape [`crate::host::Host`] public operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    /// Generic factory failure. Counted toward the failure threshold.
    #[error("connect error: {0}")]
    Connect(String),

    /// The factory signalled a connect timeout. Counted toward the threshold.
    #[error("connect timed out")]
    Timeout,

    /// The caller cancelled the attempt before the factory completed. Not
    /// counted toward the failure threshold.
    #[error("connect cancelled")]
    Cancelled,

    /// A per-connection cap was hit. Not a host-level problem, so it is not
    /// counted toward the failure threshold.
    #[error("connection limit reached")]
    LimitReached,

    /// Post-creation gating rejected the new connection.
    #[error("connection rejected ({origin})")]
    Rejected {
        /// Which gate rejected the connection.
        origin: RejectOrigin,
    },

    /// The host has already transitioned to `Closed`.
    #[error("host is closed")]
    HostClosed,
}

/// Where a [`ConnectError::Rejected`] originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectOrigin {
    /// `tryReserve()` on the freshly created connection failed.
    Reserve,
    /// The caller's selector predicate rejected the connection.
    Selector,
    /// The pool-add CAS loop rejected the connection (host closed/draining).
    Add,
}

impl fmt::Display for RejectOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectOrigin::Reserve => "reserve",
            RejectOrigin::Selector => "selector",
            RejectOrigin::Add => "add",
        };
        f.write_str(s)
    }
}

/// Coarse classification used by [`crate::tracker::ConnectTracker`]. Distinct
/// from [`ConnectError`] because a tracker only needs the outcome class, not
/// the full error (cancellation/limit-reached are not host failures, so they
/// are not classified here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    /// Generic connect failure.
    ConnectError,
    /// Connect timed out.
    ConnectTimeout,
    /// Cancelled before the factory completed.
    Cancelled,
}

impl ConnectError {
    /// Classify this error for [`crate::tracker::ConnectTracker::on_connect_error`].
    /// Returns `None` for errors that are not connect-attempt outcomes
    /// (`Rejected`, `HostClosed`, `LimitReached`) — those never reach the
    /// factory-tracking path.
    pub fn tracker_kind(&self) -> Option<ConnectErrorKind> {
        match self {
            ConnectError::Connect(_) => Some(ConnectErrorKind::ConnectError),
            ConnectError::Timeout => Some(ConnectErrorKind::ConnectTimeout),
            ConnectError::Cancelled => Some(ConnectErrorKind::Cancelled),
            ConnectError::LimitReached | ConnectError::Rejected { .. } | ConnectError::HostClosed => None,
        }
    }

    /// Whether this outcome counts toward the host's consecutive-failure
    /// counter. `Cancelled` and `LimitReached` are explicitly excluded by
    /// policy (spec §7).
    pub fn counts_as_host_failure(&self) -> bool {
        matches!(self, ConnectError::Connect(_) | ConnectError::Timeout)
    }
}

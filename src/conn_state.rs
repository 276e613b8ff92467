//! The immutable `ConnState` snapshot and its pure transition helpers
//! (spec §3, §4.1).
//!
//! `ConnState` never mutates in place — every transition returns a new
//! value. `Host` is the only place that decides which transition applies
//! and publishes the result via a CAS loop; this module only knows how to
//! compute the next value, never how to install it.

use std::sync::Arc;

use crate::health_check::HealthCheck;

/// The four lifecycle states a [`crate::host::Host`] can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Reachable from selection; accepting new connections.
    Active,
    /// Consecutive failures crossed the threshold; a health check is
    /// retrying in the background.
    Unhealthy,
    /// Service discovery no longer resolves this address; draining.
    Expired,
    /// Terminal. No further field may change (invariant I3).
    Closed,
}

/// Immutable composite value representing a host's full observable state at
/// one instant (spec §3). Cheap to clone: connections are `Clone` handles
/// (e.g. `Arc`-backed), and a transition allocates at most one new `Vec`.
#[derive(Clone)]
pub struct ConnState<C> {
    connections: Vec<C>,
    state: LifecycleState,
    failed_connections: u32,
    health_check: Option<Arc<HealthCheck>>,
}

impl<C> ConnState<C> {
    /// Initial state: `Active`, empty pool, zero failures (spec §3).
    pub fn initial() -> Self {
        ConnState {
            connections: Vec::new(),
            state: LifecycleState::Active,
            failed_connections: 0,
            health_check: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// The live connection pool. Order is only lightly significant.
    pub fn connections(&self) -> &[C] {
        &self.connections
    }

    /// Consecutive failed connection attempts since the last success.
    pub fn failed_connections(&self) -> u32 {
        self.failed_connections
    }

    /// The in-flight health check, present iff `state() == Unhealthy`
    /// (invariant I2).
    pub fn health_check(&self) -> Option<&Arc<HealthCheck>> {
        self.health_check.as_ref()
    }
}

impl<C: Clone + PartialEq> ConnState<C> {
    /// `ACTIVE --connect failure--> ACTIVE | UNHEALTHY`.
    ///
    /// Only valid to call while `self.state() == Active`. `fresh_health_check`
    /// is used only if the new failure count crosses `threshold`; callers
    /// should only pay for constructing one (and spawning its retry task)
    /// when they already know from the current failure count that this call
    /// will promote, and pass `None` otherwise. Passing `None` while the
    /// count crosses `threshold` is a caller bug — panics rather than
    /// silently dropping into `Active` with no health check (which would
    /// violate invariant I2).
    pub fn to_next_failed_connection(&self, threshold: u32, fresh_health_check: Option<Arc<HealthCheck>>) -> ConnState<C> {
        let next = self.failed_connections.saturating_add(1);
        if next >= threshold {
            let health_check = fresh_health_check
                .expect("fresh_health_check must be supplied when the failure count crosses threshold");
            ConnState {
                connections: self.connections.clone(),
                state: LifecycleState::Unhealthy,
                failed_connections: next,
                health_check: Some(health_check),
            }
        } else {
            ConnState {
                connections: self.connections.clone(),
                state: LifecycleState::Active,
                failed_connections: next,
                health_check: None,
            }
        }
    }

    /// `UNHEALTHY -> ACTIVE` (health check success, or a connection added
    /// during the race) and `EXPIRED -> ACTIVE` (service discovery revival).
    /// Resets the failure counter and drops any health check — the caller
    /// must cancel a displaced one.
    pub fn to_active_no_failures(&self) -> ConnState<C> {
        ConnState {
            connections: self.connections.clone(),
            state: LifecycleState::Active,
            failed_connections: 0,
            health_check: None,
        }
    }

    /// `ACTIVE|UNHEALTHY -> EXPIRED`. Preserves the connection list and
    /// failure count; drops the health check (caller cancels it).
    pub fn to_expired(&self) -> ConnState<C> {
        ConnState {
            connections: self.connections.clone(),
            state: LifecycleState::Expired,
            failed_connections: self.failed_connections,
            health_check: None,
        }
    }

    /// Any non-`Closed` state `-> CLOSED`. Preserves the connection list so
    /// the shutdown orchestrator can still see what to drain (spec §4.5).
    pub fn to_closed(&self) -> ConnState<C> {
        ConnState {
            connections: self.connections.clone(),
            state: LifecycleState::Closed,
            failed_connections: self.failed_connections,
            health_check: None,
        }
    }

    /// Insert `conn` at `index` (clamped to the current length), promoting
    /// to `Active` with failures reset. Returns `None` if `conn` is already
    /// present (duplicate insert is a caller-visible no-op, not an error).
    pub fn add_new_connection(&self, conn: C, index: usize) -> Option<ConnState<C>> {
        if self.connections.iter().any(|c| *c == conn) {
            return None;
        }
        let mut connections = self.connections.clone();
        let index = index.min(connections.len());
        connections.insert(index, conn);
        Some(ConnState {
            connections,
            state: LifecycleState::Active,
            failed_connections: 0,
            health_check: None,
        })
    }

    /// Remove `conn`, preserving the relative order of the rest and leaving
    /// `state`/`failed_connections`/`health_check` untouched. Returns `None`
    /// if `conn` was absent.
    pub fn remove_connection(&self, conn: &C) -> Option<ConnState<C>> {
        let pos = self.connections.iter().position(|c| c == conn)?;
        let mut connections = self.connections.clone();
        connections.remove(pos);
        Some(ConnState {
            connections,
            state: self.state,
            failed_connections: self.failed_connections,
            health_check: self.health_check.clone(),
        })
    }
}

impl<C> Default for ConnState<C> {
    fn default() -> Self {
        Self::initial()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health_check::HealthCheck;

    fn hc() -> Arc<HealthCheck> {
        Arc::new(HealthCheck::new(0))
    }

    #[test]
    fn initial_state_is_active_and_empty() {
        let state: ConnState<u32> = ConnState::initial();
        assert_eq!(state.state(), LifecycleState::Active);
        assert!(state.connections().is_empty());
        assert_eq!(state.failed_connections(), 0);
        assert!(state.health_check().is_none());
    }

    #[test]
    fn failure_below_threshold_stays_active() {
        let state: ConnState<u32> = ConnState::initial();
        let next = state.to_next_failed_connection(3, None);
        assert_eq!(next.state(), LifecycleState::Active);
        assert_eq!(next.failed_connections(), 1);
        assert!(next.health_check().is_none());
    }

    #[test]
    fn failure_at_threshold_becomes_unhealthy_with_handle() {
        let state: ConnState<u32> = ConnState::initial();
        let with_two = state
            .to_next_failed_connection(3, None)
            .to_next_failed_connection(3, None);
        let at_threshold = with_two.to_next_failed_connection(3, Some(hc()));
        assert_eq!(at_threshold.state(), LifecycleState::Unhealthy);
        assert_eq!(at_threshold.failed_connections(), 3);
        assert!(at_threshold.health_check().is_some());
    }

    #[test]
    fn threshold_of_one_promotes_on_first_failure() {
        let state: ConnState<u32> = ConnState::initial();
        let next = state.to_next_failed_connection(1, Some(hc()));
        assert_eq!(next.state(), LifecycleState::Unhealthy);
        assert_eq!(next.failed_connections(), 1);
    }

    #[test]
    #[should_panic(expected = "fresh_health_check must be supplied")]
    fn promoting_without_a_health_check_panics() {
        let state: ConnState<u32> = ConnState::initial();
        state.to_next_failed_connection(1, None);
    }

    #[test]
    fn add_new_connection_rejects_duplicates() {
        let state: ConnState<u32> = ConnState::initial();
        let with_one = state.add_new_connection(7, 0).unwrap();
        assert_eq!(with_one.connections(), &[7]);
        assert!(with_one.add_new_connection(7, 0).is_none());
    }

    #[test]
    fn add_new_connection_resets_failures_and_activates() {
        let state: ConnState<u32> = ConnState::initial();
        let failed = state.to_next_failed_connection(5, None);
        assert_eq!(failed.failed_connections(), 1);
        let revived = failed.add_new_connection(1, 0).unwrap();
        assert_eq!(revived.state(), LifecycleState::Active);
        assert_eq!(revived.failed_connections(), 0);
    }

    #[test]
    fn remove_connection_preserves_order_of_remaining() {
        let state: ConnState<u32> = ConnState::initial();
        let populated = state
            .add_new_connection(1, 0)
            .unwrap()
            .add_new_connection(2, 1)
            .unwrap()
            .add_new_connection(3, 2)
            .unwrap();
        assert_eq!(populated.connections(), &[1, 2, 3]);
        let removed = populated.remove_connection(&2).unwrap();
        assert_eq!(removed.connections(), &[1, 3]);
    }

    #[test]
    fn remove_connection_absent_returns_none() {
        let state: ConnState<u32> = ConnState::initial();
        assert!(state.remove_connection(&1).is_none());
    }

    #[test]
    fn to_expired_then_to_closed_preserve_connections() {
        let state: ConnState<u32> = ConnState::initial();
        let populated = state.add_new_connection(1, 0).unwrap();
        let expired = populated.to_expired();
        assert_eq!(expired.state(), LifecycleState::Expired);
        assert_eq!(expired.connections(), &[1]);
        let closed = expired.to_closed();
        assert_eq!(closed.state(), LifecycleState::Closed);
        assert_eq!(closed.connections(), &[1]);
    }
}

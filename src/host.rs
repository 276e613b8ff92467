//! `Host`: one resolved backend address, its live connection pool, and the
//! lock-free state machine coordinating both (spec §2-§5).
//!
//! All mutable state lives in a single `ArcSwap<ConnState<C>>`. Every
//! operation that changes state reads the current snapshot, computes a
//! replacement via a pure `ConnState` helper, and races a compare-and-swap
//! against concurrent writers, retrying on loss. Side effects that can't be
//! undone (spawning the health-check task) are created optimistically
//! before the CAS attempt and torn down if the attempt loses the race, so
//! the loop body never observes a half-applied transition.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use rand::Rng;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::conn_state::{ConnState, LifecycleState};
use crate::connection::ConnectionHandle;
use crate::context::Context;
use crate::error::{ConnectError, RejectOrigin};
use crate::factory::{ConnectionFactory, InstrumentedFactory};
use crate::health_check::{self, HealthCheck, RetryOutcome};
use crate::observer::{self, HostObserver};
use crate::selector::{AlwaysTrue, ConnectionSelector};
use crate::tracker::{ConnectTracker, HealthIndicator};

/// Tunables for the background health check (spec §6). `failed_threshold`
/// must be at least 1; enforced at construction rather than left to wrap
/// or panic mid-transition.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    failed_threshold: u32,
    health_check_interval: Duration,
    jitter: Duration,
}

impl HealthCheckConfig {
    /// Build a config. Panics if `failed_threshold` is 0.
    pub fn new(failed_threshold: u32, health_check_interval: Duration, jitter: Duration) -> Self {
        assert!(failed_threshold >= 1, "failed_threshold must be at least 1");
        HealthCheckConfig {
            failed_threshold,
            health_check_interval,
            jitter,
        }
    }
}

/// A point-in-time, serializable view of a host's state, for diagnostics
/// endpoints or logging — never consulted by the core itself.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HostSnapshot {
    pub state: String,
    pub connections: usize,
    pub failed_connections: u32,
    pub health_check_generation: Option<u64>,
    pub last_failure_cause: Option<String>,
}

struct CloseCoordinator {
    force_token: CancellationToken,
    started: AtomicBool,
    done_tx: watch::Sender<bool>,
}

impl CloseCoordinator {
    fn new() -> Self {
        let (done_tx, _) = watch::channel(false);
        CloseCoordinator {
            force_token: CancellationToken::new(),
            started: AtomicBool::new(false),
            done_tx,
        }
    }
}

struct Inner<Addr, C> {
    address: Addr,
    descriptor: String,
    weight: u32,
    state: ArcSwap<ConnState<C>>,
    factory: InstrumentedFactory<Addr, C>,
    config: HealthCheckConfig,
    observer: Arc<dyn HostObserver>,
    health_indicator: Option<Arc<dyn HealthIndicator>>,
    next_generation: AtomicU64,
    close: CloseCoordinator,
}

/// A resolved backend endpoint with its connection pool and lifecycle
/// state. Cheap to clone — internally an `Arc`, so the outer balancer can
/// hand out handles freely and background tasks can hold their own.
pub struct Host<Addr, C> {
    inner: Arc<Inner<Addr, C>>,
}

impl<Addr, C> Clone for Host<Addr, C> {
    fn clone(&self) -> Self {
        Host {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Addr, C> Host<Addr, C>
where
    Addr: Clone + Eq + fmt::Display + Send + Sync + 'static,
    C: ConnectionHandle,
{
    /// Build a host in its initial `Active`, empty, zero-failure state.
    pub fn new(
        address: Addr,
        descriptor: impl Into<String>,
        weight: u32,
        factory: Arc<dyn ConnectionFactory<Addr, C>>,
        config: HealthCheckConfig,
        observer: Arc<dyn HostObserver>,
        health_indicator: Option<Arc<dyn HealthIndicator>>,
    ) -> Self {
        Host {
            inner: Arc::new(Inner {
                address,
                descriptor: descriptor.into(),
                weight,
                state: ArcSwap::new(Arc::new(ConnState::initial())),
                factory: InstrumentedFactory::new(factory),
                config,
                observer,
                health_indicator,
                next_generation: AtomicU64::new(1),
                close: CloseCoordinator::new(),
            }),
        }
    }

    /// The address this host resolves to.
    pub fn address(&self) -> &Addr {
        &self.inner.address
    }

    /// Human-readable descriptor, for diagnostics only.
    pub fn descriptor(&self) -> &str {
        &self.inner.descriptor
    }

    /// Abstract non-negative weight used by the outer balancer.
    pub fn weight(&self) -> u32 {
        self.inner.weight
    }

    fn snapshot(&self) -> Arc<ConnState<C>> {
        self.inner.state.load_full()
    }

    /// A serializable snapshot for diagnostics.
    pub fn snapshot_diagnostics(&self) -> HostSnapshot {
        let state = self.snapshot();
        HostSnapshot {
            state: format!("{:?}", state.state()),
            connections: state.connections().len(),
            failed_connections: state.failed_connections(),
            health_check_generation: state.health_check().map(|hc| hc.generation()),
            last_failure_cause: state
                .health_check()
                .and_then(|hc| hc.last_failure_cause())
                .map(|cause| cause.to_string()),
        }
    }

    /// Read the current snapshot once and ask `selector` to pick a
    /// candidate. Never blocks, never mutates state.
    pub fn pick_connection(&self, selector: &dyn ConnectionSelector<C>, predicate: &dyn Fn(&C) -> bool) -> Option<C> {
        let snapshot = self.snapshot();
        selector.select(snapshot.connections(), predicate)
    }

    /// `Active`/`Expired` and, if a `HealthIndicator` is attached, its own
    /// opinion too. `Unhealthy` and `Closed` are always unhealthy.
    pub fn is_healthy(&self) -> bool {
        let base = matches!(self.snapshot().state(), LifecycleState::Active | LifecycleState::Expired);
        base && self
            .inner
            .health_indicator
            .as_deref()
            .map(HealthIndicator::is_healthy)
            .unwrap_or(true)
    }

    /// Whether new connections may still be attempted.
    pub fn can_make_new_connections(&self) -> bool {
        !matches!(self.snapshot().state(), LifecycleState::Expired | LifecycleState::Closed)
    }

    /// The external `HealthIndicator`'s score, or 1 if none is attached.
    pub fn score(&self) -> i64 {
        self.inner
            .health_indicator
            .as_deref()
            .map(HealthIndicator::score)
            .unwrap_or(1)
    }

    /// Open a new connection, classify and track the outcome, and attempt
    /// to add it to the pool (spec §4.2).
    pub async fn new_connection(
        &self,
        selector: &dyn ConnectionSelector<C>,
        predicate: &dyn Fn(&C) -> bool,
        force_new_and_reserve: bool,
        context: Option<Context>,
        cancel: &CancellationToken,
    ) -> Result<C, ConnectError> {
        if self.snapshot().state() == LifecycleState::Closed {
            return Err(ConnectError::HostClosed);
        }

        let mut context = context.unwrap_or_default();
        if let Some(indicator) = self.inner.health_indicator.clone() {
            context.insert(indicator);
        }
        let tracker: Option<&dyn ConnectTracker> = self
            .inner
            .health_indicator
            .as_deref()
            .map(HealthIndicator::as_connect_tracker);

        let conn = match self
            .inner
            .factory
            .connect(&self.inner.address, &mut context, tracker, cancel)
            .await
        {
            Ok(conn) => conn,
            Err(err) => {
                self.record_connect_failure(&err);
                return Err(err);
            }
        };

        if force_new_and_reserve && !conn.try_reserve() {
            self.close_rejected(&conn).await;
            return Err(ConnectError::Rejected { origin: RejectOrigin::Reserve });
        }

        let passes_predicate = selector.select(std::slice::from_ref(&conn), predicate).is_some();
        if !passes_predicate {
            if !self.try_add_connection(conn.clone()) {
                self.close_rejected(&conn).await;
            }
            return Err(ConnectError::Rejected { origin: RejectOrigin::Selector });
        }

        if self.try_add_connection(conn.clone()) {
            Ok(conn)
        } else {
            self.close_rejected(&conn).await;
            Err(ConnectError::Rejected { origin: RejectOrigin::Add })
        }
    }

    async fn close_rejected(&self, conn: &C) {
        if let Err(err) = conn.close().await {
            log::debug!("closing rejected connection on {}: {err}", self.inner.address);
        }
    }

    /// `ACTIVE --connect failure-->`. No-op for non-counting errors
    /// (`Cancelled`, `LimitReached`, `Rejected`, `HostClosed`) and when the
    /// host isn't currently `Active`.
    fn record_connect_failure(&self, err: &ConnectError) {
        if !err.counts_as_host_failure() {
            return;
        }
        loop {
            let current = self.snapshot();
            if current.state() != LifecycleState::Active {
                return;
            }

            let would_promote = current.failed_connections().saturating_add(1) >= self.inner.config.failed_threshold;
            let fresh_health_check = if would_promote {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let handle = Arc::new(HealthCheck::new(generation));
                self.spawn_health_check(Arc::clone(&handle));
                Some(handle)
            } else {
                None
            };

            let next = Arc::new(
                current.to_next_failed_connection(self.inner.config.failed_threshold, fresh_health_check.clone()),
            );
            let previous = self.inner.state.compare_and_swap(&current, Arc::clone(&next));
            if Arc::ptr_eq(&previous, &current) {
                if would_promote {
                    let observer = Arc::clone(&self.inner.observer);
                    let cause = err.clone();
                    observer::notify("on_host_marked_unhealthy", move || observer.on_host_marked_unhealthy(&cause));
                }
                return;
            }

            if let Some(handle) = &fresh_health_check {
                handle.cancel();
            }
        }
    }

    fn spawn_health_check(&self, handle: Arc<HealthCheck>) {
        let generation = handle.generation();
        let attempt_host = self.clone();
        let attempt = move || -> Pin<Box<dyn Future<Output = Result<(), ConnectError>> + Send>> {
            let host = attempt_host.clone();
            Box::pin(async move {
                let cancel = CancellationToken::new();
                host.new_connection(&AlwaysTrue, &|_| true, false, None, &cancel)
                    .await
                    .map(|_| ())
            })
        };

        let outcome_host = self.clone();
        health_check::spawn_retry_loop(
            handle,
            self.inner.config.health_check_interval,
            self.inner.config.jitter,
            attempt,
            move |_outcome: RetryOutcome| outcome_host.demote_to_active_if_current(generation),
        );
    }

    /// `UNHEALTHY -> ACTIVE`, only if `generation` still identifies the
    /// live health check (spec §4.4 step 4 — a stale check's success or
    /// fallback must not undo work a newer check has since done).
    fn demote_to_active_if_current(&self, generation: u64) {
        loop {
            let current = self.snapshot();
            let is_current = current.health_check().map(|hc| hc.generation()) == Some(generation);
            if current.state() != LifecycleState::Unhealthy || !is_current {
                return;
            }
            let next = Arc::new(current.to_active_no_failures());
            let previous = self.inner.state.compare_and_swap(&current, Arc::clone(&next));
            if Arc::ptr_eq(&previous, &current) {
                let observer = Arc::clone(&self.inner.observer);
                observer::notify("on_host_revived", move || observer.on_host_revived());
                return;
            }
        }
    }

    /// `ACTIVE | UNHEALTHY -> EXPIRED`. If the pool was already empty,
    /// immediately schedules the close and reports done; otherwise the
    /// caller must wait for the pool to drain (spec §4.2 `markExpired`).
    pub fn mark_expired(&self) -> bool {
        loop {
            let current = self.snapshot();
            match current.state() {
                LifecycleState::Closed => return true,
                LifecycleState::Expired => return false,
                LifecycleState::Active | LifecycleState::Unhealthy => {
                    let displaced_health_check = current.health_check().cloned();
                    let next = Arc::new(current.to_expired());
                    let previous = self.inner.state.compare_and_swap(&current, Arc::clone(&next));
                    if !Arc::ptr_eq(&previous, &current) {
                        continue;
                    }

                    if let Some(hc) = displaced_health_check {
                        hc.cancel();
                    }
                    let connections_len = next.connections().len();
                    let observer = Arc::clone(&self.inner.observer);
                    observer::notify("on_host_marked_expired", move || {
                        observer.on_host_marked_expired(connections_len)
                    });

                    if connections_len == 0 {
                        let host = self.clone();
                        tokio::spawn(async move { host.close_async().await });
                        return true;
                    }
                    return false;
                }
            }
        }
    }

    /// `EXPIRED -> ACTIVE`. No-op (and no observer event) from `Active` or
    /// `Unhealthy` — per spec, the source emits nothing for a spurious
    /// call, and this keeps that behavior.
    pub fn mark_active_if_not_closed(&self) -> bool {
        loop {
            let current = self.snapshot();
            match current.state() {
                LifecycleState::Closed => return false,
                LifecycleState::Active | LifecycleState::Unhealthy => return true,
                LifecycleState::Expired => {
                    let next = Arc::new(current.to_active_no_failures());
                    let previous = self.inner.state.compare_and_swap(&current, Arc::clone(&next));
                    if !Arc::ptr_eq(&previous, &current) {
                        continue;
                    }
                    let connections_len = next.connections().len();
                    let observer = Arc::clone(&self.inner.observer);
                    observer::notify("on_expired_host_revived", move || {
                        observer.on_expired_host_revived(connections_len)
                    });
                    return true;
                }
            }
        }
    }

    /// Insert `conn` at a uniformly-random index. Returns `false` if the
    /// host is `Closed` or `Expired` — an `Expired` host is writeable only
    /// for removals, never inserts, regardless of whether its pool is
    /// already empty — in which case the caller must close `conn` itself
    /// (spec §4.3).
    fn try_add_connection(&self, conn: C) -> bool {
        loop {
            let current = self.snapshot();
            match current.state() {
                LifecycleState::Closed | LifecycleState::Expired => return false,
                _ => {}
            }

            let index = rand::thread_rng().gen_range(0..=current.connections().len());
            let Some(updated) = current.add_new_connection(conn.clone(), index) else {
                return true;
            };

            let displaced_health_check = current.health_check().cloned();
            let next = Arc::new(updated);
            let previous = self.inner.state.compare_and_swap(&current, Arc::clone(&next));
            if !Arc::ptr_eq(&previous, &current) {
                continue;
            }

            if let Some(hc) = displaced_health_check {
                hc.cancel();
                let observer = Arc::clone(&self.inner.observer);
                observer::notify("on_host_revived", move || observer.on_host_revived());
            }
            self.spawn_removal_watcher(conn);
            return true;
        }
    }

    fn spawn_removal_watcher(&self, conn: C) {
        let host = self.clone();
        tokio::spawn(async move {
            conn.closed().await;
            host.remove_connection(&conn);
        });
    }

    /// Remove `conn` from the pool. If that drains the last connection of
    /// an `Expired` host, triggers the close (spec §4.3 removal loop, §4.2
    /// "`EXPIRED` with empty connections is transient").
    pub fn remove_connection(&self, conn: &C) {
        loop {
            let current = self.snapshot();
            let Some(updated) = current.remove_connection(conn) else {
                return;
            };
            let next = Arc::new(updated);
            let previous = self.inner.state.compare_and_swap(&current, Arc::clone(&next));
            if !Arc::ptr_eq(&previous, &current) {
                continue;
            }

            if next.state() == LifecycleState::Expired && next.connections().is_empty() {
                let host = self.clone();
                tokio::spawn(async move { host.close_async().await });
            }
            return;
        }
    }

    fn cas_to_closed(&self) -> Option<Arc<ConnState<C>>> {
        loop {
            let current = self.snapshot();
            if current.state() == LifecycleState::Closed {
                return None;
            }
            let next = Arc::new(current.to_closed());
            let previous = self.inner.state.compare_and_swap(&current, next);
            if Arc::ptr_eq(&previous, &current) {
                return Some(current);
            }
        }
    }

    /// Force-close every connection immediately.
    pub async fn close_async(&self) {
        self.close(false).await;
    }

    /// Close gracefully: connections are given the chance to drain, unless
    /// a concurrent/subsequent `close_async()` upgrades the drain to
    /// forceful (spec §4.2 `closeAsyncGracefully`, "graceful-then-forceful
    /// is allowed and upgrades the drain").
    pub async fn close_async_gracefully(&self) {
        self.close(true).await;
    }

    async fn close(&self, graceful: bool) {
        if !graceful {
            self.inner.close.force_token.cancel();
        }

        let should_drive = !self.inner.close.started.swap(true, Ordering::SeqCst);
        if should_drive {
            self.drive_close().await;
        } else {
            let mut rx = self.inner.close.done_tx.subscribe();
            if *rx.borrow() {
                return;
            }
            let _ = rx.changed().await;
        }
    }

    async fn drive_close(&self) {
        let Some(prior) = self.cas_to_closed() else {
            return;
        };

        if let Some(hc) = prior.health_check() {
            hc.cancel();
        }

        let connections_len = prior.connections().len();
        let was_expired = prior.state() == LifecycleState::Expired;
        let observer = Arc::clone(&self.inner.observer);
        observer::notify("host_removed", move || {
            if was_expired {
                observer.on_expired_host_removed(connections_len);
            } else {
                observer.on_active_host_removed(connections_len);
            }
        });

        let mut tasks = tokio::task::JoinSet::new();
        for conn in prior.connections().iter().cloned() {
            let force_token = self.inner.close.force_token.clone();
            tasks.spawn(async move {
                tokio::select! {
                    biased;
                    _ = force_token.cancelled() => conn.close().await,
                    result = conn.close_gracefully() => result,
                }
            });
        }

        let mut failures = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failures += 1;
                    log::debug!("connection close error while draining {}: {err}", self.inner.address);
                }
                Err(join_err) => {
                    failures += 1;
                    log::warn!("connection close task panicked while draining {}: {join_err}", self.inner.address);
                }
            }
        }
        if failures > 0 {
            log::warn!("host {} drained with {failures} connection close failure(s)", self.inner.address);
        }

        let _ = self.inner.close.done_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::CloseError;
    use crate::selector::FirstMatch;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicUsize};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    #[derive(Clone)]
    struct FakeConn {
        id: u32,
        closed_signal: Arc<Notify>,
        close_calls: Arc<AtomicUsize>,
    }

    impl PartialEq for FakeConn {
        fn eq(&self, other: &Self) -> bool {
            self.id == other.id
        }
    }

    impl FakeConn {
        fn new(id: u32) -> Self {
            FakeConn {
                id,
                closed_signal: Arc::new(Notify::new()),
                close_calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn trigger_closed(&self) {
            self.closed_signal.notify_one();
        }
    }

    #[async_trait]
    impl ConnectionHandle for FakeConn {
        async fn close(&self) -> Result<(), CloseError> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn closed(&self) {
            self.closed_signal.notified().await;
        }
    }

    struct ScriptedFactory {
        attempt: AtomicUsize,
        fail_first_n: usize,
        next_id: AtomicU32,
    }

    #[async_trait]
    impl ConnectionFactory<&'static str, FakeConn> for ScriptedFactory {
        async fn new_connection(&self, _addr: &&'static str, _context: &mut Context) -> Result<FakeConn, ConnectError> {
            let n = self.attempt.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first_n {
                Err(ConnectError::Timeout)
            } else {
                Ok(FakeConn::new(self.next_id.fetch_add(1, Ordering::SeqCst)))
            }
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        unhealthy: StdMutex<Vec<String>>,
        revived: AtomicUsize,
        marked_expired: StdMutex<Vec<usize>>,
        expired_revived: StdMutex<Vec<usize>>,
        expired_removed: StdMutex<Vec<usize>>,
        active_removed: StdMutex<Vec<usize>>,
    }

    impl HostObserver for RecordingObserver {
        fn on_host_marked_unhealthy(&self, cause: &ConnectError) {
            self.unhealthy.lock().unwrap().push(cause.to_string());
        }
        fn on_host_revived(&self) {
            self.revived.fetch_add(1, Ordering::SeqCst);
        }
        fn on_host_marked_expired(&self, connections: usize) {
            self.marked_expired.lock().unwrap().push(connections);
        }
        fn on_expired_host_revived(&self, connections: usize) {
            self.expired_revived.lock().unwrap().push(connections);
        }
        fn on_expired_host_removed(&self, connections: usize) {
            self.expired_removed.lock().unwrap().push(connections);
        }
        fn on_active_host_removed(&self, connections: usize) {
            self.active_removed.lock().unwrap().push(connections);
        }
    }

    fn make_host(
        fail_first_n: usize,
        threshold: u32,
        observer: Arc<RecordingObserver>,
    ) -> Host<&'static str, FakeConn> {
        let factory: Arc<dyn ConnectionFactory<&'static str, FakeConn>> = Arc::new(ScriptedFactory {
            attempt: AtomicUsize::new(0),
            fail_first_n,
            next_id: AtomicU32::new(0),
        });
        Host::new(
            "backend-a",
            "backend-a:9000",
            1,
            factory,
            HealthCheckConfig::new(threshold, Duration::from_millis(5), Duration::from_millis(1)),
            observer,
            None,
        )
    }

    #[tokio::test]
    async fn three_consecutive_failures_promote_to_unhealthy() {
        let observer = Arc::new(RecordingObserver::default());
        let host = make_host(usize::MAX, 3, observer.clone());
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            let result = host
                .new_connection(&FirstMatch, &|_| true, false, None, &cancel)
                .await;
            assert!(result.is_err());
        }

        let snap = host.snapshot_diagnostics();
        assert_eq!(snap.state, "Unhealthy");
        assert_eq!(snap.failed_connections, 3);
        assert_eq!(observer.unhealthy.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn health_check_success_revives_host_and_pools_connection() {
        let observer = Arc::new(RecordingObserver::default());
        let host = make_host(1, 1, observer.clone());
        let cancel = CancellationToken::new();

        let result = host
            .new_connection(&FirstMatch, &|_| true, false, None, &cancel)
            .await;
        assert!(result.is_err());
        assert_eq!(host.snapshot_diagnostics().state, "Unhealthy");

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(host.snapshot_diagnostics().state, "Active");
        assert_eq!(host.snapshot_diagnostics().failed_connections, 0);
        assert_eq!(observer.revived.load(Ordering::SeqCst), 1);
        assert_eq!(host.snapshot_diagnostics().connections, 1);
    }

    #[tokio::test]
    async fn mark_expired_with_connections_drains_then_closes() {
        let observer = Arc::new(RecordingObserver::default());
        let host = make_host(0, 3, observer.clone());
        let cancel = CancellationToken::new();

        let a = host.new_connection(&FirstMatch, &|_| true, false, None, &cancel).await.unwrap();
        let b = host.new_connection(&FirstMatch, &|_| true, false, None, &cancel).await.unwrap();
        assert_eq!(host.snapshot_diagnostics().connections, 2);

        let immediate = host.mark_expired();
        assert!(!immediate);
        assert_eq!(observer.marked_expired.lock().unwrap(), vec![2]);

        a.trigger_closed();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(host.snapshot_diagnostics().state, "Expired");
        assert_eq!(host.snapshot_diagnostics().connections, 1);

        b.trigger_closed();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(host.snapshot_diagnostics().state, "Closed");
        assert_eq!(observer.expired_removed.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn mark_active_if_not_closed_round_trips_from_expired() {
        let observer = Arc::new(RecordingObserver::default());
        let host = make_host(0, 3, observer.clone());
        let cancel = CancellationToken::new();
        let _conn = host.new_connection(&FirstMatch, &|_| true, false, None, &cancel).await.unwrap();

        assert!(!host.mark_expired());
        assert_eq!(host.snapshot_diagnostics().state, "Expired");

        assert!(host.mark_active_if_not_closed());
        assert_eq!(host.snapshot_diagnostics().state, "Active");
        assert_eq!(host.snapshot_diagnostics().failed_connections, 0);
        assert_eq!(observer.expired_revived.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn mark_active_if_not_closed_from_active_is_a_silent_noop() {
        let observer = Arc::new(RecordingObserver::default());
        let host = make_host(0, 3, observer.clone());

        assert!(host.mark_active_if_not_closed());
        assert!(observer.expired_revived.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_async_cancels_health_check_and_force_closes_connections() {
        let observer = Arc::new(RecordingObserver::default());
        let host = make_host(usize::MAX, 1, observer.clone());
        let cancel = CancellationToken::new();

        let result = host.new_connection(&FirstMatch, &|_| true, false, None, &cancel).await;
        assert!(result.is_err());
        assert_eq!(host.snapshot_diagnostics().state, "Unhealthy");

        host.close_async().await;

        assert_eq!(host.snapshot_diagnostics().state, "Closed");
        assert_eq!(observer.active_removed.lock().unwrap(), vec![0]);
        assert_eq!(observer.revived.load(Ordering::SeqCst), 0);

        // Second call is coalesced, not a second terminal event.
        host.close_async().await;
        assert_eq!(observer.active_removed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_connection_insert_is_a_no_op() {
        let observer = Arc::new(RecordingObserver::default());
        let host = make_host(0, 3, observer.clone());
        assert!(host.try_add_connection(FakeConn::new(7)));
        assert!(host.try_add_connection(FakeConn::new(7)));
        assert_eq!(host.snapshot_diagnostics().connections, 1);
    }

    #[tokio::test]
    async fn close_async_gracefully_then_close_async_upgrades_to_forceful() {
        let observer = Arc::new(RecordingObserver::default());
        let host = make_host(0, 3, observer.clone());
        let cancel = CancellationToken::new();
        let conn = host.new_connection(&FirstMatch, &|_| true, false, None, &cancel).await.unwrap();

        let graceful_host = host.clone();
        let graceful_call = tokio::spawn(async move { graceful_host.close_async_gracefully().await });
        // Give the graceful drain a moment to spawn its per-connection close task
        // before the forceful upgrade arrives.
        tokio::task::yield_now().await;

        host.close_async().await;
        graceful_call.await.unwrap();

        assert_eq!(host.snapshot_diagnostics().state, "Closed");
        assert_eq!(conn.close_calls.load(Ordering::SeqCst), 1);
        assert_eq!(observer.active_removed.lock().unwrap().len(), 1);
    }

    // Scenario 5 (spec §8): thread A's `new_connection` call wins the factory
    // race and tries to insert; thread B's `mark_expired()` wins the CAS
    // first against a non-empty pool. A's insert must then be rejected and
    // A must close the connection it created — no leak, no double-count.
    #[tokio::test(flavor = "multi_thread")]
    async fn expired_wins_race_against_racing_connection_add() {
        struct GatedFactory {
            release: Arc<Notify>,
            started: Arc<Notify>,
            next_id: AtomicU32,
        }

        #[async_trait]
        impl ConnectionFactory<&'static str, FakeConn> for GatedFactory {
            async fn new_connection(&self, _addr: &&'static str, _context: &mut Context) -> Result<FakeConn, ConnectError> {
                self.started.notify_one();
                self.release.notified().await;
                Ok(FakeConn::new(self.next_id.fetch_add(1, Ordering::SeqCst)))
            }
        }

        let observer = Arc::new(RecordingObserver::default());
        let release = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());
        let factory: Arc<dyn ConnectionFactory<&'static str, FakeConn>> = Arc::new(GatedFactory {
            release: release.clone(),
            started: started.clone(),
            next_id: AtomicU32::new(100),
        });
        let host = Host::new(
            "backend-b",
            "backend-b:9000",
            1,
            factory,
            HealthCheckConfig::new(3, Duration::from_secs(60), Duration::from_millis(1)),
            observer.clone(),
            None,
        );

        // Seed one existing connection so the pool is non-empty when B's
        // mark_expired() fires (otherwise it would close immediately).
        let existing = FakeConn::new(1);
        assert!(host.try_add_connection(existing.clone()));

        let attempt_host = host.clone();
        let cancel = CancellationToken::new();
        let attempt = tokio::spawn(async move {
            attempt_host
                .new_connection(&FirstMatch, &|_| true, false, None, &cancel)
                .await
        });

        started.notified().await;
        let immediate = host.mark_expired();
        assert!(!immediate);
        assert_eq!(host.snapshot_diagnostics().state, "Expired");

        release.notify_one();
        let result = attempt.await.unwrap();

        assert!(matches!(result, Err(ConnectError::Rejected { origin: RejectOrigin::Add })));
        assert_eq!(host.snapshot_diagnostics().connections, 1);

        existing.trigger_closed();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(host.snapshot_diagnostics().state, "Closed");
        assert_eq!(observer.expired_removed.lock().unwrap(), vec![0]);
    }
}

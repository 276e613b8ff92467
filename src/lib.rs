//! Lock-free host state and connection lifecycle core for a client-side
//! load balancer.
//!
//! This crate owns exactly one thing: a single `Host`'s 4-state lifecycle
//! (`Active`/`Unhealthy`/`Expired`/`Closed`), its connection pool, and the
//! health-check task that can demote and revive it. It does not choose
//! between hosts, resolve addresses, open sockets, or parse configuration —
//! those are the outer balancer's job, supplied here only as the
//! capabilities in [`factory`], [`selector`], [`tracker`], and
//! [`connection`].
//!
//! Every host's state lives behind a single atomic pointer to an immutable
//! [`conn_state::ConnState`]. Mutations are compare-and-swap loops over that
//! pointer — there are no locks anywhere in this crate.

pub mod conn_state;
pub mod connection;
pub mod context;
pub mod error;
pub mod factory;
pub mod health_check;
pub mod host;
pub mod observer;
pub mod selector;
pub mod tracker;

pub use conn_state::{ConnState, LifecycleState};
pub use connection::{CloseError, ConnectionHandle};
pub use context::Context;
pub use error::{ConnectError, ConnectErrorKind, RejectOrigin};
pub use factory::{ConnectionFactory, InstrumentedFactory};
pub use health_check::HealthCheck;
pub use host::{Host, HealthCheckConfig, HostSnapshot};
pub use observer::{HostObserver, NoopObserver};
pub use selector::{AlwaysTrue, ConnectionSelector, FirstMatch};
pub use tracker::{ConnectTracker, HealthIndicator, RequestTracker};

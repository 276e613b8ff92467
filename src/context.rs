//! Request-scoped typed context threaded through a single `new_connection` call.
//!
//! Mirrors the typed-extension-map pattern common across the async ecosystem
//! (e.g. `http::Extensions`): one value per type, inserted and fetched by
//! type rather than by string key. The host uses this to publish its
//! `HealthIndicator` under a well-known slot for the duration of a connect
//! attempt, per spec §6 ("a single request-tracker key").

use std::any::{Any, TypeId};
use std::collections::HashMap;

/// A typed bag of values, one per type, scoped to a single connection
/// attempt. Created fresh by [`crate::host::Host::new_connection`] when the
/// caller does not supply one.
#[derive(Default)]
pub struct Context {
    values: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing any previous value of the same type.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<T> {
        self.values
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok().map(|b| *b))
    }

    /// Fetch the value of type `T`, if present.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    /// Remove the value of type `T`, returning it if present. Used by the
    /// health-check task to clear any stray context before each retry
    /// (spec §4.4 step 2).
    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.values
            .remove(&TypeId::of::<T>())
            .and_then(|old| old.downcast::<T>().ok().map(|b| *b))
    }

    /// Whether the context has no values at all.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Drop every stored value, returning the context to a clean slate.
    pub fn clear(&mut self) {
        self.values.clear();
    }
}

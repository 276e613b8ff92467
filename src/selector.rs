//! Caller-supplied connection selection (spec §4.2, §6).

/// Selects a candidate connection from a list using the caller's predicate.
/// Never blocks, never mutates state — implementations just pick an index.
pub trait ConnectionSelector<C>: Send + Sync {
    /// Return a candidate from `candidates` for which `predicate` holds, or
    /// `None` if no candidate passes.
    fn select(&self, candidates: &[C], predicate: &dyn Fn(&C) -> bool) -> Option<C>
    where
        C: Clone;
}

/// Picks the first connection that satisfies the predicate. The common case
/// when callers have no preference beyond "has capacity".
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstMatch;

impl<C> ConnectionSelector<C> for FirstMatch {
    fn select(&self, candidates: &[C], predicate: &dyn Fn(&C) -> bool) -> Option<C>
    where
        C: Clone,
    {
        candidates.iter().find(|c| predicate(c)).cloned()
    }
}

/// Accepts any candidate unconditionally; used by the health-check task's
/// retry attempt (spec §4.4 step 3: "Attempts `newConnection` with an
/// always-true selector").
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysTrue;

impl<C> ConnectionSelector<C> for AlwaysTrue {
    fn select(&self, candidates: &[C], _predicate: &dyn Fn(&C) -> bool) -> Option<C>
    where
        C: Clone,
    {
        candidates.first().cloned()
    }
}

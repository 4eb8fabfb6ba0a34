//! Pending request registry.
//!
//! Maps correlation ids to the result slot of each outstanding call. All
//! resolution races (reply vs. timeout vs. publish failure vs. link loss) are
//! settled here: an entry leaves the map on its first transition, so the
//! first transition wins and every later one is a silent no-op returning
//! `false`.
//!
//! Delivery into the slot happens while the lock is held. A caller that
//! fails to `remove()` its own token therefore knows the outcome is already
//! sitting in its receiver.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::oneshot;

use crate::{CorrelationId, Result, RpcError};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// The map holds no invariants spanning multiple entries; the worst outcome
/// of a panic mid-update is one dropped slot, which its caller observes as a
/// closed channel.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct PendingEntry<T> {
    slot: oneshot::Sender<Result<T>>,
    created_at: Instant,
}

/// Concurrency-safe map from correlation id to an unresolved call.
pub(crate) struct PendingRegistry<T> {
    // ---
    entries: Mutex<HashMap<CorrelationId, PendingEntry<T>>>,
}

impl<T> PendingRegistry<T> {
    // ---

    pub fn new() -> Self {
        // ---
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert an unresolved entry for `token`.
    ///
    /// The returned ticket receives the outcome and removes the entry if it
    /// is dropped first (caller cancelled).
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::DuplicateCorrelation`] if `token` is already
    /// pending.
    pub fn register(self: &Arc<Self>, token: CorrelationId) -> Result<PendingTicket<T>> {
        // ---
        let (slot, rx) = oneshot::channel();

        {
            let mut entries = lock_ignore_poison(&self.entries);
            if entries.contains_key(&token) {
                return Err(RpcError::DuplicateCorrelation(token.to_string()));
            }
            entries.insert(
                token.clone(),
                PendingEntry {
                    slot,
                    created_at: Instant::now(),
                },
            );
        }

        Ok(PendingTicket {
            token,
            rx,
            registry: Arc::clone(self),
        })
    }

    /// Fulfil an unresolved entry. Returns `false` if the entry is missing or
    /// already terminal.
    pub fn resolve(&self, token: &CorrelationId, value: T) -> bool {
        self.settle(token, Ok(value))
    }

    /// Fail an unresolved entry. Same contract as [`resolve`](Self::resolve).
    pub fn fail(&self, token: &CorrelationId, err: RpcError) -> bool {
        self.settle(token, Err(err))
    }

    fn settle(&self, token: &CorrelationId, outcome: Result<T>) -> bool {
        // ---
        let mut entries = lock_ignore_poison(&self.entries);

        let Some(entry) = entries.remove(token) else {
            return false;
        };

        let _age = entry.created_at.elapsed();
        if entry.slot.send(outcome).is_err() {
            crate::log_debug!("caller for {token} went away before outcome ({_age:?})");
        } else {
            crate::log_debug!("settled {token} after {_age:?}");
        }
        true
    }

    /// Remove an entry without delivering anything. Safe on unknown tokens.
    ///
    /// Returns `true` if this call removed the entry.
    pub fn remove(&self, token: &CorrelationId) -> bool {
        // ---
        lock_ignore_poison(&self.entries).remove(token).is_some()
    }

    /// Fail every unresolved entry, building one error per entry.
    ///
    /// Returns the number of entries failed.
    pub fn fail_all<F>(&self, mut make_err: F) -> usize
    where
        F: FnMut() -> RpcError,
    {
        // ---
        let mut entries = lock_ignore_poison(&self.entries);
        let count = entries.len();

        for (_, entry) in entries.drain() {
            let _ = entry.slot.send(Err(make_err()));
        }
        count
    }

    pub fn contains(&self, token: &CorrelationId) -> bool {
        lock_ignore_poison(&self.entries).contains_key(token)
    }

    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.entries).len()
    }
}

/// Caller-side handle on one pending entry.
///
/// Dropping the ticket removes the entry, so a cancelled caller never leaves
/// a token behind in the registry.
pub(crate) struct PendingTicket<T> {
    // ---
    pub(crate) token: CorrelationId,
    pub(crate) rx: oneshot::Receiver<Result<T>>,
    registry: Arc<PendingRegistry<T>>,
}

impl<T> PendingTicket<T> {
    pub(crate) fn registry(&self) -> &PendingRegistry<T> {
        &self.registry
    }
}

impl<T> Drop for PendingTicket<T> {
    fn drop(&mut self) {
        self.registry.remove(&self.token);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn registry() -> Arc<PendingRegistry<String>> {
        Arc::new(PendingRegistry::new())
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        // ---
        let pending = registry();
        let token = CorrelationId::generate();

        let mut ticket = pending.register(token.clone()).unwrap();
        assert_eq!(pending.len(), 1);

        assert!(pending.resolve(&token, "spans".to_string()));
        assert_eq!(pending.len(), 0);

        assert_eq!((&mut ticket.rx).await.unwrap().unwrap(), "spans");
    }

    #[test]
    fn test_duplicate_register_rejected() {
        // ---
        let pending = registry();
        let token = CorrelationId::from("fixed");

        let _ticket = pending.register(token.clone()).unwrap();
        assert!(matches!(
            pending.register(token),
            Err(RpcError::DuplicateCorrelation(t)) if t == "fixed"
        ));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_second_transition_is_noop() {
        // ---
        let pending = registry();
        let token = CorrelationId::generate();
        let mut ticket = pending.register(token.clone()).unwrap();

        assert!(pending.resolve(&token, "first".to_string()));
        assert!(!pending.resolve(&token, "second".to_string()));
        assert!(!pending.fail(&token, RpcError::Decode("late".into())));
        assert!(!pending.remove(&token));

        assert_eq!(ticket.rx.try_recv().unwrap().unwrap(), "first");
    }

    #[test]
    fn test_fail_delivers_error() {
        // ---
        let pending = registry();
        let token = CorrelationId::generate();
        let mut ticket = pending.register(token.clone()).unwrap();

        assert!(pending.fail(&token, RpcError::Decode("bad body".into())));
        assert!(matches!(ticket.rx.try_recv().unwrap(), Err(RpcError::Decode(_))));
    }

    #[test]
    fn test_remove_is_idempotent() {
        // ---
        let pending = registry();
        let token = CorrelationId::generate();
        let _ticket = pending.register(token.clone()).unwrap();

        assert!(pending.remove(&token));
        assert!(!pending.remove(&token));
        assert!(!pending.resolve(&token, "late".to_string()));
    }

    #[test]
    fn test_unknown_token() {
        // ---
        let pending = registry();
        let token = CorrelationId::generate();
        assert!(!pending.resolve(&token, "x".to_string()));
        assert!(!pending.fail(&token, RpcError::ConnectionLost));
        assert!(!pending.remove(&token));
    }

    #[test]
    fn test_dropped_ticket_removes_entry() {
        // ---
        let pending = registry();
        let token = CorrelationId::generate();

        let ticket = pending.register(token.clone()).unwrap();
        assert!(pending.contains(&token));

        drop(ticket);
        assert!(!pending.contains(&token));
    }

    #[test]
    fn test_fail_all() {
        // ---
        let pending = registry();
        let mut tickets: Vec<_> = (0..3)
            .map(|_| pending.register(CorrelationId::generate()).unwrap())
            .collect();

        assert_eq!(pending.fail_all(|| RpcError::ConnectionLost), 3);
        assert_eq!(pending.len(), 0);

        for ticket in tickets.iter_mut() {
            assert!(matches!(ticket.rx.try_recv().unwrap(), Err(RpcError::ConnectionLost)));
        }
    }

    #[tokio::test]
    async fn test_concurrent_resolve_and_remove_single_winner() {
        // ---
        for _ in 0..200 {
            let pending = registry();
            let token = CorrelationId::generate();
            let mut ticket = pending.register(token.clone()).unwrap();

            let resolver = {
                let pending = pending.clone();
                let token = token.clone();
                tokio::spawn(async move { pending.resolve(&token, "reply".to_string()) })
            };
            let remover = {
                let pending = pending.clone();
                let token = token.clone();
                tokio::spawn(async move { pending.remove(&token) })
            };

            let resolved = resolver.await.unwrap();
            let removed = remover.await.unwrap();
            assert!(resolved ^ removed, "exactly one transition must win");

            if resolved {
                assert!(ticket.rx.try_recv().is_ok());
            }
        }
    }
}

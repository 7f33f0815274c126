//! Single-flight Coordinator.
//!
//! For each key missing from the local tier, at most one loader call is in
//! flight per process; concurrent callers for the same key share the
//! result. A failed loader is never cached — every current waiter observes
//! the same error and the very next caller re-invokes the loader. If the
//! initiator cancels before completing and waiters remain, the next caller
//! to reserve the key (any of the waiters retrying, or a brand new caller)
//! becomes the new initiator, which is this coordinator's notion of
//! "promotion" — there is no designated successor, just whoever reserves
//! the now-empty slot first.
//!
//! Built on a sharded map from key to an in-flight ticket (a
//! [`tokio::sync::watch`] channel), avoiding a global lock across the
//! loader call: the map lock (inside [`dashmap`]) is only ever held for the
//! duration of an `entry()` lookup, never while a loader runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tokio::sync::watch;

use crate::error::CacheError;

/// What a successful load produced: the encoded bytes, the version the
/// backend assigned, and the expiry the upsert settled on.
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub bytes: Vec<u8>,
    /// `None` when the loader asked not to cache the value: nothing was
    /// written to the backend or the local tier, but every waiter still
    /// shares the single loader invocation's bytes.
    pub version: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
}

type TicketResult = Result<Arc<LoadOutcome>, Arc<CacheError>>;
type Slot = watch::Sender<Option<TicketResult>>;

/// The result of reserving a key: either the caller is the initiator and
/// must run the loader, or another in-flight call is already running it
/// and the caller should await its result.
pub enum Reservation<'a> {
    Initiator(InitiatorGuard<'a>),
    Waiter(watch::Receiver<Option<TicketResult>>),
}

/// Held by whichever caller is responsible for invoking the loader.
/// Consumed by [`InitiatorGuard::complete`] on success or failure; dropping
/// it without completing (e.g. the caller was cancelled) releases the
/// ticket without ever sending a result, which is what lets a waiter
/// promote itself.
pub struct InitiatorGuard<'a> {
    coordinator: &'a Coordinator,
    key: Vec<u8>,
    tx: Arc<Slot>,
    completed: bool,
}

impl InitiatorGuard<'_> {
    /// Deliver the loader's outcome to every current waiter and free the
    /// key for the next caller to reserve fresh.
    pub fn complete(self, result: Result<LoadOutcome, CacheError>) {
        let wrapped = result.map(Arc::new).map_err(Arc::new);
        self.finish(Some(wrapped));
    }

    /// Give up without producing a result. Any waiter still blocked on
    /// this ticket will see the channel close and must reserve again.
    pub fn cancel(mut self) {
        self.completed = true;
        self.coordinator.release(&self.key, &self.tx);
    }

    fn finish(mut self, result: Option<TicketResult>) {
        self.completed = true;
        if let Some(result) = result {
            let _ = self.tx.send(Some(result));
        }
        self.coordinator.release(&self.key, &self.tx);
    }
}

impl Drop for InitiatorGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.coordinator.release(&self.key, &self.tx);
        }
    }
}

#[derive(Default)]
struct Counters {
    loader_invocations: AtomicU64,
}

/// Deduplicates concurrent loader invocations per key.
pub struct Coordinator {
    tickets: DashMap<Vec<u8>, Arc<Slot>>,
    counters: Counters,
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            tickets: DashMap::new(),
            counters: Counters::default(),
        }
    }

    /// Reserve the key: the first caller becomes the initiator, later
    /// callers (while the ticket is live) become waiters on the same
    /// result.
    pub fn reserve(&self, key: &[u8]) -> Reservation<'_> {
        match self.tickets.entry(key.to_vec()) {
            MapEntry::Occupied(e) => Reservation::Waiter(e.get().subscribe()),
            MapEntry::Vacant(e) => {
                self.counters.loader_invocations.fetch_add(1, Ordering::Relaxed);
                let (tx, _rx) = watch::channel(None);
                let tx = Arc::new(tx);
                e.insert(tx.clone());
                Reservation::Initiator(InitiatorGuard {
                    coordinator: self,
                    key: key.to_vec(),
                    tx,
                    completed: false,
                })
            }
        }
    }

    /// Wait for the ticket this receiver is subscribed to. Returns `None`
    /// if the initiator gave up without producing a result — the caller
    /// must reserve again (and may become the new initiator) in that case.
    pub async fn wait(rx: &mut watch::Receiver<Option<TicketResult>>) -> Option<TicketResult> {
        if rx.changed().await.is_err() {
            return None;
        }
        rx.borrow().clone()
    }

    fn release(&self, key: &[u8], tx: &Arc<Slot>) {
        self.tickets.remove_if(key, |_, v| Arc::ptr_eq(v, tx));
    }

    /// Number of loader invocations ever initiated through this
    /// coordinator (an "absent → loading" transition in spec terms).
    pub fn loader_invocations(&self) -> u64 {
        self.counters.loader_invocations.load(Ordering::Relaxed)
    }

    /// Number of keys with an in-flight loader right now.
    pub fn in_flight_count(&self) -> usize {
        self.tickets.len()
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering as O};
    use std::time::Duration;

    fn outcome(version: i64) -> LoadOutcome {
        LoadOutcome {
            bytes: vec![1, 2, 3],
            version: Some(version),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn fifty_concurrent_callers_share_one_loader_invocation() {
        let coordinator = Arc::new(Coordinator::new());
        let invocations = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let coordinator = coordinator.clone();
            let invocations = invocations.clone();
            handles.push(tokio::spawn(async move {
                match coordinator.reserve(b"k") {
                    Reservation::Initiator(guard) => {
                        invocations.fetch_add(1, O::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        guard.complete(Ok(outcome(1)));
                    }
                    Reservation::Waiter(mut rx) => {
                        let result = Coordinator::wait(&mut rx).await;
                        assert!(result.is_some());
                    }
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(invocations.load(O::SeqCst), 1);
        assert_eq!(coordinator.loader_invocations(), 1);
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn waiters_observe_the_same_error_and_it_is_not_cached() {
        let coordinator = Coordinator::new();

        let (tx, mut waiter_rx) = match coordinator.reserve(b"k") {
            Reservation::Initiator(guard) => {
                let waiter = match coordinator.reserve(b"k") {
                    Reservation::Waiter(rx) => rx,
                    Reservation::Initiator(_) => panic!("expected waiter"),
                };
                (guard, waiter)
            }
            Reservation::Waiter(_) => panic!("expected initiator first"),
        };

        tx.complete(Err(CacheError::LoaderError("boom".into())));
        let result = Coordinator::wait(&mut waiter_rx).await.unwrap();
        assert!(result.is_err());

        // Ticket is gone: the next reserve starts a brand new loader run.
        assert_eq!(coordinator.in_flight_count(), 0);
        match coordinator.reserve(b"k") {
            Reservation::Initiator(guard) => guard.cancel(),
            Reservation::Waiter(_) => panic!("error must not be cached as an in-flight ticket"),
        }
    }

    #[tokio::test]
    async fn cancelled_initiator_lets_a_waiter_become_the_new_initiator() {
        let coordinator = Coordinator::new();

        let mut waiter_rx = match coordinator.reserve(b"k") {
            Reservation::Initiator(guard) => {
                let waiter_rx = match coordinator.reserve(b"k") {
                    Reservation::Waiter(rx) => rx,
                    Reservation::Initiator(_) => panic!("expected waiter"),
                };
                guard.cancel();
                waiter_rx
            }
            Reservation::Waiter(_) => panic!("expected initiator first"),
        };

        // The cancelled ticket resolves to nothing for the existing waiter.
        assert!(Coordinator::wait(&mut waiter_rx).await.is_none());

        // Reserving again promotes this caller to initiator.
        match coordinator.reserve(b"k") {
            Reservation::Initiator(guard) => guard.complete(Ok(outcome(1))),
            Reservation::Waiter(_) => panic!("expected promotion to initiator"),
        }
    }
}

//! Correlation ids and the pending-call table.
//!
//! The [`CorrelationTable`] is the single serialization point between caller
//! tasks (which register and cancel pending calls) and the reply listener
//! (which resolves them). All three operations are O(1) map work under one
//! mutex; nothing blocks or performs I/O while the lock is held.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::{Result, RpcError};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// The protected state is a best-effort pending-call map; there are no
/// invariants spanning multiple fields, and the worst outcome of a poisoned
/// lock is a dropped or unmatched reply. Connection-level failures are
/// handled by the transport layer.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Unique correlation identifier used to match requests with replies.
///
/// Correlation ids are opaque to the transport layer and round-trip
/// byte-for-byte through a full send/receive cycle. Generated ids are
/// UUIDv4-backed and independent of payload content, so repeated payloads
/// never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a new unique correlation ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the correlation ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct PendingCall {
    // ---
    /// Single-assignment slot; transitions exactly once to a reply, or is
    /// dropped on cancellation so the waiter observes a closed channel.
    slot: oneshot::Sender<Bytes>,
    registered_at: Instant,
}

/// Registry of in-flight calls awaiting replies.
///
/// Invariants:
/// - at most one entry per correlation id (`register` rejects duplicates);
/// - removal is idempotent: the race between timeout-driven `cancel` and
///   listener-driven `resolve` is settled by whichever removes the entry
///   first, the loser observes "not found" and does nothing further;
/// - at most one reply is ever delivered per id, because delivery removes
///   the entry atomically.
pub(crate) struct CorrelationTable {
    pending: Mutex<HashMap<CorrelationId, PendingCall>>,
}

impl CorrelationTable {
    // ---

    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new pending call and return the receiver to wait on.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::DuplicateCorrelationId`] if the id is already
    /// registered. Only the offending call fails.
    pub fn register(&self, id: CorrelationId) -> Result<oneshot::Receiver<Bytes>> {
        // ---
        let (tx, rx) = oneshot::channel();

        let mut pending = lock_ignore_poison(&self.pending);
        match pending.entry(id) {
            Entry::Occupied(occupied) => {
                Err(RpcError::DuplicateCorrelationId(occupied.key().clone()))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PendingCall {
                    slot: tx,
                    registered_at: Instant::now(),
                });
                Ok(rx)
            }
        }
    }

    /// Deliver a reply into the matching pending call, waking its waiter.
    ///
    /// Returns `false` when no entry exists for `id` — the normal case for
    /// a reply arriving after the caller timed out, or a duplicate delivery.
    ///
    /// Delivery happens while the table lock is held, so a concurrent
    /// `cancel` that observes "not found" can rely on the reply already
    /// being in the slot.
    pub fn resolve(&self, id: &CorrelationId, payload: Bytes) -> bool {
        // ---
        let mut pending = lock_ignore_poison(&self.pending);
        match pending.remove(id) {
            Some(call) => {
                let _waited = call.registered_at.elapsed();
                if call.slot.send(payload).is_err() {
                    crate::log_debug!(
                        "reply for {id} arrived after the caller went away ({_waited:?})"
                    );
                }
                true
            }
            None => false,
        }
    }

    /// Remove a pending call without delivering a reply.
    ///
    /// Dropping the slot makes an abandoned waiter observe a closed channel.
    /// Idempotent: cancelling an id that is no longer present returns
    /// `false` and is not an error.
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        // ---
        lock_ignore_poison(&self.pending).remove(id).is_some()
    }

    /// Drop every pending call. Waiters observe `Cancelled`.
    ///
    /// Used on client shutdown.
    pub fn cancel_all(&self) {
        // ---
        lock_ignore_poison(&self.pending).clear();
    }

    /// Number of calls currently awaiting a reply.
    pub fn len(&self) -> usize {
        // ---
        lock_ignore_poison(&self.pending).len()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_generate_unique() {
        // ---
        let id1 = CorrelationId::generate();
        let id2 = CorrelationId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_register_and_resolve() {
        // ---
        let table = CorrelationTable::new();
        let id = CorrelationId::generate();

        let rx = table.register(id.clone()).unwrap();
        assert_eq!(table.len(), 1);

        let payload = Bytes::from("test reply");
        assert!(table.resolve(&id, payload.clone()));

        // Removed on first match; a duplicate delivery finds nothing.
        assert_eq!(table.len(), 0);
        assert!(!table.resolve(&id, payload.clone()));

        let received = rx.blocking_recv().unwrap();
        assert_eq!(received, payload);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        // ---
        let table = CorrelationTable::new();
        let id = CorrelationId::from("fixed-id");

        let _rx = table.register(id.clone()).unwrap();
        match table.register(id.clone()) {
            Err(RpcError::DuplicateCorrelationId(dup)) => assert_eq!(dup, id),
            other => panic!("expected DuplicateCorrelationId, got {other:?}"),
        }

        // The original entry is untouched.
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        // ---
        let table = CorrelationTable::new();
        let id = CorrelationId::generate();

        let rx = table.register(id.clone()).unwrap();
        assert!(table.cancel(&id));
        assert!(!table.cancel(&id));
        assert_eq!(table.len(), 0);

        // Cancelled waiter observes a closed channel, not a reply.
        assert!(rx.blocking_recv().is_err());

        // A reply racing in after cancellation is a no-op.
        assert!(!table.resolve(&id, Bytes::from("late")));
    }

    #[test]
    fn test_resolve_unknown_id() {
        // ---
        let table = CorrelationTable::new();
        assert!(!table.resolve(&CorrelationId::generate(), Bytes::from("stray")));
    }

    #[test]
    fn test_cancel_all() {
        // ---
        let table = CorrelationTable::new();
        let rx1 = table.register(CorrelationId::generate()).unwrap();
        let rx2 = table.register(CorrelationId::generate()).unwrap();
        assert_eq!(table.len(), 2);

        table.cancel_all();
        assert_eq!(table.len(), 0);
        assert!(rx1.blocking_recv().is_err());
        assert!(rx2.blocking_recv().is_err());
    }
}

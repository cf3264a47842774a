//! Pending-call table of a session.
//!
//! Every entry is resolved exactly once. Whoever removes it from the map
//! (a matching response, the caller's timeout, or the session closing) owns
//! the completion; everyone else finds nothing and backs off.

use crate::error::RpcError;
use crate::message::{AnyMessage, MessageTag};
use crate::pool::Pooled;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::oneshot;
use tracing::debug;

/// What a pending call resolves to.
pub type Completion = Result<Pooled<dyn AnyMessage>, RpcError>;

/// A call waiting for its response.
#[derive(Debug)]
struct RpcInfo {
    request: MessageTag,
    completion: oneshot::Sender<Completion>,
}

/// Request id to pending call.
#[derive(Debug)]
pub struct CorrelationTable {
    pending: DashMap<u32, RpcInfo>,
    last_id: AtomicU32,
}

impl CorrelationTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_after(0)
    }

    /// Create an empty table whose first id is `last + 1`.
    #[must_use]
    pub fn starting_after(last: u32) -> Self {
        Self {
            pending: DashMap::new(),
            last_id: AtomicU32::new(last),
        }
    }

    /// Register a new pending call and return its id.
    ///
    /// Ids increase with wraparound. `0` is never handed out, and neither is
    /// an id still held by an older pending call.
    pub fn register(&self, request: MessageTag) -> (u32, oneshot::Receiver<Completion>) {
        let (completion, rx) = oneshot::channel();
        let mut info = Some(RpcInfo {
            request,
            completion,
        });

        loop {
            let id = self.last_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id == 0 {
                continue;
            }
            match self.pending.entry(id) {
                Entry::Occupied(_) => {
                    debug!(rid = id, "Request id still pending, skipping");
                }
                Entry::Vacant(slot) => {
                    if let Some(info) = info.take() {
                        slot.insert(info);
                    }
                    return (id, rx);
                }
            }
        }
    }

    /// Resolve a pending call with its response.
    ///
    /// Returns the response back if no call is waiting for it (unknown or
    /// already timed out id, or the caller went away).
    pub fn resolve(
        &self,
        rid: u32,
        response: Pooled<dyn AnyMessage>,
    ) -> Option<Pooled<dyn AnyMessage>> {
        let Some((_, info)) = self.pending.remove(&rid) else {
            return Some(response);
        };
        match info.completion.send(Ok(response)) {
            Ok(()) => None,
            Err(unclaimed) => unclaimed.ok(),
        }
    }

    /// Withdraw a pending call. Returns `false` if it was already resolved.
    pub fn cancel(&self, rid: u32) -> bool {
        self.pending.remove(&rid).is_some()
    }

    /// Fail every pending call.
    pub fn fail_all(&self, error: &RpcError) {
        let ids: Vec<u32> = self.pending.iter().map(|entry| *entry.key()).collect();
        for rid in ids {
            if let Some((_, info)) = self.pending.remove(&rid) {
                debug!(rid, request = info.request, "Failing pending call: {error}");
                let _ = info.completion.send(Err(error.clone()));
            }
        }
    }

    /// Whether `rid` is pending.
    #[must_use]
    pub fn contains(&self, rid: u32) -> bool {
        self.pending.contains_key(&rid)
    }

    /// Number of pending calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, Ping};

    fn pong(rid: u32) -> Pooled<dyn AnyMessage> {
        let mut ping = Ping::default();
        ping.header.rid = rid;
        Pooled::new(ping).erase()
    }

    #[tokio::test]
    async fn test_resolve_completes_once() {
        let table = CorrelationTable::new();
        let (rid, rx) = table.register(Ping::TAG);
        assert_eq!(rid, 1);
        assert!(table.contains(rid));

        assert!(table.resolve(rid, pong(rid)).is_none());
        assert!(table.is_empty());

        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.rpc_header().unwrap().rid, rid);

        // A duplicate or late response finds nothing.
        assert!(table.resolve(rid, pong(rid)).is_some());
        assert!(!table.cancel(rid));
    }

    #[tokio::test]
    async fn test_fail_all_cancels_every_call() {
        let table = CorrelationTable::new();
        let receivers: Vec<_> = (0..5).map(|_| table.register(Ping::TAG).1).collect();
        assert_eq!(table.len(), 5);

        table.fail_all(&RpcError::Cancelled);
        table.fail_all(&RpcError::Cancelled);
        assert!(table.is_empty());

        for rx in receivers {
            assert!(matches!(rx.await.unwrap(), Err(RpcError::Cancelled)));
        }
    }

    #[test]
    fn test_ids_wrap_and_skip_zero() {
        let table = CorrelationTable::starting_after(u32::MAX - 1);
        let (first, _rx1) = table.register(Ping::TAG);
        let (second, _rx2) = table.register(Ping::TAG);
        assert_eq!(first, u32::MAX);
        assert_eq!(second, 1);
    }

    #[test]
    fn test_ids_skip_pending_calls() {
        let table = CorrelationTable::starting_after(u32::MAX - 1);
        let (long_lived, _rx) = table.register(Ping::TAG);
        assert_eq!(long_lived, u32::MAX);

        // Force the counter around so the next candidate collides.
        table.last_id.store(u32::MAX - 1, Ordering::Relaxed);
        let (next, _rx2) = table.register(Ping::TAG);
        assert_eq!(next, 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_dropped_caller_returns_response() {
        let table = CorrelationTable::new();
        let (rid, rx) = table.register(Ping::TAG);
        drop(rx);

        assert!(table.resolve(rid, pong(rid)).is_some());
        assert!(table.is_empty());
    }
}

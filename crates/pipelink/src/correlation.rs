//! Correlation table - rendezvous between the ingress path and the egress path.
//!
//! Ingress registers a pending entry keyed by request id, sends the frame, and
//! waits on the returned [`PendingResult`]. The egress listener resolves the
//! entry when the matching frame comes back. Both sides touch the map only
//! under one mutex, and never across an await.
//!
//! Each entry remembers the route (outbound connection epoch) its frame was
//! sent on, so a broken connection fails exactly the requests it was carrying.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::bridge::protocol::RequestId;
use crate::error::RelayError;

/// What a pending entry is fulfilled with.
pub type Outcome = Result<Bytes, RelayError>;

/// Connection epoch a request was sent on.
pub type RouteId = u64;

struct PendingEntry {
    tx: oneshot::Sender<Outcome>,
    route: RouteId,
    registered_at: Instant,
}

/// Map from request id to the sender half of its pending result.
#[derive(Default)]
pub struct CorrelationTable {
    pending: Mutex<HashMap<RequestId, PendingEntry>>,
}

impl CorrelationTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, PendingEntry>> {
        // Entries are plain data; a panic elsewhere leaves the map consistent.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create and store a pending entry for `id`.
    pub fn register(
        self: &Arc<Self>,
        id: RequestId,
        route: RouteId,
    ) -> Result<PendingResult, RelayError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.lock();
            if pending.contains_key(&id) {
                return Err(RelayError::DuplicateRequest(id));
            }
            pending.insert(
                id,
                PendingEntry {
                    tx,
                    route,
                    registered_at: Instant::now(),
                },
            );
        }
        tracing::debug!(request_id = %id, route, "Registered pending request");

        Ok(PendingResult {
            id,
            rx: Some(rx),
            table: Arc::clone(self),
            armed: true,
        })
    }

    /// Remove the entry for `id` and fulfil it with `outcome`.
    ///
    /// Resolving an unknown id is an error and leaves every other entry alone.
    pub fn resolve(&self, id: RequestId, outcome: Outcome) -> Result<(), RelayError> {
        let mut pending = self.lock();
        let entry = pending.remove(&id).ok_or(RelayError::NoSuchRequest(id))?;

        let ok = outcome.is_ok();
        // Sent under the lock: once an entry is gone from the map its outcome
        // is already in the channel. PendingResult::wait relies on this.
        if entry.tx.send(outcome).is_err() {
            tracing::debug!(request_id = %id, "Waiter dropped before result arrived");
        }
        drop(pending);

        tracing::debug!(
            request_id = %id,
            ok,
            elapsed_ms = entry.registered_at.elapsed().as_millis() as u64,
            "Resolved pending request"
        );
        Ok(())
    }

    /// Fail every entry sent on `route`. Returns how many were failed.
    pub fn fail_route(&self, route: RouteId, error: RelayError) -> usize {
        let mut pending = self.lock();
        let ids: Vec<RequestId> = pending
            .iter()
            .filter(|(_, entry)| entry.route == route)
            .map(|(id, _)| *id)
            .collect();

        for id in &ids {
            if let Some(entry) = pending.remove(id) {
                let _ = entry.tx.send(Err(error.clone()));
            }
        }
        drop(pending);

        if !ids.is_empty() {
            tracing::warn!(route, failed = ids.len(), error = %error, "Failed pending requests on route");
        }
        ids.len()
    }

    /// Fail every pending entry regardless of route.
    pub fn fail_all(&self, error: RelayError) -> usize {
        let drained: Vec<(RequestId, PendingEntry)> = self.lock().drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.tx.send(Err(error.clone()));
        }
        if count > 0 {
            tracing::warn!(failed = count, error = %error, "Failed all pending requests");
        }
        count
    }

    fn remove(&self, id: RequestId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Receiver side of one pending entry.
///
/// Dropping it before the result arrives removes the entry from the table, so
/// an abandoned caller (e.g. a closed HTTP connection) does not leak one.
pub struct PendingResult {
    id: RequestId,
    rx: Option<oneshot::Receiver<Outcome>>,
    table: Arc<CorrelationTable>,
    armed: bool,
}

impl PendingResult {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the entry to be resolved.
    ///
    /// `None` waits forever. With a deadline the entry is removed on expiry and
    /// the caller gets [`RelayError::Timeout`]; a resolve that lands after that
    /// finds no entry and is reported to the resolver instead.
    pub async fn wait(mut self, timeout: Option<Duration>) -> Outcome {
        let Some(mut rx) = self.rx.take() else {
            return Err(RelayError::Abandoned);
        };

        let received = match timeout {
            None => (&mut rx).await,
            Some(limit) => match tokio::time::timeout(limit, &mut rx).await {
                Ok(received) => received,
                Err(_) => return self.expire(rx, limit),
            },
        };

        self.armed = false;
        received.unwrap_or(Err(RelayError::Abandoned))
    }

    /// Deadline passed. Whichever side removes the entry first decides the outcome.
    fn expire(&mut self, mut rx: oneshot::Receiver<Outcome>, limit: Duration) -> Outcome {
        self.armed = false;
        if self.table.remove(self.id) {
            tracing::warn!(
                request_id = %self.id,
                timeout_ms = limit.as_millis() as u64,
                "Timed out waiting for result"
            );
            return Err(RelayError::Timeout);
        }
        // A resolver removed the entry first; its outcome is already queued.
        rx.try_recv().unwrap_or(Err(RelayError::Abandoned))
    }
}

impl Drop for PendingResult {
    fn drop(&mut self) {
        if self.armed && self.table.remove(self.id) {
            tracing::debug!(request_id = %self.id, "Pending request dropped before completion");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn register_then_resolve_delivers_payload() {
        let table = CorrelationTable::new();
        let id = RequestId::new();

        let pending = table.register(id, 0).unwrap();
        assert_eq!(table.len(), 1);

        table.resolve(id, Ok(payload("result"))).unwrap();
        assert!(table.is_empty());

        assert_eq!(pending.wait(None).await.unwrap(), payload("result"));
    }

    #[tokio::test]
    async fn resolve_with_error_propagates() {
        let table = CorrelationTable::new();
        let id = RequestId::new();
        let pending = table.register(id, 0).unwrap();

        table
            .resolve(id, Err(RelayError::Frame("corrupt".to_string())))
            .unwrap();

        assert_eq!(
            pending.wait(None).await.unwrap_err(),
            RelayError::Frame("corrupt".to_string())
        );
    }

    #[tokio::test]
    async fn duplicate_register_is_rejected() {
        let table = CorrelationTable::new();
        let id = RequestId::new();
        let _pending = table.register(id, 0).unwrap();

        assert!(matches!(
            table.register(id, 0),
            Err(RelayError::DuplicateRequest(dup)) if dup == id
        ));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn resolving_unknown_id_is_an_error_and_leaves_others() {
        let table = CorrelationTable::new();
        let known = RequestId::new();
        let pending = table.register(known, 0).unwrap();

        let stranger = RequestId::new();
        assert_eq!(
            table.resolve(stranger, Ok(payload("x"))),
            Err(RelayError::NoSuchRequest(stranger))
        );
        assert!(table.contains(known));

        table.resolve(known, Ok(payload("mine"))).unwrap();
        assert_eq!(pending.wait(None).await.unwrap(), payload("mine"));
    }

    #[tokio::test]
    async fn second_resolve_of_same_id_is_reported() {
        let table = CorrelationTable::new();
        let id = RequestId::new();
        let _pending = table.register(id, 0).unwrap();

        table.resolve(id, Ok(payload("first"))).unwrap();
        assert_eq!(
            table.resolve(id, Ok(payload("second"))),
            Err(RelayError::NoSuchRequest(id))
        );
    }

    #[tokio::test]
    async fn concurrent_waiters_get_their_own_results() {
        let table = CorrelationTable::new();
        let n = 32;

        let mut ids = Vec::with_capacity(n);
        let mut tasks = Vec::with_capacity(n);
        for _ in 0..n {
            let id = RequestId::new();
            let pending = table.register(id, 0).unwrap();
            ids.push(id);
            tasks.push(tokio::spawn(async move { pending.wait(None).await }));
        }

        // Resolve in a scrambled order: odd indices backwards, then even ones.
        let order: Vec<usize> = (0..n)
            .rev()
            .filter(|i| i % 2 == 1)
            .chain((0..n).filter(|i| i % 2 == 0))
            .collect();
        for i in order {
            table.resolve(ids[i], Ok(payload(&ids[i].to_string()))).unwrap();
        }

        for (id, task) in ids.iter().zip(tasks) {
            let result = task.await.unwrap().unwrap();
            assert_eq!(result, payload(&id.to_string()));
        }
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn timeout_removes_entry() {
        let table = CorrelationTable::new();
        let id = RequestId::new();
        let pending = table.register(id, 0).unwrap();

        let err = pending
            .wait(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Timeout);
        assert!(!table.contains(id));

        // A late result finds nothing to resolve.
        assert_eq!(
            table.resolve(id, Ok(payload("late"))),
            Err(RelayError::NoSuchRequest(id))
        );
    }

    #[tokio::test]
    async fn result_before_deadline_wins() {
        let table = CorrelationTable::new();
        let id = RequestId::new();
        let pending = table.register(id, 0).unwrap();

        table.resolve(id, Ok(payload("fast"))).unwrap();
        let result = pending.wait(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(result, payload("fast"));
    }

    #[tokio::test]
    async fn dropping_pending_result_removes_entry() {
        let table = CorrelationTable::new();
        let id = RequestId::new();

        {
            let _pending = table.register(id, 0).unwrap();
            assert!(table.contains(id));
        }

        assert!(!table.contains(id));
    }

    #[tokio::test]
    async fn fail_route_only_touches_that_route() {
        let table = CorrelationTable::new();
        let old_a = table.register(RequestId::new(), 1).unwrap();
        let old_b = table.register(RequestId::new(), 1).unwrap();
        let current_id = RequestId::new();
        let current = table.register(current_id, 2).unwrap();

        assert_eq!(table.fail_route(1, RelayError::ConnectionClosed), 2);
        assert_eq!(table.len(), 1);

        assert_eq!(old_a.wait(None).await.unwrap_err(), RelayError::ConnectionClosed);
        assert_eq!(old_b.wait(None).await.unwrap_err(), RelayError::ConnectionClosed);

        table.resolve(current_id, Ok(payload("ok"))).unwrap();
        assert_eq!(current.wait(None).await.unwrap(), payload("ok"));
    }

    #[tokio::test]
    async fn fail_all_drains_table() {
        let table = CorrelationTable::new();
        let a = table.register(RequestId::new(), 1).unwrap();
        let b = table.register(RequestId::new(), 7).unwrap();

        assert_eq!(table.fail_all(RelayError::ConnectionClosed), 2);
        assert!(table.is_empty());
        assert!(a.wait(None).await.is_err());
        assert!(b.wait(None).await.is_err());
    }

    #[test]
    fn result_resolved_at_the_deadline_is_still_delivered() {
        let table = CorrelationTable::new();
        let id = RequestId::new();
        let mut pending = table.register(id, 1).unwrap();
        let rx = pending.rx.take().unwrap();

        // The resolver wins the race for the entry just as the deadline fires.
        table.resolve(id, Ok(payload("late"))).unwrap();
        let outcome = pending.expire(rx, Duration::from_millis(10));

        assert_eq!(outcome.unwrap(), payload("late"));
        assert!(table.is_empty());
    }

    #[test]
    fn expiry_that_wins_the_race_times_out() {
        let table = CorrelationTable::new();
        let id = RequestId::new();
        let mut pending = table.register(id, 1).unwrap();
        let rx = pending.rx.take().unwrap();

        assert_eq!(
            pending.expire(rx, Duration::from_millis(10)).unwrap_err(),
            RelayError::Timeout
        );
        assert!(table.is_empty());
        assert_eq!(
            table.resolve(id, Ok(payload("too late"))).unwrap_err(),
            RelayError::NoSuchRequest(id)
        );
    }
}

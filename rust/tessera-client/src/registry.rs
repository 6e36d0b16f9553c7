//! In-flight request registry and the send-permit pool.
//!
//! The registry maps client handles to pending-request records. A handle
//! is present iff its promise is incomplete; whoever removes the handle
//! owns completion, which makes completion race-free between the response
//! path, the timeout scanner, and connection teardown.
//!
//! Admission checks the size before inserting, in that order. The check
//! and the insert are separate lock acquisitions, so a race can admit one
//! request over the hard cap; that transient is accepted.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tessera_wire::{ClientResponse, ProcedureInvocation};
use tokio::sync::oneshot;

use crate::connection::Connection;

/// Context for one in-progress procedure call.
pub(crate) struct RequestContext {
    /// Global admission sequence; FIFO tiebreak in the send queue.
    pub sequence: u64,
    pub invocation: ProcedureInvocation,
    pub start: Instant,
    pub timeout: Duration,
    /// The connection the router bound this request to.
    pub cxn: Arc<Connection>,
    /// Whether this request holds a global send permit.
    pub holds_permit: AtomicBool,
    completion: Mutex<Option<oneshot::Sender<ClientResponse>>>,
}

impl RequestContext {
    pub(crate) fn new(
        sequence: u64,
        invocation: ProcedureInvocation,
        timeout: Duration,
        cxn: Arc<Connection>,
        completion: oneshot::Sender<ClientResponse>,
    ) -> Self {
        Self {
            sequence,
            invocation,
            start: Instant::now(),
            timeout,
            cxn,
            holds_permit: AtomicBool::new(false),
            completion: Mutex::new(Some(completion)),
        }
    }

    /// Deliver the response. Only callers who removed the handle from the
    /// registry reach this; the take() makes a double call harmless.
    pub(crate) fn complete(&self, response: ClientResponse) {
        if let Some(tx) = self.completion.lock().unwrap().take() {
            let _ = tx.send(response);
        }
    }

    /// Time left until this request's budget expires.
    pub(crate) fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.start.elapsed())
    }
}

/// Handle-to-record map plus the active-handles set scanned by the
/// timeout tick.
#[derive(Default)]
pub(crate) struct Registry {
    map: Mutex<HashMap<i64, Arc<RequestContext>>>,
    active: Mutex<HashSet<i64>>,
    sequencer: AtomicU64,
}

impl Registry {
    pub(crate) fn next_sequence(&self) -> u64 {
        self.sequencer.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map.lock().unwrap().is_empty()
    }

    pub(crate) fn insert(&self, handle: i64, ctx: Arc<RequestContext>) {
        self.map.lock().unwrap().insert(handle, ctx);
    }

    pub(crate) fn get(&self, handle: i64) -> Option<Arc<RequestContext>> {
        self.map.lock().unwrap().get(&handle).cloned()
    }

    /// Remove the record prior to completion. Also drops the handle from
    /// the active set.
    pub(crate) fn remove(&self, handle: i64) -> Option<Arc<RequestContext>> {
        self.active.lock().unwrap().remove(&handle);
        self.map.lock().unwrap().remove(&handle)
    }

    /// Mark a handle as sent; the timeout scanner only looks at these.
    pub(crate) fn mark_active(&self, handle: i64) {
        self.active.lock().unwrap().insert(handle);
    }

    pub(crate) fn is_active(&self, handle: i64) -> bool {
        self.active.lock().unwrap().contains(&handle)
    }

    pub(crate) fn active_snapshot(&self) -> Vec<i64> {
        self.active.lock().unwrap().iter().copied().collect()
    }

    /// Records bound to a given connection, for teardown scans.
    pub(crate) fn bound_to(&self, conn_id: u64) -> Vec<(i64, Arc<RequestContext>)> {
        self.map
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, ctx)| ctx.cxn.conn_id == conn_id)
            .map(|(h, ctx)| (*h, ctx.clone()))
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.active.lock().unwrap().clear();
        self.map.lock().unwrap().clear();
    }
}

/// The global send-permit pool: a counting semaphore sized to the
/// outstanding-transaction limit, gating sends across all connections.
///
/// Permits are acquired-and-forgotten; release is explicit on a terminal
/// outcome of a sent request. That models a permit owned by a request
/// record rather than by a scope.
pub(crate) struct SendPermits {
    sem: Arc<tokio::sync::Semaphore>,
    limit: Mutex<usize>,
}

impl SendPermits {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            sem: Arc::new(tokio::sync::Semaphore::new(limit)),
            limit: Mutex::new(limit),
        }
    }

    pub(crate) fn try_acquire(&self) -> bool {
        match self.sem.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Acquire within `budget`; false when the budget is exhausted.
    pub(crate) async fn acquire_timeout(&self, budget: Duration) -> bool {
        if budget.is_zero() {
            return false;
        }
        match tokio::time::timeout(budget, self.sem.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                true
            }
            _ => false,
        }
    }

    pub(crate) fn release(&self) {
        self.sem.add_permits(1);
    }

    pub(crate) fn available(&self) -> usize {
        self.sem.available_permits()
    }

    pub(crate) fn limit(&self) -> usize {
        *self.limit.lock().unwrap()
    }

    /// Resize the pool, returning the new effective limit.
    ///
    /// Growing releases the difference. Shrinking drains whatever permits
    /// are currently available; if fewer could be drained than requested,
    /// the effective limit only drops by the drained count, temporarily
    /// over-committing until in-flight transactions complete.
    pub(crate) fn set_limit(&self, new_limit: usize) -> usize {
        let new_limit = new_limit.max(1);
        let mut limit = self.limit.lock().unwrap();
        let old = *limit;
        let mut effective = new_limit;
        if new_limit > old {
            self.sem.add_permits(new_limit - old);
        } else if new_limit < old {
            let want = old - new_limit;
            let mut drained = 0;
            while drained < want {
                match self.sem.try_acquire() {
                    Ok(permit) => {
                        permit.forget();
                        drained += 1;
                    }
                    Err(_) => break,
                }
            }
            if drained < want {
                effective = old - drained;
            }
        }
        *limit = effective;
        effective
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permit_counts_are_conserved() {
        let permits = SendPermits::new(3);
        assert!(permits.try_acquire());
        assert!(permits.try_acquire());
        assert_eq!(permits.available(), 1);
        permits.release();
        assert_eq!(permits.available(), 2);
        permits.release();
        assert_eq!(permits.available(), 3);
        assert_eq!(permits.limit(), 3);
    }

    #[test]
    fn growing_the_limit_releases_permits() {
        let permits = SendPermits::new(2);
        assert_eq!(permits.set_limit(5), 5);
        assert_eq!(permits.available(), 5);
    }

    #[test]
    fn shrinking_drains_available_permits() {
        let permits = SendPermits::new(5);
        assert_eq!(permits.set_limit(2), 2);
        assert_eq!(permits.available(), 2);
    }

    #[test]
    fn shrink_below_in_use_only_drops_by_drained() {
        let permits = SendPermits::new(5);
        for _ in 0..4 {
            assert!(permits.try_acquire());
        }
        // One permit available; asking to shrink by three only drains one.
        assert_eq!(permits.set_limit(2), 4);
        assert_eq!(permits.available(), 0);
    }

    #[tokio::test]
    async fn acquire_timeout_expires() {
        let permits = SendPermits::new(1);
        assert!(permits.try_acquire());
        assert!(!permits.acquire_timeout(Duration::from_millis(20)).await);
        permits.release();
        assert!(permits.acquire_timeout(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn zero_budget_fails_immediately() {
        let permits = SendPermits::new(1);
        assert!(permits.try_acquire());
        assert!(!permits.acquire_timeout(Duration::ZERO).await);
    }
}

//! Routing: partition-leader affinity with round-robin fallback.
//!
//! The router reads one snapshot each of the hashinator, the procedure
//! map, and the partition-leader map per call; the topology manager swaps
//! those wholesale, so a call sees a consistent view without locks on the
//! hot path.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tessera_wire::{ProcedureInvocation, MP_INIT_PID, NO_PARTITION};

use crate::client::ClientInner;
use crate::connection::Connection;
use crate::topology::ProcInfo;

impl ClientInner {
    /// Pick a connection for an invocation, preferring the partition
    /// leader and falling back to round-robin. Bumps affinity counters as
    /// a side effect. `None` means no connection to the cluster.
    pub(crate) fn find_connection(&self, invocation: &ProcedureInvocation) -> Option<Arc<Connection>> {
        let proc_info = self.proc_info.read().unwrap().clone();
        let info = proc_info.get(invocation.proc_name());
        let read_only = info.map(|i| i.read_only).unwrap_or(false);
        let hashinator = self.hashinator.read().unwrap().clone();

        let mut hashed_partition = NO_PARTITION;
        if invocation.has_partition_destination() {
            hashed_partition = invocation.partition_destination();
        } else if let (Some(hashi), Some(info)) = (hashinator.as_ref(), info) {
            hashed_partition = hash_partition(hashi, info, invocation);
        }

        let mut by_affinity = true;
        let leaders = self.partition_leaders.read().unwrap().clone();
        let mut cxn = leaders.get(&hashed_partition).cloned();
        if cxn.as_ref().map(|c| !c.is_connected()).unwrap_or(true) {
            cxn = self.find_cxn_by_round_robin();
            by_affinity = false;
        }

        if cxn.is_some() && hashed_partition != NO_PARTITION {
            self.bump_affinity_stats(hashed_partition, read_only, by_affinity);
        }
        cxn
    }

    /// Round-robin selection over a snapshot of the connection list.
    /// Two passes: the first prefers connections without network
    /// backpressure, the second takes any connected endpoint. The shared
    /// cursor is advanced racily; it is only a hint.
    fn find_cxn_by_round_robin(&self) -> Option<Arc<Connection>> {
        let list = self.connection_list.read().unwrap().clone();
        let count = list.len();
        if count == 0 {
            return None;
        }
        for pass in 0..2 {
            for _ in 0..count {
                let n = (self.next_connection.load(Ordering::Relaxed) + 1) % count;
                self.next_connection.store(n, Ordering::Relaxed);
                let cxn = &list[n];
                if cxn.is_connected() && (pass > 0 || !cxn.has_backpressure()) {
                    return Some(cxn.clone());
                }
            }
        }
        None
    }

    fn bump_affinity_stats(&self, partition: i32, read_only: bool, by_affinity: bool) {
        let mut stats = self.affinity_stats.lock().unwrap();
        stats.entry(partition).or_default().bump(by_affinity, read_only);
    }
}

/// Hash a single-partition invocation to its partition, or the
/// multi-partition id when the procedure (or its parameter index) says
/// the call cannot be single-partition routed.
fn hash_partition(
    hashinator: &tessera_wire::Hashinator,
    info: &ProcInfo,
    invocation: &ProcedureInvocation,
) -> i32 {
    match info.partition_parameter {
        Some(index) if (index as usize) < invocation.passed_param_count() => {
            match invocation.params() {
                Ok(params) => match params.get(index as usize) {
                    Some(value) => hashinator.partition_for(info.parameter_type, value),
                    None => MP_INIT_PID,
                },
                Err(_) => MP_INIT_PID,
            }
        }
        Some(_) => MP_INIT_PID,
        None => MP_INIT_PID,
    }
}

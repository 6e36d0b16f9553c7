//! Per-connection send pipeline.
//!
//! The hottest loop in the client. Each iteration dequeues the
//! highest-priority request, paces it through the optional rate limiter,
//! serializes it, acquires a global send permit, waits out network
//! backpressure, arms timeout bookkeeping, and hands the bytes to the
//! connection. Every wait is bounded by the request's remaining budget.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tessera_wire::ProcedureInvocation;
use tracing::trace;

use crate::client::ClientInner;
use crate::connection::Connection;

const ONE_SECOND: Duration = Duration::from_secs(1);

pub(crate) async fn connection_worker(inner: Arc<ClientInner>, cxn: Arc<Connection>) {
    while cxn.is_connected() {
        // Dequeue, blocking while the queue is empty. Teardown wakes us.
        let entry = loop {
            if let Some(entry) = cxn.queue.try_pop() {
                break Some(entry);
            }
            if !cxn.is_connected() {
                break None;
            }
            cxn.queue.wait().await;
        };
        let Some(entry) = entry else { break };

        // A request that timed out while queued has already been removed
        // from the registry; nothing left to do for it.
        let Some(ctx) = inner.registry.get(entry.handle) else {
            continue;
        };

        if let Some(limiter) = &inner.rate_limiter {
            limiter.pace().await;
        }

        let buf = match serialize_invocation(&ctx.invocation) {
            Ok(buf) => buf,
            Err(e) => {
                inner.complete_request_on_local_failure(&ctx, false, &e.to_string());
                continue;
            }
        };

        // Global send permit: cheap try first, then wait out the budget.
        if !inner.permits.try_acquire() {
            let remaining = ctx.remaining();
            if !inner.permits.acquire_timeout(remaining).await {
                inner.complete_request_on_local_failure(
                    &ctx,
                    true,
                    "Procedure call timed out before sending",
                );
                continue;
            }
        }
        ctx.holds_permit.store(true, Ordering::SeqCst);

        // The request may have been completed (teardown, timeout) while
        // we waited for the permit. A remover that ran before the store
        // above could not release the permit, so release it here; the
        // swap in release_permit keeps this single-release either way.
        if inner.registry.get(entry.handle).is_none() {
            inner.release_permit(&ctx);
            continue;
        }

        if !cxn.clear_to_send(ctx.start, ctx.timeout).await {
            inner.complete_request_on_local_failure(
                &ctx,
                true,
                "Procedure call timed out before sending",
            );
            continue;
        }

        inner.registry.mark_active(entry.handle);

        // Sub-second timeouts get a dedicated one-shot task; the budget is
        // re-checked here because the permit or backpressure waits above
        // may have consumed it entirely.
        if ctx.timeout < ONE_SECOND && inner.short_timeout_expired(&ctx) {
            inner.complete_request_on_local_failure(
                &ctx,
                true,
                "Procedure call timed out before sending",
            );
            continue;
        }

        trace!(
            handle = entry.handle,
            proc = ctx.invocation.proc_name(),
            priority = entry.priority,
            "sending invocation"
        );
        cxn.write_to_network(buf);
    }
    cxn.queue.clear();
}

/// Serialize as a length-prefixed frame: 4-byte big-endian length, then
/// the version-2 invocation body.
pub(crate) fn serialize_invocation(
    invocation: &ProcedureInvocation,
) -> Result<Bytes, tessera_wire::WireError> {
    let size = invocation.serialized_size()?;
    let mut buf = BytesMut::with_capacity(4 + size);
    buf.put_i32(size as i32);
    invocation.write_to(&mut buf)?;
    debug_assert_eq!(buf.len(), 4 + size);
    Ok(buf.freeze())
}

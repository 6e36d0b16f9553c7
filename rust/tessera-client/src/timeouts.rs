//! Timeout scanning and connection keepalives.
//!
//! A single once-per-second tick handles coarse timeouts: it pings quiet
//! connections, tears down connections whose ping went unanswered, and
//! expires sent requests whose budget ran out. Requests with sub-second
//! budgets get a dedicated one-shot task armed by the send pipeline, since
//! a 1 s scan cannot honor them.

use std::sync::Arc;
use std::time::Duration;

use tessera_wire::ParamValue;
use tracing::debug;

use crate::client::ClientInner;
use crate::registry::RequestContext;

/// Procedures expected to run long, exempt from the normal timeout until
/// the long-op floor is reached.
const LONG_OP_MINIMUM: Duration = Duration::from_secs(30 * 60);

pub(crate) fn is_long_op(proc_name: &str) -> bool {
    proc_name.starts_with('@')
        && (proc_name == "@UpdateApplicationCatalog" || proc_name == "@SnapshotSave")
}

pub(crate) async fn timeout_ticker(inner: Arc<ClientInner>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        if inner.is_shutdown() {
            break;
        }
        run_tick(&inner);
    }
}

fn run_tick(inner: &Arc<ClientInner>) {
    let response_timeout = inner.connection_response_timeout;

    // Keepalive handling per connection.
    let connections = inner.connection_list.read().unwrap().clone();
    for cxn in connections.iter() {
        let since_last = Duration::from_nanos(cxn.nanos_since_last_response());

        // An unanswered ping past the response timeout means the
        // connection is dead; unregister it.
        if cxn.outstanding_ping.load(std::sync::atomic::Ordering::SeqCst)
            && since_last > response_timeout
        {
            inner.log_error(&format!(
                "Connection to {} port {} timed out",
                cxn.host, cxn.port
            ));
            inner.remove_connection(cxn);
            continue;
        }

        // Quiet for a third of the timeout: send a ping.
        if !cxn.outstanding_ping.load(std::sync::atomic::Ordering::SeqCst)
            && since_last > response_timeout / 3
        {
            cxn.outstanding_ping.store(true, std::sync::atomic::Ordering::SeqCst);
            let rx = inner.call_system_procedure(cxn, "@Ping", Vec::<ParamValue>::new());
            let ping_cxn = cxn.clone();
            tokio::spawn(async move {
                let _ = rx.await;
                ping_cxn
                    .outstanding_ping
                    .store(false, std::sync::atomic::Ordering::SeqCst);
            });
        }
    }

    // Expire sent requests whose budget ran out.
    let mut timed_out = 0;
    for handle in inner.registry.active_snapshot() {
        // A missing record means the request completed after the snapshot
        // was taken; drop any leftover active entry while we are here.
        let Some(ctx) = inner.registry.get(handle) else {
            inner.registry.remove(handle);
            continue;
        };
        let elapsed = ctx.start.elapsed();
        if elapsed > ctx.timeout {
            // Long-running operations keep their own generous floor.
            if !is_long_op(ctx.invocation.proc_name()) || elapsed >= LONG_OP_MINIMUM {
                inner.complete_request_on_timeout(&ctx, elapsed);
                timed_out += 1;
            }
        }
    }

    if timed_out > 0 {
        debug!(timed_out, "requests expired by timeout scan");
        if inner.request_backpressure_on() {
            inner.report_request_backpressure(false);
        }
    }
}

impl ClientInner {
    /// Sub-second timeout bookkeeping for one request about to be sent.
    ///
    /// Returns true when the budget already expired (caller fails the
    /// request); otherwise arms a one-shot task to expire exactly this
    /// request. Long-op procedures are exempt.
    pub(crate) fn short_timeout_expired(self: &Arc<Self>, ctx: &Arc<RequestContext>) -> bool {
        if is_long_op(ctx.invocation.proc_name()) {
            return false;
        }
        let remaining = ctx.remaining();
        if remaining.is_zero() {
            return true;
        }
        let inner = self.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            // Only act if the request is still in flight.
            if inner.registry.is_active(ctx.invocation.client_handle()) {
                inner.complete_request_on_timeout(&ctx, ctx.start.elapsed());
            }
        });
        false
    }
}

//! Response dispatch.
//!
//! Inbound frames arrive on connection read tasks; completions must never
//! run there, so frames are queued to a pool of response workers (default
//! four). Each worker decodes the response header, removes the matching
//! record from the registry, and completes it — or routes magic-handle
//! pushes to the topology machinery.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tessera_wire::{ClientResponse, ASYNC_PROC_HANDLE, ASYNC_TOPO_HANDLE, MAX_CLIENT_HANDLE};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::client::ClientInner;
use crate::connection::Connection;

/// One decoded-not-yet-processed frame.
pub(crate) struct InboundFrame {
    pub cxn: Arc<Connection>,
    pub body: Bytes,
    pub received: Instant,
}

/// Start the response-worker pool. Returns the submission side.
pub(crate) fn start_workers(
    inner: &Arc<ClientInner>,
    count: usize,
) -> mpsc::Sender<InboundFrame> {
    let (tx, rx) = mpsc::channel::<InboundFrame>(1024);
    let rx = Arc::new(Mutex::new(rx));
    for _ in 0..count {
        let worker_inner = inner.clone();
        let rx = rx.clone();
        inner.register_task(tokio::spawn(async move {
            loop {
                let frame = { rx.lock().await.recv().await };
                let Some(frame) = frame else { break };
                handle_response(&worker_inner, frame);
            }
        }));
    }
    tx
}

/// Decode and complete one response. Any panic-free failure here is
/// logged and dropped; a malformed frame must not take a worker down.
fn handle_response(inner: &Arc<ClientInner>, frame: InboundFrame) {
    let mut response = match ClientResponse::read_from(frame.body) {
        Ok(resp) => resp,
        Err(e) => {
            inner.log_error(&format!("undecodable response frame: {e}"));
            return;
        }
    };

    // Race with the timeout scanner to be the one that removes the
    // record; the winner completes the promise.
    let handle = response.client_handle();
    let context = inner.registry.remove(handle);

    if (0..=MAX_CLIENT_HANDLE).contains(&handle) {
        if let Some(ctx) = context {
            inner.release_permit(&ctx);

            let elapsed = frame
                .received
                .saturating_duration_since(ctx.start)
                .as_nanos()
                .max(1) as u64;
            response.set_client_roundtrip_ns(elapsed);

            let status = response.status();
            let abort = status.is_abort();
            let fail = !abort && !status.is_success();
            ctx.cxn
                .update_stats(ctx.invocation.proc_name(), elapsed, abort, fail, false);
            if abort || fail {
                debug!(
                    proc = ctx.invocation.proc_name(),
                    status = %status,
                    "procedure completed unsuccessfully"
                );
            }
            ctx.complete(response);
        } else {
            // Late response for a request we already timed out. The
            // permit was released at timeout, so not here.
            inner.notify_late_response(&response, &frame.cxn);
        }
    } else if handle < 0 {
        // Internally-generated system call.
        match context {
            Some(ctx) => ctx.complete(response),
            None => inner.log_error("Late response to system procedure call"),
        }
    } else if handle == ASYNC_TOPO_HANDLE {
        debug!("received notification of topology change");
        inner.topo_stats_completion(Some(response));
    } else if handle == ASYNC_PROC_HANDLE {
        debug!("received notification of catalog change");
        inner.procedure_catalog_completion(Some(response));
    } else {
        warn!(handle, "notification with unexpected handle ignored");
    }

    // A completed request may let us exit request backpressure.
    if inner.request_backpressure_on() {
        inner.report_request_backpressure(false);
    }
}

//! Connection endpoints.
//!
//! One [`Connection`] per cluster node. The endpoint is a passive
//! resource: it owns the socket halves (via a read task and a writer
//! task), the per-connection send queue, the network-backpressure signal,
//! and per-procedure counters. Business logic lives in the runtime; the
//! endpoint only moves bytes.
//!
//! Outbound frames go through an unbounded channel to the writer task; the
//! queued-frame count drives the level-triggered backpressure signal. The
//! read task turns length-prefixed frames into dispatcher work items.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::client::ClientInner;
use crate::dispatcher::InboundFrame;
use crate::errors::ConnectError;
use crate::queue::SendQueue;
use crate::stats::ProcedureStats;

/// Upper bound on a single inbound frame; anything larger is treated as a
/// protocol error and tears the connection down.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Facts learned from the login exchange.
#[derive(Debug, Clone)]
pub(crate) struct LoginInfo {
    pub host_id: i32,
    pub connection_id: i64,
    pub cluster_timestamp: i64,
    pub leader_addr: i32,
    pub build_string: String,
}

/// A connected cluster node.
pub(crate) struct Connection {
    /// Client-local id, used to match registry records to endpoints.
    pub conn_id: u64,
    pub host: String,
    pub port: u16,
    pub host_id: i32,
    connected: AtomicBool,
    pub queue: SendQueue,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    queued_frames: AtomicUsize,
    backpressure_level: usize,
    backpressure: AtomicBool,
    backpressure_notify: Notify,
    /// Nanoseconds since the client epoch of the last inbound frame.
    pub last_response_ns: AtomicU64,
    pub outstanding_ping: AtomicBool,
    pub stats: Mutex<HashMap<String, ProcedureStats>>,
    epoch: Instant,
    read_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Connection {
    /// Wrap an authenticated stream: split it, start the writer and read
    /// tasks, and start the send worker.
    pub(crate) fn spawn(
        inner: &Arc<ClientInner>,
        stream: TcpStream,
        host: String,
        port: u16,
        login: &LoginInfo,
    ) -> Arc<Connection> {
        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let cxn = Arc::new(Connection {
            conn_id: inner.next_conn_id(),
            host,
            port,
            host_id: login.host_id,
            connected: AtomicBool::new(true),
            queue: SendQueue::default(),
            outbound_tx: Mutex::new(Some(outbound_tx)),
            queued_frames: AtomicUsize::new(0),
            backpressure_level: inner.network_backpressure_level,
            backpressure: AtomicBool::new(false),
            backpressure_notify: Notify::new(),
            last_response_ns: AtomicU64::new(inner.epoch.elapsed().as_nanos() as u64),
            outstanding_ping: AtomicBool::new(false),
            stats: Mutex::new(HashMap::new()),
            epoch: inner.epoch,
            read_task: Mutex::new(None),
        });

        debug!(
            conn_id = cxn.conn_id,
            host_id = cxn.host_id,
            server_cid = login.connection_id,
            host = %cxn.host,
            "connection registered"
        );
        tokio::spawn(writer_task(inner.clone(), cxn.clone(), write_half, outbound_rx));
        let reader = tokio::spawn(read_task(inner.clone(), cxn.clone(), read_half));
        *cxn.read_task.lock().unwrap() = Some(reader);
        tokio::spawn(crate::sender::connection_worker(inner.clone(), cxn.clone()));
        cxn
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// First teardown caller wins; later calls are no-ops.
    pub(crate) fn mark_disconnected(&self) -> bool {
        self.connected.swap(false, Ordering::SeqCst)
    }

    /// Close the outbound channel, stopping the writer task and releasing
    /// the socket's write half.
    pub(crate) fn close_outbound(&self) {
        self.outbound_tx.lock().unwrap().take();
    }

    pub(crate) fn abort_read(&self) {
        if let Some(task) = self.read_task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Hand a serialized frame to the writer. Raises network backpressure
    /// when the queued-frame count crosses the configured level; duplicate
    /// "on" transitions are idempotent.
    pub(crate) fn write_to_network(&self, buf: Bytes) {
        let tx = self.outbound_tx.lock().unwrap().clone();
        let Some(tx) = tx else { return };
        let queued = self.queued_frames.fetch_add(1, Ordering::SeqCst) + 1;
        if queued > self.backpressure_level {
            self.network_backpressure(true);
        }
        if tx.send(buf).is_err() {
            self.queued_frames.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Level-triggered backpressure signal. "off" wakes all waiters.
    pub(crate) fn network_backpressure(&self, state: bool) {
        self.backpressure.store(state, Ordering::SeqCst);
        if !state {
            self.backpressure_notify.notify_waiters();
        }
    }

    pub(crate) fn has_backpressure(&self) -> bool {
        self.backpressure.load(Ordering::SeqCst)
    }

    /// Wait until the connection is clear to send, bounded by the
    /// request's remaining budget. False means the budget ran out.
    pub(crate) async fn clear_to_send(&self, start: Instant, timeout: Duration) -> bool {
        loop {
            let waiter = self.backpressure_notify.notified();
            if !self.has_backpressure() {
                return true;
            }
            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return false;
            }
            let _ = tokio::time::timeout(remaining, waiter).await;
        }
    }

    pub(crate) fn touch_last_response(&self) {
        self.last_response_ns
            .store(self.epoch.elapsed().as_nanos() as u64, Ordering::SeqCst);
    }

    pub(crate) fn nanos_since_last_response(&self) -> u64 {
        let now = self.epoch.elapsed().as_nanos() as u64;
        now.saturating_sub(self.last_response_ns.load(Ordering::SeqCst)).max(1)
    }

    /// Update the per-procedure counters for one completed call.
    pub(crate) fn update_stats(
        &self,
        proc_name: &str,
        roundtrip_ns: u64,
        abort: bool,
        fail: bool,
        timeout: bool,
    ) {
        let mut stats = self.stats.lock().unwrap();
        stats
            .entry(proc_name.to_owned())
            .or_default()
            .update(roundtrip_ns, abort, fail, timeout);
    }

    pub(crate) fn stats_snapshot(&self) -> HashMap<String, ProcedureStats> {
        self.stats.lock().unwrap().clone()
    }
}

async fn writer_task(
    inner: Arc<ClientInner>,
    cxn: Arc<Connection>,
    mut write_half: OwnedWriteHalf,
    mut outbound_rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(buf) = outbound_rx.recv().await {
        if let Err(e) = write_half.write_all(&buf).await {
            debug!(conn_id = cxn.conn_id, error = %e, "connection write failed");
            inner.remove_connection(&cxn);
            return;
        }
        let queued = cxn.queued_frames.fetch_sub(1, Ordering::SeqCst) - 1;
        if cxn.has_backpressure() && queued <= cxn.backpressure_level {
            cxn.network_backpressure(false);
        }
    }
}

async fn read_task(inner: Arc<ClientInner>, cxn: Arc<Connection>, mut read_half: OwnedReadHalf) {
    loop {
        let mut len_buf = [0u8; 4];
        if read_half.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = i32::from_be_bytes(len_buf);
        if len <= 0 || len as usize > MAX_FRAME_BYTES {
            warn!(conn_id = cxn.conn_id, len, "bad inbound frame length");
            break;
        }
        let mut body = vec![0u8; len as usize];
        if read_half.read_exact(&mut body).await.is_err() {
            break;
        }
        cxn.touch_last_response();
        let frame = InboundFrame {
            cxn: cxn.clone(),
            body: Bytes::from(body),
            received: Instant::now(),
        };
        if inner.submit_response(frame).await.is_err() {
            break; // dispatcher gone, client is shutting down
        }
    }
    debug!(conn_id = cxn.conn_id, host = %cxn.host, "connection read loop ended");
    inner.remove_connection(&cxn);
}

// ============================================================================
// Login exchange
// ============================================================================

/// Open a socket and run the login exchange within the setup timeout.
pub(crate) async fn open_and_login(
    host: &str,
    port: u16,
    username: &str,
    password_hash: &[u8],
    setup_timeout: Duration,
) -> Result<(TcpStream, LoginInfo), ConnectError> {
    let fut = async {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        login(stream, username, password_hash).await
    };
    match tokio::time::timeout(setup_timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::SetupTimeout),
    }
}

async fn login(
    mut stream: TcpStream,
    username: &str,
    password_hash: &[u8],
) -> Result<(TcpStream, LoginInfo), ConnectError> {
    let mut body = BytesMut::new();
    body.put_u8(2); // protocol version
    put_prefixed(&mut body, b"database");
    put_prefixed(&mut body, username.as_bytes());
    put_prefixed(&mut body, password_hash);

    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_i32(body.len() as i32);
    frame.put_slice(&body);
    stream.write_all(&frame).await?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = i32::from_be_bytes(len_buf);
    if len <= 0 || len as usize > MAX_FRAME_BYTES {
        return Err(ConnectError::Handshake(format!("bad login frame length {len}")));
    }
    let mut resp = vec![0u8; len as usize];
    stream.read_exact(&mut resp).await?;
    let mut buf = Bytes::from(resp);

    if buf.remaining() < 2 {
        return Err(ConnectError::Handshake("short login response".into()));
    }
    let _version = buf.get_u8();
    let result = buf.get_i8();
    if result != 0 {
        return Err(ConnectError::Handshake(format!("login rejected, code {result}")));
    }
    if buf.remaining() < 4 + 8 + 8 + 4 + 4 {
        return Err(ConnectError::Handshake("short login response".into()));
    }
    let host_id = buf.get_i32();
    let connection_id = buf.get_i64();
    let cluster_timestamp = buf.get_i64();
    let leader_addr = buf.get_i32();
    let build_len = buf.get_i32();
    if build_len < 0 || buf.remaining() < build_len as usize {
        return Err(ConnectError::Handshake("short build string".into()));
    }
    let build_string = String::from_utf8(buf.split_to(build_len as usize).to_vec())
        .map_err(|_| ConnectError::Handshake("build string not UTF-8".into()))?;

    Ok((
        stream,
        LoginInfo {
            host_id,
            connection_id,
            cluster_timestamp,
            leader_addr,
            build_string,
        },
    ))
}

fn put_prefixed(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_i32(bytes.len() as i32);
    buf.put_slice(bytes);
}

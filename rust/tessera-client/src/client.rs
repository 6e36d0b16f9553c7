//! The client runtime and its public surface.
//!
//! [`Client`] is a cheap-clone handle over the shared runtime state
//! ([`ClientInner`]); background tasks (send workers, read tasks, response
//! workers, the timeout tick, topology tasks) all hold clones of the same
//! inner. Call admission never blocks on the network: it checks the hard
//! limit, picks a connection, records the request, and enqueues it for the
//! connection's send worker.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tessera_wire::{
    ClientResponse, Hashinator, ParamValue, ParameterSet, ProcedureInvocation, Status,
    MAX_CLIENT_HANDLE, NO_BATCH_TIMEOUT, NO_PARTITION, SYSTEM_PRIORITY,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace};

use crate::config::{ClientConfig, Notifications};
use crate::connection::{open_and_login, Connection};
use crate::dispatcher::InboundFrame;
use crate::errors::{CallError, ConnectError, ProcCallError};
use crate::queue::QueuedEntry;
use crate::ratelimit::RateLimiter;
use crate::registry::{Registry, RequestContext, SendPermits};
use crate::sender::serialize_invocation;
use crate::stats::{AffinityStats, ProcedureStats};
use crate::topology::ProcInfo;
use crate::CallOptions;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const DEFAULT_PORT: u16 = 21212;

/// Mutation-side connection bookkeeping, guarded by one lock so cluster
/// identity, host-id mapping, and connect history stay consistent.
#[derive(Default)]
pub(crate) struct ConnState {
    pub by_host: HashMap<i32, Arc<Connection>>,
    pub cluster: Option<(i64, i32)>,
    pub build_string: Option<String>,
    pub history: HashSet<(String, u16)>,
    pub subscribed: Option<Arc<Connection>>,
}

pub(crate) struct ClientInner {
    // Fixed configuration.
    pub username: String,
    pub password_hash: Vec<u8>,
    pub default_priority: u8,
    pub connection_setup_timeout: Duration,
    pub procedure_call_timeout: Duration,
    pub connection_response_timeout: Duration,
    pub network_backpressure_level: usize,
    pub reconnect_delay: Duration,
    pub reconnect_retry_delay: Duration,
    pub auto_connection_mgmt: bool,
    pub notifications: Notifications,
    error_log: Option<crate::config::ErrorLogFn>,

    // Request limits; dynamically adjustable.
    request_hard_limit: AtomicUsize,
    request_warning_level: AtomicUsize,
    request_resume_level: AtomicUsize,
    request_backpressure_on: AtomicBool,
    request_backpressure_lock: Mutex<()>,

    // Core shared state.
    pub registry: Registry,
    pub permits: SendPermits,
    pub rate_limiter: Option<RateLimiter>,
    handle_gen: AtomicI64,
    sys_handle_gen: AtomicI64,
    conn_id_gen: AtomicU64,
    pub epoch: Instant,

    // Connections: copy-on-write list for lock-free iteration, plus the
    // mutation-side state under its own lock.
    pub connection_list: RwLock<Arc<Vec<Arc<Connection>>>>,
    pub conn_state: Mutex<ConnState>,
    pub next_connection: AtomicUsize,

    // Topology snapshots, swapped wholesale; readers clone the Arc.
    pub hashinator: RwLock<Option<Arc<Hashinator>>>,
    pub partition_leaders: RwLock<Arc<HashMap<i32, Arc<Connection>>>>,
    pub proc_info: RwLock<Arc<HashMap<String, ProcInfo>>>,
    pub partition_keys: RwLock<Arc<HashMap<i32, i32>>>,
    pub partition_keys_ts_ms: AtomicI64,
    pub partition_keys_in_progress: AtomicBool,
    pub partition_keys_waiters: Mutex<Vec<oneshot::Sender<Result<(), String>>>>,
    pub partition_keys_cache_refresh: Duration,

    // On-demand task guards: at most one instance of each queued.
    pub subscription_pending: AtomicBool,
    pub topo_refresh_pending: AtomicBool,
    pub connection_task_pending: AtomicBool,
    pub port_key: OnceLock<String>,

    pub affinity_stats: Mutex<HashMap<i32, AffinityStats>>,

    dispatcher_tx: Mutex<Option<mpsc::Sender<InboundFrame>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl ClientInner {
    fn new(config: ClientConfig) -> Self {
        let hard = config.request_hard_limit.max(1);
        let warning = config.request_warning_level.clamp(1, hard);
        let resume = config.request_resume_level.min(warning);
        Self {
            username: config.username,
            password_hash: config.password_hash,
            default_priority: config.request_priority,
            connection_setup_timeout: config.connection_setup_timeout,
            procedure_call_timeout: config.procedure_call_timeout,
            connection_response_timeout: config.connection_response_timeout,
            network_backpressure_level: config.network_backpressure_level,
            reconnect_delay: config.reconnect_delay,
            reconnect_retry_delay: config.reconnect_retry_delay,
            auto_connection_mgmt: !config.disable_connection_mgmt,
            notifications: config.notifications,
            error_log: config.error_log,
            request_hard_limit: AtomicUsize::new(hard),
            request_warning_level: AtomicUsize::new(warning),
            request_resume_level: AtomicUsize::new(resume),
            request_backpressure_on: AtomicBool::new(false),
            request_backpressure_lock: Mutex::new(()),
            registry: Registry::default(),
            permits: SendPermits::new(config.outstanding_txn_limit),
            rate_limiter: config.txn_per_sec_rate_limit.map(RateLimiter::new),
            handle_gen: AtomicI64::new(0),
            sys_handle_gen: AtomicI64::new(0),
            conn_id_gen: AtomicU64::new(0),
            epoch: Instant::now(),
            connection_list: RwLock::new(Arc::new(Vec::new())),
            conn_state: Mutex::new(ConnState::default()),
            next_connection: AtomicUsize::new(0),
            hashinator: RwLock::new(None),
            partition_leaders: RwLock::new(Arc::new(HashMap::new())),
            proc_info: RwLock::new(Arc::new(HashMap::new())),
            partition_keys: RwLock::new(Arc::new(HashMap::new())),
            partition_keys_ts_ms: AtomicI64::new(0),
            partition_keys_in_progress: AtomicBool::new(false),
            partition_keys_waiters: Mutex::new(Vec::new()),
            partition_keys_cache_refresh: Duration::from_secs(1),
            subscription_pending: AtomicBool::new(false),
            topo_refresh_pending: AtomicBool::new(false),
            connection_task_pending: AtomicBool::new(false),
            port_key: OnceLock::new(),
            affinity_stats: Mutex::new(HashMap::new()),
            dispatcher_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.conn_id_gen.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn next_handle(&self) -> i64 {
        let handle = self.handle_gen.fetch_add(1, Ordering::Relaxed) + 1;
        debug_assert!(handle <= MAX_CLIENT_HANDLE);
        handle
    }

    fn next_sys_handle(&self) -> i64 {
        self.sys_handle_gen.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub(crate) fn register_task(&self, task: tokio::task::JoinHandle<()>) {
        self.tasks.lock().unwrap().push(task);
    }

    pub(crate) async fn submit_response(&self, frame: InboundFrame) -> Result<(), ()> {
        let tx = self.dispatcher_tx.lock().unwrap().clone();
        match tx {
            Some(tx) => tx.send(frame).await.map_err(|_| ()),
            None => Err(()),
        }
    }

    pub(crate) fn log_error(&self, msg: &str) {
        match &self.error_log {
            Some(sink) => {
                if catch_unwind(AssertUnwindSafe(|| sink(msg))).is_err() {
                    error!("error-log handler panicked");
                }
            }
            None => error!("{msg}"),
        }
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Admit one procedure call. All optional arguments are resolved by
    /// the caller; the destination partition is usually `NO_PARTITION`,
    /// letting the router derive it from the parameters.
    pub(crate) fn do_proc_call(
        self: &Arc<Self>,
        client_timeout: Duration,
        batch_timeout_ms: i32,
        destination_partition: i32,
        priority: u8,
        proc_name: &str,
        params: Vec<ParamValue>,
    ) -> ResponseFuture {
        if self.is_shutdown() {
            return ResponseFuture::failed(CallError::Shutdown);
        }
        if proc_name.is_empty() {
            return ResponseFuture::failed(CallError::MissingProcedureName);
        }

        // Hard limit on requests in progress, queued or sent. This races
        // with concurrent insertions and removals; a transient single
        // over-admission is accepted.
        let request_count = self.registry.len();
        let hard_limit = self.request_hard_limit.load(Ordering::SeqCst);
        if request_count >= hard_limit {
            return ResponseFuture::failed(CallError::RequestLimit { limit: hard_limit });
        }

        let handle = self.next_handle();
        let invocation = ProcedureInvocation::new(
            handle,
            batch_timeout_ms,
            destination_partition,
            priority,
            proc_name,
            ParameterSet::new(params),
        );

        let (tx, rx) = oneshot::channel();
        let Some(cxn) = self.find_connection(&invocation) else {
            complete_unqueued_request(tx, handle, "No connections to cluster at this time");
            return ResponseFuture::waiting(rx);
        };

        let sequence = self.registry.next_sequence();
        let ctx = Arc::new(RequestContext::new(
            sequence,
            invocation,
            client_timeout,
            cxn.clone(),
            tx,
        ));
        self.registry.insert(handle, ctx);

        // Entering the yellow zone triggers the warning. Slightly racy
        // with respect to the actual level; that is fine.
        if request_count + 1 >= self.request_warning_level.load(Ordering::SeqCst)
            && !self.request_backpressure_on()
        {
            self.report_request_backpressure(true);
        }

        cxn.queue.push(QueuedEntry {
            priority,
            sequence,
            handle,
        });

        // The connection may have torn down between routing and enqueue,
        // in which case its teardown scan may have run before our insert;
        // fail the request here rather than leaving it stranded.
        if !cxn.is_connected() {
            if let Some(removed) = self.registry.remove(handle) {
                self.complete_request_on_host_down(&removed);
            }
        }

        ResponseFuture::waiting(rx)
    }

    pub(crate) fn resolve_call_options(
        &self,
        options: Option<&CallOptions>,
    ) -> (Duration, i32, u8) {
        let mut timeout = self.procedure_call_timeout;
        let mut batch_ms = NO_BATCH_TIMEOUT;
        let mut priority = self.default_priority;
        if let Some(options) = options {
            if let Some(t) = options.client_timeout {
                timeout = t;
            }
            if let Some(b) = options.batch_timeout {
                batch_ms = b.as_millis().min(i32::MAX as u128) as i32;
            }
            if let Some(p) = options.request_priority {
                priority = p;
            }
        }
        (timeout, batch_ms, priority)
    }

    // ========================================================================
    // System calls
    // ========================================================================

    /// Internally-generated call to a system procedure. These bypass flow
    /// control and the send queue entirely, and carry negative handles.
    pub(crate) fn call_system_procedure(
        &self,
        cxn: &Arc<Connection>,
        proc_name: &str,
        params: Vec<ParamValue>,
    ) -> oneshot::Receiver<ClientResponse> {
        let (tx, rx) = oneshot::channel();
        let handle = self.next_sys_handle();
        let invocation = ProcedureInvocation::new(
            handle,
            NO_BATCH_TIMEOUT,
            NO_PARTITION,
            SYSTEM_PRIORITY,
            proc_name,
            ParameterSet::new(params),
        );
        let buf = match serialize_invocation(&invocation) {
            Ok(buf) => buf,
            Err(e) => {
                self.log_error(&format!("cannot serialize {proc_name}: {e}"));
                return rx; // sender dropped; receiver errors out
            }
        };
        let sequence = self.registry.next_sequence();
        let ctx = Arc::new(RequestContext::new(
            sequence,
            invocation,
            self.procedure_call_timeout,
            cxn.clone(),
            tx,
        ));
        self.registry.insert(handle, ctx);
        trace!(handle, proc = proc_name, "system call");
        cxn.write_to_network(buf);
        // If the endpoint died around the insert, its teardown scan may
        // have missed this record; fail it rather than strand it.
        if !cxn.is_connected() {
            if let Some(removed) = self.registry.remove(handle) {
                self.complete_request_on_host_down(&removed);
            }
        }
        rx
    }

    // ========================================================================
    // Request completion
    // ========================================================================

    pub(crate) fn release_permit(&self, ctx: &RequestContext) {
        if ctx.holds_permit.swap(false, Ordering::SeqCst) {
            self.permits.release();
        }
    }

    /// Fail a request that cannot have reached the server.
    pub(crate) fn complete_request_on_local_failure(
        &self,
        ctx: &Arc<RequestContext>,
        timed_out: bool,
        err: &str,
    ) {
        let handle = ctx.invocation.client_handle();
        if let Some(removed) = self.registry.remove(handle) {
            let status = if timed_out {
                Status::RequestTimeout
            } else {
                Status::TxnNotSent
            };
            let mut resp = ClientResponse::new(status, Vec::new(), err);
            resp.set_client_handle(handle);
            resp.set_client_roundtrip_ns(elapsed_ns(&removed));
            self.release_permit(&removed);
            removed.complete(resp);
        }
    }

    /// Time out a request that may already have been sent. The permit is
    /// released even though the transaction may still be live at the
    /// server; late responses therefore must not release again.
    pub(crate) fn complete_request_on_timeout(&self, ctx: &Arc<RequestContext>, elapsed: Duration) {
        let handle = ctx.invocation.client_handle();
        if let Some(removed) = self.registry.remove(handle) {
            let err = format!(
                "No response received in the allotted time (set to {} ms)",
                removed.timeout.as_millis()
            );
            let mut resp = ClientResponse::new(Status::ResponseTimeout, Vec::new(), err);
            resp.set_client_handle(handle);
            let elapsed_ns = elapsed.as_nanos().max(1) as u64;
            resp.set_client_roundtrip_ns(elapsed_ns);
            resp.set_cluster_roundtrip_ms(elapsed.as_millis().min(i32::MAX as u128) as i32);
            if handle >= 0 {
                removed.cxn.update_stats(
                    removed.invocation.proc_name(),
                    elapsed_ns,
                    false,
                    false,
                    true,
                );
            }
            self.release_permit(&removed);
            removed.complete(resp);
        }
    }

    /// Fail a request whose connection dropped while it was outstanding.
    pub(crate) fn complete_request_on_host_down(&self, ctx: &Arc<RequestContext>) {
        let handle = ctx.invocation.client_handle();
        if let Some(removed) = self.registry.remove(handle) {
            let mut resp = ClientResponse::new(
                Status::ConnectionLost,
                Vec::new(),
                "Connection to host was lost before response was received",
            );
            resp.set_client_handle(handle);
            resp.set_client_roundtrip_ns(elapsed_ns(&removed));
            self.release_permit(&removed);
            removed.complete(resp);
        }
    }

    // ========================================================================
    // Request backpressure (client <-> application)
    // ========================================================================

    pub(crate) fn request_backpressure_on(&self) -> bool {
        self.request_backpressure_on.load(Ordering::SeqCst)
    }

    /// Notify the application of entry into or exit from the yellow zone.
    /// The lock across the notification is what keeps `false` from ever
    /// overtaking its preceding `true`.
    pub(crate) fn report_request_backpressure(&self, slowdown: bool) {
        let Some(handler) = self.notifications.request_backpressure.clone() else {
            return;
        };
        let count = self.registry.len();
        let trigger = if slowdown {
            count >= self.request_warning_level.load(Ordering::SeqCst)
        } else {
            count <= self.request_resume_level.load(Ordering::SeqCst)
        };
        if trigger {
            let _guard = self.request_backpressure_lock.lock().unwrap();
            if slowdown != self.request_backpressure_on.load(Ordering::SeqCst) {
                self.request_backpressure_on.store(slowdown, Ordering::SeqCst);
                if catch_unwind(AssertUnwindSafe(|| handler(slowdown))).is_err() {
                    self.log_error("Unhandled panic from backpressure handler");
                }
            }
        }
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Create a connection and absorb it into the runtime. Used for all
    /// connections: user-initiated, topology-driven, and recovery.
    pub(crate) async fn create_connection(
        self: &Arc<Self>,
        host: &str,
        port: u16,
    ) -> Result<(), ConnectError> {
        if self.is_shutdown() {
            return Err(ConnectError::Shutdown);
        }

        let login = match open_and_login(
            host,
            port,
            &self.username,
            &self.password_hash,
            self.connection_setup_timeout,
        )
        .await
        {
            Ok(ok) => ok,
            Err(e) => {
                self.notify_connect_failure(host, port);
                return Err(e);
            }
        };
        let (stream, info) = login;

        // Absorb the new connection. The lock covers the cluster identity
        // check and the registration as one step.
        let cxn;
        {
            let mut state = self.conn_state.lock().unwrap();
            let empty = self.connection_list.read().unwrap().is_empty();
            if empty || state.cluster.is_none() {
                state.cluster = Some((info.cluster_timestamp, info.leader_addr));
                state.build_string = Some(info.build_string.clone());
                state.history.clear();
            } else if state.cluster != Some((info.cluster_timestamp, info.leader_addr)) {
                let ours = state.cluster.unwrap();
                drop(state);
                self.notify_connect_failure(host, port);
                return Err(ConnectError::ClusterMismatch {
                    ours,
                    theirs: (info.cluster_timestamp, info.leader_addr),
                });
            }

            cxn = Connection::spawn(self, stream, host.to_owned(), port, &info);
            if state.by_host.insert(info.host_id, cxn.clone()).is_some() {
                self.log_error(&format!(
                    "Warning: replaced connection for host id {}",
                    info.host_id
                ));
            }
            state.history.insert((host.to_owned(), port));
            {
                let mut list = self.connection_list.write().unwrap();
                let mut new_list = (**list).clone();
                new_list.push(cxn.clone());
                *list = Arc::new(new_list);
            }
        }

        // A new connection needs either a topology subscription (first
        // connection) or a refresh (the cluster did not change, so no
        // push will arrive).
        if !self.ensure_subscription(Duration::ZERO) {
            self.refresh_topology(crate::topology::TOPO_REFRESH_DELAY);
        }

        self.notify_connection_up(&cxn);
        Ok(())
    }

    /// Remove a connection being disconnected. Idempotent; the first
    /// caller wins and runs the teardown.
    pub(crate) fn remove_connection(self: &Arc<Self>, cxn: &Arc<Connection>) {
        if !cxn.mark_disconnected() {
            return;
        }
        cxn.close_outbound();
        cxn.queue.wake_all();
        self.notify_connection_down(cxn);

        let mut lost_last = false;
        let mut lost_subscriber = false;
        let mut history = HashSet::new();
        {
            let mut state = self.conn_state.lock().unwrap();
            state.by_host.retain(|_, c| !Arc::ptr_eq(c, cxn));
            {
                let mut list = self.connection_list.write().unwrap();
                let new_list: Vec<_> =
                    list.iter().filter(|c| !Arc::ptr_eq(c, cxn)).cloned().collect();
                *list = Arc::new(new_list);
            }
            {
                let mut leaders = self.partition_leaders.write().unwrap();
                if leaders.values().any(|c| Arc::ptr_eq(c, cxn)) {
                    let pruned: HashMap<_, _> = leaders
                        .iter()
                        .filter(|(_, c)| !Arc::ptr_eq(c, cxn))
                        .map(|(p, c)| (*p, c.clone()))
                        .collect();
                    *leaders = Arc::new(pruned);
                }
            }
            if self.connection_list.read().unwrap().is_empty() {
                state.subscribed = None;
                lost_last = true;
                history = state.history.clone();
            } else if state
                .subscribed
                .as_ref()
                .map(|c| Arc::ptr_eq(c, cxn))
                .unwrap_or(false)
            {
                state.subscribed = None;
                lost_subscriber = true;
            }
        }

        if lost_last {
            self.schedule_first_connection(history, self.reconnect_delay);
        } else if lost_subscriber {
            self.ensure_subscription(crate::topology::RESUBSCRIPTION_DELAY);
        }

        // Fail every in-flight request bound to this endpoint.
        for (_, ctx) in self.registry.bound_to(cxn.conn_id) {
            self.complete_request_on_host_down(&ctx);
        }

        cxn.abort_read();
    }

    pub(crate) fn get_connection_for_host(&self, host_id: i32) -> Option<Arc<Connection>> {
        self.conn_state.lock().unwrap().by_host.get(&host_id).cloned()
    }

    /// An arbitrary live connection, for system calls with no affinity.
    pub(crate) fn arbitrary_connection(&self) -> Option<Arc<Connection>> {
        let list = self.connection_list.read().unwrap().clone();
        if list.is_empty() {
            return None;
        }
        let n = self.next_connection.fetch_add(1, Ordering::Relaxed) % list.len();
        Some(list[n].clone())
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    fn notify_connection_event(
        &self,
        handler: Option<&crate::config::ConnectionStatusFn>,
        host: &str,
        port: u16,
    ) {
        if let Some(handler) = handler {
            if catch_unwind(AssertUnwindSafe(|| handler(host, port))).is_err() {
                self.log_error("Unhandled panic from notification handler");
            }
        }
    }

    pub(crate) fn notify_connect_failure(&self, host: &str, port: u16) {
        debug!(host, port, "connect failed");
        self.notify_connection_event(self.notifications.connect_failure.as_ref(), host, port);
    }

    fn notify_connection_up(&self, cxn: &Connection) {
        debug!(host = %cxn.host, port = cxn.port, "connection up");
        self.notify_connection_event(self.notifications.connection_up.as_ref(), &cxn.host, cxn.port);
    }

    fn notify_connection_down(&self, cxn: &Connection) {
        debug!(host = %cxn.host, port = cxn.port, "connection down");
        self.notify_connection_event(self.notifications.connection_down.as_ref(), &cxn.host, cxn.port);
    }

    pub(crate) fn notify_late_response(&self, response: &ClientResponse, cxn: &Connection) {
        debug!(
            host = %cxn.host,
            port = cxn.port,
            status = %response.status(),
            "late response received"
        );
        if let Some(handler) = self.notifications.late_response.clone() {
            if catch_unwind(AssertUnwindSafe(|| handler(response, &cxn.host, cxn.port))).is_err() {
                self.log_error("Unhandled panic from notification handler");
            }
        }
    }

    // ========================================================================
    // Drain and shutdown
    // ========================================================================

    /// Wait until no requests remain in the system. The application must
    /// not queue further calls while draining.
    pub(crate) async fn drain_requests(&self) {
        let mut sleep = Duration::from_micros(500);
        let max_sleep = Duration::from_millis(5);
        while !self.registry.is_empty() {
            tokio::time::sleep(sleep).await;
            if sleep < max_sleep {
                sleep += Duration::from_micros(500);
            }
        }
    }

    /// Wait for queued background tasks to clear their pending flags.
    async fn drain_tasks(&self) {
        while self.subscription_pending.load(Ordering::SeqCst)
            || self.topo_refresh_pending.load(Ordering::SeqCst)
            || self.connection_task_pending.load(Ordering::SeqCst)
        {
            tokio::time::sleep(Duration::from_micros(500)).await;
        }
    }

    pub(crate) async fn do_shutdown(self: &Arc<Self>) {
        self.shutdown.store(true, Ordering::SeqCst);

        self.drain_tasks().await;
        self.drain_requests().await;

        // Stop the response workers by closing their channel.
        self.dispatcher_tx.lock().unwrap().take();

        // Close connections; reconnect scheduling is disabled by the
        // shutdown flag.
        let connections = self.connection_list.read().unwrap().clone();
        for cxn in connections.iter() {
            self.remove_connection(cxn);
        }

        // Give background tasks a grace period, then abort stragglers.
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        for mut task in tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut task).await.is_err() {
                task.abort();
            }
        }

        // Clear all snapshots and bookkeeping.
        *self.hashinator.write().unwrap() = None;
        *self.partition_leaders.write().unwrap() = Arc::new(HashMap::new());
        *self.proc_info.write().unwrap() = Arc::new(HashMap::new());
        *self.partition_keys.write().unwrap() = Arc::new(HashMap::new());
        self.affinity_stats.lock().unwrap().clear();
        self.registry.clear();
        *self.connection_list.write().unwrap() = Arc::new(Vec::new());
        let mut state = self.conn_state.lock().unwrap();
        state.by_host.clear();
        state.history.clear();
        state.subscribed = None;
    }
}

fn elapsed_ns(ctx: &RequestContext) -> u64 {
    ctx.start.elapsed().as_nanos().max(1) as u64
}

fn complete_unqueued_request(tx: oneshot::Sender<ClientResponse>, handle: i64, err: &str) {
    let mut resp = ClientResponse::new(Status::TxnNotSent, Vec::new(), err);
    resp.set_client_handle(handle);
    let _ = tx.send(resp);
}

// ============================================================================
// Response future
// ============================================================================

/// The in-progress side of a call: resolves to the response, or to a
/// [`CallError`] for failures at admission time.
pub struct ResponseFuture {
    state: FutureState,
}

enum FutureState {
    Failed(Option<CallError>),
    Waiting(oneshot::Receiver<ClientResponse>),
}

impl ResponseFuture {
    fn failed(err: CallError) -> Self {
        Self {
            state: FutureState::Failed(Some(err)),
        }
    }

    fn waiting(rx: oneshot::Receiver<ClientResponse>) -> Self {
        Self {
            state: FutureState::Waiting(rx),
        }
    }
}

impl Future for ResponseFuture {
    type Output = Result<ClientResponse, CallError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            FutureState::Failed(err) => {
                Poll::Ready(Err(err.take().expect("response future polled after completion")))
            }
            FutureState::Waiting(rx) => {
                Pin::new(rx).poll(cx).map(|r| r.map_err(|_| CallError::ClientGone))
            }
        }
    }
}

/// One per-partition result from an all-partition call.
#[derive(Debug)]
pub struct PartitionResponse {
    /// The sample key that routed to this partition.
    pub partition_key: i32,
    pub response: ClientResponse,
}

// ============================================================================
// Public client
// ============================================================================

/// Asynchronous client for a tessera cluster.
///
/// Cloning is cheap; all clones share the same connections and state.
/// Construction starts the runtime's background tasks; [`Client::close`]
/// shuts them down.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Client {
        let response_workers = config.response_worker_count;
        let inner = Arc::new(ClientInner::new(config));
        let tx = crate::dispatcher::start_workers(&inner, response_workers);
        *inner.dispatcher_tx.lock().unwrap() = Some(tx);
        inner.register_task(tokio::spawn(crate::timeouts::timeout_ticker(inner.clone())));
        Client { inner }
    }

    /// Connect to a server given as `host`, `host:port`, or
    /// `[ipv6]:port`. A single attempt, no retries.
    pub async fn connect(&self, server: &str) -> Result<(), ConnectError> {
        let (host, port) = parse_host_port(server)?;
        self.connect_to(&host, port).await
    }

    /// Connect to a specific host and port. A single attempt, no retries.
    pub async fn connect_to(&self, host: &str, port: u16) -> Result<(), ConnectError> {
        self.inner.create_connection(host, port).await
    }

    /// Connect with retries on connection failure, until the overall
    /// timeout elapses. Retries are spaced by `delay`.
    pub async fn connect_with_retry(
        &self,
        server: &str,
        timeout: Duration,
        delay: Duration,
    ) -> Result<(), ConnectError> {
        let (host, port) = parse_host_port(server)?;
        let start = Instant::now();
        loop {
            match self.inner.create_connection(&host, port).await {
                Ok(()) => return Ok(()),
                Err(e @ (ConnectError::Io(_) | ConnectError::SetupTimeout)) => {
                    if start.elapsed() >= timeout {
                        return Err(ConnectError::RetriesExhausted { last: Box::new(e) });
                    }
                    self.inner
                        .log_error(&format!("Failed to connect to host at {host}:{port}: {e}"));
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Call a stored procedure with the configured timeout and priority.
    /// The returned future resolves when the call completes, successfully
    /// or not; unsuccessful outcomes are responses with non-success
    /// status, not errors.
    pub fn call_procedure(&self, proc_name: &str, params: Vec<ParamValue>) -> ResponseFuture {
        self.call_with_options(None, proc_name, params)
    }

    /// Call a stored procedure with per-call overrides.
    pub fn call_with_options(
        &self,
        options: Option<&CallOptions>,
        proc_name: &str,
        params: Vec<ParamValue>,
    ) -> ResponseFuture {
        let (timeout, batch_ms, priority) = self.inner.resolve_call_options(options);
        self.inner
            .do_proc_call(timeout, batch_ms, NO_PARTITION, priority, proc_name, params)
    }

    /// Call a stored procedure and surface a non-success response as a
    /// [`ProcCallError`].
    pub async fn call_sync(
        &self,
        proc_name: &str,
        params: Vec<ParamValue>,
    ) -> Result<ClientResponse, ProcCallError> {
        self.call_sync_with_options(None, proc_name, params).await
    }

    pub async fn call_sync_with_options(
        &self,
        options: Option<&CallOptions>,
        proc_name: &str,
        params: Vec<ParamValue>,
    ) -> Result<ClientResponse, ProcCallError> {
        let response = self.call_with_options(options, proc_name, params).await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(ProcCallError::Failed(Box::new(response)))
        }
    }

    /// Run a procedure once per partition, with the partition's sample
    /// key prepended as the first parameter. Individual failures are
    /// reported per partition; the overall call only fails when the
    /// partition keys cannot be obtained.
    pub async fn call_all_partitions(
        &self,
        options: Option<&CallOptions>,
        proc_name: &str,
        params: Vec<ParamValue>,
    ) -> Result<Vec<PartitionResponse>, CallError> {
        if self.inner.is_shutdown() {
            return Err(CallError::Shutdown);
        }
        let rx = self.inner.refresh_partition_keys();
        match rx.await {
            Ok(Ok(())) => {}
            Ok(Err(msg)) => return Err(CallError::PartitionKeys(msg)),
            Err(_) => return Err(CallError::ClientGone),
        }

        let keys = self.inner.partition_keys.read().unwrap().clone();
        let (timeout, batch_ms, priority) = self.inner.resolve_call_options(options);
        let mut pending = Vec::with_capacity(keys.len());
        for (&partition_id, &partition_key) in keys.iter() {
            let mut args = Vec::with_capacity(params.len() + 1);
            args.push(ParamValue::I32(partition_key));
            args.extend(params.iter().cloned());
            let future = self.inner.do_proc_call(
                timeout,
                batch_ms,
                partition_id,
                priority,
                proc_name,
                args,
            );
            pending.push((partition_key, future));
        }

        let mut responses = Vec::with_capacity(pending.len());
        for (partition_key, future) in pending {
            let response = match future.await {
                Ok(resp) => resp,
                Err(e) => {
                    ClientResponse::new(Status::UnexpectedFailure, Vec::new(), e.to_string())
                }
            };
            responses.push(PartitionResponse {
                partition_key,
                response,
            });
        }
        Ok(responses)
    }

    /// Wait until there are no requests in the system. The application
    /// must not queue more calls while draining.
    pub async fn drain(&self) {
        self.inner.drain_requests().await;
    }

    /// Shut down: drain tasks and requests, stop workers, close
    /// connections, clear all state.
    pub async fn close(&self) {
        self.inner.do_shutdown().await;
    }

    // ------------------------------------------------------------------------
    // Introspection and dynamic tuning
    // ------------------------------------------------------------------------

    /// Hosts currently connected.
    pub fn connected_hosts(&self) -> Vec<(String, u16)> {
        self.inner
            .connection_list
            .read()
            .unwrap()
            .iter()
            .map(|c| (c.host.clone(), c.port))
            .collect()
    }

    /// Identity of the connected cluster: (timestamp, leader address).
    pub fn cluster_instance_id(&self) -> Option<(i64, i32)> {
        self.inner.conn_state.lock().unwrap().cluster
    }

    /// Build string reported by the most recently joined cluster.
    pub fn cluster_build_string(&self) -> Option<String> {
        self.inner.conn_state.lock().unwrap().build_string.clone()
    }

    /// Estimate of requests queued but not yet completed.
    pub fn current_request_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Estimate of transactions currently outstanding at the cluster.
    pub fn outstanding_txn_count(&self) -> usize {
        self.inner.permits.limit().saturating_sub(self.inner.permits.available())
    }

    /// Adjust the request limits. Warning is clamped to the hard limit
    /// and resume to the warning level.
    pub fn set_request_limits(&self, limit: usize, warning: usize, resume: usize) {
        let hard = limit.max(1);
        let warning = warning.clamp(1, hard);
        let resume = resume.min(warning);
        self.inner.request_hard_limit.store(hard, Ordering::SeqCst);
        self.inner.request_warning_level.store(warning, Ordering::SeqCst);
        self.inner.request_resume_level.store(resume, Ordering::SeqCst);
    }

    /// Adjust the outstanding-transaction limit, returning the new
    /// effective limit. Shrinking below the in-use count reduces the
    /// limit only by the permits that could be reclaimed, accepting a
    /// temporary over-commit until in-flight transactions complete.
    pub fn set_outstanding_txn_limit(&self, limit: usize) -> usize {
        self.inner.permits.set_limit(limit)
    }

    /// Per-connection, per-procedure counters.
    pub fn procedure_stats(&self) -> HashMap<(String, u16), HashMap<String, ProcedureStats>> {
        self.inner
            .connection_list
            .read()
            .unwrap()
            .iter()
            .map(|c| ((c.host.clone(), c.port), c.stats_snapshot()))
            .collect()
    }

    /// Per-partition affinity routing counters.
    pub fn affinity_stats(&self) -> HashMap<i32, AffinityStats> {
        self.inner.affinity_stats.lock().unwrap().clone()
    }
}

fn parse_host_port(server: &str) -> Result<(String, u16), ConnectError> {
    let server = server.trim();
    if server.is_empty() {
        return Err(ConnectError::BadAddress(server.into()));
    }
    if let Some(rest) = server.strip_prefix('[') {
        // Bracketed IPv6, optionally with a port.
        let Some((host, after)) = rest.split_once(']') else {
            return Err(ConnectError::BadAddress(server.into()));
        };
        let port = match after.strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| ConnectError::BadAddress(server.into()))?,
            None if after.is_empty() => DEFAULT_PORT,
            None => return Err(ConnectError::BadAddress(server.into())),
        };
        return Ok((host.to_owned(), port));
    }
    match server.split_once(':') {
        None => Ok((server.to_owned(), DEFAULT_PORT)),
        Some((host, port)) => {
            if port.contains(':') {
                // Unbracketed IPv6 is ambiguous.
                return Err(ConnectError::BadAddress(server.into()));
            }
            let port = port
                .parse()
                .map_err(|_| ConnectError::BadAddress(server.into()))?;
            Ok((host.to_owned(), port))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_parsing() {
        assert_eq!(parse_host_port("db1").unwrap(), ("db1".into(), DEFAULT_PORT));
        assert_eq!(parse_host_port("db1:7001").unwrap(), ("db1".into(), 7001));
        assert_eq!(parse_host_port(" db1:7001 ").unwrap(), ("db1".into(), 7001));
        assert_eq!(parse_host_port("[::1]:7001").unwrap(), ("::1".into(), 7001));
        assert_eq!(parse_host_port("[::1]").unwrap(), ("::1".into(), DEFAULT_PORT));
        assert!(parse_host_port("::1").is_err());
        assert!(parse_host_port("db1:x").is_err());
        assert!(parse_host_port("").is_err());
    }
}

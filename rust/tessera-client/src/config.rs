//! Client configuration and per-call options.
//!
//! All operational parameters are conveyed through a [`ClientConfig`]
//! handed to [`Client::new`](crate::Client::new). Durations are plain
//! [`Duration`]s; internally everything is tracked in nanoseconds.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tessera_wire::ClientResponse;

/// Default request priority: the middle of the 1..=8 range.
pub const DEFAULT_REQUEST_PRIORITY: u8 = tessera_wire::LOWEST_PRIORITY / 2;

pub(crate) const DEFAULT_CONNECTION_SETUP_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_CONNECTION_RESPONSE_TIMEOUT: Duration = Duration::from_secs(120);
pub(crate) const DEFAULT_PROCEDURE_TIMEOUT: Duration = Duration::from_secs(120);

pub(crate) const DEFAULT_REQUEST_HARD_LIMIT: usize = 1000;
pub(crate) const DEFAULT_REQUEST_WARNING_LEVEL: usize = 800;
pub(crate) const DEFAULT_REQUEST_RESUME_LEVEL: usize = 200;
pub(crate) const DEFAULT_TXN_OUT_LIMIT: usize = 100;
pub(crate) const DEFAULT_BACKPRESSURE_QUEUE_LIMIT: usize = 100;
pub(crate) const DEFAULT_RESPONSE_WORKERS: usize = 4;

pub(crate) const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_RECONNECT_RETRY_DELAY: Duration = Duration::from_secs(15);

/// Connection up / down / connect-failure notification: (host, port).
pub type ConnectionStatusFn = Arc<dyn Fn(&str, u16) + Send + Sync>;

/// Late-response notification: (response, host, port).
pub type LateResponseFn = Arc<dyn Fn(&ClientResponse, &str, u16) + Send + Sync>;

/// Request-backpressure notification: `true` = slow down.
pub type BackpressureFn = Arc<dyn Fn(bool) + Send + Sync>;

/// Error-log sink for conditions with no completion path to report through.
pub type ErrorLogFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Optional application callbacks. All are fire-and-forget; they run on
/// the client's response workers, never on a network read task.
#[derive(Clone, Default)]
pub(crate) struct Notifications {
    pub connection_up: Option<ConnectionStatusFn>,
    pub connection_down: Option<ConnectionStatusFn>,
    pub connect_failure: Option<ConnectionStatusFn>,
    pub late_response: Option<LateResponseFn>,
    pub request_backpressure: Option<BackpressureFn>,
}

/// Configuration for a [`Client`](crate::Client).
///
/// # Example
///
/// ```ignore
/// let config = ClientConfig::new()
///     .username("ops")
///     .password("secret")
///     .procedure_call_timeout(Duration::from_millis(1200));
/// let client = Client::new(config);
/// ```
#[derive(Clone)]
pub struct ClientConfig {
    pub(crate) username: String,
    pub(crate) password_hash: Vec<u8>,
    pub(crate) request_priority: u8,
    pub(crate) connection_setup_timeout: Duration,
    pub(crate) procedure_call_timeout: Duration,
    pub(crate) connection_response_timeout: Duration,
    pub(crate) outstanding_txn_limit: usize,
    pub(crate) request_hard_limit: usize,
    pub(crate) request_warning_level: usize,
    pub(crate) request_resume_level: usize,
    pub(crate) network_backpressure_level: usize,
    pub(crate) reconnect_delay: Duration,
    pub(crate) reconnect_retry_delay: Duration,
    pub(crate) disable_connection_mgmt: bool,
    pub(crate) response_worker_count: usize,
    pub(crate) txn_per_sec_rate_limit: Option<u32>,
    pub(crate) notifications: Notifications,
    pub(crate) error_log: Option<ErrorLogFn>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password_hash: hash_password(""),
            request_priority: DEFAULT_REQUEST_PRIORITY,
            connection_setup_timeout: DEFAULT_CONNECTION_SETUP_TIMEOUT,
            procedure_call_timeout: DEFAULT_PROCEDURE_TIMEOUT,
            connection_response_timeout: DEFAULT_CONNECTION_RESPONSE_TIMEOUT,
            outstanding_txn_limit: DEFAULT_TXN_OUT_LIMIT,
            request_hard_limit: DEFAULT_REQUEST_HARD_LIMIT,
            request_warning_level: DEFAULT_REQUEST_WARNING_LEVEL,
            request_resume_level: DEFAULT_REQUEST_RESUME_LEVEL,
            network_backpressure_level: DEFAULT_BACKPRESSURE_QUEUE_LIMIT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            reconnect_retry_delay: DEFAULT_RECONNECT_RETRY_DELAY,
            disable_connection_mgmt: false,
            response_worker_count: DEFAULT_RESPONSE_WORKERS,
            txn_per_sec_rate_limit: None,
            notifications: Notifications::default(),
            error_log: None,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Set the cleartext password; it is hashed immediately and the
    /// cleartext is not retained.
    pub fn password(mut self, password: &str) -> Self {
        self.password_hash = hash_password(password);
        self
    }

    /// Set an already-hashed password (hex-free raw digest bytes).
    pub fn password_hash(mut self, hash: Vec<u8>) -> Self {
        self.password_hash = hash;
        self
    }

    /// Default priority for calls that do not override it. Out-of-range
    /// values clamp to the lowest priority.
    pub fn request_priority(mut self, prio: i32) -> Self {
        self.request_priority = tessera_wire::clip_priority(prio);
        self
    }

    pub fn connection_setup_timeout(mut self, timeout: Duration) -> Self {
        self.connection_setup_timeout = timeout;
        self
    }

    pub fn procedure_call_timeout(mut self, timeout: Duration) -> Self {
        self.procedure_call_timeout = timeout;
        self
    }

    pub fn connection_response_timeout(mut self, timeout: Duration) -> Self {
        self.connection_response_timeout = timeout;
        self
    }

    /// Cap on transactions in flight to the cluster across all
    /// connections (the send-permit pool size).
    pub fn outstanding_txn_limit(mut self, limit: usize) -> Self {
        self.outstanding_txn_limit = limit.max(1);
        self
    }

    /// Hard cap on requests in progress, queued or sent.
    pub fn request_limit(mut self, limit: usize) -> Self {
        self.request_hard_limit = limit.max(1);
        self
    }

    /// Warning and resume levels for request backpressure notifications.
    pub fn request_backpressure_levels(mut self, warning: usize, resume: usize) -> Self {
        self.request_warning_level = warning;
        self.request_resume_level = resume;
        self
    }

    /// Queued-byte level at which a connection reports network
    /// backpressure, expressed in whole frames of typical size.
    pub fn network_backpressure_level(mut self, frames: usize) -> Self {
        self.network_backpressure_level = frames.max(1);
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn reconnect_retry_delay(mut self, delay: Duration) -> Self {
        self.reconnect_retry_delay = delay;
        self
    }

    /// Disable automatic connection management: no connecting to hosts
    /// discovered via topology, no reconnecting failed connections.
    pub fn disable_connection_mgmt(mut self) -> Self {
        self.disable_connection_mgmt = true;
        self
    }

    /// Number of response-worker tasks running completions.
    pub fn response_worker_count(mut self, count: usize) -> Self {
        self.response_worker_count = count.max(1);
        self
    }

    /// Artificially limit the rate at which transactions are sent.
    /// Not generally used in production.
    pub fn txn_per_sec_rate_limit(mut self, rate: u32) -> Self {
        self.txn_per_sec_rate_limit = if rate > 0 { Some(rate) } else { None };
        self
    }

    pub fn on_connection_up(mut self, f: impl Fn(&str, u16) + Send + Sync + 'static) -> Self {
        self.notifications.connection_up = Some(Arc::new(f));
        self
    }

    pub fn on_connection_down(mut self, f: impl Fn(&str, u16) + Send + Sync + 'static) -> Self {
        self.notifications.connection_down = Some(Arc::new(f));
        self
    }

    pub fn on_connect_failure(mut self, f: impl Fn(&str, u16) + Send + Sync + 'static) -> Self {
        self.notifications.connect_failure = Some(Arc::new(f));
        self
    }

    pub fn on_late_response(
        mut self,
        f: impl Fn(&ClientResponse, &str, u16) + Send + Sync + 'static,
    ) -> Self {
        self.notifications.late_response = Some(Arc::new(f));
        self
    }

    pub fn on_request_backpressure(mut self, f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.notifications.request_backpressure = Some(Arc::new(f));
        self
    }

    /// Intercept error-log messages that have no completion to report
    /// through. Defaults to logging via `tracing`.
    pub fn on_error_log(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.error_log = Some(Arc::new(f));
        self
    }
}

pub(crate) fn hash_password(password: &str) -> Vec<u8> {
    Sha256::digest(password.as_bytes()).to_vec()
}

/// Per-call overrides, for the occasional call that needs values other
/// than the configured ones.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub(crate) client_timeout: Option<Duration>,
    pub(crate) batch_timeout: Option<Duration>,
    pub(crate) request_priority: Option<u8>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client-side timeout for this call.
    pub fn client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = Some(timeout);
        self
    }

    /// Batch-timeout override forwarded to the cluster.
    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = Some(timeout);
        self
    }

    /// Priority for this call, 1 (highest) to 8 (lowest).
    pub fn request_priority(mut self, prio: i32) -> Self {
        self.request_priority = Some(tessera_wire::clip_priority(prio));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = ClientConfig::default();
        assert_eq!(c.request_hard_limit, 1000);
        assert_eq!(c.request_warning_level, 800);
        assert_eq!(c.request_resume_level, 200);
        assert_eq!(c.outstanding_txn_limit, 100);
        assert_eq!(c.request_priority, 4);
        assert_eq!(c.procedure_call_timeout, Duration::from_secs(120));
    }

    #[test]
    fn out_of_range_priority_clamps_low() {
        let c = ClientConfig::new().request_priority(99);
        assert_eq!(c.request_priority, tessera_wire::LOWEST_PRIORITY);
    }

    #[test]
    fn limits_have_floors() {
        let c = ClientConfig::new().outstanding_txn_limit(0).request_limit(0);
        assert_eq!(c.outstanding_txn_limit, 1);
        assert_eq!(c.request_hard_limit, 1);
    }
}

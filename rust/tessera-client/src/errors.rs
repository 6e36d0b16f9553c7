//! Error types surfaced by the client.
//!
//! Most call failures complete the call's response future with a
//! synthesized [`ClientResponse`](tessera_wire::ClientResponse) carrying a
//! client-local status; the types here cover the cases that fail before a
//! request context exists (admission) and the sync facade's mapping of
//! unsuccessful responses.

use tessera_wire::ClientResponse;

/// Error failing a call at admission time, before a request record exists.
#[derive(Debug)]
pub enum CallError {
    /// The in-progress request count is at the hard limit.
    RequestLimit {
        /// The configured hard limit.
        limit: usize,
    },
    /// The client is shutting down.
    Shutdown,
    /// No procedure name was supplied.
    MissingProcedureName,
    /// The client went away before the call completed.
    ClientGone,
    /// An all-partition call could not obtain the partition keys.
    PartitionKeys(String),
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::RequestLimit { limit } => {
                write!(f, "in-progress request limit {limit} exceeded")
            }
            CallError::Shutdown => write!(f, "client is shutting down"),
            CallError::MissingProcedureName => write!(f, "procedure name required"),
            CallError::ClientGone => write!(f, "client went away before completion"),
            CallError::PartitionKeys(msg) => write!(f, "partition keys unavailable: {msg}"),
        }
    }
}

impl std::error::Error for CallError {}

/// Error from the sync call facade.
///
/// Client-side failures pass through as [`CallError`]; a response that
/// arrived but was not successful is surfaced as `Failed` with the full
/// response attached.
#[derive(Debug)]
pub enum ProcCallError {
    /// The call failed client-side before any response.
    Client(CallError),
    /// The cluster returned a non-success response.
    Failed(Box<ClientResponse>),
}

impl ProcCallError {
    /// The unsuccessful response, when there is one.
    pub fn response(&self) -> Option<&ClientResponse> {
        match self {
            ProcCallError::Failed(resp) => Some(resp),
            ProcCallError::Client(_) => None,
        }
    }
}

impl std::fmt::Display for ProcCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcCallError::Client(e) => write!(f, "procedure call failed: {e}"),
            ProcCallError::Failed(resp) => {
                write!(
                    f,
                    "procedure call failed: {} ({})",
                    resp.status(),
                    resp.status_string()
                )
            }
        }
    }
}

impl std::error::Error for ProcCallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcCallError::Client(e) => Some(e),
            ProcCallError::Failed(_) => None,
        }
    }
}

impl From<CallError> for ProcCallError {
    fn from(e: CallError) -> Self {
        ProcCallError::Client(e)
    }
}

/// Error establishing a connection to a cluster node.
#[derive(Debug)]
pub enum ConnectError {
    /// Address could not be parsed.
    BadAddress(String),
    /// Socket-level failure.
    Io(std::io::Error),
    /// The node did not complete the login exchange in time.
    SetupTimeout,
    /// The login exchange failed.
    Handshake(String),
    /// The node belongs to a different cluster than the one already
    /// connected to.
    ClusterMismatch {
        /// (timestamp, leader) of the cluster we are connected to.
        ours: (i64, i32),
        /// (timestamp, leader) reported by the new node.
        theirs: (i64, i32),
    },
    /// The client is shutting down.
    Shutdown,
    /// All retry attempts were exhausted.
    RetriesExhausted {
        /// The last error seen.
        last: Box<ConnectError>,
    },
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::BadAddress(s) => write!(f, "bad server address: {s}"),
            ConnectError::Io(e) => write!(f, "connection failed: {e}"),
            ConnectError::SetupTimeout => write!(f, "connection setup timed out"),
            ConnectError::Handshake(why) => write!(f, "login failed: {why}"),
            ConnectError::ClusterMismatch { ours, theirs } => write!(
                f,
                "cluster instance id mismatch: current is {},{}, server's is {},{}",
                ours.0, ours.1, theirs.0, theirs.1
            ),
            ConnectError::Shutdown => write!(f, "client is shutting down"),
            ConnectError::RetriesExhausted { last } => {
                write!(f, "connect retries exhausted: {last}")
            }
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectError::Io(e) => Some(e),
            ConnectError::RetriesExhausted { last } => Some(last),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConnectError {
    fn from(e: std::io::Error) -> Self {
        ConnectError::Io(e)
    }
}

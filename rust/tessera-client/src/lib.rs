#![deny(unsafe_code)]

//! Asynchronous client for the tessera distributed OLTP database.
//!
//! The client delivers stored-procedure calls over long-lived, multiplexed
//! TCP connections to the nodes of a cluster, completing each call's
//! response future asynchronously. It enforces two tiers of flow control
//! (an application-facing request limit and a network-facing send-permit
//! pool), routes single-partition calls to the partition leader via a
//! consistent-hash "hashinator", honors per-call timeouts and priorities,
//! and recovers connections in the background as cluster topology changes.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use tessera_client::{Client, ClientConfig};
//! use tessera_wire::ParamValue;
//!
//! let client = Client::new(
//!     ClientConfig::new().procedure_call_timeout(Duration::from_millis(1200)),
//! );
//! client.connect("db1.example.com").await?;
//! let response = client
//!     .call_procedure("AddUser", vec![ParamValue::I64(12), ParamValue::Str("kim".into())])
//!     .await?;
//! assert!(response.status().is_success());
//! client.close().await;
//! ```

mod client;
mod config;
mod connection;
mod dispatcher;
mod errors;
mod queue;
mod ratelimit;
mod registry;
mod router;
mod sender;
mod stats;
mod timeouts;
mod topology;

pub use client::{Client, PartitionResponse, ResponseFuture};
pub use config::{
    BackpressureFn, CallOptions, ClientConfig, ConnectionStatusFn, ErrorLogFn, LateResponseFn,
    DEFAULT_REQUEST_PRIORITY,
};
pub use errors::{CallError, ConnectError, ProcCallError};
pub use stats::{AffinityStats, ProcedureStats};

// Re-exported so applications only need one dependency for common calls.
pub use tessera_wire::{ClientResponse, ParamValue, ResultTable, Status};

#![deny(unsafe_code)]

//! Wire-level types for the tessera client.
//!
//! Everything that crosses the network lives here: procedure invocations,
//! parameter sets, client responses, result tables, and the hashinator that
//! maps partition-parameter values to partition ids. The client runtime in
//! `tessera-client` composes these; it never touches raw byte layouts
//! directly.
//!
//! All integers on the wire are big-endian. Frames are length-prefixed with
//! a 4-byte length; framing itself is the transport's job, the codecs here
//! produce and consume frame bodies.

mod error;
mod hash;
mod invocation;
mod params;
mod response;
mod table;

pub use error::WireError;
pub use hash::Hashinator;
pub use invocation::{InvocationVersion, Params, ProcedureInvocation};
pub use params::{ParamType, ParamValue, ParameterSet};
pub use response::{ClientResponse, Status};
pub use table::ResultTable;

/// Handle values at or below this are ordinary client handles.
///
/// The two values above it identify unsolicited pushes from the cluster
/// (topology and procedure-catalog updates) and must match the server.
pub const MAX_CLIENT_HANDLE: i64 = i64::MAX - 3;

/// Magic handle on unsolicited topology-change pushes.
pub const ASYNC_TOPO_HANDLE: i64 = i64::MAX - 1;

/// Magic handle on unsolicited procedure-catalog pushes.
pub const ASYNC_PROC_HANDLE: i64 = i64::MAX - 2;

/// Highest (most urgent) request priority.
pub const HIGHEST_PRIORITY: u8 = 1;

/// Lowest request priority. Out-of-range priorities clamp to this.
pub const LOWEST_PRIORITY: u8 = 8;

/// Priority used for the client's own system calls. System calls bypass
/// the per-connection queue, so this only matters server-side.
pub const SYSTEM_PRIORITY: u8 = 0;

/// Destination-partition sentinel: route by partition parameter.
pub const NO_PARTITION: i32 = -1;

/// Partition id used for multi-partition transactions.
pub const MP_INIT_PID: i32 = 16383;

/// Batch-timeout sentinel: no override.
pub const NO_BATCH_TIMEOUT: i32 = -1;

/// Clamp a request priority into the valid range.
///
/// Anything outside 1..=8 is forced to the lowest priority rather than
/// rejected; a bad priority is not worth failing a call over.
pub fn clip_priority(prio: i32) -> u8 {
    if prio < HIGHEST_PRIORITY as i32 || prio > LOWEST_PRIORITY as i32 {
        LOWEST_PRIORITY
    } else {
        prio as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_clipping() {
        assert_eq!(clip_priority(1), 1);
        assert_eq!(clip_priority(8), 8);
        assert_eq!(clip_priority(0), LOWEST_PRIORITY);
        assert_eq!(clip_priority(9), LOWEST_PRIORITY);
        assert_eq!(clip_priority(-3), LOWEST_PRIORITY);
    }

    #[test]
    fn magic_handles_are_above_client_range() {
        assert!(ASYNC_TOPO_HANDLE > MAX_CLIENT_HANDLE);
        assert!(ASYNC_PROC_HANDLE > MAX_CLIENT_HANDLE);
        assert_ne!(ASYNC_TOPO_HANDLE, ASYNC_PROC_HANDLE);
    }
}

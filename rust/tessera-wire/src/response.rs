//! Client response codec.
//!
//! A response carries the client handle it answers, a status, optional
//! status strings, the cluster-side round-trip estimate, and result tables.
//! The client-side round-trip is stamped locally and never serialized.
//!
//! Body layout: version byte, 8-byte client handle, fields-present byte,
//! 1-byte status [+ status string], 1-byte app status [+ app status
//! string], 4-byte cluster round-trip ms, 2-byte table count, tables.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::table::ResultTable;
use crate::WireError;

const FIELD_APP_STATUS_STRING: u8 = 1 << 5;
const FIELD_STATUS_STRING: u8 = 1 << 7;

/// Response status. Positive codes come from the server; negative
/// client-local codes are synthesized by the runtime and never hit the
/// wire in the server direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    UserAbort,
    GracefulFailure,
    UnexpectedFailure,
    ConnectionLost,
    ServerUnavailable,
    ConnectionTimeout,
    ResponseUnknown,
    TxnRestart,
    OperationalFailure,
    /// Local: the request never reached the network.
    TxnNotSent,
    /// Local: timed out before the send completed.
    RequestTimeout,
    /// Local: sent, but no response within the budget.
    ResponseTimeout,
}

impl Status {
    pub fn code(self) -> i8 {
        match self {
            Status::Success => 1,
            Status::UserAbort => -1,
            Status::GracefulFailure => -2,
            Status::UnexpectedFailure => -3,
            Status::ConnectionLost => -4,
            Status::ServerUnavailable => -5,
            Status::ConnectionTimeout => -6,
            Status::ResponseUnknown => -7,
            Status::TxnRestart => -8,
            Status::OperationalFailure => -9,
            Status::TxnNotSent => -10,
            Status::RequestTimeout => -11,
            Status::ResponseTimeout => -12,
        }
    }

    pub fn from_code(code: i8) -> Option<Status> {
        match code {
            1 => Some(Status::Success),
            -1 => Some(Status::UserAbort),
            -2 => Some(Status::GracefulFailure),
            -3 => Some(Status::UnexpectedFailure),
            -4 => Some(Status::ConnectionLost),
            -5 => Some(Status::ServerUnavailable),
            -6 => Some(Status::ConnectionTimeout),
            -7 => Some(Status::ResponseUnknown),
            -8 => Some(Status::TxnRestart),
            -9 => Some(Status::OperationalFailure),
            -10 => Some(Status::TxnNotSent),
            -11 => Some(Status::RequestTimeout),
            -12 => Some(Status::ResponseTimeout),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    /// Whether the transaction was aborted (as opposed to failed) — the
    /// distinction feeds the per-procedure stats classification.
    pub fn is_abort(self) -> bool {
        matches!(self, Status::UserAbort | Status::GracefulFailure)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Success => "success",
            Status::UserAbort => "user abort",
            Status::GracefulFailure => "graceful failure",
            Status::UnexpectedFailure => "unexpected failure",
            Status::ConnectionLost => "connection lost",
            Status::ServerUnavailable => "server unavailable",
            Status::ConnectionTimeout => "connection timeout",
            Status::ResponseUnknown => "response unknown",
            Status::TxnRestart => "transaction restart",
            Status::OperationalFailure => "operational failure",
            Status::TxnNotSent => "transaction not sent",
            Status::RequestTimeout => "request timeout",
            Status::ResponseTimeout => "response timeout",
        };
        f.write_str(s)
    }
}

/// A completed procedure-call result.
#[derive(Debug, Clone)]
pub struct ClientResponse {
    client_handle: i64,
    status: Status,
    status_string: Option<String>,
    app_status: i8,
    app_status_string: Option<String>,
    cluster_roundtrip_ms: i32,
    client_roundtrip_ns: u64,
    tables: Vec<ResultTable>,
}

impl ClientResponse {
    pub fn new(status: Status, tables: Vec<ResultTable>, status_string: impl Into<String>) -> Self {
        Self {
            client_handle: -1,
            status,
            status_string: Some(status_string.into()),
            app_status: 0,
            app_status_string: None,
            cluster_roundtrip_ms: 0,
            client_roundtrip_ns: 0,
            tables,
        }
    }

    pub fn client_handle(&self) -> i64 {
        self.client_handle
    }

    pub fn set_client_handle(&mut self, handle: i64) {
        self.client_handle = handle;
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn status_string(&self) -> &str {
        self.status_string.as_deref().unwrap_or("")
    }

    pub fn app_status(&self) -> i8 {
        self.app_status
    }

    pub fn app_status_string(&self) -> &str {
        self.app_status_string.as_deref().unwrap_or("")
    }

    pub fn cluster_roundtrip_ms(&self) -> i32 {
        self.cluster_roundtrip_ms
    }

    pub fn set_cluster_roundtrip_ms(&mut self, ms: i32) {
        self.cluster_roundtrip_ms = ms;
    }

    /// Client-measured round-trip, stamped by the response dispatcher.
    pub fn client_roundtrip_ns(&self) -> u64 {
        self.client_roundtrip_ns
    }

    pub fn set_client_roundtrip_ns(&mut self, ns: u64) {
        self.client_roundtrip_ns = ns;
    }

    pub fn results(&self) -> &[ResultTable] {
        &self.tables
    }

    pub fn serialized_size(&self) -> usize {
        let mut size = 1 + 8 + 1 + 1 + 1 + 4 + 2;
        if let Some(s) = &self.status_string {
            size += 4 + s.len();
        }
        if let Some(s) = &self.app_status_string {
            size += 4 + s.len();
        }
        size + self.tables.iter().map(ResultTable::serialized_size).sum::<usize>()
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(0); // response format version
        buf.put_i64(self.client_handle);
        let mut fields = 0u8;
        if self.status_string.is_some() {
            fields |= FIELD_STATUS_STRING;
        }
        if self.app_status_string.is_some() {
            fields |= FIELD_APP_STATUS_STRING;
        }
        buf.put_u8(fields);
        buf.put_i8(self.status.code());
        if let Some(s) = &self.status_string {
            buf.put_i32(s.len() as i32);
            buf.put_slice(s.as_bytes());
        }
        buf.put_i8(self.app_status);
        if let Some(s) = &self.app_status_string {
            buf.put_i32(s.len() as i32);
            buf.put_slice(s.as_bytes());
        }
        buf.put_i32(self.cluster_roundtrip_ms);
        buf.put_i16(self.tables.len() as i16);
        for t in &self.tables {
            t.write_to(buf);
        }
    }

    pub fn read_from(mut buf: Bytes) -> Result<ClientResponse, WireError> {
        if buf.remaining() < 1 + 8 + 1 + 1 {
            return Err(WireError::Truncated { what: "response header" });
        }
        let _version = buf.get_u8();
        let client_handle = buf.get_i64();
        let fields = buf.get_u8();
        let status_code = buf.get_i8();
        let status = Status::from_code(status_code)
            .ok_or(WireError::UnknownTypeTag(status_code as u8))?;
        let status_string = if fields & FIELD_STATUS_STRING != 0 {
            Some(read_string(&mut buf, "status string")?)
        } else {
            None
        };
        if buf.remaining() < 1 {
            return Err(WireError::Truncated { what: "app status" });
        }
        let app_status = buf.get_i8();
        let app_status_string = if fields & FIELD_APP_STATUS_STRING != 0 {
            Some(read_string(&mut buf, "app status string")?)
        } else {
            None
        };
        if buf.remaining() < 4 + 2 {
            return Err(WireError::Truncated { what: "response footer" });
        }
        let cluster_roundtrip_ms = buf.get_i32();
        let table_count = buf.get_i16();
        if table_count < 0 {
            return Err(WireError::BadLength {
                what: "table count",
                len: table_count as i64,
            });
        }
        let mut tables = Vec::with_capacity(table_count as usize);
        for _ in 0..table_count {
            tables.push(ResultTable::read_from(&mut buf)?);
        }
        Ok(ClientResponse {
            client_handle,
            status,
            status_string,
            app_status,
            app_status_string,
            cluster_roundtrip_ms,
            client_roundtrip_ns: 0,
            tables,
        })
    }
}

fn read_string(buf: &mut Bytes, what: &'static str) -> Result<String, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated { what });
    }
    let len = buf.get_i32();
    if len < 0 {
        return Err(WireError::BadLength { what, len: len as i64 });
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated { what });
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::BadUtf8(what))
}

//! Stored-procedure invocation codec.
//!
//! An invocation is the client's half of a call: procedure name, client
//! handle, optional destination partition, priority, optional batch-timeout
//! override, and the parameter set. Only version 2 is ever written; versions
//! 0 and 1 are decoded for completeness.
//!
//! Version 2 body layout (after the 4-byte frame length):
//!
//! | size | field                                      |
//! |------|--------------------------------------------|
//! | 1    | version byte (2)                           |
//! | 4    | procedure-name length                      |
//! | N    | procedure-name UTF-8 bytes                 |
//! | 8    | client handle                              |
//! | 1    | extension count                            |
//! | 6·e  | extensions (tag, length, body)             |
//! | M    | parameter set                              |
//!
//! Parameter decoding is lazy: `read_from` slices the remaining buffer and
//! the set is parsed once, on first access, and memoized.

use std::sync::OnceLock;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::params::ParameterSet;
use crate::{WireError, NO_BATCH_TIMEOUT, NO_PARTITION};

/// Invocation wire versions. Only `V2` is produced by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationVersion {
    V0,
    V1,
    V2,
}

impl InvocationVersion {
    fn from_byte(b: u8) -> Result<Self, WireError> {
        match b {
            0 => Ok(InvocationVersion::V0),
            1 => Ok(InvocationVersion::V1),
            2 => Ok(InvocationVersion::V2),
            other => Err(WireError::UnknownVersion(other)),
        }
    }
}

/// Extension tags understood by the version-2 decoder.
mod extension {
    /// Batch-timeout override: 4-byte body holding milliseconds.
    pub const BATCH_TIMEOUT: u8 = 1;
}

/// The parameter representation. Exactly one form is populated; the
/// serialized form, once set, is immutable and shared views are cheap
/// `Bytes` clones.
#[derive(Debug, Clone)]
pub enum Params {
    /// Parameters as values, serialized when the invocation is written.
    Values(ParameterSet),
    /// An already-serialized parameter block, written verbatim.
    Serialized(Bytes),
}

/// An immutable descriptor of one stored-procedure call.
#[derive(Debug, Clone)]
pub struct ProcedureInvocation {
    proc_name: String,
    client_handle: i64,
    partition_destination: i32,
    request_priority: u8,
    batch_timeout_ms: i32,
    params: Params,
    /// One-way raw -> parsed memoization for decoded invocations.
    parsed: OnceLock<Result<ParameterSet, WireError>>,
}

impl ProcedureInvocation {
    pub fn new(
        client_handle: i64,
        batch_timeout_ms: i32,
        partition_destination: i32,
        request_priority: u8,
        proc_name: impl Into<String>,
        params: ParameterSet,
    ) -> Self {
        Self {
            proc_name: proc_name.into(),
            client_handle,
            partition_destination,
            request_priority,
            batch_timeout_ms,
            params: Params::Values(params),
            parsed: OnceLock::new(),
        }
    }

    pub fn proc_name(&self) -> &str {
        &self.proc_name
    }

    pub fn client_handle(&self) -> i64 {
        self.client_handle
    }

    pub fn request_priority(&self) -> u8 {
        self.request_priority
    }

    pub fn batch_timeout_ms(&self) -> i32 {
        self.batch_timeout_ms
    }

    pub fn has_partition_destination(&self) -> bool {
        self.partition_destination != NO_PARTITION
    }

    pub fn partition_destination(&self) -> i32 {
        self.partition_destination
    }

    /// Number of parameters passed by the caller.
    pub fn passed_param_count(&self) -> usize {
        match &self.params {
            Params::Values(set) => set.len(),
            Params::Serialized(_) => self.params().map(|s| s.len()).unwrap_or(0),
        }
    }

    /// The parameter set, parsing the serialized form on first access.
    pub fn params(&self) -> Result<&ParameterSet, WireError> {
        match &self.params {
            Params::Values(set) => Ok(set),
            Params::Serialized(raw) => {
                let result = self.parsed.get_or_init(|| {
                    let mut buf = raw.clone();
                    ParameterSet::read_from(&mut buf)
                });
                result.as_ref().map_err(Clone::clone)
            }
        }
    }

    /// A shared view of the serialized parameter block, if one exists.
    pub fn serialized_params(&self) -> Option<Bytes> {
        match &self.params {
            Params::Serialized(raw) => Some(raw.clone()),
            Params::Values(_) => None,
        }
    }

    fn batch_extension_size(&self) -> usize {
        if self.batch_timeout_ms != NO_BATCH_TIMEOUT {
            6
        } else {
            0
        }
    }

    fn extension_count(&self) -> u8 {
        if self.batch_timeout_ms != NO_BATCH_TIMEOUT {
            1
        } else {
            0
        }
    }

    fn params_serialized_size(&self) -> Result<usize, WireError> {
        match &self.params {
            Params::Serialized(raw) => Ok(raw.len()),
            Params::Values(set) => {
                let size = set.serialized_size();
                if !set.is_empty() && size <= 2 {
                    return Err(WireError::InvalidParameterSetSize(size));
                }
                Ok(size)
            }
        }
    }

    /// Exact number of bytes `write_to` will produce.
    pub fn serialized_size(&self) -> Result<usize, WireError> {
        Ok(1 // version
            + 4 + self.proc_name.len()
            + 8 // client handle
            + 1 // extension count
            + self.batch_extension_size()
            + self.params_serialized_size()?)
    }

    /// Write the version-2 wire form. Writes exactly `serialized_size()`
    /// bytes.
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.put_u8(2);
        buf.put_i32(self.proc_name.len() as i32);
        buf.put_slice(self.proc_name.as_bytes());
        buf.put_i64(self.client_handle);
        buf.put_u8(self.extension_count());
        if self.batch_timeout_ms != NO_BATCH_TIMEOUT {
            buf.put_u8(extension::BATCH_TIMEOUT);
            buf.put_u8(4);
            buf.put_i32(self.batch_timeout_ms);
        }
        match &self.params {
            Params::Serialized(raw) => buf.put_slice(raw),
            Params::Values(set) => {
                let size = set.serialized_size();
                if !set.is_empty() && size <= 2 {
                    return Err(WireError::InvalidParameterSetSize(size));
                }
                set.write_to(buf);
            }
        }
        Ok(())
    }

    /// Decode an invocation body, dispatching on the version byte.
    ///
    /// The remaining buffer after the header is kept as the serialized
    /// parameter block; parsing it is deferred until `params()` is called.
    pub fn read_from(mut buf: Bytes) -> Result<ProcedureInvocation, WireError> {
        if buf.remaining() < 1 {
            return Err(WireError::Truncated { what: "invocation version" });
        }
        let version = InvocationVersion::from_byte(buf.get_u8())?;

        let mut batch_timeout_ms = NO_BATCH_TIMEOUT;
        if version == InvocationVersion::V1 {
            // v1 carries a single leading flag byte saying whether a
            // batch-timeout int follows.
            if buf.remaining() < 1 {
                return Err(WireError::Truncated { what: "v1 batch flag" });
            }
            if buf.get_u8() != 0 {
                if buf.remaining() < 4 {
                    return Err(WireError::Truncated { what: "v1 batch timeout" });
                }
                batch_timeout_ms = buf.get_i32();
                if batch_timeout_ms < 0 {
                    return Err(WireError::BadLength {
                        what: "v1 batch timeout",
                        len: batch_timeout_ms as i64,
                    });
                }
            }
        }

        let proc_name = read_name(&mut buf)?;
        if buf.remaining() < 8 {
            return Err(WireError::Truncated { what: "client handle" });
        }
        let client_handle = buf.get_i64();

        if version == InvocationVersion::V2 {
            if buf.remaining() < 1 {
                return Err(WireError::Truncated { what: "extension count" });
            }
            let ext_count = buf.get_u8();
            for _ in 0..ext_count {
                if buf.remaining() < 2 {
                    return Err(WireError::Truncated { what: "extension header" });
                }
                let tag = buf.get_u8();
                let len = buf.get_u8() as usize;
                if buf.remaining() < len {
                    return Err(WireError::Truncated { what: "extension body" });
                }
                match tag {
                    extension::BATCH_TIMEOUT => {
                        if len != 4 {
                            return Err(WireError::BadLength {
                                what: "batch timeout extension",
                                len: len as i64,
                            });
                        }
                        batch_timeout_ms = buf.get_i32();
                    }
                    // Unknown extensions are skipped via their length byte.
                    _ => buf.advance(len),
                }
            }
        }

        Ok(ProcedureInvocation {
            proc_name,
            client_handle,
            partition_destination: NO_PARTITION,
            request_priority: crate::LOWEST_PRIORITY,
            batch_timeout_ms,
            params: Params::Serialized(buf),
            parsed: OnceLock::new(),
        })
    }
}

fn read_name(buf: &mut Bytes) -> Result<String, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated { what: "name length" });
    }
    let len = buf.get_i32();
    if len < 0 {
        // -1 means a null name; clients never produce one.
        return Err(WireError::BadLength {
            what: "procedure name",
            len: len as i64,
        });
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated { what: "procedure name" });
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::BadUtf8("procedure name"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamValue;
    use crate::{clip_priority, NO_PARTITION};

    fn sample(batch_timeout_ms: i32) -> ProcedureInvocation {
        ProcedureInvocation::new(
            77,
            batch_timeout_ms,
            NO_PARTITION,
            clip_priority(4),
            "AddUser",
            ParameterSet::new(vec![ParamValue::I64(12), ParamValue::Str("kim".into())]),
        )
    }

    fn round_trip(inv: &ProcedureInvocation) -> ProcedureInvocation {
        let mut buf = BytesMut::new();
        inv.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), inv.serialized_size().unwrap());
        ProcedureInvocation::read_from(buf.freeze()).unwrap()
    }

    #[test]
    fn v2_round_trips_without_batch_timeout() {
        let inv = sample(NO_BATCH_TIMEOUT);
        let back = round_trip(&inv);
        assert_eq!(back.proc_name(), "AddUser");
        assert_eq!(back.client_handle(), 77);
        assert_eq!(back.batch_timeout_ms(), NO_BATCH_TIMEOUT);
        assert_eq!(back.params().unwrap(), inv.params().unwrap());
    }

    #[test]
    fn v2_round_trips_with_batch_timeout() {
        let inv = sample(250);
        let back = round_trip(&inv);
        assert_eq!(back.batch_timeout_ms(), 250);
        assert_eq!(back.params().unwrap(), inv.params().unwrap());
    }

    #[test]
    fn unknown_extension_is_skipped() {
        let inv = sample(NO_BATCH_TIMEOUT);
        // Hand-build a v2 body with one unknown extension before the params.
        let mut buf = BytesMut::new();
        buf.put_u8(2);
        buf.put_i32(inv.proc_name().len() as i32);
        buf.put_slice(inv.proc_name().as_bytes());
        buf.put_i64(inv.client_handle());
        buf.put_u8(1); // one extension
        buf.put_u8(200); // unknown tag
        buf.put_u8(3);
        buf.put_slice(&[0xde, 0xad, 0xbe]);
        inv.params().unwrap().write_to(&mut buf);

        let back = ProcedureInvocation::read_from(buf.freeze()).unwrap();
        assert_eq!(back.batch_timeout_ms(), NO_BATCH_TIMEOUT);
        assert_eq!(back.params().unwrap(), inv.params().unwrap());
    }

    #[test]
    fn v0_and_v1_are_decoded() {
        let params = ParameterSet::new(vec![ParamValue::I32(5)]);

        let mut v0 = BytesMut::new();
        v0.put_u8(0);
        v0.put_i32(4);
        v0.put_slice(b"Ping");
        v0.put_i64(-9);
        params.write_to(&mut v0);
        let inv0 = ProcedureInvocation::read_from(v0.freeze()).unwrap();
        assert_eq!(inv0.proc_name(), "Ping");
        assert_eq!(inv0.client_handle(), -9);
        assert_eq!(inv0.params().unwrap(), &params);

        let mut v1 = BytesMut::new();
        v1.put_u8(1);
        v1.put_u8(1); // batch timeout follows
        v1.put_i32(900);
        v1.put_i32(4);
        v1.put_slice(b"Ping");
        v1.put_i64(-10);
        params.write_to(&mut v1);
        let inv1 = ProcedureInvocation::read_from(v1.freeze()).unwrap();
        assert_eq!(inv1.batch_timeout_ms(), 900);
        assert_eq!(inv1.params().unwrap(), &params);
    }

    #[test]
    fn params_parse_is_memoized() {
        let inv = round_trip(&sample(NO_BATCH_TIMEOUT));
        let first = inv.params().unwrap() as *const ParameterSet;
        let second = inv.params().unwrap() as *const ParameterSet;
        assert_eq!(first, second);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let body = Bytes::from_static(&[9, 0, 0, 0, 0]);
        assert!(matches!(
            ProcedureInvocation::read_from(body),
            Err(WireError::UnknownVersion(9))
        ));
    }

    #[test]
    fn serialized_params_views_are_shared() {
        let inv = round_trip(&sample(NO_BATCH_TIMEOUT));
        let a = inv.serialized_params().unwrap();
        let b = inv.serialized_params().unwrap();
        assert_eq!(a, b);
    }
}

//! Procedure parameter sets.
//!
//! A parameter set is a 2-byte count followed by tagged values. The type
//! tags double as the catalog's partition-parameter type codes, so the
//! router can coerce a value to the declared partition type before hashing.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::WireError;

/// Wire type codes. These match the catalog's parameter-type integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ParamType {
    Null = 1,
    TinyInt = 3,
    SmallInt = 4,
    Integer = 5,
    BigInt = 6,
    Float = 8,
    String = 9,
    VarBinary = 25,
}

impl ParamType {
    /// Map a catalog type code to a wire type, if known.
    pub fn from_code(code: i32) -> Option<ParamType> {
        match code {
            1 => Some(ParamType::Null),
            3 => Some(ParamType::TinyInt),
            4 => Some(ParamType::SmallInt),
            5 => Some(ParamType::Integer),
            6 => Some(ParamType::BigInt),
            8 => Some(ParamType::Float),
            9 => Some(ParamType::String),
            25 => Some(ParamType::VarBinary),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// A single procedure parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Bytes),
}

impl ParamValue {
    pub fn param_type(&self) -> ParamType {
        match self {
            ParamValue::Null => ParamType::Null,
            ParamValue::I8(_) => ParamType::TinyInt,
            ParamValue::I16(_) => ParamType::SmallInt,
            ParamValue::I32(_) => ParamType::Integer,
            ParamValue::I64(_) => ParamType::BigInt,
            ParamValue::F64(_) => ParamType::Float,
            ParamValue::Str(_) => ParamType::String,
            ParamValue::Bytes(_) => ParamType::VarBinary,
        }
    }

    /// Encoded size including the tag byte.
    pub fn serialized_size(&self) -> usize {
        1 + match self {
            ParamValue::Null => 0,
            ParamValue::I8(_) => 1,
            ParamValue::I16(_) => 2,
            ParamValue::I32(_) => 4,
            ParamValue::I64(_) => 8,
            ParamValue::F64(_) => 8,
            ParamValue::Str(s) => 4 + s.len(),
            ParamValue::Bytes(b) => 4 + b.len(),
        }
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.param_type().code());
        match self {
            ParamValue::Null => {}
            ParamValue::I8(v) => buf.put_i8(*v),
            ParamValue::I16(v) => buf.put_i16(*v),
            ParamValue::I32(v) => buf.put_i32(*v),
            ParamValue::I64(v) => buf.put_i64(*v),
            ParamValue::F64(v) => buf.put_f64(*v),
            ParamValue::Str(s) => {
                buf.put_i32(s.len() as i32);
                buf.put_slice(s.as_bytes());
            }
            ParamValue::Bytes(b) => {
                buf.put_i32(b.len() as i32);
                buf.put_slice(b);
            }
        }
    }

    pub fn read_from(buf: &mut Bytes) -> Result<ParamValue, WireError> {
        if buf.remaining() < 1 {
            return Err(WireError::Truncated { what: "param tag" });
        }
        let tag = buf.get_u8();
        let ptype = ParamType::from_code(tag as i32).ok_or(WireError::UnknownTypeTag(tag))?;
        let value = match ptype {
            ParamType::Null => ParamValue::Null,
            ParamType::TinyInt => {
                need(buf, 1, "tinyint")?;
                ParamValue::I8(buf.get_i8())
            }
            ParamType::SmallInt => {
                need(buf, 2, "smallint")?;
                ParamValue::I16(buf.get_i16())
            }
            ParamType::Integer => {
                need(buf, 4, "integer")?;
                ParamValue::I32(buf.get_i32())
            }
            ParamType::BigInt => {
                need(buf, 8, "bigint")?;
                ParamValue::I64(buf.get_i64())
            }
            ParamType::Float => {
                need(buf, 8, "float")?;
                ParamValue::F64(buf.get_f64())
            }
            ParamType::String => {
                let raw = read_prefixed(buf, "string")?;
                let s = std::str::from_utf8(&raw)
                    .map_err(|_| WireError::BadUtf8("string param"))?
                    .to_owned();
                ParamValue::Str(s)
            }
            ParamType::VarBinary => ParamValue::Bytes(read_prefixed(buf, "varbinary")?),
        };
        Ok(value)
    }

    /// Canonical bytes handed to the hashinator.
    ///
    /// Integer widths are all widened to 8 bytes so `I32(7)` and `I64(7)`
    /// land on the same partition.
    pub fn hash_bytes(&self) -> Vec<u8> {
        match self {
            ParamValue::Null => Vec::new(),
            ParamValue::I8(v) => (*v as i64).to_be_bytes().to_vec(),
            ParamValue::I16(v) => (*v as i64).to_be_bytes().to_vec(),
            ParamValue::I32(v) => (*v as i64).to_be_bytes().to_vec(),
            ParamValue::I64(v) => v.to_be_bytes().to_vec(),
            ParamValue::F64(v) => v.to_bits().to_be_bytes().to_vec(),
            ParamValue::Str(s) => s.as_bytes().to_vec(),
            ParamValue::Bytes(b) => b.to_vec(),
        }
    }
}

fn need(buf: &Bytes, n: usize, what: &'static str) -> Result<(), WireError> {
    if buf.remaining() < n {
        Err(WireError::Truncated { what })
    } else {
        Ok(())
    }
}

fn read_prefixed(buf: &mut Bytes, what: &'static str) -> Result<Bytes, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated { what });
    }
    let len = buf.get_i32();
    if len < 0 {
        return Err(WireError::BadLength {
            what,
            len: len as i64,
        });
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated { what });
    }
    Ok(buf.split_to(len))
}

/// An ordered set of procedure parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    values: Vec<ParamValue>,
}

impl ParameterSet {
    pub fn new(values: Vec<ParamValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[ParamValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ParamValue> {
        self.values.get(index)
    }

    /// Encoded size: 2-byte count plus each value.
    pub fn serialized_size(&self) -> usize {
        2 + self.values.iter().map(ParamValue::serialized_size).sum::<usize>()
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_i16(self.values.len() as i16);
        for v in &self.values {
            v.write_to(buf);
        }
    }

    pub fn read_from(buf: &mut Bytes) -> Result<ParameterSet, WireError> {
        if buf.remaining() < 2 {
            return Err(WireError::Truncated { what: "param count" });
        }
        let count = buf.get_i16();
        if count < 0 {
            return Err(WireError::BadLength {
                what: "param count",
                len: count as i64,
            });
        }
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            values.push(ParamValue::read_from(buf)?);
        }
        Ok(ParameterSet { values })
    }
}

impl From<Vec<ParamValue>> for ParameterSet {
    fn from(values: Vec<ParamValue>) -> Self {
        Self { values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_is_two_bytes() {
        let set = ParameterSet::default();
        assert_eq!(set.serialized_size(), 2);
        let mut buf = BytesMut::new();
        set.write_to(&mut buf);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn values_round_trip() {
        let set = ParameterSet::new(vec![
            ParamValue::Null,
            ParamValue::I8(-3),
            ParamValue::I16(500),
            ParamValue::I32(70_000),
            ParamValue::I64(1 << 40),
            ParamValue::F64(2.5),
            ParamValue::Str("partition key".into()),
            ParamValue::Bytes(Bytes::from_static(b"\x00\x01\x02")),
        ]);
        let mut buf = BytesMut::new();
        set.write_to(&mut buf);
        assert_eq!(buf.len(), set.serialized_size());

        let mut bytes = buf.freeze();
        let decoded = ParameterSet::read_from(&mut bytes).unwrap();
        assert_eq!(decoded, set);
        assert!(bytes.is_empty());
    }

    #[test]
    fn truncated_value_is_an_error() {
        let set = ParameterSet::new(vec![ParamValue::I64(9)]);
        let mut buf = BytesMut::new();
        set.write_to(&mut buf);
        let mut short = buf.freeze().slice(0..5);
        assert!(matches!(
            ParameterSet::read_from(&mut short),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn integer_widths_hash_identically() {
        assert_eq!(ParamValue::I32(42).hash_bytes(), ParamValue::I64(42).hash_bytes());
        assert_eq!(ParamValue::I8(7).hash_bytes(), ParamValue::I64(7).hash_bytes());
    }
}

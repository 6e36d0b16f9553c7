//! Result tables.
//!
//! The compact tabular format used for procedure results and for the
//! system-procedure result sets the runtime consumes (topology, catalog,
//! host overview, partition keys). Layout: 2-byte column count, per column
//! a length-prefixed name and a type tag, 4-byte row count, then rows of
//! tagged values.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::params::{ParamType, ParamValue};
use crate::WireError;

#[derive(Debug, Clone, PartialEq)]
struct Column {
    name: String,
    ctype: ParamType,
}

/// One result table: named, typed columns and rows of values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultTable {
    columns: Vec<Column>,
    rows: Vec<Vec<ParamValue>>,
}

impl ResultTable {
    /// Build a table from column (name, type) pairs.
    pub fn new(columns: Vec<(&str, ParamType)>) -> Self {
        Self {
            columns: columns
                .into_iter()
                .map(|(name, ctype)| Column {
                    name: name.to_owned(),
                    ctype,
                })
                .collect(),
            rows: Vec::new(),
        }
    }

    /// Append a row. The value count must match the column count.
    pub fn add_row(&mut self, row: Vec<ParamValue>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    fn value(&self, row: usize, col: &str) -> Option<&ParamValue> {
        let idx = self.column_index(col)?;
        self.rows.get(row)?.get(idx)
    }

    fn value_at(&self, row: usize, col: usize) -> Option<&ParamValue> {
        self.rows.get(row)?.get(col)
    }

    /// Integer accessor; widens any integral column value.
    pub fn get_long(&self, row: usize, col: &str) -> Option<i64> {
        as_long(self.value(row, col)?)
    }

    pub fn get_string(&self, row: usize, col: &str) -> Option<&str> {
        match self.value(row, col)? {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// String accessor by column position, for tables addressed by index.
    pub fn get_string_at(&self, row: usize, col: usize) -> Option<&str> {
        match self.value_at(row, col)? {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_varbinary(&self, row: usize, col: &str) -> Option<&Bytes> {
        match self.value(row, col)? {
            ParamValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn serialized_size(&self) -> usize {
        let mut size = 2;
        for col in &self.columns {
            size += 4 + col.name.len() + 1;
        }
        size += 4;
        for row in &self.rows {
            size += row.iter().map(ParamValue::serialized_size).sum::<usize>();
        }
        size
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_i16(self.columns.len() as i16);
        for col in &self.columns {
            buf.put_i32(col.name.len() as i32);
            buf.put_slice(col.name.as_bytes());
            buf.put_u8(col.ctype.code());
        }
        buf.put_i32(self.rows.len() as i32);
        for row in &self.rows {
            for v in row {
                v.write_to(buf);
            }
        }
    }

    pub fn read_from(buf: &mut Bytes) -> Result<ResultTable, WireError> {
        if buf.remaining() < 2 {
            return Err(WireError::Truncated { what: "column count" });
        }
        let col_count = buf.get_i16();
        if col_count < 0 {
            return Err(WireError::BadLength {
                what: "column count",
                len: col_count as i64,
            });
        }
        let mut columns = Vec::with_capacity(col_count as usize);
        for _ in 0..col_count {
            if buf.remaining() < 4 {
                return Err(WireError::Truncated { what: "column name" });
            }
            let len = buf.get_i32();
            if len < 0 {
                return Err(WireError::BadLength {
                    what: "column name",
                    len: len as i64,
                });
            }
            let len = len as usize;
            if buf.remaining() < len + 1 {
                return Err(WireError::Truncated { what: "column name" });
            }
            let raw = buf.split_to(len);
            let name = String::from_utf8(raw.to_vec())
                .map_err(|_| WireError::BadUtf8("column name"))?;
            let tag = buf.get_u8();
            let ctype =
                ParamType::from_code(tag as i32).ok_or(WireError::UnknownTypeTag(tag))?;
            columns.push(Column { name, ctype });
        }
        if buf.remaining() < 4 {
            return Err(WireError::Truncated { what: "row count" });
        }
        let row_count = buf.get_i32();
        if row_count < 0 {
            return Err(WireError::BadLength {
                what: "row count",
                len: row_count as i64,
            });
        }
        let mut rows = Vec::with_capacity(row_count as usize);
        for _ in 0..row_count {
            let mut row = Vec::with_capacity(columns.len());
            for _ in 0..columns.len() {
                row.push(ParamValue::read_from(buf)?);
            }
            rows.push(row);
        }
        Ok(ResultTable { columns, rows })
    }
}

fn as_long(v: &ParamValue) -> Option<i64> {
    match v {
        ParamValue::I8(n) => Some(*n as i64),
        ParamValue::I16(n) => Some(*n as i64),
        ParamValue::I32(n) => Some(*n as i64),
        ParamValue::I64(n) => Some(*n),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topo_table() -> ResultTable {
        let mut t = ResultTable::new(vec![
            ("Partition", ParamType::Integer),
            ("Leader", ParamType::String),
            ("Sites", ParamType::String),
        ]);
        t.add_row(vec![
            ParamValue::I32(0),
            ParamValue::Str("0:0".into()),
            ParamValue::Str("0:0,1:0".into()),
        ]);
        t.add_row(vec![
            ParamValue::I32(1),
            ParamValue::Str("1:0".into()),
            ParamValue::Str("0:0,1:0".into()),
        ]);
        t
    }

    #[test]
    fn table_round_trips() {
        let table = topo_table();
        let mut buf = BytesMut::new();
        table.write_to(&mut buf);
        assert_eq!(buf.len(), table.serialized_size());

        let mut bytes = buf.freeze();
        let back = ResultTable::read_from(&mut bytes).unwrap();
        assert_eq!(back, table);
        assert!(bytes.is_empty());
    }

    #[test]
    fn accessors_find_values_by_name() {
        let table = topo_table();
        assert_eq!(table.get_long(0, "Partition"), Some(0));
        assert_eq!(table.get_string(1, "Leader"), Some("1:0"));
        assert_eq!(table.get_string(2, "Leader"), None);
        assert_eq!(table.get_long(0, "NoSuchColumn"), None);
    }

    #[test]
    fn positional_accessor() {
        let table = topo_table();
        assert_eq!(table.get_string_at(0, 1), Some("0:0"));
        assert_eq!(table.get_string_at(0, 9), None);
    }
}

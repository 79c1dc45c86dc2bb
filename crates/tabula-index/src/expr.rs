//! Key expressions: fixed-width, byte-comparable keys computed from rows.
//!
//! Column keys start with a null marker (0x00 for null, 0x01 otherwise) so
//! nulls sort first. Numbers are encoded big-endian with the sign bit
//! flipped, which makes unsigned byte order match numeric order.

use crate::rows::{ColumnHandle, RowIterator, Structure};
use std::fmt;
use tabula_common::{ColumnType, Result, TabulaError, Value};

const NULL_MARK: u8 = 0x00;
const VALUE_MARK: u8 = 0x01;
const SIGN_BIT: u64 = 1 << 63;

/// Computes the index key of the current row of a row iterator.
pub trait KeyExpression: Send + Sync {
    /// Length in bytes of every key this expression produces.
    fn key_len(&self) -> usize;

    /// Appends the key of `row`'s current row to `out`.
    fn evaluate(&self, row: &dyn RowIterator, out: &mut Vec<u8>) -> Result<()>;

    /// Human readable form, used in logs.
    fn describe(&self) -> String;
}

/// Key taken from a single column.
#[derive(Debug, Clone)]
pub struct ColumnKey {
    column: ColumnHandle,
    name: String,
    column_type: ColumnType,
    payload: usize,
}

impl ColumnKey {
    pub fn new(structure: &Structure, name: &str) -> Result<Self> {
        let column = structure.column(name)?;
        let desc = structure.desc(column)?;
        let payload = match desc.column_type {
            ColumnType::Boolean => 1,
            ColumnType::Integer | ColumnType::Double | ColumnType::DateTime => 8,
            ColumnType::String | ColumnType::Binary => desc.width,
        };
        if payload == 0 {
            return Err(TabulaError::invalid(format!("{} width", desc.name), 0));
        }
        Ok(Self {
            column,
            name: desc.name.clone(),
            column_type: desc.column_type,
            payload,
        })
    }

    pub fn column(&self) -> ColumnHandle {
        self.column
    }

    /// Encodes `value` as this column's key, for building seek keys.
    pub fn encode_value(&self, value: &Value) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.key_len());
        self.encode_into(value, &mut out)?;
        Ok(out)
    }

    fn encode_into(&self, value: &Value, out: &mut Vec<u8>) -> Result<()> {
        let start = out.len();
        match (self.column_type, value) {
            (_, Value::Null) => {
                out.push(NULL_MARK);
                out.resize(start + 1 + self.payload, 0);
                return Ok(());
            }
            (ColumnType::Boolean, Value::Boolean(b)) => {
                out.push(VALUE_MARK);
                out.push(u8::from(*b));
            }
            (ColumnType::Integer, Value::Integer(v)) | (ColumnType::DateTime, Value::DateTime(v)) => {
                out.push(VALUE_MARK);
                out.extend_from_slice(&((*v as u64) ^ SIGN_BIT).to_be_bytes());
            }
            (ColumnType::Double, Value::Double(d)) => {
                out.push(VALUE_MARK);
                out.extend_from_slice(&order_double(*d).to_be_bytes());
            }
            (ColumnType::Double, Value::Integer(v)) => {
                out.push(VALUE_MARK);
                out.extend_from_slice(&order_double(*v as f64).to_be_bytes());
            }
            (ColumnType::String, Value::String(s)) => {
                out.push(VALUE_MARK);
                pad_into(s.as_bytes(), self.payload, out);
            }
            (ColumnType::Binary, Value::Binary(b)) => {
                out.push(VALUE_MARK);
                pad_into(b, self.payload, out);
            }
            (expected, other) => {
                return Err(TabulaError::TypeMismatch {
                    expected: expected.to_string(),
                    actual: other
                        .column_type()
                        .map(|t| t.to_string())
                        .unwrap_or_default(),
                });
            }
        }
        debug_assert_eq!(out.len() - start, self.key_len());
        Ok(())
    }

    fn read(&self, row: &dyn RowIterator) -> Result<Value> {
        let c = self.column;
        let value = match self.column_type {
            ColumnType::Boolean => row.get_boolean(c)?.map(Value::Boolean),
            ColumnType::Integer => row.get_integer(c)?.map(Value::Integer),
            ColumnType::Double => row.get_double(c)?.map(Value::Double),
            ColumnType::DateTime => row.get_datetime(c)?.map(Value::DateTime),
            ColumnType::String => row.get_string(c)?.map(Value::String),
            ColumnType::Binary => {
                if row.is_null(c)? {
                    None
                } else {
                    Some(Value::Binary(row.raw(c)?))
                }
            }
        };
        Ok(value.unwrap_or(Value::Null))
    }
}

/// Maps a double to a u64 whose unsigned order matches numeric order.
fn order_double(d: f64) -> u64 {
    let bits = d.to_bits();
    if bits & SIGN_BIT != 0 {
        !bits
    } else {
        bits | SIGN_BIT
    }
}

/// Appends `bytes` truncated or zero-padded to `width`.
fn pad_into(bytes: &[u8], width: usize, out: &mut Vec<u8>) {
    let take = bytes.len().min(width);
    out.extend_from_slice(&bytes[..take]);
    out.resize(out.len() + width - take, 0);
}

impl KeyExpression for ColumnKey {
    fn key_len(&self) -> usize {
        1 + self.payload
    }

    fn evaluate(&self, row: &dyn RowIterator, out: &mut Vec<u8>) -> Result<()> {
        let value = self.read(row)?;
        self.encode_into(&value, out)
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Concatenation of several expressions, compared part by part.
pub struct CompositeKey {
    parts: Vec<Box<dyn KeyExpression>>,
}

impl CompositeKey {
    pub fn new(parts: Vec<Box<dyn KeyExpression>>) -> Result<Self> {
        if parts.is_empty() {
            return Err(TabulaError::invalid("key parts", 0));
        }
        Ok(Self { parts })
    }
}

impl KeyExpression for CompositeKey {
    fn key_len(&self) -> usize {
        self.parts.iter().map(|p| p.key_len()).sum()
    }

    fn evaluate(&self, row: &dyn RowIterator, out: &mut Vec<u8>) -> Result<()> {
        for part in &self.parts {
            part.evaluate(row, out)?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.parts
            .iter()
            .map(|p| p.describe())
            .collect::<Vec<_>>()
            .join(" + ")
    }
}

type KeyFn = dyn Fn(&dyn RowIterator, &mut Vec<u8>) -> Result<()> + Send + Sync;

/// Expression backed by a closure that appends exactly `key_len` bytes.
pub struct FnKey {
    key_len: usize,
    label: String,
    f: Box<KeyFn>,
}

impl FnKey {
    pub fn new<F>(key_len: usize, label: impl Into<String>, f: F) -> Self
    where
        F: Fn(&dyn RowIterator, &mut Vec<u8>) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            key_len,
            label: label.into(),
            f: Box::new(f),
        }
    }
}

impl KeyExpression for FnKey {
    fn key_len(&self) -> usize {
        self.key_len
    }

    fn evaluate(&self, row: &dyn RowIterator, out: &mut Vec<u8>) -> Result<()> {
        let start = out.len();
        (self.f)(row, out)?;
        let written = out.len() - start;
        if written != self.key_len {
            out.truncate(start);
            return Err(TabulaError::invalid(format!("{} key length", self.label), written));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

impl fmt::Debug for dyn KeyExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyExpression({}, {} bytes)", self.describe(), self.key_len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTable;
    use crate::rows::ColumnDesc;
    use tabula_common::RowId;

    fn table() -> MemoryTable {
        MemoryTable::new(Structure::new(vec![
            ColumnDesc::new("n", ColumnType::Integer, 0),
            ColumnDesc::new("d", ColumnType::Double, 0),
            ColumnDesc::new("s", ColumnType::String, 4),
            ColumnDesc::new("b", ColumnType::Boolean, 0),
        ]))
    }

    #[test]
    fn test_integer_order() {
        let t = table();
        let key = ColumnKey::new(t.structure(), "n").unwrap();
        let encoded: Vec<Vec<u8>> = [i64::MIN, -5, -1, 0, 1, 7, i64::MAX]
            .iter()
            .map(|v| key.encode_value(&Value::Integer(*v)).unwrap())
            .collect();
        assert!(encoded.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(key.key_len(), 9);
        assert!(key.encode_value(&Value::Null).unwrap() < encoded[0]);
    }

    #[test]
    fn test_double_order() {
        let t = table();
        let key = ColumnKey::new(t.structure(), "d").unwrap();
        let encoded: Vec<Vec<u8>> = [f64::NEG_INFINITY, -2.5, -0.0, 0.0, 1e-9, 3.0, f64::INFINITY]
            .iter()
            .map(|v| key.encode_value(&Value::Double(*v)).unwrap())
            .collect();
        assert!(encoded.windows(2).all(|w| w[0] <= w[1]));
        assert!(encoded[1] < encoded[4]);
    }

    #[test]
    fn test_string_padding_and_truncation() {
        let t = table();
        let key = ColumnKey::new(t.structure(), "s").unwrap();
        assert_eq!(key.encode_value(&Value::from("ab")).unwrap(), b"\x01ab\0\0".to_vec());
        assert_eq!(key.encode_value(&Value::from("abcdef")).unwrap(), b"\x01abcd".to_vec());
        assert!(matches!(
            key.encode_value(&Value::Integer(1)),
            Err(TabulaError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_evaluate_reads_current_row() {
        let t = table();
        t.insert(vec![
            Value::Integer(3),
            Value::Null,
            Value::from("x"),
            Value::Boolean(true),
        ])
        .unwrap();
        let mut row = t.iter();
        row.go_row(RowId(1)).unwrap();

        let key = CompositeKey::new(vec![
            Box::new(ColumnKey::new(t.structure(), "b").unwrap()),
            Box::new(ColumnKey::new(t.structure(), "d").unwrap()),
        ])
        .unwrap();
        let mut out = Vec::new();
        key.evaluate(&row, &mut out).unwrap();
        assert_eq!(out.len(), key.key_len());
        assert_eq!(&out[..2], &[VALUE_MARK, 1]);
        assert_eq!(out[2], NULL_MARK);
        assert_eq!(key.describe(), "b + d");
    }

    #[test]
    fn test_fn_key_checks_length() {
        let t = table();
        t.insert(vec![Value::Integer(3), Value::Null, Value::Null, Value::Null])
            .unwrap();
        let mut row = t.iter();
        row.go_first().unwrap();

        let good = FnKey::new(2, "rowid", |row, out| {
            let id = row.row_id().map(|r| r.0).unwrap_or(0) as u16;
            out.extend_from_slice(&id.to_be_bytes());
            Ok(())
        });
        let mut out = Vec::new();
        good.evaluate(&row, &mut out).unwrap();
        assert_eq!(out, vec![0, 1]);

        let bad = FnKey::new(4, "short", |_, out| {
            out.push(1);
            Ok(())
        });
        let mut out = Vec::new();
        assert!(bad.evaluate(&row, &mut out).is_err());
        assert!(out.is_empty());
    }
}

//! Column types, cell values and row identifiers.

use serde::{Deserialize, Serialize};

/// Identifier of a row in a base data set.
///
/// Row ids are assigned by the data source and stay stable while the row
/// exists. Indexes store them big-endian so byte order matches numeric order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RowId(pub u64);

impl RowId {
    /// Encodes the row id into `len` big-endian bytes.
    ///
    /// Returns None if the id does not fit.
    pub fn to_be_bytes(&self, len: usize) -> Option<Vec<u8>> {
        if len == 0 || len > 8 {
            return None;
        }
        if len < 8 && self.0 >> (len * 8) != 0 {
            return None;
        }
        let full = self.0.to_be_bytes();
        Some(full[8 - len..].to_vec())
    }

    /// Decodes a big-endian row id of up to 8 bytes.
    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        let mut full = [0u8; 8];
        let len = bytes.len().min(8);
        full[8 - len..].copy_from_slice(&bytes[bytes.len() - len..]);
        RowId(u64::from_be_bytes(full))
    }
}

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Logical type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColumnType {
    Boolean = 1,
    Integer = 2,
    Double = 3,
    /// Microseconds since the Unix epoch.
    DateTime = 4,
    String = 5,
    Binary = 6,
}

impl ColumnType {
    /// Returns the fixed byte size for this type, or None for variable-length types.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            ColumnType::Boolean => Some(1),
            ColumnType::Integer | ColumnType::Double | ColumnType::DateTime => Some(8),
            ColumnType::String | ColumnType::Binary => None,
        }
    }

    /// Returns true if this type is numeric.
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Double)
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ColumnType::Boolean => "Boolean",
            ColumnType::Integer => "Integer",
            ColumnType::Double => "Double",
            ColumnType::DateTime => "DateTime",
            ColumnType::String => "String",
            ColumnType::Binary => "Binary",
        };
        f.write_str(name)
    }
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    DateTime(i64),
    String(String),
    Binary(Vec<u8>),
}

impl Value {
    /// Returns the column type of this value, or None for null.
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(ColumnType::Boolean),
            Value::Integer(_) => Some(ColumnType::Integer),
            Value::Double(_) => Some(ColumnType::Double),
            Value::DateTime(_) => Some(ColumnType::DateTime),
            Value::String(_) => Some(ColumnType::String),
            Value::Binary(_) => Some(ColumnType::Binary),
        }
    }

    /// Returns true if the value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Raw byte representation used by width/raw accessors.
    pub fn to_raw(&self) -> Vec<u8> {
        match self {
            Value::Null => Vec::new(),
            Value::Boolean(b) => vec![*b as u8],
            Value::Integer(i) | Value::DateTime(i) => i.to_le_bytes().to_vec(),
            Value::Double(d) => d.to_le_bytes().to_vec(),
            Value::String(s) => s.as_bytes().to_vec(),
            Value::Binary(b) => b.clone(),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_id_encode_full_width() {
        let id = RowId(0x0102_0304_0506_0708);
        assert_eq!(
            id.to_be_bytes(8).unwrap(),
            vec![1, 2, 3, 4, 5, 6, 7, 8]
        );
        assert_eq!(RowId::from_be_bytes(&[1, 2, 3, 4, 5, 6, 7, 8]), id);
    }

    #[test]
    fn test_row_id_encode_narrow() {
        let id = RowId(300);
        let bytes = id.to_be_bytes(4).unwrap();
        assert_eq!(bytes, vec![0, 0, 1, 44]);
        assert_eq!(RowId::from_be_bytes(&bytes), id);
    }

    #[test]
    fn test_row_id_does_not_fit() {
        assert!(RowId(1 << 32).to_be_bytes(4).is_none());
        assert!(RowId(1).to_be_bytes(0).is_none());
        assert!(RowId(1).to_be_bytes(9).is_none());
    }

    #[test]
    fn test_row_id_byte_order_matches_numeric_order() {
        let a = RowId(255).to_be_bytes(4).unwrap();
        let b = RowId(256).to_be_bytes(4).unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_column_type_fixed_size() {
        assert_eq!(ColumnType::Boolean.fixed_size(), Some(1));
        assert_eq!(ColumnType::Integer.fixed_size(), Some(8));
        assert_eq!(ColumnType::DateTime.fixed_size(), Some(8));
        assert_eq!(ColumnType::String.fixed_size(), None);
        assert!(ColumnType::Double.is_numeric());
        assert!(!ColumnType::String.is_numeric());
    }

    #[test]
    fn test_value_column_type() {
        assert_eq!(Value::Null.column_type(), None);
        assert_eq!(Value::from(3i64).column_type(), Some(ColumnType::Integer));
        assert_eq!(Value::from("x").column_type(), Some(ColumnType::String));
        assert!(Value::Null.is_null());
    }

    #[test]
    fn test_value_raw() {
        assert_eq!(Value::from(true).to_raw(), vec![1]);
        assert_eq!(Value::from("ab").to_raw(), b"ab".to_vec());
        assert_eq!(Value::from(1i64).to_raw(), 1i64.to_le_bytes().to_vec());
        assert!(Value::Null.to_raw().is_empty());
    }

    #[test]
    fn test_value_serde_roundtrip() {
        let values = vec![
            Value::Null,
            Value::Integer(-5),
            Value::Double(2.5),
            Value::String("hello".to_string()),
        ];
        let json = serde_json::to_string(&values).unwrap();
        let back: Vec<Value> = serde_json::from_str(&json).unwrap();
        assert_eq!(values, back);
    }
}

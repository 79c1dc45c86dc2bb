//! Row iterator contract shared by base data sets and indexed views.

use tabula_common::{ColumnType, Result, RowId, TabulaError, Value};

/// Opaque reference to a column of a `Structure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColumnHandle(pub usize);

/// Description of one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDesc {
    pub name: String,
    pub column_type: ColumnType,
    /// Display width for strings and binaries, byte size for fixed types.
    pub width: usize,
    pub nullable: bool,
}

impl ColumnDesc {
    pub fn new(name: impl Into<String>, column_type: ColumnType, width: usize) -> Self {
        Self {
            name: name.into(),
            column_type,
            width: column_type.fixed_size().unwrap_or(width),
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Schema of a row iterator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Structure {
    columns: Vec<ColumnDesc>,
}

impl Structure {
    pub fn new(columns: Vec<ColumnDesc>) -> Self {
        Self { columns }
    }

    /// Looks a column up by name, ignoring ASCII case.
    pub fn column(&self, name: &str) -> Result<ColumnHandle> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .map(ColumnHandle)
            .ok_or_else(|| TabulaError::ColumnNotFound(name.to_string()))
    }

    pub fn desc(&self, column: ColumnHandle) -> Result<&ColumnDesc> {
        self.columns
            .get(column.0)
            .ok_or_else(|| TabulaError::ColumnNotFound(format!("#{}", column.0)))
    }

    pub fn columns(&self) -> &[ColumnDesc] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Behaviour flags of a row iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct IteratorFlags(u32);

impl IteratorFlags {
    pub const NONE: IteratorFlags = IteratorFlags(0);
    /// The iterator only moves forward.
    pub const FORWARD_ONLY: IteratorFlags = IteratorFlags(1);
    /// Backward moves are served from a cache.
    pub const REVERSE_CACHE: IteratorFlags = IteratorFlags(1 << 1);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: IteratorFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: IteratorFlags) -> IteratorFlags {
        IteratorFlags(self.0 | other.0)
    }

    pub fn without(self, other: IteratorFlags) -> IteratorFlags {
        IteratorFlags(self.0 & !other.0)
    }
}

/// Traversal direction of an indexed view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Change to a base row, pushed to views over the data set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowEvent {
    Updated(RowId),
    Deleted(RowId),
}

fn mismatch(expected: &str, actual: &Value) -> TabulaError {
    TabulaError::TypeMismatch {
        expected: expected.to_string(),
        actual: actual
            .column_type()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "Null".to_string()),
    }
}

/// Cursor over the rows of a data set.
///
/// A row iterator sits before the first row, on a row, or after the last
/// row. `skip` from before the first row starts at the first row and from
/// after the last row starts at the last one. Typed getters read the
/// current row and return None for null cells.
pub trait RowIterator: Send {
    /// Independent iterator over the same rows, at the same position.
    fn clone_iterator(&self) -> Result<Box<dyn RowIterator>>;

    fn go_first(&mut self) -> Result<bool>;

    fn go_last(&mut self) -> Result<bool>;

    /// Moves `delta` rows and returns how many were actually moved.
    fn skip(&mut self, delta: i64) -> Result<i64>;

    fn is_bof(&self) -> bool;

    fn is_eof(&self) -> bool;

    /// Moves to the row with id `row`. Returns false, without moving, if no
    /// such row exists.
    fn go_row(&mut self, row: RowId) -> Result<bool>;

    fn row_id(&self) -> Option<RowId>;

    fn structure(&self) -> &Structure;

    /// Cell of the current row.
    fn value(&self, column: ColumnHandle) -> Result<Value>;

    fn get_string(&self, column: ColumnHandle) -> Result<Option<String>> {
        match self.value(column)? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Err(mismatch("String", &other)),
        }
    }

    fn get_double(&self, column: ColumnHandle) -> Result<Option<f64>> {
        match self.value(column)? {
            Value::Null => Ok(None),
            Value::Double(d) => Ok(Some(d)),
            Value::Integer(i) => Ok(Some(i as f64)),
            other => Err(mismatch("Double", &other)),
        }
    }

    fn get_integer(&self, column: ColumnHandle) -> Result<Option<i64>> {
        match self.value(column)? {
            Value::Null => Ok(None),
            Value::Integer(i) => Ok(Some(i)),
            other => Err(mismatch("Integer", &other)),
        }
    }

    fn get_datetime(&self, column: ColumnHandle) -> Result<Option<i64>> {
        match self.value(column)? {
            Value::Null => Ok(None),
            Value::DateTime(t) => Ok(Some(t)),
            other => Err(mismatch("DateTime", &other)),
        }
    }

    fn get_boolean(&self, column: ColumnHandle) -> Result<Option<bool>> {
        match self.value(column)? {
            Value::Null => Ok(None),
            Value::Boolean(b) => Ok(Some(b)),
            other => Err(mismatch("Boolean", &other)),
        }
    }

    fn is_null(&self, column: ColumnHandle) -> Result<bool> {
        Ok(self.value(column)?.is_null())
    }

    /// Raw bytes of a cell.
    fn raw(&self, column: ColumnHandle) -> Result<Vec<u8>> {
        Ok(self.value(column)?.to_raw())
    }

    fn width(&self, column: ColumnHandle) -> Result<usize> {
        Ok(self.structure().desc(column)?.width)
    }

    fn flags(&self) -> IteratorFlags;

    fn set_flags(&mut self, flags: IteratorFlags);

    /// Number of rows, when cheap to know.
    fn row_count_hint(&self) -> Option<u64> {
        None
    }
}

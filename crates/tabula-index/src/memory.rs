//! In-memory data set implementing the row iterator contract.

use crate::rows::{ColumnHandle, IteratorFlags, RowIterator, Structure};
use parking_lot::RwLock;
use std::sync::Arc;
use tabula_common::{Result, RowId, TabulaError, Value};

struct TableData {
    rows: Vec<Option<Vec<Value>>>,
    live: usize,
}

/// Shared, mutable table of rows. Clones see the same rows.
///
/// Row ids start at 1 and are never reused; deleted rows leave a hole.
#[derive(Clone)]
pub struct MemoryTable {
    structure: Arc<Structure>,
    data: Arc<RwLock<TableData>>,
}

impl MemoryTable {
    pub fn new(structure: Structure) -> Self {
        Self {
            structure: Arc::new(structure),
            data: Arc::new(RwLock::new(TableData {
                rows: Vec::new(),
                live: 0,
            })),
        }
    }

    pub fn structure(&self) -> &Structure {
        &self.structure
    }

    fn check_row(&self, values: &[Value]) -> Result<()> {
        if values.len() != self.structure.len() {
            return Err(TabulaError::invalid("row width", values.len()));
        }
        for (desc, value) in self.structure.columns().iter().zip(values) {
            match value.column_type() {
                None if !desc.nullable => {
                    return Err(TabulaError::invalid(desc.name.as_str(), "null"));
                }
                Some(t) if t != desc.column_type => {
                    return Err(TabulaError::TypeMismatch {
                        expected: desc.column_type.to_string(),
                        actual: t.to_string(),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Appends a row and returns its id.
    pub fn insert(&self, values: Vec<Value>) -> Result<RowId> {
        self.check_row(&values)?;
        let mut data = self.data.write();
        data.rows.push(Some(values));
        data.live += 1;
        Ok(RowId(data.rows.len() as u64))
    }

    fn slot(id: RowId) -> Option<usize> {
        (id.0 as usize).checked_sub(1)
    }

    pub fn update(&self, id: RowId, values: Vec<Value>) -> Result<()> {
        self.check_row(&values)?;
        let mut data = self.data.write();
        let row = Self::slot(id)
            .and_then(|i| data.rows.get_mut(i))
            .filter(|row| row.is_some())
            .ok_or_else(|| TabulaError::invalid("row", id))?;
        *row = Some(values);
        Ok(())
    }

    pub fn delete(&self, id: RowId) -> Result<()> {
        let mut data = self.data.write();
        let row = Self::slot(id)
            .and_then(|i| data.rows.get_mut(i))
            .filter(|row| row.is_some())
            .ok_or_else(|| TabulaError::invalid("row", id))?;
        *row = None;
        data.live -= 1;
        Ok(())
    }

    /// Copy of a live row.
    pub fn get(&self, id: RowId) -> Option<Vec<Value>> {
        let data = self.data.read();
        Self::slot(id).and_then(|i| data.rows.get(i)?.clone())
    }

    /// Number of live rows.
    pub fn len(&self) -> usize {
        self.data.read().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterator positioned before the first row.
    pub fn iter(&self) -> MemoryRowIterator {
        MemoryRowIterator {
            table: self.clone(),
            position: Position::Bof,
            flags: IteratorFlags::NONE,
        }
    }

    /// Nearest live slot at or after `from`, walking in `step` direction.
    fn live_from(&self, from: i64, step: i64) -> Option<usize> {
        let data = self.data.read();
        let mut i = from;
        while i >= 0 && (i as usize) < data.rows.len() {
            if data.rows[i as usize].is_some() {
                return Some(i as usize);
            }
            i += step;
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Bof,
    At(usize),
    Eof,
}

/// Row iterator over a `MemoryTable` in row id order.
#[derive(Clone)]
pub struct MemoryRowIterator {
    table: MemoryTable,
    position: Position,
    flags: IteratorFlags,
}

impl MemoryRowIterator {
    pub fn table(&self) -> &MemoryTable {
        &self.table
    }
}

impl RowIterator for MemoryRowIterator {
    fn clone_iterator(&self) -> Result<Box<dyn RowIterator>> {
        Ok(Box::new(self.clone()))
    }

    fn go_first(&mut self) -> Result<bool> {
        self.position = match self.table.live_from(0, 1) {
            Some(i) => Position::At(i),
            None => Position::Eof,
        };
        Ok(matches!(self.position, Position::At(_)))
    }

    fn go_last(&mut self) -> Result<bool> {
        let end = self.table.data.read().rows.len() as i64 - 1;
        self.position = match self.table.live_from(end, -1) {
            Some(i) => Position::At(i),
            None => Position::Bof,
        };
        Ok(matches!(self.position, Position::At(_)))
    }

    fn skip(&mut self, delta: i64) -> Result<i64> {
        if delta == 0 {
            return Ok(0);
        }
        let step = delta.signum();
        let mut moved = 0i64;
        let mut at = match (self.position, step) {
            (Position::At(i), _) => i as i64,
            (Position::Bof, 1) => -1,
            (Position::Eof, -1) => self.table.data.read().rows.len() as i64,
            _ => return Ok(0),
        };
        while moved != delta {
            match self.table.live_from(at + step, step) {
                Some(i) => {
                    at = i as i64;
                    moved += step;
                }
                None => {
                    self.position = if step > 0 { Position::Eof } else { Position::Bof };
                    return Ok(moved);
                }
            }
        }
        self.position = Position::At(at as usize);
        Ok(moved)
    }

    fn is_bof(&self) -> bool {
        self.position == Position::Bof
    }

    fn is_eof(&self) -> bool {
        self.position == Position::Eof
    }

    fn go_row(&mut self, row: RowId) -> Result<bool> {
        let Some(i) = MemoryTable::slot(row) else {
            return Ok(false);
        };
        let live = matches!(self.table.data.read().rows.get(i), Some(Some(_)));
        if live {
            self.position = Position::At(i);
        }
        Ok(live)
    }

    fn row_id(&self) -> Option<RowId> {
        match self.position {
            Position::At(i) => Some(RowId(i as u64 + 1)),
            _ => None,
        }
    }

    fn structure(&self) -> &Structure {
        self.table.structure()
    }

    fn value(&self, column: ColumnHandle) -> Result<Value> {
        self.structure().desc(column)?;
        let Position::At(i) = self.position else {
            return Err(TabulaError::invalid("row position", "not on a row"));
        };
        let data = self.table.data.read();
        match data.rows.get(i) {
            Some(Some(row)) => Ok(row[column.0].clone()),
            _ => Err(TabulaError::invalid("row", RowId(i as u64 + 1))),
        }
    }

    fn flags(&self) -> IteratorFlags {
        self.flags
    }

    fn set_flags(&mut self, flags: IteratorFlags) {
        self.flags = flags;
    }

    fn row_count_hint(&self) -> Option<u64> {
        Some(self.table.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::ColumnDesc;
    use tabula_common::ColumnType;

    fn people() -> MemoryTable {
        let table = MemoryTable::new(Structure::new(vec![
            ColumnDesc::new("name", ColumnType::String, 10),
            ColumnDesc::new("age", ColumnType::Integer, 0),
        ]));
        for (name, age) in [("ann", 31), ("bob", 25), ("cy", 40)] {
            table
                .insert(vec![Value::from(name), Value::Integer(age)])
                .unwrap();
        }
        table
    }

    #[test]
    fn test_walk_skips_deleted_rows() {
        let table = people();
        table.delete(RowId(2)).unwrap();
        let mut it = table.iter();
        assert!(it.is_bof());

        assert_eq!(it.skip(1).unwrap(), 1);
        assert_eq!(it.row_id(), Some(RowId(1)));
        assert_eq!(it.skip(1).unwrap(), 1);
        assert_eq!(it.row_id(), Some(RowId(3)));
        assert_eq!(it.skip(1).unwrap(), 0);
        assert!(it.is_eof());

        assert_eq!(it.skip(-1).unwrap(), -1);
        assert_eq!(it.row_id(), Some(RowId(3)));
        assert_eq!(it.row_count_hint(), Some(2));
    }

    #[test]
    fn test_typed_getters() {
        let table = people();
        let mut it = table.iter();
        assert!(it.go_row(RowId(2)).unwrap());
        let name = it.structure().column("name").unwrap();
        let age = it.structure().column("age").unwrap();
        assert_eq!(it.get_string(name).unwrap().as_deref(), Some("bob"));
        assert_eq!(it.get_integer(age).unwrap(), Some(25));
        assert_eq!(it.get_double(age).unwrap(), Some(25.0));
        assert!(matches!(
            it.get_boolean(age),
            Err(TabulaError::TypeMismatch { .. })
        ));
        assert_eq!(it.width(name).unwrap(), 10);
        assert_eq!(it.raw(name).unwrap(), b"bob".to_vec());
    }

    #[test]
    fn test_go_row_misses_leave_position() {
        let table = people();
        let mut it = table.iter();
        it.go_first().unwrap();
        table.delete(RowId(3)).unwrap();
        assert!(!it.go_row(RowId(3)).unwrap());
        assert!(!it.go_row(RowId(0)).unwrap());
        assert!(!it.go_row(RowId(99)).unwrap());
        assert_eq!(it.row_id(), Some(RowId(1)));
    }

    #[test]
    fn test_insert_checks_schema() {
        let table = people();
        assert!(table.insert(vec![Value::from("x")]).is_err());
        assert!(matches!(
            table.insert(vec![Value::Integer(1), Value::Integer(2)]),
            Err(TabulaError::TypeMismatch { .. })
        ));
        table.insert(vec![Value::Null, Value::Null]).unwrap();
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_update_and_clone_share_rows() {
        let table = people();
        let mut a = table.iter();
        a.go_row(RowId(1)).unwrap();
        let b = a.clone_iterator().unwrap();
        table
            .update(RowId(1), vec![Value::from("ann"), Value::Integer(32)])
            .unwrap();
        let age = table.structure().column("age").unwrap();
        assert_eq!(b.get_integer(age).unwrap(), Some(32));
        assert!(table.update(RowId(9), vec![Value::Null, Value::Null]).is_err());
    }
}

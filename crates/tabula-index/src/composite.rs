//! Index-ordered view over a base row iterator.

use crate::btree::{CursorState, Index, IndexCursor};
use crate::expr::KeyExpression;
use crate::rows::{
    ColumnHandle, IteratorFlags, RowEvent, RowIterator, SortOrder, Structure,
};
use std::sync::Arc;
use tabula_common::{Result, RowId, TabulaError, Value};
use tracing::trace;

/// Row iterator that visits the rows of a base iterator in index order.
///
/// The index cursor drives traversal; after every move the base iterator is
/// repositioned on the row id stored in the entry's value. Entries whose row
/// no longer exists in the base are skipped. A descending view walks the
/// same index backwards.
pub struct CompositeRowIterator {
    base: Box<dyn RowIterator>,
    cursor: IndexCursor,
    expr: Arc<dyn KeyExpression>,
    order: SortOrder,
    key_filter: Option<Vec<u8>>,
    state: CursorState,
    flags: IteratorFlags,
}

impl CompositeRowIterator {
    pub(crate) fn new(
        base: Box<dyn RowIterator>,
        cursor: IndexCursor,
        expr: Arc<dyn KeyExpression>,
        order: SortOrder,
    ) -> Self {
        let flags = base.flags();
        Self {
            base,
            cursor,
            expr,
            order,
            key_filter: None,
            state: CursorState::BeforeFirst,
            flags,
        }
    }

    pub fn index(&self) -> &Index {
        self.cursor.index()
    }

    pub fn order(&self) -> SortOrder {
        self.order
    }

    pub fn expression(&self) -> &Arc<dyn KeyExpression> {
        &self.expr
    }

    /// View state, following the index cursor when a change made through
    /// another cursor parked it.
    fn state(&self) -> CursorState {
        if self.state != CursorState::Positioned {
            return self.state;
        }
        match (self.cursor.state(), self.ascending()) {
            (CursorState::Positioned, _) => CursorState::Positioned,
            (CursorState::AfterLast, true) | (CursorState::BeforeFirst, false) => {
                CursorState::AfterLast
            }
            _ => CursorState::BeforeFirst,
        }
    }

    /// Key of the current index entry.
    pub fn key(&self) -> Option<Vec<u8>> {
        if self.state() != CursorState::Positioned {
            return None;
        }
        self.cursor.key().map(|k| k.to_vec())
    }

    fn ascending(&self) -> bool {
        self.order == SortOrder::Ascending
    }

    /// Index direction of a view step.
    fn index_step(&self, step: i64) -> i64 {
        if self.ascending() {
            step
        } else {
            -step
        }
    }

    fn in_filter(&self) -> bool {
        match (self.cursor.key(), &self.key_filter) {
            (Some(key), Some(filter)) => key.starts_with(filter),
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Moves the index cursor to the view's first entry.
    fn cursor_to_first(&mut self) -> Result<()> {
        match (&self.key_filter, self.ascending()) {
            (Some(filter), true) => self.cursor.seek_run_first(filter)?,
            (Some(filter), false) => self.cursor.seek_run_last(filter)?,
            (None, true) => self.cursor.first()?,
            (None, false) => self.cursor.last()?,
        };
        Ok(())
    }

    /// Moves the index cursor to the view's last entry.
    fn cursor_to_last(&mut self) -> Result<()> {
        match (&self.key_filter, self.ascending()) {
            (Some(filter), true) => self.cursor.seek_run_last(filter)?,
            (Some(filter), false) => self.cursor.seek_run_first(filter)?,
            (None, true) => self.cursor.last()?,
            (None, false) => self.cursor.first()?,
        };
        Ok(())
    }

    fn park(&mut self, step: i64) -> bool {
        self.state = if step > 0 {
            CursorState::AfterLast
        } else {
            CursorState::BeforeFirst
        };
        false
    }

    /// Aligns the base iterator with the index cursor.
    ///
    /// Entries whose row is gone are skipped in view direction `step`. Leaving
    /// the index or the filtered run parks the view at the matching end.
    fn settle(&mut self, step: i64) -> Result<bool> {
        loop {
            if !self.in_filter() {
                return Ok(self.park(step));
            }
            let row = self
                .cursor
                .row_id()
                .ok_or_else(|| TabulaError::IndexCorrupted("entry without row id".to_string()))?;
            if self.base.go_row(row)? {
                self.state = CursorState::Positioned;
                return Ok(true);
            }
            trace!(%row, "index entry without base row skipped");
            if self.cursor.skip(self.index_step(step))? == 0 {
                return Ok(self.park(step));
            }
        }
    }

    /// Positions on the first entry whose key starts with `key`.
    ///
    /// With `soft`, a miss lands on the next entry in view order. Returns
    /// whether the row reached has a matching key.
    pub fn seek(&mut self, key: &[u8], soft: bool) -> Result<bool> {
        if self.ascending() {
            let matched = self.cursor.seek(key, soft)?;
            if !matched && !soft {
                return Ok(self.park(1));
            }
        } else if !self.cursor.seek_run_last(key)? {
            if !soft {
                return Ok(self.park(1));
            }
            // largest entry below `key`
            self.cursor.seek(key, true)?;
            if self.cursor.is_eof() {
                self.cursor.last()?;
            } else {
                self.cursor.skip(-1)?;
            }
        }
        if !self.settle(1)? {
            return Ok(false);
        }
        Ok(self.cursor.key().is_some_and(|k| k.starts_with(key)))
    }

    /// Restricts traversal to the run of entries whose key starts with
    /// `filter`. `None` clears the filter. The position is kept.
    pub fn set_key_filter(&mut self, filter: Option<&[u8]>) -> Result<()> {
        if let Some(filter) = filter {
            if filter.len() > self.index().key_len() {
                return Err(TabulaError::invalid("key filter length", filter.len()));
            }
        }
        self.key_filter = filter.map(<[u8]>::to_vec);
        Ok(())
    }

    pub fn get_key_filter(&self) -> Option<&[u8]> {
        self.key_filter.as_deref()
    }

    /// Moves to the approximate fraction `fraction` of the view.
    pub fn set_pos(&mut self, fraction: f64) -> Result<bool> {
        let fraction = fraction.clamp(0.0, 1.0);
        let index_fraction = if self.ascending() {
            fraction
        } else {
            1.0 - fraction
        };
        self.cursor.set_pos(index_fraction)?;
        if let Some(filter) = self.key_filter.clone() {
            match self.cursor.key() {
                Some(key) if key.starts_with(&filter) => {}
                Some(key) if key[..] < filter[..] => {
                    self.cursor.seek_run_first(&filter)?;
                }
                _ => {
                    self.cursor.seek_run_last(&filter)?;
                }
            }
        }
        self.settle(1)
    }

    /// Approximate fraction of the view before the current row.
    pub fn get_pos(&self) -> Result<f64> {
        match self.state() {
            CursorState::BeforeFirst => Ok(0.0),
            CursorState::AfterLast => Ok(1.0),
            CursorState::Positioned => {
                let pos = self.cursor.get_pos()?;
                Ok(if self.ascending() { pos } else { 1.0 - pos })
            }
        }
    }

    /// A base row changed. Keys are not recomputed; a row that vanished from
    /// the base is treated as deleted.
    pub fn on_row_updated(&mut self, row: RowId) -> Result<()> {
        if self.row_id() == Some(row) && !self.base.go_row(row)? {
            return self.on_row_deleted(row);
        }
        Ok(())
    }

    /// A base row was deleted. If it is the current row, the view moves to
    /// the next row in view order, or after the last.
    pub fn on_row_deleted(&mut self, row: RowId) -> Result<()> {
        if self.state() != CursorState::Positioned || self.cursor.row_id() != Some(row) {
            return Ok(());
        }
        if self.cursor.skip(self.index_step(1))? == 0 {
            self.park(1);
            return Ok(());
        }
        self.settle(1)?;
        Ok(())
    }

    pub fn on_row_event(&mut self, event: RowEvent) -> Result<()> {
        match event {
            RowEvent::Updated(row) => self.on_row_updated(row),
            RowEvent::Deleted(row) => self.on_row_deleted(row),
        }
    }

    /// Independent view at the same position.
    pub fn try_clone(&self) -> Result<CompositeRowIterator> {
        Ok(Self {
            base: self.base.clone_iterator()?,
            cursor: self.cursor.try_clone()?,
            expr: self.expr.clone(),
            order: self.order,
            key_filter: self.key_filter.clone(),
            state: self.state(),
            flags: self.flags,
        })
    }

    fn on_row(&self) -> Result<&dyn RowIterator> {
        if self.state() != CursorState::Positioned {
            return Err(TabulaError::invalid("row position", "not on a row"));
        }
        Ok(self.base.as_ref())
    }
}

impl RowIterator for CompositeRowIterator {
    fn clone_iterator(&self) -> Result<Box<dyn RowIterator>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn go_first(&mut self) -> Result<bool> {
        self.cursor_to_first()?;
        self.settle(1)
    }

    fn go_last(&mut self) -> Result<bool> {
        self.cursor_to_last()?;
        self.settle(-1)
    }

    fn skip(&mut self, delta: i64) -> Result<i64> {
        if delta == 0 {
            return Ok(0);
        }
        let step = delta.signum();
        let mut moved = 0i64;
        self.state = self.state();
        match (self.state, step) {
            (CursorState::Positioned, _) => {}
            (CursorState::BeforeFirst, 1) => {
                if !self.go_first()? {
                    return Ok(0);
                }
                moved = 1;
            }
            (CursorState::AfterLast, -1) => {
                if !self.go_last()? {
                    return Ok(0);
                }
                moved = -1;
            }
            _ => return Ok(0),
        }
        while moved != delta {
            if self.cursor.skip(self.index_step(step))? == 0 || !self.settle(step)? {
                self.park(step);
                break;
            }
            moved += step;
        }
        Ok(moved)
    }

    fn is_bof(&self) -> bool {
        self.state() == CursorState::BeforeFirst
    }

    fn is_eof(&self) -> bool {
        self.state() == CursorState::AfterLast
    }

    /// Moves to the index entry of base row `row`. Fails without moving if
    /// the row does not exist, is not indexed, or lies outside the filter.
    fn go_row(&mut self, row: RowId) -> Result<bool> {
        let previous = self.row_id();
        if !self.base.go_row(row)? {
            return Ok(false);
        }
        let mut key = Vec::with_capacity(self.expr.key_len());
        self.expr.evaluate(self.base.as_ref(), &mut key)?;
        let value_len = self.index().value_len();
        let value = row
            .to_be_bytes(value_len)
            .ok_or_else(|| TabulaError::invalid("row id", row))?;
        let in_filter = self
            .key_filter
            .as_ref()
            .map_or(true, |filter| key.starts_with(filter));

        let mut probe = self.cursor.try_clone()?;
        if in_filter && probe.seek_entry(&key, &value)? {
            self.cursor = probe;
            self.state = CursorState::Positioned;
            return Ok(true);
        }
        if let Some(previous) = previous {
            self.base.go_row(previous)?;
        }
        Ok(false)
    }

    fn row_id(&self) -> Option<RowId> {
        match self.state() {
            CursorState::Positioned => self.base.row_id(),
            _ => None,
        }
    }

    fn structure(&self) -> &Structure {
        self.base.structure()
    }

    fn value(&self, column: ColumnHandle) -> Result<Value> {
        self.on_row()?.value(column)
    }

    fn get_string(&self, column: ColumnHandle) -> Result<Option<String>> {
        self.on_row()?.get_string(column)
    }

    fn get_double(&self, column: ColumnHandle) -> Result<Option<f64>> {
        self.on_row()?.get_double(column)
    }

    fn get_integer(&self, column: ColumnHandle) -> Result<Option<i64>> {
        self.on_row()?.get_integer(column)
    }

    fn get_datetime(&self, column: ColumnHandle) -> Result<Option<i64>> {
        self.on_row()?.get_datetime(column)
    }

    fn get_boolean(&self, column: ColumnHandle) -> Result<Option<bool>> {
        self.on_row()?.get_boolean(column)
    }

    fn is_null(&self, column: ColumnHandle) -> Result<bool> {
        self.on_row()?.is_null(column)
    }

    fn raw(&self, column: ColumnHandle) -> Result<Vec<u8>> {
        self.on_row()?.raw(column)
    }

    fn width(&self, column: ColumnHandle) -> Result<usize> {
        self.base.width(column)
    }

    fn flags(&self) -> IteratorFlags {
        self.flags
    }

    fn set_flags(&mut self, flags: IteratorFlags) {
        self.flags = flags;
    }

    fn row_count_hint(&self) -> Option<u64> {
        self.key_filter.is_none().then(|| self.index().len())
    }
}

impl std::fmt::Debug for CompositeRowIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeRowIterator")
            .field("expr", &self.expr)
            .field("order", &self.order)
            .field("state", &self.state())
            .field("filter", &self.key_filter)
            .field("cursor", &self.cursor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ColumnKey;
    use crate::facade::{build_external_index, wrap_with_index, BuildOptions};
    use crate::memory::MemoryTable;
    use crate::progress::NoProgress;
    use crate::rows::ColumnDesc;
    use tabula_common::ColumnType;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        table: MemoryTable,
        index: Index,
        expr: Arc<dyn KeyExpression>,
    }

    /// Table of single-letter names indexed by name, duplicates allowed.
    fn fixture(names: &[&str]) -> Fixture {
        let table = MemoryTable::new(Structure::new(vec![ColumnDesc::new(
            "name",
            ColumnType::String,
            1,
        )]));
        for name in names {
            table.insert(vec![Value::from(*name)]).unwrap();
        }
        let expr: Arc<dyn KeyExpression> =
            Arc::new(ColumnKey::new(table.structure(), "name").unwrap());
        let dir = tempfile::tempdir().unwrap();
        let mut options = BuildOptions::new(dir.path().join("names.idx"));
        options.allow_duplicates = true;
        options.config.fsync_enabled = false;
        let mut base = table.iter();
        let index =
            build_external_index(&mut base, expr.as_ref(), &options, &mut NoProgress).unwrap();
        Fixture {
            _dir: dir,
            table,
            index,
            expr,
        }
    }

    fn view(fx: &Fixture, order: SortOrder) -> CompositeRowIterator {
        wrap_with_index(Box::new(fx.table.iter()), &fx.index, fx.expr.clone(), order).unwrap()
    }

    fn ids(view: &mut CompositeRowIterator) -> Vec<u64> {
        let mut out = Vec::new();
        while view.skip(1).unwrap() == 1 {
            out.push(view.row_id().unwrap().0);
        }
        out
    }

    fn name_key(name: &str) -> Vec<u8> {
        let mut key = vec![1];
        key.extend_from_slice(name.as_bytes());
        key
    }

    #[test]
    fn test_walk_in_both_orders() {
        let fx = fixture(&["c", "a", "b", "a"]);
        let mut up = view(&fx, SortOrder::Ascending);
        assert!(up.is_bof());
        assert_eq!(ids(&mut up), vec![2, 4, 3, 1]);
        assert!(up.is_eof());

        let mut down = view(&fx, SortOrder::Descending);
        assert_eq!(ids(&mut down), vec![1, 3, 4, 2]);
        assert_eq!(down.skip(-2).unwrap(), -2);
        assert_eq!(down.row_id(), Some(RowId(4)));
    }

    #[test]
    fn test_key_filter_limits_run() {
        let fx = fixture(&["a", "a", "b"]);
        let mut v = view(&fx, SortOrder::Ascending);
        assert!(v.seek(&name_key("a"), false).unwrap());
        v.set_key_filter(Some(&name_key("a"))).unwrap();
        assert_eq!(v.row_id(), Some(RowId(1)));
        assert_eq!(v.skip(1).unwrap(), 1);
        assert_eq!(v.row_id(), Some(RowId(2)));
        assert_eq!(v.skip(1).unwrap(), 0);
        assert!(v.is_eof());

        assert!(v.go_last().unwrap());
        assert_eq!(v.row_id(), Some(RowId(2)));
        v.set_key_filter(None).unwrap();
        assert_eq!(v.skip(1).unwrap(), 1);
        assert_eq!(v.row_id(), Some(RowId(3)));
        assert!(v.get_key_filter().is_none());
    }

    #[test]
    fn test_seek_soft_descending() {
        let fx = fixture(&["a", "c", "e"]);
        let mut v = view(&fx, SortOrder::Descending);
        assert!(!v.seek(&name_key("d"), true).unwrap());
        assert_eq!(v.row_id(), Some(RowId(2)));
        assert!(!v.seek(&name_key("z"), true).unwrap());
        assert_eq!(v.row_id(), Some(RowId(3)));
        assert!(v.seek(&name_key("a"), false).unwrap());
        assert_eq!(v.row_id(), Some(RowId(1)));
        assert!(!v.seek(&name_key("b"), false).unwrap());
        assert!(v.is_eof());
    }

    #[test]
    fn test_deleted_rows_are_skipped() {
        let fx = fixture(&["a", "b", "c", "d"]);
        let mut v = view(&fx, SortOrder::Ascending);
        v.go_first().unwrap();
        v.skip(1).unwrap();
        assert_eq!(v.row_id(), Some(RowId(2)));

        fx.table.delete(RowId(2)).unwrap();
        v.on_row_event(RowEvent::Deleted(RowId(2))).unwrap();
        assert_eq!(v.row_id(), Some(RowId(3)));

        fx.table.delete(RowId(4)).unwrap();
        assert_eq!(v.skip(1).unwrap(), 0);
        assert!(v.is_eof());
        assert!(v.go_last().unwrap());
        assert_eq!(v.row_id(), Some(RowId(3)));
    }

    #[test]
    fn test_go_row_and_getters() {
        let fx = fixture(&["b", "a"]);
        let mut v = view(&fx, SortOrder::Ascending);
        let name = v.structure().column("name").unwrap();
        assert!(v.get_string(name).is_err());
        assert!(v.go_row(RowId(1)).unwrap());
        assert_eq!(v.get_string(name).unwrap().as_deref(), Some("b"));
        assert_eq!(v.skip(-1).unwrap(), -1);
        assert_eq!(v.row_id(), Some(RowId(2)));
        assert!(!v.go_row(RowId(9)).unwrap());
        assert_eq!(v.row_id(), Some(RowId(2)));
        assert_eq!(v.row_count_hint(), Some(2));
    }

    #[test]
    fn test_clone_is_independent() {
        let fx = fixture(&["a", "b", "c"]);
        let mut v = view(&fx, SortOrder::Ascending);
        v.go_first().unwrap();
        let mut copy = v.clone_iterator().unwrap();
        assert_eq!(copy.row_id(), Some(RowId(1)));
        copy.skip(2).unwrap();
        assert_eq!(copy.row_id(), Some(RowId(3)));
        assert_eq!(v.row_id(), Some(RowId(1)));
    }

    #[test]
    fn test_removing_last_entry_elsewhere_keeps_view_walkable() {
        let fx = fixture(&["a", "b", "c"]);
        let mut up = view(&fx, SortOrder::Ascending);
        assert!(up.go_last().unwrap());
        assert_eq!(up.row_id(), Some(RowId(3)));
        let mut ahead = up.try_clone().unwrap();

        let other = fx.index.seek(&name_key("c"), false).unwrap();
        assert!(fx.index.remove(&other).unwrap());

        assert!(!up.is_eof());
        assert_eq!(up.skip(-1).unwrap(), -1);
        assert_eq!(up.row_id(), Some(RowId(2)));
        assert_eq!(up.skip(-1).unwrap(), -1);
        assert_eq!(up.row_id(), Some(RowId(1)));

        assert_eq!(ahead.skip(1).unwrap(), 0);
        assert!(ahead.is_eof());

        // first row of a descending view is the last index entry
        let mut down = view(&fx, SortOrder::Descending);
        assert!(down.go_first().unwrap());
        assert_eq!(down.row_id(), Some(RowId(2)));
        let other = fx.index.seek(&name_key("b"), false).unwrap();
        assert!(fx.index.remove(&other).unwrap());
        assert_eq!(down.skip(1).unwrap(), 1);
        assert_eq!(down.row_id(), Some(RowId(1)));
        assert_eq!(down.skip(1).unwrap(), 0);
        assert!(down.is_eof());
    }

    #[test]
    fn test_view_parks_when_index_emptied_elsewhere() {
        let fx = fixture(&["a"]);
        let mut v = view(&fx, SortOrder::Ascending);
        assert!(v.go_first().unwrap());
        let other = fx.index.seek(&name_key("a"), false).unwrap();
        assert!(fx.index.remove(&other).unwrap());

        assert!(v.is_eof());
        assert_eq!(v.row_id(), None);
        assert!(v.key().is_none());
        assert_eq!(v.skip(1).unwrap(), 0);
        assert_eq!(v.skip(-1).unwrap(), 0);
        assert!(v.is_bof());
    }

    #[test]
    fn test_set_pos_ends() {
        let fx = fixture(&["a", "b", "c", "d", "e"]);
        let mut v = view(&fx, SortOrder::Descending);
        assert!(v.set_pos(0.0).unwrap());
        assert_eq!(v.row_id(), Some(RowId(5)));
        assert!(v.get_pos().unwrap() < 0.5);
        v.go_last().unwrap();
        assert_eq!(v.row_id(), Some(RowId(1)));
        assert!(v.get_pos().unwrap() > 0.5);
    }
}

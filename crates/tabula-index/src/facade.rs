//! Entry points tying row iterators, key expressions and indexes together.

use crate::btree::{Index, IndexCursor};
use crate::composite::CompositeRowIterator;
use crate::expr::KeyExpression;
use crate::progress::ProgressSink;
use crate::rows::{RowIterator, SortOrder};
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabula_common::{IndexConfig, Result, RowId, TabulaError};
use tracing::{debug, info, warn};

/// Parameters of `build_external_index`.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Final location of the index file.
    pub path: PathBuf,
    pub allow_duplicates: bool,
    /// Bytes used to store each row id, 1 to 8.
    pub value_len: usize,
    pub config: IndexConfig,
}

impl BuildOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            allow_duplicates: false,
            value_len: 8,
            config: IndexConfig::default(),
        }
    }
}

/// Location of an index while it is being built.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".partial");
    PathBuf::from(name)
}

fn check_value_len(value_len: usize) -> Result<()> {
    if value_len == 0 || value_len > 8 {
        return Err(TabulaError::invalid("value_len", value_len));
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Scans `base` into the bulk pool of `index` and loads it.
fn scan_and_load(
    index: &Index,
    base: &mut dyn RowIterator,
    expr: &dyn KeyExpression,
    progress: &mut dyn ProgressSink,
) -> Result<u64> {
    let total = base.row_count_hint().unwrap_or(0);
    let interval = index.config().bulk.progress_interval;
    let value_len = index.value_len();
    index.start_bulk_insert(total)?;

    let mut key = Vec::with_capacity(expr.key_len());
    let mut scanned = 0u64;
    let mut more = base.go_first()?;
    while more {
        let row = base
            .row_id()
            .ok_or_else(|| TabulaError::Internal("positioned row without id".to_string()))?;
        key.clear();
        expr.evaluate(base, &mut key)?;
        let value = row
            .to_be_bytes(value_len)
            .ok_or_else(|| TabulaError::invalid("row id", row))?;
        index.insert_during_bulk(&key, &value)?;
        scanned += 1;
        if scanned % interval == 0 {
            let mut cancel = false;
            progress.update_progress(scanned, total.max(scanned), &mut cancel);
            if cancel {
                index.cancel_bulk_insert();
                return Err(TabulaError::BuildCancelled);
            }
        }
        more = base.skip(1)? == 1;
    }
    debug!(rows = scanned, key = %expr.describe(), "index scan finished");
    index.finish_bulk_insert(progress)
}

/// Builds a new index over every row of `base`.
///
/// The file is written under `<path>.partial` and renamed into place only
/// after the build has completed, so an interrupted or failed build never
/// leaves a file at `path`. Each entry maps the expression's key to the big
/// endian row id.
pub fn build_external_index(
    base: &mut dyn RowIterator,
    expr: &dyn KeyExpression,
    options: &BuildOptions,
    progress: &mut dyn ProgressSink,
) -> Result<Index> {
    check_value_len(options.value_len)?;
    if options.path.exists() {
        return Err(TabulaError::invalid(
            "index path",
            format!("{} exists", options.path.display()),
        ));
    }
    let partial = partial_path(&options.path);
    remove_if_present(&partial)?;

    let index = Index::create(
        &partial,
        expr.key_len(),
        options.value_len,
        options.allow_duplicates,
        options.config.clone(),
    )?;
    let built = scan_and_load(&index, base, expr, progress).and_then(|rows| {
        index.close()?;
        Ok(rows)
    });
    drop(index);

    let rows = match built {
        Ok(rows) => rows,
        Err(e) => {
            warn!(path = %options.path.display(), error = %e, "index build failed");
            remove_if_present(&partial)?;
            return Err(e);
        }
    };
    fs::rename(&partial, &options.path)?;
    info!(path = %options.path.display(), rows, key = %expr.describe(), "index built");
    Index::open(&options.path, options.config.clone())
}

/// Presents the rows of `base` in the order of `index`.
///
/// `expr` must be the expression the index was built with; it is used to
/// find the entry of a row in `go_row`. The view starts before the first row.
pub fn wrap_with_index(
    base: Box<dyn RowIterator>,
    index: &Index,
    expr: Arc<dyn KeyExpression>,
    order: SortOrder,
) -> Result<CompositeRowIterator> {
    if index.is_closed() {
        return Err(TabulaError::invalid("index", "closed"));
    }
    if expr.key_len() != index.key_len() {
        return Err(TabulaError::invalid("key expression length", expr.key_len()));
    }
    check_value_len(index.value_len())?;
    let cursor = index.cursor()?;
    Ok(CompositeRowIterator::new(base, cursor, expr, order))
}

/// Opens a cursor on the entry `(key, row)`.
///
/// A full-length key goes straight to the entry. A shorter key is treated as
/// a prefix: the cursor seeks to its run and advances until the row id
/// matches. A missing entry leaves the cursor after the last.
pub fn seek_row(index: &Index, key: &[u8], row: RowId) -> Result<IndexCursor> {
    let value = row
        .to_be_bytes(index.value_len())
        .ok_or_else(|| TabulaError::invalid("row id", row))?;
    let mut cursor = index.cursor()?;
    if key.len() == index.key_len() {
        cursor.seek_entry(key, &value)?;
        return Ok(cursor);
    }

    let mut found = cursor.seek(key, false)?;
    while found {
        if cursor.value().is_some_and(|v| v[..] == value[..]) {
            return Ok(cursor);
        }
        found = cursor.skip(1)? == 1 && cursor.key().is_some_and(|k| k.starts_with(key));
    }
    cursor.park_after_last()?;
    Ok(cursor)
}

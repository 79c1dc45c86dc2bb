//! End-to-end tests for external indexes.
//!
//! Covers the properties the index must keep under load:
//! - Sort order of a full walk
//! - Balance after random inserts and removes
//! - Bulk builds producing the same traversal as point inserts
//! - Cursor stability while other cursors mutate the tree
//! - Cleanup of partial files and sort runs on cancellation

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tabula_index::{
    build_external_index, partial_path, wrap_with_index, BuildOptions, BulkConfig, CancelAfter,
    ColumnDesc, ColumnKey, ColumnType, Index, IndexConfig, KeyExpression, MemoryTable,
    NoProgress, RowId, RowIterator, SortOrder, Structure, TabulaError, Value,
};

// =============================================================================
// Helpers
// =============================================================================

fn config() -> IndexConfig {
    IndexConfig {
        page_size: 512,
        cache_pages: 128,
        fsync_enabled: false,
        ..Default::default()
    }
}

fn k(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

/// Walks `index` from the first entry and returns every (key, value) pair.
fn walk(index: &Index) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut cursor = index.cursor().unwrap();
    let mut out = Vec::new();
    let mut more = cursor.first().unwrap();
    while more {
        out.push((cursor.key().unwrap().to_vec(), cursor.value().unwrap().to_vec()));
        more = cursor.skip(1).unwrap() == 1;
    }
    assert!(cursor.is_eof());
    out
}

fn letters(names: &[&str]) -> MemoryTable {
    let table = MemoryTable::new(Structure::new(vec![ColumnDesc::new(
        "name",
        ColumnType::String,
        1,
    )]));
    for name in names {
        table.insert(vec![Value::from(*name)]).unwrap();
    }
    table
}

fn file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

// =============================================================================
// Test 1: Random inserts, ordered walk, bulk equivalence
// =============================================================================

#[test]
fn test_10k_random_inserts_walk_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut keys: Vec<u32> = (0..10_000).collect();
    keys.shuffle(&mut rand::thread_rng());

    let sequential = Index::create(&dir.path().join("seq.idx"), 4, 4, false, config()).unwrap();
    let start = Instant::now();
    for (row, key) in keys.iter().enumerate() {
        sequential.insert(&k(*key), &k(row as u32 + 1)).unwrap();
    }
    println!("10k random inserts: {:?}", start.elapsed());

    let entries = walk(&sequential);
    assert_eq!(entries.len(), 10_000);
    for (i, (key, _)) in entries.iter().enumerate() {
        assert_eq!(key.as_slice(), &k(i as u32));
    }
    let stats = sequential.verify().unwrap();
    assert_eq!(stats.entries, 10_000);
    assert!(stats.height >= 3, "height {}", stats.height);

    let bulk_config = IndexConfig {
        bulk: BulkConfig {
            run_entries: 1000,
            merge_fan_in: 4,
            ..Default::default()
        },
        ..config()
    };
    let bulk = Index::create(&dir.path().join("bulk.idx"), 4, 4, false, bulk_config).unwrap();
    bulk.start_bulk_insert(keys.len() as u64).unwrap();
    for (row, key) in keys.iter().enumerate() {
        bulk.insert_during_bulk(&k(*key), &k(row as u32 + 1)).unwrap();
    }
    let start = Instant::now();
    assert_eq!(bulk.finish_bulk_insert(&mut NoProgress).unwrap(), 10_000);
    println!("10k bulk load: {:?}", start.elapsed());

    assert_eq!(walk(&bulk), entries);
    let bulk_stats = bulk.verify().unwrap();
    assert_eq!(bulk_stats.entries, 10_000);
    assert!(bulk_stats.leaf_pages <= stats.leaf_pages);

    // every spilled run is gone once the load is done
    let leftovers = std::fs::read_dir(dir.path())
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .starts_with("tabula-run-")
        })
        .count();
    assert_eq!(leftovers, 0);
}

#[test]
fn test_duplicate_bulk_matches_point_inserts() {
    let dir = tempfile::tempdir().unwrap();
    let mut rows: Vec<(u32, u32)> = (1..=3000).map(|row| (row % 37, row)).collect();
    rows.shuffle(&mut rand::thread_rng());

    let sequential = Index::create(&dir.path().join("seq.idx"), 4, 4, true, config()).unwrap();
    for (key, row) in &rows {
        sequential.insert(&k(*key), &k(*row)).unwrap();
    }
    let bulk = Index::create(&dir.path().join("bulk.idx"), 4, 4, true, config()).unwrap();
    bulk.start_bulk_insert(rows.len() as u64).unwrap();
    for (key, row) in &rows {
        bulk.insert_during_bulk(&k(*key), &k(*row)).unwrap();
    }
    bulk.finish_bulk_insert(&mut NoProgress).unwrap();

    let expected = walk(&sequential);
    assert_eq!(walk(&bulk), expected);
    // runs are ordered by row id
    assert!(expected.windows(2).all(|w| w[0] < w[1]));
    bulk.verify().unwrap();
}

// =============================================================================
// Test 2: Duplicate run filtering through a composite iterator
// =============================================================================

#[test]
fn test_key_filter_visits_exactly_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let table = letters(&["A", "A", "B"]);
    let expr: Arc<dyn KeyExpression> = Arc::new(ColumnKey::new(table.structure(), "name").unwrap());
    let mut options = BuildOptions::new(dir.path().join("names.idx"));
    options.allow_duplicates = true;
    options.config = config();
    let index =
        build_external_index(&mut table.iter(), expr.as_ref(), &options, &mut NoProgress).unwrap();

    let mut view =
        wrap_with_index(Box::new(table.iter()), &index, expr.clone(), SortOrder::Ascending)
            .unwrap();
    let a = ColumnKey::new(table.structure(), "name")
        .unwrap()
        .encode_value(&Value::from("A"))
        .unwrap();
    assert!(view.seek(&a, false).unwrap());
    view.set_key_filter(Some(&a)).unwrap();

    let mut visited = vec![view.row_id().unwrap()];
    while view.skip(1).unwrap() == 1 {
        visited.push(view.row_id().unwrap());
    }
    assert_eq!(visited, vec![RowId(1), RowId(2)]);
    assert!(view.is_eof());
    assert_eq!(view.get_key_filter(), Some(a.as_slice()));
}

// =============================================================================
// Test 3: Cursor stability under mutation
// =============================================================================

#[test]
fn test_cursor_parked_on_removed_entry_lands_on_successor() {
    let dir = tempfile::tempdir().unwrap();
    let index = Index::create(&dir.path().join("s.idx"), 4, 4, false, config()).unwrap();
    for n in 0..500 {
        index.insert(&k(n), &k(n)).unwrap();
    }

    let mut a = index.seek(&k(250), false).unwrap();
    let b = index.seek(&k(250), false).unwrap();
    assert!(index.remove(&b).unwrap());
    assert_eq!(a.skip(1).unwrap(), 1);
    assert_eq!(a.key().unwrap().as_ref(), &k(251));
    assert_eq!(b.key().unwrap().as_ref(), &k(251));

    // removing far away entries reshapes the tree around `a`
    let mut c = index.cursor().unwrap();
    c.first().unwrap();
    for _ in 0..200 {
        assert!(index.remove(&c).unwrap());
    }
    assert_eq!(a.key().unwrap().as_ref(), &k(251));
    assert_eq!(a.skip(-1).unwrap(), -1);
    assert_eq!(a.key().unwrap().as_ref(), &k(249));
    index.verify().unwrap();
}

#[test]
fn test_view_on_removed_last_entry_walks_back_through_every_row() {
    let dir = tempfile::tempdir().unwrap();
    let table = letters(&["a", "b", "c", "d", "e"]);
    let key = ColumnKey::new(table.structure(), "name").unwrap();
    let last = key.encode_value(&Value::from("e")).unwrap();
    let expr: Arc<dyn KeyExpression> = Arc::new(key);
    let mut options = BuildOptions::new(dir.path().join("tail.idx"));
    options.config = config();
    let index =
        build_external_index(&mut table.iter(), expr.as_ref(), &options, &mut NoProgress).unwrap();

    let mut view =
        wrap_with_index(Box::new(table.iter()), &index, expr.clone(), SortOrder::Ascending)
            .unwrap();
    assert!(view.go_last().unwrap());
    assert_eq!(view.row_id(), Some(RowId(5)));

    let other = index.seek(&last, false).unwrap();
    assert!(index.remove(&other).unwrap());
    assert!(!view.is_eof());

    let mut visited = Vec::new();
    while view.skip(-1).unwrap() == -1 {
        visited.push(view.row_id().unwrap());
    }
    assert_eq!(visited, vec![RowId(4), RowId(3), RowId(2), RowId(1)]);
    assert!(view.is_bof());
}

#[test]
fn test_scan_survives_interleaved_mutations() {
    let dir = tempfile::tempdir().unwrap();
    let index = Index::create(&dir.path().join("m.idx"), 4, 4, false, config()).unwrap();
    for n in (0..4000).step_by(4) {
        index.insert(&k(n), &k(n)).unwrap();
    }

    let mut scan = index.cursor().unwrap();
    scan.first().unwrap();
    let mut seen = vec![u32::from_be_bytes(scan.key().unwrap()[..].try_into().unwrap())];
    let mut rng = rand::thread_rng();
    while scan.skip(1).unwrap() == 1 {
        seen.push(u32::from_be_bytes(scan.key().unwrap()[..].try_into().unwrap()));
        // insert keys not divisible by 4 anywhere in the tree
        let n: u32 = rng.gen_range(0..1000) * 4 + rng.gen_range(1..4);
        match index.insert(&k(n), &k(n)) {
            Ok(()) | Err(TabulaError::DuplicateKey) => {}
            Err(e) => panic!("insert failed: {e}"),
        }
    }
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    let originals: BTreeSet<u32> = seen.iter().copied().filter(|n| n % 4 == 0).collect();
    assert_eq!(originals.len(), 1000);
    index.verify().unwrap();
}

// =============================================================================
// Test 4: Balance and round trip
// =============================================================================

#[test]
fn test_random_inserts_and_removes_stay_balanced() {
    let dir = tempfile::tempdir().unwrap();
    let index = Index::create(&dir.path().join("b.idx"), 4, 4, false, config()).unwrap();
    let mut rng = rand::thread_rng();
    let mut present = BTreeSet::new();

    for round in 0..20 {
        for _ in 0..300 {
            let n: u32 = rng.gen_range(0..5000);
            if present.insert(n) {
                index.insert(&k(n), &k(n)).unwrap();
            }
        }
        let victims: Vec<u32> = present.iter().copied().filter(|_| rng.gen_bool(0.4)).collect();
        for n in victims {
            let cursor = index.seek(&k(n), false).unwrap();
            assert!(index.remove(&cursor).unwrap(), "round {round}: {n} not removed");
            present.remove(&n);
        }
        let stats = index.verify().unwrap();
        assert_eq!(stats.entries, present.len() as u64);
    }

    for n in 0..5000 {
        let cursor = index.seek(&k(n), false).unwrap();
        assert_eq!(cursor.key().is_some(), present.contains(&n), "key {n}");
    }
}

// =============================================================================
// Test 5: Cancellation cleanup
// =============================================================================

fn numbers(count: i64) -> MemoryTable {
    let table = MemoryTable::new(Structure::new(vec![ColumnDesc::new(
        "n",
        ColumnType::Integer,
        0,
    )]));
    for n in 0..count {
        table.insert(vec![Value::Integer(count - n)]).unwrap();
    }
    table
}

fn cancel_build(updates: u64) {
    let out = tempfile::tempdir().unwrap();
    let runs = tempfile::tempdir().unwrap();
    let table = numbers(5000);
    let expr = ColumnKey::new(table.structure(), "n").unwrap();
    let mut options = BuildOptions::new(out.path().join("n.idx"));
    options.config = IndexConfig {
        bulk: BulkConfig {
            run_entries: 100,
            merge_fan_in: 4,
            progress_interval: 100,
            temp_dir: Some(runs.path().to_path_buf()),
        },
        ..config()
    };

    let mut sink = CancelAfter::new(updates);
    let result = build_external_index(&mut table.iter(), &expr, &options, &mut sink);
    assert!(matches!(result, Err(TabulaError::BuildCancelled)));
    assert_eq!(sink.updates(), updates);
    assert!(!options.path.exists());
    assert!(!partial_path(&options.path).exists());
    assert_eq!(file_count(out.path()), 0);
    assert_eq!(file_count(runs.path()), 0);
}

#[test]
fn test_cancel_during_scan_leaves_nothing() {
    // 50 scan reports, cancelled at the 30th
    cancel_build(30);
}

#[test]
fn test_cancel_during_merge_leaves_nothing() {
    // 50 scan reports, then one per merge pass: 50 runs -> 13 -> 4
    cancel_build(52);
}

#[test]
fn test_completed_build_reopens() {
    let out = tempfile::tempdir().unwrap();
    let table = numbers(2000);
    let expr = ColumnKey::new(table.structure(), "n").unwrap();
    let mut options = BuildOptions::new(out.path().join("n.idx"));
    options.config = config();
    let index = build_external_index(&mut table.iter(), &expr, &options, &mut NoProgress).unwrap();
    assert_eq!(index.len(), 2000);
    assert_eq!(file_count(out.path()), 1);

    let mut view = wrap_with_index(
        Box::new(table.iter()),
        &index,
        Arc::new(expr),
        SortOrder::Descending,
    )
    .unwrap();
    let n = view.structure().column("n").unwrap();
    assert!(view.go_first().unwrap());
    assert_eq!(view.get_integer(n).unwrap(), Some(2000));
    assert_eq!(view.row_id(), Some(RowId(1)));
    assert!(view.go_last().unwrap());
    assert_eq!(view.get_integer(n).unwrap(), Some(1));
}

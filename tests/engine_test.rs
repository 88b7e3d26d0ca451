// End-to-end scenarios across the memtable surface: mixed workloads,
// persistence round trips and crash-safety surrogates.

use boxstore::{CallbackValue, MemTable, Options, RecordId};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashMap;
use tempfile::TempDir;

fn open(dir: &TempDir) -> MemTable {
    MemTable::open(Options::default().with_data_dir(dir.path())).unwrap()
}

fn collect_overlap(table: &MemTable, edges: &[(f64, f64)]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    table
        .search_overlap(edges, &mut |v: &CallbackValue<'_>| {
            out.push(v.data.to_vec());
            true
        })
        .unwrap();
    out.sort();
    out
}

#[test]
fn test_insert_flush_query_cycle() {
    let dir = TempDir::new().unwrap();
    let table = open(&dir);

    for i in 0..100 {
        let at = (i % 10) as f64 * 4.0;
        let row = (i / 10) as f64 * 4.0;
        table
            .insert(
                &[(at, at + 1.0), (row, row + 1.0)],
                format!("cell-{i}").as_bytes(),
            )
            .unwrap();
    }
    assert_eq!(table.len(), 100);
    table.spatial_index().check_invariants();

    // Flush twice; results must be unaffected.
    table.flush().unwrap();
    table.flush().unwrap();

    let hits = collect_overlap(&table, &[(3.5, 8.5), (3.5, 8.5)]);
    // Columns 1..=2 and rows 1..=2: four cells.
    assert_eq!(hits.len(), 4);
    table.spatial_index().check_invariants();
}

#[test]
fn test_idempotent_flush_produces_identical_files() {
    let dir = TempDir::new().unwrap();
    let table = open(&dir);
    for i in 0..50u32 {
        let at = i as f64 * 1.3;
        table
            .insert(&[(at, at + 2.0), (-at, -at + 2.0)], &i.to_le_bytes())
            .unwrap();
    }
    table.flush().unwrap();
    let heap_a = std::fs::read(table.options().heap_path()).unwrap();
    let index_a = std::fs::read(table.options().index_path()).unwrap();

    table.flush().unwrap();
    let heap_b = std::fs::read(table.options().heap_path()).unwrap();
    let index_b = std::fs::read(table.options().index_path()).unwrap();

    assert_eq!(heap_a, heap_b);
    assert_eq!(index_a, index_b);
}

#[test]
fn test_crash_safety_surrogate() {
    // Save after a mixed workload, reload, and verify queries match.
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(0xc0ffee);
    let queries: Vec<[(f64, f64); 2]> = (0..10)
        .map(|_| {
            let x = rng.random_range(-50.0..50.0);
            let y = rng.random_range(-50.0..50.0);
            [(x, x + rng.random_range(1.0..30.0)), (y, y + rng.random_range(1.0..30.0))]
        })
        .collect();

    let before: Vec<Vec<Vec<u8>>>;
    {
        let table = open(&dir);
        let mut live: Vec<([(f64, f64); 2], RecordId)> = Vec::new();
        for step in 0..400 {
            if !live.is_empty() && rng.random_bool(0.3) {
                let (edges, id) = live.swap_remove(rng.random_range(0..live.len()));
                assert!(table.remove(&edges, id).unwrap());
            } else {
                let x = rng.random_range(-50.0..50.0);
                let y = rng.random_range(-50.0..50.0);
                let edges = [
                    (x, x + rng.random_range(0.5..8.0)),
                    (y, y + rng.random_range(0.5..8.0)),
                ];
                let payload = format!("step-{step}");
                let id = table.insert(&edges, payload.as_bytes()).unwrap();
                live.push((edges, id));
            }
            // Interleave flushes so records get signed, freed and moved.
            if step % 97 == 0 {
                table.flush().unwrap();
            }
        }
        table.spatial_index().check_invariants();
        before = queries.iter().map(|q| collect_overlap(&table, q)).collect();
        table.close().unwrap();
    }

    let table = open(&dir);
    table.spatial_index().check_invariants();
    let after: Vec<Vec<Vec<u8>>> = queries.iter().map(|q| collect_overlap(&table, q)).collect();
    assert_eq!(before, after);
}

#[test]
fn test_search_variants_agree_with_linear_scan() {
    let dir = TempDir::new().unwrap();
    let table = open(&dir);
    let mut rng = StdRng::seed_from_u64(42);
    let mut boxes: HashMap<Vec<u8>, [(f64, f64); 2]> = HashMap::new();

    for i in 0..150 {
        let x = rng.random_range(0.0..100.0);
        let y = rng.random_range(0.0..100.0);
        let edges = [
            (x, x + rng.random_range(0.5..12.0)),
            (y, y + rng.random_range(0.5..12.0)),
        ];
        let payload = format!("b{i}").into_bytes();
        table.insert(&edges, &payload).unwrap();
        boxes.insert(payload, edges);
    }
    table.flush().unwrap();

    let q = [(20.0, 60.0), (20.0, 60.0)];
    let overlap = |a: &[(f64, f64); 2]| {
        a.iter()
            .zip(q.iter())
            .all(|(&(alo, ahi), &(qlo, qhi))| alo < qhi && qlo < ahi)
    };
    let covers_query = |a: &[(f64, f64); 2]| {
        a.iter()
            .zip(q.iter())
            .all(|(&(alo, ahi), &(qlo, qhi))| alo <= qlo && qhi <= ahi)
    };
    let inside_query = |a: &[(f64, f64); 2]| {
        a.iter()
            .zip(q.iter())
            .all(|(&(alo, ahi), &(qlo, qhi))| qlo <= alo && ahi <= qhi)
    };

    let mut expect_overlap: Vec<Vec<u8>> = boxes
        .iter()
        .filter(|(_, b)| overlap(b))
        .map(|(k, _)| k.clone())
        .collect();
    expect_overlap.sort();
    assert_eq!(collect_overlap(&table, &q), expect_overlap);

    let mut got = Vec::new();
    table
        .search_contains_range(&q, &mut |v: &CallbackValue<'_>| {
            got.push(v.data.to_vec());
            true
        })
        .unwrap();
    got.sort();
    let mut expect: Vec<Vec<u8>> = boxes
        .iter()
        .filter(|(_, b)| covers_query(b))
        .map(|(k, _)| k.clone())
        .collect();
    expect.sort();
    assert_eq!(got, expect);

    let mut got = Vec::new();
    table
        .search_cover(&q, &mut |v: &CallbackValue<'_>| {
            got.push(v.data.to_vec());
            true
        })
        .unwrap();
    got.sort();
    let mut expect: Vec<Vec<u8>> = boxes
        .iter()
        .filter(|(_, b)| inside_query(b))
        .map(|(k, _)| k.clone())
        .collect();
    expect.sort();
    assert_eq!(got, expect);
}

#[test]
fn test_large_payloads_span_pages() {
    let dir = TempDir::new().unwrap();
    let table = open(&dir);
    // Payloads several pages long force spanning chains in the heap.
    let big: Vec<u8> = (0..20_000u32).map(|i| i as u8).collect();
    table.insert(&[(0.0, 1.0), (0.0, 1.0)], &big).unwrap();
    table.insert(&[(2.0, 3.0), (2.0, 3.0)], b"small").unwrap();
    table.flush().unwrap();

    let hits = collect_overlap(&table, &[(-1.0, 4.0), (-1.0, 4.0)]);
    assert_eq!(hits.len(), 2);
    assert!(hits.contains(&big));

    // Reload straight off disk.
    drop(table);
    let table = open(&dir);
    let hits = collect_overlap(&table, &[(0.5, 0.6), (0.5, 0.6)]);
    assert_eq!(hits, vec![big]);
}

#[test]
fn test_delete_then_compact_keeps_survivors_queryable() {
    let dir = TempDir::new().unwrap();
    let table = open(&dir);
    let mut ids = Vec::new();
    for i in 0..60 {
        let at = i as f64 * 2.0;
        let edges = [(at, at + 1.0), (0.0, 1.0)];
        ids.push((edges, table.insert(&edges, &[i as u8; 32]).unwrap()));
    }
    table.flush().unwrap();

    // Remove every other record; the flush frees them and compacts,
    // rewriting survivor addresses in place.
    for (edges, id) in ids.iter().step_by(2) {
        assert!(table.remove(edges, *id).unwrap());
    }
    let compacted = table.flush().unwrap();
    assert!(compacted);
    assert_eq!(table.len(), 30);

    for (i, (edges, _)) in ids.iter().enumerate() {
        let hits = collect_overlap(&table, edges);
        if i % 2 == 1 {
            assert_eq!(hits, vec![vec![i as u8; 32]]);
        } else {
            assert!(hits.is_empty());
        }
    }
    table.spatial_index().check_invariants();
}

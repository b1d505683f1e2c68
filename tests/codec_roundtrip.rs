//! 写入 → 读回：bucket 与 positional 两种编码都必须无损

use std::collections::BTreeSet;
use std::sync::Arc;
use olap_block_engine::block::TableBlock;
use olap_block_engine::column_writer::seal_rows;
use olap_block_engine::config::EngineConfig;
use olap_block_engine::executor::load_records;
use olap_block_engine::load_spec::LoadSpec;
use olap_block_engine::lock::NoLock;
use olap_block_engine::{Row, Table};
use proptest::prelude::*;

#[derive(Debug, Clone)]
struct Fields {
    n:    Option<i64>,
    s:    Option<String>,
    tags: BTreeSet<String>,
}

fn fields(alphabet: usize) -> impl Strategy<Value = Fields> {
    (
        proptest::option::of(any::<i64>()),
        proptest::option::of((0..alphabet).prop_map(|i| format!("s{i}"))),
        proptest::collection::btree_set((0..alphabet).prop_map(|i| format!("t{i}")), 0..4),
    )
        .prop_map(|(n, s, tags)| Fields { n, s, tags })
}

fn to_row(f: &Fields) -> Row {
    let mut row = Row::new();
    if let Some(n) = f.n {
        row = row.int("n", n);
    }
    if let Some(s) = &f.s {
        row = row.str("s", s);
    }
    if !f.tags.is_empty() {
        let tags: Vec<&str> = f.tags.iter().map(String::as_str).collect();
        row = row.set("tags", tags.as_slice());
    }
    row
}

fn check_round_trip(input: &[Fields], threshold: usize) {
    let dir    = tempfile::tempdir().unwrap();
    let config = EngineConfig::default().with_chunk_size(32).with_cardinality_threshold(threshold).with_workers(2);
    let t      = Table::new("t", dir.path(), Arc::new(config), Arc::new(NoLock));
    let rows: Vec<Row> = input.iter().map(to_row).collect();
    seal_rows(&t, &rows).unwrap();

    let (blocks, stats) = load_records(&t, &LoadSpec::all(&t)).unwrap();
    assert!(stats.broken.is_empty());
    let records: Vec<(&TableBlock, usize)> = blocks
        .iter()
        .flat_map(|b| (0..b.len()).map(move |r| (b, r)))
        .collect();
    assert_eq!(records.len(), input.len());

    let (n, s, tags) = (t.key_id("n"), t.key_id("s"), t.key_id("tags"));
    for (want, (block, row)) in input.iter().zip(records) {
        let rec = block.slab().record(row);
        assert_eq!(n.and_then(|id| rec.int(id)), want.n);
        let got_s = s.and_then(|id| rec.str_id(id).and_then(|sid| block.resolve_str(id, sid)));
        assert_eq!(got_s, want.s.as_deref());
        let got_tags: BTreeSet<String> = tags
            .and_then(|id| rec.set(id).map(|ids| (id, ids)))
            .map(|(id, ids)| ids.iter().filter_map(|sid| block.resolve_str(id, *sid)).map(String::from).collect())
            .unwrap_or_default();
        assert_eq!(got_tags, want.tags);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn low_cardinality_round_trip(input in proptest::collection::vec(fields(3), 1..100)) {
        check_round_trip(&input, 5000);
    }

    #[test]
    fn high_cardinality_round_trip(input in proptest::collection::vec(fields(40), 1..100)) {
        // 阈值 2 迫使几乎所有列走 positional
        check_round_trip(&input, 2);
    }
}

#[test]
fn empty_rows_keep_their_slots() {
    let input = vec![
        Fields { n: None, s: None, tags: BTreeSet::new() },
        Fields { n: Some(-1), s: Some("x".into()), tags: BTreeSet::new() },
        Fields { n: None, s: None, tags: BTreeSet::new() },
    ];
    check_round_trip(&input, 5000);
    check_round_trip(&input, 0);
}

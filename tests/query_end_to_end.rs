//! 端到端：封块写入 → 并发查询 → 合并

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use olap_block_engine::column_writer::seal_rows;
use olap_block_engine::combine::{merge_node_results, sort_results};
use olap_block_engine::filter::{build_filters, FilterSpec};
use olap_block_engine::hist::{Extent, HistogramOps};
use olap_block_engine::lock::NoLock;
use olap_block_engine::meta::BlockInfo;
use olap_block_engine::{
    load_and_query, AggOp, EngineConfig, Filter, IntOp, OrderBy, QueryParams, QueryResults, QuerySpec, QueryStats,
    Row, StrOp, Table, TableRegistry,
};

fn table(dir: &Path, config: EngineConfig) -> Table {
    Table::new("events", dir, Arc::new(config), Arc::new(NoLock))
}

fn config(chunk: usize) -> EngineConfig {
    EngineConfig::default().with_chunk_size(chunk).with_workers(3).with_checkpoint_every(2)
}

fn run(t: &Table, params: QueryParams) -> (QuerySpec, QueryStats) {
    let load     = params.load_spec(t).unwrap();
    let mut spec = QuerySpec::new(params, t).unwrap();
    let stats    = load_and_query(t, &load, &mut spec).unwrap();
    (spec, stats)
}

/// 块内第一个以 `prefix` 开头的列文件
fn column_file(block: &Path, prefix: &str) -> PathBuf {
    fs::read_dir(block)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.file_name().unwrap().to_string_lossy().starts_with(prefix))
        .unwrap()
}

#[test]
fn group_by_is_complete() {
    let dir = tempfile::tempdir().unwrap();
    let t   = table(dir.path(), config(64));
    let rows: Vec<Row> = (0..700).map(|i| Row::new().int("bucket", i % 7).int("v", i)).collect();
    seal_rows(&t, &rows).unwrap();

    let (spec, stats) = run(&t, QueryParams::new().group_by("bucket").aggregate("v", AggOp::Hist));
    assert_eq!(stats.blocks, 11);
    assert_eq!(stats.matched, 700);
    let results = &spec.results.results;
    assert_eq!(results.len(), 7);
    for k in 0..7 {
        let r = &results[&k.to_string()];
        assert_eq!(r.count, 100);
        assert_eq!(r.hists["v"].count(), 100);
    }
    let total = spec.results.cumulative.as_ref().unwrap();
    assert_eq!(total.label, "TOTAL");
    assert_eq!(total.count, 700);
    assert!((total.hists["v"].mean() - 349.5).abs() < 1e-6);
}

#[test]
fn int_filters_keep_exact_groups() {
    let dir = tempfile::tempdir().unwrap();
    let t   = table(dir.path(), config(50));
    let rows: Vec<Row> = (0..200).map(|i| Row::new().int("age", i % 40)).collect();
    seal_rows(&t, &rows).unwrap();

    let lt = Filter::int(&t, "age", IntOp::Lt, 20).unwrap();
    let (spec, _) = run(&t, QueryParams::new().filter(lt).group_by("age"));
    assert_eq!(spec.results.results.len(), 20);
    assert!(spec.results.results.keys().all(|k| k.parse::<i64>().unwrap() < 20));

    let neq = Filter::int(&t, "age", IntOp::Neq, 20).unwrap();
    let (spec, stats) = run(&t, QueryParams::new().filter(neq).group_by("age"));
    assert_eq!(spec.results.results.len(), 39);
    assert!(!spec.results.results.contains_key("20"));
    assert_eq!(stats.matched, 195);
}

#[test]
fn text_filters_and_ordering() {
    let dir = tempfile::tempdir().unwrap();
    let t   = table(dir.path(), config(100));
    let rows: Vec<Row> = (0..300)
        .map(|i| {
            Row::new()
                .str("host", ["api", "web", "db"][i % 3])
                .int("latency", (i % 3) as i64 * 100 + (i as i64 % 10))
                .set("flags", if i % 5 == 0 { &["slow"][..] } else { &["ok"][..] })
        })
        .collect();
    seal_rows(&t, &rows).unwrap();

    let params = QueryParams::new()
        .group_by("host")
        .aggregate("latency", AggOp::Avg)
        .order_by(OrderBy::Aggregation("latency".into()))
        .limit(2);
    let mut load = params.load_spec(&t).unwrap();
    let filters  = build_filters(&t, &mut load, &FilterSpec::default().with_set("flags:nin:slow").with_str("host:re:^(api|db)$"), None).unwrap();
    let mut spec = QuerySpec::new(params.filters(filters), &t).unwrap();
    let stats    = load_and_query(&t, &load, &mut spec).unwrap();

    assert_eq!(stats.matched, 160);
    assert_eq!(spec.results.results.len(), 2);
    assert_eq!(spec.results.sorted, vec!["db", "api"]);
}

#[test]
fn strings_resolve_per_block() {
    let dir = tempfile::tempdir().unwrap();
    let t   = table(dir.path(), config(4));
    // 两个 block 中 "y" 的块内 ID 不同
    let rows = vec![
        Row::new().str("k", "x"), Row::new().str("k", "y"), Row::new().str("k", "y"), Row::new().str("k", "x"),
        Row::new().str("k", "y"), Row::new().str("k", "z"), Row::new().str("k", "z"), Row::new().str("k", "z"),
    ];
    seal_rows(&t, &rows).unwrap();

    let eq = Filter::str(&t, "k", StrOp::Eq, "y").unwrap();
    let (spec, _) = run(&t, QueryParams::new().filter(eq).group_by("k"));
    assert_eq!(spec.results.results.keys().collect::<Vec<_>>(), vec!["y"]);
    assert_eq!(spec.results.results["y"].count, 3);

    let (spec, _) = run(&t, QueryParams::new().group_by("k"));
    let counts: HashMap<_, _> = spec.results.results.iter().map(|(k, r)| (k.clone(), r.count)).collect();
    assert_eq!(counts, HashMap::from([("x".to_string(), 2), ("y".to_string(), 3), ("z".to_string(), 3)]));
}

#[test]
fn pruned_blocks_are_never_decoded() {
    let dir = tempfile::tempdir().unwrap();
    let t   = table(dir.path(), config(10));
    let rows: Vec<Row> = (0..30).map(|i| Row::new().int("n", i)).collect();
    let dirs = seal_rows(&t, &rows).unwrap();

    // 第一个 block（0..9）的列文件损坏；gt 15 的查询不应读到它
    fs::write(column_file(&dirs[0], "int_n"), b"garbage").unwrap();
    let gt = Filter::int(&t, "n", IntOp::Gt, 15).unwrap();
    let (spec, stats) = run(&t, QueryParams::new().filter(gt));
    assert_eq!(stats.skipped, 1);
    assert!(stats.broken.is_empty());
    assert_eq!(spec.results.matched, 14);
}

#[test]
fn broken_blocks_do_not_abort_the_query() {
    let dir = tempfile::tempdir().unwrap();
    let t   = table(dir.path(), config(10));
    let rows: Vec<Row> = (0..30).map(|i| Row::new().int("n", i).str("s", "v")).collect();
    let dirs = seal_rows(&t, &rows).unwrap();

    fs::write(column_file(&dirs[1], "str_s"), b"garbage").unwrap();
    let (spec, stats) = run(&t, QueryParams::new().group_by("s"));
    assert_eq!(stats.broken, vec!["block_000001".to_string()]);
    assert_eq!(stats.loaded, 2);
    assert_eq!(spec.results.results["v"].count, 20);
}

#[test]
fn shrunken_block_is_a_consistency_failure() {
    let dir = tempfile::tempdir().unwrap();
    let t   = table(dir.path(), config(10));
    let rows: Vec<Row> = (0..20).map(|i| Row::new().int("n", i)).collect();
    let dirs = seal_rows(&t, &rows).unwrap();

    let mut info = BlockInfo::read(&dirs[0]).unwrap();
    info.num_records = 5;
    info.write(&dirs[0]).unwrap();
    t.forget_block_info(&dirs[0]);

    let (spec, stats) = run(&t, QueryParams::new().aggregate("n", AggOp::Avg));
    assert_eq!(stats.broken, vec!["block_000000".to_string()]);
    assert_eq!(spec.results.matched, 10);
}

#[test]
fn cached_results_match_fresh_results() {
    let dir = tempfile::tempdir().unwrap();
    let t   = table(dir.path(), config(20).with_cached_queries(true));
    let rows: Vec<Row> = (0..50).map(|i| Row::new().int("v", i * 3).str("k", ["a", "b", "c"][i as usize % 3])).collect();
    let dirs = seal_rows(&t, &rows).unwrap();

    let params = || {
        QueryParams::new()
            .filter(Filter::int(&t, "v", IntOp::Gt, -1).unwrap())
            .group_by("k")
            .aggregate("v", AggOp::Hist)
    };
    let (fresh, first) = run(&t, params());
    assert_eq!(first.cache_hits, 0);
    // 只有两个满 block 写缓存
    assert!(dirs[0].join("cache").is_dir());
    assert!(!dirs[2].join("cache").exists());

    let (cached, second) = run(&t, params());
    assert_eq!(second.cache_hits, 2);
    assert_eq!(second.cached_records, 40);
    assert_eq!(second.loaded, 1);
    assert_eq!(cached.results.matched, fresh.results.matched);
    assert_eq!(cached.results.sorted, fresh.results.sorted);
    assert_eq!(cached.results.results.len(), fresh.results.results.len());
    // block 完成顺序不同，浮点均值只比较到容差
    for (label, r) in &fresh.results.results {
        let c = &cached.results.results[label];
        assert_eq!((c.count, c.samples), (r.count, r.samples));
        let (hc, hr) = (&c.hists["v"], &r.hists["v"]);
        assert_eq!((hc.count(), hc.min(), hc.max()), (hr.count(), hr.min(), hr.max()));
        assert_eq!(hc.buckets(), hr.buckets());
        assert!((hc.mean() - hr.mean()).abs() < 1e-9);
    }

    // 恒真过滤条件不同，缓存 key 相同
    let other = QueryParams::new()
        .filter(Filter::int(&t, "v", IntOp::Gt, -100).unwrap())
        .group_by("k")
        .aggregate("v", AggOp::Hist);
    let (_, third) = run(&t, other);
    assert_eq!(third.cache_hits, 2);
}

#[test]
fn time_series_buckets_across_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let t   = table(dir.path(), config(16));
    let rows: Vec<Row> = (0..60).map(|i| Row::new().int("ts", 1000 + i * 10).str("k", "a")).collect();
    seal_rows(&t, &rows).unwrap();

    let (spec, _) = run(&t, QueryParams::new().time_series("ts", 100).group_by("k"));
    let totals = &spec.results.time_totals;
    assert_eq!(totals.len(), 6);
    assert!(totals.values().all(|r| r.count == 10));
    assert_eq!(spec.results.time_results[&1500]["a"].count, 10);
}

#[test]
fn stale_extent_discards_far_outliers() {
    let dir = tempfile::tempdir().unwrap();
    let t   = table(dir.path(), config(10));
    seal_rows(&t, &[Row::new().int("v", 5).str("k", "a"), Row::new().int("v", 500).str("k", "a")]).unwrap();

    let params   = QueryParams::new().group_by("k").aggregate("v", AggOp::Hist);
    let load     = params.load_spec(&t).unwrap();
    let mut spec = QuerySpec::new(params, &t).unwrap();
    // 表级 extent 停留在 [0, 10]：500 > 10 × 10 被丢弃，但记录仍计入分组
    let v = t.key_id("v").unwrap();
    spec.extents = Arc::new(HashMap::from([(v, Extent::new(0, 10))]));
    load_and_query(&t, &load, &mut spec).unwrap();

    let a = &spec.results.results["a"];
    assert_eq!(a.count, 2);
    assert_eq!(a.hists["v"].count(), 1);
    assert_eq!(a.hists["v"].max(), 5);
}

#[test]
fn sealing_tops_up_partial_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let t   = table(dir.path(), config(10));
    seal_rows(&t, &(0..5).map(|i| Row::new().int("n", i)).collect::<Vec<_>>()).unwrap();
    seal_rows(&t, &(5..17).map(|i| Row::new().int("n", i)).collect::<Vec<_>>()).unwrap();

    let dirs = t.block_dirs().unwrap();
    assert_eq!(dirs.len(), 2);
    assert_eq!(BlockInfo::read(&dirs[0]).unwrap().num_records, 10);
    assert_eq!(BlockInfo::read(&dirs[1]).unwrap().num_records, 7);
    let (spec, _) = run(&t, QueryParams::new().aggregate("n", AggOp::Avg));
    assert_eq!(spec.results.matched, 17);
    assert!((spec.results.results["total"].mean("n").unwrap() - 8.0).abs() < 1e-9);
}

#[test]
fn node_results_merge_like_a_single_query() {
    let root = tempfile::tempdir().unwrap();
    let a    = TableRegistry::new(root.path().join("a"), config(10)).with_locks(Arc::new(NoLock));
    let b    = TableRegistry::new(root.path().join("b"), config(10)).with_locks(Arc::new(NoLock));
    let ta   = a.table("events").unwrap();
    let tb   = b.table("events").unwrap();
    seal_rows(&ta, &(0..30).map(|i| Row::new().int("v", i).str("k", "x")).collect::<Vec<_>>()).unwrap();
    seal_rows(&tb, &(0..20).map(|i| Row::new().int("v", i * 100).str("k", "x")).collect::<Vec<_>>()).unwrap();

    let params = || QueryParams::new().group_by("k").aggregate("v", AggOp::Hist);
    let (ra, _) = run(&ta, params());
    let (rb, _) = run(&tb, params());
    let nodes: Vec<QueryResults> = vec![ra.results.exported(), rb.results.exported()];
    let mut merged = merge_node_results(&ra, nodes).unwrap();
    sort_results(&mut merged);

    let x = &merged.results.results["x"];
    assert_eq!(x.count, 50);
    assert_eq!(x.hists["v"].min(), 0);
    assert_eq!(x.hists["v"].max(), 1900);
    assert_eq!(merged.results.cumulative.as_ref().map(|c| c.count), Some(50));
    assert_eq!(merged.results.sorted, vec!["x"]);
}

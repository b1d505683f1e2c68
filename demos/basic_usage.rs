//! # olap-block-engine 使用案例
//!
//! 1. 打开 TableRegistry 与表
//! 2. 封块写入（seal_rows → encode_block）
//! 3. 文本过滤条件 + 分组 + 直方图查询
//! 4. 时间序列查询
//! 5. 导出结果并跨进程合并

use olap_block_engine::{
    combine::{merge_node_results, sort_results},
    filter::build_filters,
    hist::{HistogramKind, HistogramOps, HistogramParams},
    column_writer::seal_rows,
    load_and_query, AggOp, EngineConfig, FilterSpec, OrderBy, QueryParams, QuerySpec, Row, TableRegistry,
};

fn main() -> olap_block_engine::Result<()> {
    println!("═══════════════════════════════════════════════════════════");
    println!("   olap-block-engine 演示                                  ");
    println!("═══════════════════════════════════════════════════════════\n");

    // =========================================================================
    // 1. 打开表
    // =========================================================================
    println!("【1】打开表 `requests` ...");
    let root     = std::env::temp_dir().join("olap-block-demo");
    let _        = std::fs::remove_dir_all(&root);
    let config   = EngineConfig::default().with_chunk_size(1000).with_workers(4);
    let registry = TableRegistry::new(&root, config);
    let table    = registry.table("requests")?;
    println!("    root = {}\n", root.display());

    // =========================================================================
    // 2. 封块写入
    // =========================================================================
    println!("【2】写入 5000 条请求记录 ...");
    let hosts = ["api", "web", "cdn"];
    let rows: Vec<Row> = (0..5000i64)
        .map(|i| {
            Row::new()
                .int("time", 1_700_000_000 + i * 7)
                .int("latency", 5 + (i * 37) % 400)
                .str("host", hosts[(i % 3) as usize])
                .str("path", &format!("/item/{}", i % 50))
                .set("flags", if i % 10 == 0 { &["slow", "retry"][..] } else { &["ok"][..] })
        })
        .collect();
    let dirs = seal_rows(&table, &rows)?;
    println!("    blocks = {}\n", dirs.len());

    // =========================================================================
    // 3. 过滤 + 分组 + 直方图
    // =========================================================================
    println!("【3】host 分组，latency 直方图，过滤 latency > 100 且不含 slow ...");
    let filter_spec = FilterSpec::default()
        .with_int("latency:gt:100")
        .with_set("flags:nin:slow");
    let params = QueryParams::new()
        .group_by("host")
        .aggregate("latency", AggOp::Hist)
        .order_by(OrderBy::Aggregation("latency".into()));
    let mut load = params.load_spec(&table)?;
    let filters  = build_filters(&table, &mut load, &filter_spec, None)?;
    let params   = params.filters(filters);
    load.replace(&table, "path", r"\d+", "N")?;

    let mut spec = QuerySpec::new(params, &table)?;
    let stats    = load_and_query(&table, &load, &mut spec)?;
    println!("    blocks={} loaded={} skipped={} matched={}", stats.blocks, stats.loaded, stats.skipped, stats.matched);
    for r in spec.results.ordered() {
        let h = &r.hists["latency"];
        let p = h.percentiles();
        println!(
            "    {:<4} count={:<5} mean={:>7.2} p50={:<4} p99={:<4} stddev={:.2}",
            r.label, r.count, h.mean(), p.get(50).copied().unwrap_or(0), p.get(99).copied().unwrap_or(0), h.std_dev(),
        );
    }
    if let Some(total) = &spec.results.cumulative {
        println!("    {} count={}\n", total.label, total.count);
    }

    // =========================================================================
    // 4. 时间序列
    // =========================================================================
    println!("【4】按 3600 秒分桶的请求数 ...");
    let params = QueryParams::new()
        .time_series("time", 3600)
        .histogram(HistogramParams { kind: HistogramKind::Logarithmic, ..HistogramParams::default() })
        .aggregate("latency", AggOp::Avg);
    let load     = params.load_spec(&table)?;
    let mut spec = QuerySpec::new(params, &table)?;
    load_and_query(&table, &load, &mut spec)?;
    for (bucket, total) in &spec.results.time_totals {
        println!("    {bucket}  count={:<5} avg_latency={:.1}", total.count, total.mean("latency").unwrap_or(0.0));
    }
    println!();

    // =========================================================================
    // 5. 跨进程合并
    // =========================================================================
    println!("【5】导出结果并作为两个节点合并 ...");
    let params = QueryParams::new().group_by("host").aggregate("latency", AggOp::Hist);
    let load     = params.load_spec(&table)?;
    let mut spec = QuerySpec::new(params, &table)?;
    load_and_query(&table, &load, &mut spec)?;
    let exported = spec.results.exported();
    let mut merged = merge_node_results(&spec, [exported.clone(), exported])?;
    sort_results(&mut merged);
    for label in &merged.results.sorted {
        println!("    {label:<4} count={}", merged.results.results[label].count);
    }

    println!("\n完成。");
    Ok(())
}

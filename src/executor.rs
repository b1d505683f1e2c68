//! 查询执行：有界 worker 池扫描 block
//!
//! ```text
//!            block_dirs ── chunks(checkpoint_every) ──┐
//!                                                     ▼
//!   job channel (bounded) ──► worker × N ──► outcome channel
//!                               │
//!                               ├─ info.db extent 剪枝      → Skipped
//!                               ├─ cache/<md5>.db.gz 命中   → Cached
//!                               ├─ load_block + aggregate  → Scanned
//!                               └─ block 级错误             → Broken
//!                                                     │
//!   检查点：等待本批 worker 结束，合并结果，回收 slab 池 ◄─┘
//! ```
//!
//! 每个 worker 持有自己的 `block_copy`，block 之间不做同步；合并满足交换律，
//! 完成顺序不影响结果。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use crossbeam_channel::{bounded, unbounded};
use tracing::{debug, info, warn};
use crate::aggregate::filter_and_aggregate;
use crate::block::{load_block, TableBlock};
use crate::combine::{combine_results, merge_results, sort_results, MergeMode};
use crate::common::Result;
use crate::index::BlockExtents;
use crate::load_spec::LoadSpec;
use crate::query::{QueryResults, QuerySpec};
use crate::query_cache::{cache_key, load_cached, store_cached};
use crate::table::Table;

/// 一次查询的诊断计数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryStats {
    pub blocks:         usize,
    /// extent 剪枝跳过（含空 block）
    pub skipped:        usize,
    /// 解码失败的 block 名
    pub broken:         Vec<String>,
    pub cache_hits:     usize,
    pub cached_records: u64,
    pub loaded:         usize,
    pub matched:        u64,
}

enum Outcome {
    Skipped,
    Cached { records: u64, results: QueryResults },
    Scanned { results: QueryResults },
}

fn block_name(dir: &Path) -> String {
    dir.file_name().map_or_else(|| dir.display().to_string(), |n| n.to_string_lossy().into_owned())
}

// ── worker 池 ─────────────────────────────────────────────────────────────────

/// 在 `workers` 个线程上对每个目录执行 `job`；返回 (下标, 结果)，顺序不定
fn run_pool<T, F>(dirs: &[PathBuf], workers: usize, job: F) -> Vec<(usize, T)>
where
    T: Send,
    F: Fn(&Path) -> T + Sync,
{
    let workers = workers.max(1).min(dirs.len().max(1));
    let (job_tx, job_rx) = bounded::<(usize, &Path)>(workers);
    let (out_tx, out_rx) = unbounded::<(usize, T)>();
    let job = &job;

    thread::scope(|s| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let out_tx = out_tx.clone();
            s.spawn(move || {
                for (i, dir) in job_rx.iter() {
                    if out_tx.send((i, job(dir))).is_err() {
                        break;
                    }
                }
            });
        }
        for (i, dir) in dirs.iter().enumerate() {
            if job_tx.send((i, dir.as_path())).is_err() {
                break;
            }
        }
        drop(job_tx);
    });
    drop(out_tx);
    out_rx.into_iter().collect()
}

// ── 单个 block ────────────────────────────────────────────────────────────────

fn scan_block(table: &Table, load_spec: &LoadSpec, spec: &QuerySpec, dir: &Path) -> Result<Outcome> {
    let config = table.config();
    let info   = table.load_block_info(dir)?;
    if !BlockExtents::from_info(&info).should_load(&spec.query.params.filters) {
        return Ok(Outcome::Skipped);
    }

    let key = if config.cached_queries {
        match cache_key(spec, &info) {
            Ok(k)  => Some(k),
            Err(e) => {
                debug!(block = %block_name(dir), error = %e, "cannot build cache key");
                None
            }
        }
    } else {
        None
    };
    if let Some(results) = key.as_deref().and_then(|k| load_cached(dir, k)) {
        return Ok(Outcome::Cached { records: info.num_records as u64, results });
    }

    let Some(block) = load_block(table, dir, Some(load_spec), false)? else {
        return Ok(Outcome::Skipped);
    };
    let mut part = spec.block_copy();
    filter_and_aggregate(&mut part, &block, config);
    if let Some(k) = &key {
        store_cached(table, dir, &info, k, &part.results);
    }
    if load_spec.recycle() {
        load_spec.slab_pool().recycle(block.into_slab());
    }
    Ok(Outcome::Scanned { results: part.results })
}

/// 聚合列缺少表级 extent 时，先用各 block 的统计补齐，保证所有 worker 看到同一快照
fn prime_extents(table: &Table, spec: &mut QuerySpec, dirs: &[PathBuf]) {
    let missing = spec.query.aggregations.iter().any(|a| !spec.extents.contains_key(&a.id));
    if !missing {
        return;
    }
    for dir in dirs {
        match table.load_block_info(dir) {
            Ok(info) => table.absorb_block_info(&info),
            Err(e)   => debug!(block = %block_name(dir), error = %e, "no block info for extents"),
        }
    }
    spec.extents = Arc::new(table.extents_snapshot());
}

// ── 入口 ──────────────────────────────────────────────────────────────────────

/// 扫描表的所有 block，结果（已合并、排序）写回 `spec.results`
///
/// block 级错误只把该 block 记为 broken；其余错误中止查询。
pub fn load_and_query(table: &Table, load_spec: &LoadSpec, spec: &mut QuerySpec) -> Result<QueryStats> {
    let config = table.config();
    let dirs   = table.block_dirs()?;
    prime_extents(table, spec, &dirs);

    let mut stats = QueryStats { blocks: dirs.len(), ..QueryStats::default() };
    let mut acc   = QueryResults::default();
    let mut fatal = None;
    let shared    = &*spec;

    for (round, chunk) in dirs.chunks(config.checkpoint_every.max(1)).enumerate() {
        let outcomes = run_pool(chunk, config.workers, |dir| scan_block(table, load_spec, shared, dir));
        for (i, outcome) in outcomes {
            let name = block_name(&chunk[i]);
            match outcome {
                Ok(Outcome::Skipped) => stats.skipped += 1,
                Ok(Outcome::Cached { records, results }) => {
                    stats.cache_hits     += 1;
                    stats.cached_records += records;
                    merge_results(&mut acc, results, MergeMode::Fast)?;
                }
                Ok(Outcome::Scanned { results }) => {
                    stats.loaded += 1;
                    merge_results(&mut acc, results, MergeMode::Fast)?;
                }
                Err(e) if e.is_block_scoped() => {
                    warn!(table = %table.name(), block = %name, error = %e, "broken block, skipping");
                    table.forget_block_info(&chunk[i]);
                    stats.broken.push(name);
                }
                Err(e) => {
                    warn!(table = %table.name(), block = %name, error = %e, "query failed");
                    fatal.get_or_insert(e);
                }
            }
        }
        if let Some(e) = fatal.take() {
            return Err(e);
        }
        let dropped = table.slab_pool().trim(config.workers);
        debug!(table = %table.name(), round, blocks = chunk.len(), dropped_slabs = dropped, "checkpoint");
    }

    let mut partial = spec.block_copy();
    partial.results = acc;
    let mut out = combine_results(spec, [partial])?;
    sort_results(&mut out);
    stats.matched = out.results.matched;
    spec.results  = out.results;

    stats.broken.sort();
    info!(
        table      = %table.name(),
        blocks     = stats.blocks,
        skipped    = stats.skipped,
        cache_hits = stats.cache_hits,
        loaded     = stats.loaded,
        broken     = stats.broken.len(),
        matched    = stats.matched,
        "query finished"
    );
    Ok(stats)
}

/// 加载所有 block（不做查询），按目录顺序返回
pub fn load_records(table: &Table, load_spec: &LoadSpec) -> Result<(Vec<TableBlock>, QueryStats)> {
    let config  = table.config();
    let dirs    = table.block_dirs()?;
    let mut out = run_pool(&dirs, config.workers, |dir| load_block(table, dir, Some(load_spec), load_spec.load_all()));
    out.sort_by_key(|(i, _)| *i);

    let mut stats  = QueryStats { blocks: dirs.len(), ..QueryStats::default() };
    let mut blocks = Vec::with_capacity(out.len());
    for (i, loaded) in out {
        match loaded {
            Ok(Some(block)) => {
                stats.loaded += 1;
                blocks.push(block);
            }
            Ok(None) => stats.skipped += 1,
            Err(e) if e.is_block_scoped() => {
                warn!(table = %table.name(), block = %block_name(&dirs[i]), error = %e, "broken block, skipping");
                stats.broken.push(block_name(&dirs[i]));
            }
            Err(e) => return Err(e),
        }
    }
    debug!(table = %table.name(), loaded = stats.loaded, broken = stats.broken.len(), "loaded records");
    Ok((blocks, stats))
}

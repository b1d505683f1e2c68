//! Block 级查询结果缓存
//!
//! `<block>/cache/<md5>.db.gz`：gzip(bincode(QueryResults))
//!
//! key 是规范化查询签名的 MD5。对本 block 恒真的 `gt` / `lt` 条件不进入签名，
//! 使只在这些条件上不同的查询共享同一份缓存。排序与截断不进入签名：缓存的
//! 是未排序、未截断的 block 结果。读写失败一律视为未命中或放弃，不向上报错。

use std::fs;
use std::path::{Path, PathBuf};
use md5::{Digest, Md5};
use serde::Serialize;
use tracing::{debug, trace, warn};
use crate::common::Result;
use crate::compression;
use crate::field_type::CompressionType;
use crate::hist::HistogramParams;
use crate::index::BlockExtents;
use crate::meta::{write_file_atomic, BlockInfo};
use crate::query::{AggOp, QueryResults, QuerySpec};
use crate::table::Table;

const CACHE_DIR:     &str = "cache";
const CACHE_VERSION: u32  = 1;

#[derive(Serialize)]
struct CacheSignature<'a> {
    version:      u32,
    filters:      Vec<String>,
    groups:       Vec<&'a str>,
    aggregations: Vec<(&'a str, AggOp)>,
    time:         Option<(&'a str, i64)>,
    weight:       Option<&'a str>,
    histogram:    HistogramParams,
}

pub fn cache_key(spec: &QuerySpec, info: &BlockInfo) -> Result<String> {
    let query   = &spec.query;
    let extents = BlockExtents::from_info(info);
    // 只去掉恒真的区间条件；恒假条件的 block 在查缓存前已被 should_load 跳过
    let mut filters: Vec<String> = query
        .params
        .filters
        .iter()
        .filter(|f| !extents.is_trivial(f))
        .map(|f| f.signature())
        .collect();
    filters.sort();

    let sig = CacheSignature {
        version:      CACHE_VERSION,
        filters,
        groups:       query.groups.iter().map(|g| g.name.as_str()).collect(),
        aggregations: query.aggregations.iter().map(|a| (a.name.as_str(), a.op)).collect(),
        time:         query.time.as_ref().map(|t| (t.column.name.as_str(), t.width)),
        weight:       query.weight.as_ref().map(|w| w.name.as_str()),
        histogram:    query.hist,
    };
    let bytes = bincode::serialize(&sig)?;
    Ok(format!("{:x}", Md5::digest(&bytes)))
}

pub fn cache_path(block_dir: &Path, key: &str) -> PathBuf {
    block_dir.join(CACHE_DIR).join(format!("{key}.db{}", CompressionType::Gzip.extension()))
}

fn read_cached(path: &Path) -> Result<QueryResults> {
    let data = compression::decompress(&fs::read(path)?, CompressionType::Gzip)?;
    Ok(bincode::deserialize(&data)?)
}

/// 命中返回缓存的 block 结果
pub fn load_cached(block_dir: &Path, key: &str) -> Option<QueryResults> {
    let path = cache_path(block_dir, key);
    if !path.exists() {
        return None;
    }
    match read_cached(&path) {
        Ok(results) => {
            trace!(cache = %path.display(), "query cache hit");
            Some(results)
        }
        Err(e) => {
            debug!(cache = %path.display(), error = %e, "unreadable cache entry, treating as miss");
            None
        }
    }
}

fn write_cached(table: &Table, block_dir: &Path, key: &str, results: &QueryResults) -> Result<()> {
    let data  = compression::compress(&bincode::serialize(results)?, CompressionType::Gzip)?;
    let _lock = table.grab_lock(block_dir)?;
    fs::create_dir_all(block_dir.join(CACHE_DIR))?;
    write_file_atomic(&cache_path(block_dir, key), &data)
}

/// 只缓存满 block；失败只记日志。返回是否写入
pub fn store_cached(table: &Table, block_dir: &Path, info: &BlockInfo, key: &str, results: &QueryResults) -> bool {
    if info.num_records as usize != table.config().chunk_size {
        return false;
    }
    match write_cached(table, block_dir, key, results) {
        Ok(()) => {
            trace!(block = %block_dir.display(), key, "stored query cache");
            true
        }
        Err(e) => {
            warn!(block = %block_dir.display(), error = %e, "cannot store query cache");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::common::ColumnKind;
    use crate::config::EngineConfig;
    use crate::filter::{Filter, IntOp};
    use crate::lock::NoLock;
    use crate::meta::IntInfo;
    use crate::query::{GroupResult, QueryParams};

    fn table(dir: &Path, chunk: usize) -> Table {
        let config = EngineConfig::default().with_chunk_size(chunk);
        let t      = Table::new("t", dir, Arc::new(config), Arc::new(NoLock));
        for name in ["age", "state"] {
            let id = t.get_or_assign_key(name).unwrap();
            t.set_column_kind(id, if name == "age" { ColumnKind::Int } else { ColumnKind::Str }).unwrap();
        }
        t
    }

    fn info(min: i64, max: i64) -> BlockInfo {
        let mut info = BlockInfo { num_records: 4, ..BlockInfo::default() };
        info.int_info.insert("age".into(), IntInfo { min, max, avg: 0.0, count: 4 });
        info
    }

    fn spec(t: &Table, params: QueryParams) -> QuerySpec {
        QuerySpec::new(params, t).unwrap()
    }

    #[test]
    fn trivial_filters_do_not_change_key() {
        let dir   = tempfile::tempdir().unwrap();
        let t     = table(dir.path(), 4);
        let base  = spec(&t, QueryParams::new().group_by("state"));
        let gt    = spec(&t, QueryParams::new().group_by("state").filter(Filter::int(&t, "age", IntOp::Gt, 5).unwrap()));
        let cut   = spec(&t, QueryParams::new().group_by("state").filter(Filter::int(&t, "age", IntOp::Gt, 15).unwrap()));
        let block = info(10, 20);

        assert_eq!(cache_key(&base, &block).unwrap(), cache_key(&gt, &block).unwrap());
        assert_ne!(cache_key(&base, &block).unwrap(), cache_key(&cut, &block).unwrap());
        assert_eq!(cache_key(&base, &block).unwrap().len(), 32);
    }

    #[test]
    fn order_and_limit_are_not_part_of_key() {
        let dir   = tempfile::tempdir().unwrap();
        let t     = table(dir.path(), 4);
        let a     = spec(&t, QueryParams::new().group_by("state").limit(3));
        let b     = spec(&t, QueryParams::new().group_by("state"));
        let c     = spec(&t, QueryParams::new().group_by("age"));
        let block = info(0, 1);
        assert_eq!(cache_key(&a, &block).unwrap(), cache_key(&b, &block).unwrap());
        assert_ne!(cache_key(&a, &block).unwrap(), cache_key(&c, &block).unwrap());
    }

    #[test]
    fn store_and_load_full_blocks_only() {
        let dir       = tempfile::tempdir().unwrap();
        let block_dir = dir.path().join("block_000000");
        fs::create_dir_all(&block_dir).unwrap();
        let mut results = QueryResults::default();
        results.results.insert("CA".into(), GroupResult { count: 3, samples: 3, ..GroupResult::new("CA") });
        results.matched = 3;

        let partial = table(dir.path(), 8);
        assert!(!store_cached(&partial, &block_dir, &info(0, 1), "abc", &results));
        assert!(load_cached(&block_dir, "abc").is_none());

        let full = table(dir.path(), 4);
        assert!(store_cached(&full, &block_dir, &info(0, 1), "abc", &results));
        assert_eq!(load_cached(&block_dir, "abc"), Some(results));
    }

    #[test]
    fn corrupt_entries_are_misses() {
        let dir       = tempfile::tempdir().unwrap();
        let block_dir = dir.path().join("block_000000");
        fs::create_dir_all(block_dir.join(CACHE_DIR)).unwrap();
        fs::write(cache_path(&block_dir, "bad"), b"not gzip").unwrap();
        assert!(load_cached(&block_dir, "bad").is_none());
    }

    #[test]
    fn always_false_filters_stay_in_key_and_prune_the_block() {
        let dir   = tempfile::tempdir().unwrap();
        let t     = table(dir.path(), 4);
        let base  = spec(&t, QueryParams::new().group_by("state"));
        let never = spec(&t, QueryParams::new().group_by("state").filter(Filter::int(&t, "age", IntOp::Gt, 50).unwrap()));
        let block = info(10, 20);

        assert_ne!(cache_key(&base, &block).unwrap(), cache_key(&never, &block).unwrap());
        assert!(!BlockExtents::from_info(&block).should_load(&never.params().filters));
    }
}

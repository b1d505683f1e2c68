//! 过滤 + 分组聚合
//!
//! ```text
//! block.records()
//!   │  matches_all(bound filters)
//!   ▼
//! 原始分组键 [v0:8B LE][v1:8B LE]…[tag0][tag1]…
//!   │  HashMap<Vec<u8>, GroupResult>   （每个 block 最多 internal_result_limit 个）
//!   ▼
//! translate：每个不同的键解析一次标签 "CA\t42"
//!   │
//!   ▼
//! spec.results.results / time_results / time_totals
//! ```
//!
//! 原始键只在单个 block 内有意义：字符串槽位存的是块内 intern ID，
//! 扫描结束前必须按本 block 的 intern 表翻译成标签。

use std::collections::{BTreeMap, HashMap};
use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace, warn};
use crate::block::TableBlock;
use crate::combine::{combine_results, merge_result_maps, MergeMode};
use crate::common::{ColumnKind, Result};
use crate::config::EngineConfig;
use crate::filter::{bind_all, matches_all};
use crate::index::BlockExtents;
use crate::query::{ColumnRef, GroupResult, QuerySpec, ResultMap};
use crate::record::Record;

/// 没有分组列时的标签
pub const NO_GROUP_LABEL: &str = "total";

const KEY_WIDTH: usize = 8;

type RawGroups = HashMap<Vec<u8>, GroupResult>;

// ── 分组键 ────────────────────────────────────────────────────────────────────

/// 每个分组列 8 字节原始值，末尾每列一个槽位类型标签
///
/// 未填充与 set 槽位的值为 u64::MAX、标签为 Absent，因此与 int -1 不会冲突。
fn build_key(groups: &[ColumnRef], rec: &Record<'_>, key: &mut Vec<u8>) {
    let n = groups.len();
    key.clear();
    key.resize(n * (KEY_WIDTH + 1), 0);
    for (i, g) in groups.iter().enumerate() {
        let slot = &mut key[i * KEY_WIDTH..(i + 1) * KEY_WIDTH];
        let (raw, tag) = match rec.kind(g.id) {
            ColumnKind::Int => (rec.int(g.id).map_or(u64::MAX, |v| v as u64), ColumnKind::Int),
            ColumnKind::Str => (rec.str_id(g.id).map_or(u64::MAX, |s| s as u32 as u64), ColumnKind::Str),
            _               => (u64::MAX, ColumnKind::Absent),
        };
        LittleEndian::write_u64(slot, raw);
        key[n * KEY_WIDTH + i] = tag as u8;
    }
}

/// 原始键 → 可读标签（tab 分隔）
fn translate_key(key: &[u8], groups: &[ColumnRef], block: &TableBlock) -> String {
    if groups.is_empty() {
        return NO_GROUP_LABEL.to_string();
    }
    let n = groups.len();
    let parts: Vec<String> = groups
        .iter()
        .enumerate()
        .map(|(i, g)| {
            let raw = LittleEndian::read_u64(&key[i * KEY_WIDTH..(i + 1) * KEY_WIDTH]);
            match ColumnKind::from_u8(key[n * KEY_WIDTH + i]) {
                Some(ColumnKind::Int) => (raw as i64).to_string(),
                Some(ColumnKind::Str) => match block.resolve_str(g.id, raw as u32 as i32) {
                    Some(s) => s.to_string(),
                    None => {
                        debug!(block = %block.name(), column = %g.name, id = raw, "unresolved string id in group key");
                        String::new()
                    }
                },
                _ => String::new(),
            }
        })
        .collect();
    parts.join("\t")
}

/// 已存在则返回；达到上限时新分组被丢弃
fn group_slot<'m>(map: &'m mut RawGroups, key: &[u8], limit: usize) -> Option<&'m mut GroupResult> {
    if !map.contains_key(key) {
        if map.len() >= limit {
            return None;
        }
        map.insert(key.to_vec(), GroupResult::default());
    }
    map.get_mut(key)
}

fn translate_into(into: &mut ResultMap, raw: RawGroups, groups: &[ColumnRef], block: &TableBlock) {
    let mut labelled = ResultMap::new();
    for (key, mut result) in raw {
        let label    = translate_key(&key, groups, block);
        result.label = label.clone();
        match labelled.get_mut(&label) {
            // 不同原始键翻译成同一标签时合并
            Some(existing) => {
                if let Err(e) = existing.combine(&result, MergeMode::Fast) {
                    warn!(block = %block.name(), label = %label, error = %e, "cannot merge group");
                }
            }
            None => {
                labelled.insert(label, result);
            }
        }
    }
    if let Err(e) = merge_result_maps(into, labelled, MergeMode::Fast) {
        warn!(block = %block.name(), error = %e, "cannot merge block results");
    }
}

// ── 扫描 ──────────────────────────────────────────────────────────────────────

/// 对一个 block 过滤并聚合，结果累加进 `spec.results`；返回匹配的记录数
pub fn filter_and_aggregate(spec: &mut QuerySpec, block: &TableBlock, config: &EngineConfig) -> usize {
    let query   = spec.query.clone();
    let extents = spec.extents.clone();
    let limit   = config.internal_result_limit;

    let mut bound       = bind_all(&query.params.filters, block, config.regex_cache_size);
    let mut groups      = RawGroups::new();
    let mut time_groups = BTreeMap::<i64, RawGroups>::new();
    let mut time_totals = BTreeMap::<i64, GroupResult>::new();
    let mut key         = Vec::with_capacity(query.groups.len() * (KEY_WIDTH + 1));
    let mut matched     = 0usize;
    let mut dropped     = 0usize;

    for rec in block.records() {
        if !matches_all(&mut bound, &rec) {
            continue;
        }
        matched += 1;

        // 缺少时间列的记录计入匹配数但不参与聚合
        let bucket = match &query.time {
            Some(tb) => match rec.int(tb.column.id) {
                Some(t) => Some(tb.bucket(t)),
                None    => continue,
            },
            None => None,
        };
        let weight = query.weight_of(&rec);
        build_key(&query.groups, &rec, &mut key);

        match group_slot(&mut groups, &key, limit) {
            Some(r) => r.add(&query, &extents, &rec, weight),
            None    => dropped += 1,
        }
        if let Some(b) = bucket {
            if let Some(r) = group_slot(time_groups.entry(b).or_default(), &key, limit) {
                r.add(&query, &extents, &rec, weight);
            }
            time_totals
                .entry(b)
                .or_insert_with(|| GroupResult::new(NO_GROUP_LABEL))
                .add(&query, &extents, &rec, weight);
        }
    }

    if dropped > 0 {
        debug!(block = %block.name(), dropped, limit, "group limit reached, records dropped");
    }

    let results = &mut spec.results;
    translate_into(&mut results.results, groups, &query.groups, block);
    for (b, raw) in time_groups {
        translate_into(results.time_results.entry(b).or_default(), raw, &query.groups, block);
    }
    for (b, total) in time_totals {
        match results.time_totals.get_mut(&b) {
            Some(existing) => {
                if let Err(e) = existing.combine(&total, MergeMode::Fast) {
                    warn!(block = %block.name(), bucket = b, error = %e, "cannot merge time total");
                }
            }
            None => {
                results.time_totals.insert(b, total);
            }
        }
    }
    results.matched += matched as u64;
    trace!(block = %block.name(), records = block.len(), matched, groups = results.results.len(), "aggregated block");
    matched
}

/// 对已在内存中的 block 逐个聚合并合并（不经过磁盘与缓存）
pub fn match_and_aggregate(spec: &QuerySpec, blocks: &[TableBlock], config: &EngineConfig) -> Result<QuerySpec> {
    let filters  = &spec.query.params.filters;
    let partials = blocks
        .iter()
        .filter(|b| BlockExtents::from_info(b.info()).should_load(filters))
        .map(|b| {
            let mut part = spec.block_copy();
            filter_and_aggregate(&mut part, b, config);
            part
        })
        .collect::<Vec<_>>();
    combine_results(spec, partials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::filter::{Filter, IntOp, StrOp};
    use crate::hist::HistogramOps;
    use crate::lock::NoLock;
    use crate::query::{AggOp, QueryParams};
    use crate::record::Row;
    use crate::table::Table;

    fn table(dir: &std::path::Path) -> Table {
        Table::new("t", dir, Arc::new(EngineConfig::default()), Arc::new(NoLock))
    }

    fn people(t: &Table) -> TableBlock {
        let rows: Vec<Row> = (0..100)
            .map(|i| {
                let state = ["CA", "NY", "TX", "WA"][i % 4];
                Row::new().int("age", i as i64).str("state", state).int("ts", 1000 + i as i64)
            })
            .collect();
        TableBlock::from_rows(t, &rows).unwrap()
    }

    #[test]
    fn groups_by_string_column() {
        let dir   = tempfile::tempdir().unwrap();
        let t     = table(dir.path());
        let block = people(&t);
        let mut spec = QuerySpec::new(QueryParams::new().group_by("state").aggregate("age", AggOp::Avg), &t).unwrap();

        let matched = filter_and_aggregate(&mut spec, &block, &EngineConfig::default());
        assert_eq!(matched, 100);
        let r = &spec.results.results;
        assert_eq!(r.len(), 4);
        assert_eq!(r["CA"].count, 25);
        assert_eq!(r["CA"].label, "CA");
        // CA: 0, 4, ..., 96
        assert!((r["CA"].mean("age").unwrap() - 48.0).abs() < 1e-9);
    }

    #[test]
    fn filters_restrict_matches() {
        let dir   = tempfile::tempdir().unwrap();
        let t     = table(dir.path());
        let block = people(&t);
        let params = QueryParams::new()
            .filter(Filter::int(&t, "age", IntOp::Lt, 20).unwrap())
            .filter(Filter::str(&t, "state", StrOp::Neq, "TX").unwrap())
            .group_by("age");
        let mut spec = QuerySpec::new(params, &t).unwrap();
        assert_eq!(filter_and_aggregate(&mut spec, &block, &EngineConfig::default()), 15);
        assert!(spec.results.results.contains_key("0"));
        assert!(!spec.results.results.contains_key("2"));
        assert!(!spec.results.results.contains_key("20"));
    }

    #[test]
    fn ungrouped_label_and_time_buckets() {
        let dir   = tempfile::tempdir().unwrap();
        let t     = table(dir.path());
        let block = people(&t);
        let params   = QueryParams::new().time_series("ts", 50).aggregate("age", AggOp::Hist);
        let mut spec = QuerySpec::new(params, &t).unwrap();
        filter_and_aggregate(&mut spec, &block, &EngineConfig::default());

        let res = &spec.results;
        assert_eq!(res.results[NO_GROUP_LABEL].count, 100);
        // ts 1000..1100 → 桶 1000 / 1050
        assert_eq!(res.time_totals.keys().copied().collect::<Vec<_>>(), vec![1000, 1050]);
        assert_eq!(res.time_totals[&1000].count, 50);
        assert_eq!(res.time_results[&1050][NO_GROUP_LABEL].samples, 50);
        assert_eq!(res.results[NO_GROUP_LABEL].hists["age"].count(), 100);
    }

    #[test]
    fn weights_scale_counts() {
        let dir  = tempfile::tempdir().unwrap();
        let t    = table(dir.path());
        let rows = vec![
            Row::new().str("k", "a").int("w", 5),
            Row::new().str("k", "a").int("w", 0),
            Row::new().str("k", "a"),
        ];
        let block    = TableBlock::from_rows(&t, &rows).unwrap();
        let mut spec = QuerySpec::new(QueryParams::new().group_by("k").weight_by("w"), &t).unwrap();
        filter_and_aggregate(&mut spec, &block, &EngineConfig::default());
        let a = &spec.results.results["a"];
        assert_eq!(a.count, 7);
        assert_eq!(a.samples, 3);
    }

    #[test]
    fn negative_one_and_absent_are_distinct_groups() {
        let dir  = tempfile::tempdir().unwrap();
        let t    = table(dir.path());
        let rows = vec![Row::new().int("n", -1), Row::new().str("other", "x")];
        let block    = TableBlock::from_rows(&t, &rows).unwrap();
        let mut spec = QuerySpec::new(QueryParams::new().group_by("n"), &t).unwrap();
        filter_and_aggregate(&mut spec, &block, &EngineConfig::default());
        let labels: Vec<_> = spec.results.results.keys().cloned().collect();
        assert_eq!(labels, vec!["".to_string(), "-1".to_string()]);
    }

    #[test]
    fn group_limit_drops_new_groups() {
        let dir      = tempfile::tempdir().unwrap();
        let t        = table(dir.path());
        let block    = people(&t);
        let config   = EngineConfig::default().with_internal_result_limit(10);
        let mut spec = QuerySpec::new(QueryParams::new().group_by("age"), &t).unwrap();
        assert_eq!(filter_and_aggregate(&mut spec, &block, &config), 100);
        assert_eq!(spec.results.results.len(), 10);
    }

    #[test]
    fn in_memory_blocks_combine() {
        let dir    = tempfile::tempdir().unwrap();
        let t      = table(dir.path());
        let blocks = vec![people(&t), people(&t)];
        let spec   = QuerySpec::new(QueryParams::new().group_by("state"), &t).unwrap();
        let out    = match_and_aggregate(&spec, &blocks, &EngineConfig::default()).unwrap();
        assert_eq!(out.results.results["WA"].count, 50);
        assert_eq!(out.results.cumulative.as_ref().map(|c| c.count), Some(200));
        assert_eq!(out.results.matched, 200);
    }
}

//! 结果合并与排序
//!
//! block 完成顺序不固定，合并必须满足交换律与结合律：计数相加，直方图按
//! 几何一致的逐桶合并（Fast）或并集 extent 上的重建合并（Rebuild）。

use std::cmp::Ordering;
use tracing::debug;
use crate::common::Result;
use crate::query::{GroupResult, OrderBy, QueryResults, QuerySpec, ResultMap};

/// 累计结果的标签
pub const CUMULATIVE_LABEL: &str = "TOTAL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// 几何一致时原地逐桶合并，否则退化为重建
    Fast,
    /// 总是在并集 extent 上重建；用于不同进程的结果
    Rebuild,
}

impl GroupResult {
    pub fn combine(&mut self, other: &GroupResult, mode: MergeMode) -> Result<()> {
        for (name, h) in &other.hists {
            match self.hists.get_mut(name) {
                Some(mine) => mine.merge(h, mode == MergeMode::Fast)?,
                None => {
                    self.hists.insert(name.clone(), h.clone());
                }
            }
        }
        self.count   += other.count;
        self.samples += other.samples;
        Ok(())
    }
}

/// 不存在的分组直接移入，已存在的合并
pub fn merge_result_maps(into: &mut ResultMap, from: ResultMap, mode: MergeMode) -> Result<()> {
    for (label, result) in from {
        match into.get_mut(&label) {
            Some(existing) => existing.combine(&result, mode)?,
            None => {
                into.insert(label, result);
            }
        }
    }
    Ok(())
}

pub fn merge_results(into: &mut QueryResults, from: QueryResults, mode: MergeMode) -> Result<()> {
    merge_result_maps(&mut into.results, from.results, mode)?;
    for (bucket, map) in from.time_results {
        merge_result_maps(into.time_results.entry(bucket).or_default(), map, mode)?;
    }
    for (bucket, total) in from.time_totals {
        match into.time_totals.get_mut(&bucket) {
            Some(existing) => existing.combine(&total, mode)?,
            None => {
                into.time_totals.insert(bucket, total);
            }
        }
    }
    into.matched += from.matched;
    Ok(())
}

/// 由分组结果折叠出 `TOTAL`
fn compute_cumulative(results: &mut QueryResults, mode: MergeMode) -> Result<()> {
    let mut total = GroupResult::new(CUMULATIVE_LABEL);
    for r in results.results.values() {
        total.combine(r, mode)?;
    }
    results.cumulative = Some(total);
    Ok(())
}

/// 合并各 block 的结果，计算累计结果
pub fn combine_results(spec: &QuerySpec, partials: impl IntoIterator<Item = QuerySpec>) -> Result<QuerySpec> {
    let mut out = spec.block_copy();
    let mut n   = 0usize;
    for part in partials {
        merge_results(&mut out.results, part.results, MergeMode::Fast)?;
        n += 1;
    }
    compute_cumulative(&mut out.results, MergeMode::Fast)?;
    debug!(partials = n, groups = out.results.results.len(), matched = out.results.matched, "combined results");
    Ok(out)
}

/// 合并多个进程各自算出的结果（通常是 `exported()` 形式）
pub fn merge_node_results(spec: &QuerySpec, nodes: impl IntoIterator<Item = QueryResults>) -> Result<QuerySpec> {
    let mut out = spec.block_copy();
    for node in nodes {
        merge_results(&mut out.results, node, MergeMode::Rebuild)?;
    }
    compute_cumulative(&mut out.results, MergeMode::Rebuild)?;
    Ok(out)
}

fn score(r: &GroupResult, order: &OrderBy) -> f64 {
    match order {
        OrderBy::Count          => r.count as f64,
        OrderBy::Aggregation(a) => r.mean(a).unwrap_or(f64::NEG_INFINITY),
    }
}

/// 降序排序，同分按标签升序；`limit == 0` 不截断
///
/// 只截断 `sorted`，`results` 保持完整。
pub fn sort_results(spec: &mut QuerySpec) {
    let params = spec.params();
    let order  = params.order_by.clone();
    let limit  = params.limit;

    let mut ranked: Vec<(&String, f64)> = spec
        .results
        .results
        .iter()
        .map(|(label, r)| (label, score(r, &order)))
        .collect();
    ranked.sort_by(|a, b| match b.1.total_cmp(&a.1) {
        Ordering::Equal => a.0.cmp(b.0),
        other           => other,
    });
    if limit > 0 {
        ranked.truncate(limit);
    }
    let sorted: Vec<String> = ranked.into_iter().map(|(l, _)| l.clone()).collect();
    spec.results.sorted = sorted;
}

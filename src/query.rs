//! 查询描述与结果
//!
//! ```text
//! QueryParams (用户构建，列名)
//!      │ QuerySpec::new(params, table)   列名 → ColumnId，校验类型
//!      ▼
//! QuerySpec ─┬─ query   : Arc<CompiledQuery>            所有 block 共享
//!            ├─ extents : Arc<HashMap<ColumnId, Extent>> 查询开始时的表级快照
//!            └─ results : QueryResults                   每个 block 一份
//! ```
//!
//! `block_copy` 只复制两个 Arc，结果集为空，供每个 block 的 worker 独立累加。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tracing::debug;
use crate::common::{ColumnId, ColumnKind, OlapError, Result};
use crate::filter::Filter;
use crate::hist::{Extent, Histogram, HistogramKind, HistogramOps, HistogramParams};
use crate::load_spec::LoadSpec;
use crate::record::Record;
use crate::table::Table;

// ── 参数 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggOp {
    /// 只维护均值 / 计数
    Avg,
    /// 带桶的直方图（百分位）
    Hist,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OrderBy {
    #[default]
    Count,
    /// 按该聚合列的均值降序
    Aggregation(String),
}

#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub filters:      Vec<Filter>,
    pub groups:       Vec<String>,
    pub aggregations: Vec<(String, AggOp)>,
    pub order_by:     OrderBy,
    /// 0 表示不截断
    pub limit:        usize,
    pub time_series:  Option<(String, i64)>,
    pub weight:       Option<String>,
    pub histogram:    Option<HistogramParams>,
}

impl QueryParams {
    pub fn new() -> Self { Self::default() }

    pub fn filter(mut self, f: Filter) -> Self {
        self.filters.push(f);
        self
    }

    pub fn filters(mut self, fs: impl IntoIterator<Item = Filter>) -> Self {
        self.filters.extend(fs);
        self
    }

    pub fn group_by(mut self, column: &str) -> Self {
        self.groups.push(column.to_string());
        self
    }

    pub fn aggregate(mut self, column: &str, op: AggOp) -> Self {
        self.aggregations.push((column.to_string(), op));
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by = order;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = n;
        self
    }

    pub fn time_series(mut self, column: &str, bucket: i64) -> Self {
        self.time_series = Some((column.to_string(), bucket));
        self
    }

    pub fn weight_by(mut self, column: &str) -> Self {
        self.weight = Some(column.to_string());
        self
    }

    pub fn histogram(mut self, params: HistogramParams) -> Self {
        self.histogram = Some(params);
        self
    }

    /// 本查询需要解码的列
    pub fn load_spec(&self, table: &Table) -> Result<LoadSpec> {
        let mut spec = LoadSpec::new(table);
        for f in &self.filters {
            match f.kind() {
                ColumnKind::Int => spec.int(table, f.column())?,
                ColumnKind::Str => spec.str(table, f.column())?,
                ColumnKind::Set => spec.set(table, f.column())?,
                ColumnKind::Absent => {}
            }
        }
        for g in &self.groups {
            let id = table.key_id(g).ok_or_else(|| OlapError::MissingColumn(g.clone()))?;
            match table.column_kind(id) {
                ColumnKind::Int    => spec.int(table, g)?,
                ColumnKind::Str    => spec.str(table, g)?,
                ColumnKind::Set    => spec.set(table, g)?,
                ColumnKind::Absent => {}
            }
        }
        let ints = self.aggregations.iter().map(|(c, _)| c)
            .chain(self.time_series.as_ref().map(|(c, _)| c))
            .chain(self.weight.as_ref());
        for c in ints {
            spec.int(table, c)?;
        }
        Ok(spec)
    }
}

// ── 编译后的查询 ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    pub name: String,
    pub id:   ColumnId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    pub name: String,
    pub id:   ColumnId,
    pub op:   AggOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeBucket {
    pub column: ColumnRef,
    pub width:  i64,
}

impl TimeBucket {
    #[inline]
    pub fn bucket(&self, t: i64) -> i64 {
        t - t % self.width
    }
}

#[derive(Debug)]
pub struct CompiledQuery {
    pub params:       QueryParams,
    pub groups:       Vec<ColumnRef>,
    pub aggregations: Vec<Aggregation>,
    pub time:         Option<TimeBucket>,
    pub weight:       Option<ColumnRef>,
    pub hist:         HistogramParams,
}

impl CompiledQuery {
    /// 记录权重：权重列缺失或小于 1 时为 1
    #[inline]
    pub fn weight_of(&self, rec: &Record<'_>) -> i64 {
        self.weight
            .as_ref()
            .and_then(|w| rec.int(w.id))
            .map_or(1, |w| w.max(1))
    }

    pub fn new_histogram(&self, agg: &Aggregation, extent: Extent) -> Histogram {
        Histogram::new(&self.hist, extent, agg.op == AggOp::Hist)
    }
}

fn resolve(table: &Table, name: &str) -> Result<ColumnRef> {
    let id = table.key_id(name).ok_or_else(|| OlapError::MissingColumn(name.to_string()))?;
    Ok(ColumnRef { name: name.to_string(), id })
}

fn resolve_int(table: &Table, name: &str) -> Result<ColumnRef> {
    let col = resolve(table, name)?;
    match table.column_kind(col.id) {
        ColumnKind::Int | ColumnKind::Absent => Ok(col),
        found => Err(OlapError::TypeMismatch { column: name.to_string(), expected: ColumnKind::Int, found }),
    }
}

// ── 结果 ──────────────────────────────────────────────────────────────────────

/// 一个分组的累加结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupResult {
    pub label:   String,
    /// 加权计数
    pub count:   i64,
    pub samples: i64,
    pub hists:   BTreeMap<String, Histogram>,
}

impl GroupResult {
    pub fn new(label: &str) -> Self {
        Self { label: label.to_string(), ..Self::default() }
    }

    /// 计入一条记录；直方图按查询开始时的表级 extent 建立
    pub fn add(&mut self, query: &CompiledQuery, extents: &HashMap<ColumnId, Extent>, rec: &Record<'_>, weight: i64) {
        self.samples += 1;
        self.count   += weight;
        for agg in &query.aggregations {
            let Some(v) = rec.int(agg.id) else { continue };
            if let Some(h) = self.hists.get_mut(&agg.name) {
                h.record_value(v, weight);
                continue;
            }
            let mut h = match extents.get(&agg.id) {
                Some(extent) => query.new_histogram(agg, *extent),
                None => {
                    debug!(column = %agg.name, "no cached extent, histogram keeps every value");
                    query.new_histogram(agg, Extent::new(v, v)).without_discard()
                }
            };
            h.record_value(v, weight);
            self.hists.insert(agg.name.clone(), h);
        }
    }

    pub fn mean(&self, aggregation: &str) -> Option<f64> {
        self.hists.get(aggregation).map(HistogramOps::mean)
    }
}

pub type ResultMap = BTreeMap<String, GroupResult>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResults {
    /// 所有分组合计，标签 `TOTAL`
    pub cumulative:   Option<GroupResult>,
    pub results:      ResultMap,
    pub time_results: BTreeMap<i64, ResultMap>,
    pub time_totals:  BTreeMap<i64, GroupResult>,
    pub matched:      u64,
    /// 排序并截断后的标签
    pub sorted:       Vec<String>,
}

impl QueryResults {
    /// 所有直方图转为 External 形式，供跨进程传输
    pub fn exported(&self) -> QueryResults {
        let export = |r: &GroupResult| GroupResult {
            hists: r.hists.iter().map(|(k, h)| (k.clone(), h.export())).collect(),
            ..r.clone()
        };
        let export_map = |m: &ResultMap| m.iter().map(|(k, r)| (k.clone(), export(r))).collect::<ResultMap>();
        QueryResults {
            cumulative:   self.cumulative.as_ref().map(export),
            results:      export_map(&self.results),
            time_results: self.time_results.iter().map(|(t, m)| (*t, export_map(m))).collect(),
            time_totals:  self.time_totals.iter().map(|(t, r)| (*t, export(r))).collect(),
            matched:      self.matched,
            sorted:       self.sorted.clone(),
        }
    }

    /// 排序后的结果；未排序时按标签顺序
    pub fn ordered(&self) -> Vec<&GroupResult> {
        if self.sorted.is_empty() {
            return self.results.values().collect();
        }
        self.sorted.iter().filter_map(|l| self.results.get(l)).collect()
    }
}

// ── QuerySpec ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub query:   Arc<CompiledQuery>,
    pub extents: Arc<HashMap<ColumnId, Extent>>,
    pub results: QueryResults,
}

impl QuerySpec {
    pub fn new(params: QueryParams, table: &Table) -> Result<Self> {
        let groups = params.groups.iter().map(|g| resolve(table, g)).collect::<Result<Vec<_>>>()?;
        let aggregations = params.aggregations.iter()
            .map(|(name, op)| resolve_int(table, name).map(|c| Aggregation { name: c.name, id: c.id, op: *op }))
            .collect::<Result<Vec<_>>>()?;
        let time = match &params.time_series {
            Some((_, width)) if *width <= 0 =>
                return Err(OlapError::Unsupported(format!("time bucket must be positive, got {width}"))),
            Some((col, width)) => Some(TimeBucket { column: resolve_int(table, col)?, width: *width }),
            None => None,
        };
        let weight = params.weight.as_deref().map(|w| resolve_int(table, w)).transpose()?;
        let hist   = params
            .histogram
            .unwrap_or_else(|| HistogramParams::from_config(table.config(), HistogramKind::Linear));

        let query = CompiledQuery { params, groups, aggregations, time, weight, hist };
        Ok(Self {
            query:   Arc::new(query),
            extents: Arc::new(table.extents_snapshot()),
            results: QueryResults::default(),
        })
    }

    pub fn params(&self) -> &QueryParams { &self.query.params }

    /// 共享查询定义与 extent 快照，结果集独立
    pub fn block_copy(&self) -> Self {
        Self {
            query:   Arc::clone(&self.query),
            extents: Arc::clone(&self.extents),
            results: QueryResults::default(),
        }
    }

    pub fn reset_results(&mut self) {
        self.results = QueryResults::default();
    }
}

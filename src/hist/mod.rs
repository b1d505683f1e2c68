//! 直方图
//!
//! 三种封闭变体共享同一能力接口 `HistogramOps`（sealed，crate 外无法实现）：
//! - **Linear**      — 等宽桶覆盖表级缓存的 [min, max]
//! - **Logarithmic** — 从高端开始逐层减半的子区间，每个子区间一个 Linear
//! - **External**    — 稀疏精确桶（value → weight），跨进程传输用
//!
//! 同一列的所有分组直方图都按表级 extent 建立，因此正常情况下几何一致，
//! 可以逐桶合并；几何不同时走重建合并；变体不同时报 `HistogramMismatch`。

pub mod linear;
pub mod multi;
pub mod sparse;

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use crate::common::{OlapError, Result};
use crate::config::EngineConfig;

pub use linear::LinearHist;
pub use multi::LogHist;
pub use sparse::SparseHist;

// ── Extent ────────────────────────────────────────────────────────────────────

/// 闭区间 [min, max]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub min: i64,
    pub max: i64,
}

impl Extent {
    pub fn new(a: i64, b: i64) -> Self {
        Self { min: a.min(b), max: a.max(b) }
    }

    pub fn union(&self, other: &Extent) -> Extent {
        Extent { min: self.min.min(other.min), max: self.max.max(other.max) }
    }

    pub fn contains(&self, v: i64) -> bool {
        self.min <= v && v <= self.max
    }

    /// max - min，饱和到 i64::MAX
    pub fn width(&self) -> i64 {
        (self.max as i128 - self.min as i128).min(i64::MAX as i128) as i64
    }

    /// 远超缓存 max 的值视为脏数据丢弃（仅对正区间生效）
    pub fn discards(&self, v: i64) -> bool {
        self.max > 0 && v > self.max.saturating_mul(10)
    }
}

// ── 参数 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HistogramKind {
    #[default]
    Linear,
    Logarithmic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HistogramParams {
    pub kind:        HistogramKind,
    pub num_buckets: usize,
    pub split_pow:   u32,
}

impl Default for HistogramParams {
    fn default() -> Self {
        Self { kind: HistogramKind::Linear, num_buckets: crate::config::NUM_BUCKETS, split_pow: 1 }
    }
}

impl HistogramParams {
    pub fn from_config(config: &EngineConfig, kind: HistogramKind) -> Self {
        Self { kind, num_buckets: config.num_buckets, split_pow: config.log_hist_split_pow }
    }
}

// ── 运行统计 ──────────────────────────────────────────────────────────────────

/// 加权计数、样本数、min/max、均值与二阶矩（加权 Welford，可合并）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    pub count:   i64,
    pub samples: i64,
    pub min:     i64,
    pub max:     i64,
    pub mean:    f64,
    m2:          f64,
}

impl Default for RunningStats {
    fn default() -> Self {
        Self { count: 0, samples: 0, min: i64::MAX, max: i64::MIN, mean: 0.0, m2: 0.0 }
    }
}

impl RunningStats {
    pub fn record(&mut self, v: i64, weight: i64) {
        let x        = v as f64;
        self.samples += 1;
        self.count   += weight;
        self.min      = self.min.min(v);
        self.max      = self.max.max(v);
        let delta     = x - self.mean;
        self.mean    += delta * weight as f64 / self.count as f64;
        self.m2      += weight as f64 * delta * (x - self.mean);
    }

    pub fn merge(&mut self, other: &RunningStats) {
        if other.count == 0 && other.samples == 0 {
            return;
        }
        let total = self.count + other.count;
        if total > 0 {
            let (ca, cb) = (self.count as f64, other.count as f64);
            let delta    = other.mean - self.mean;
            self.mean    = (self.mean * ca + other.mean * cb) / total as f64;
            self.m2     += other.m2 + delta * delta * ca * cb / total as f64;
        }
        self.count   = total;
        self.samples += other.samples;
        self.min      = self.min.min(other.min);
        self.max      = self.max.max(other.max);
    }

    pub fn std_dev(&self) -> f64 {
        if self.count <= 0 {
            return 0.0;
        }
        (self.m2 / self.count as f64).max(0.0).sqrt()
    }
}

/// 按值升序遍历 (value, weight)，为每个百分位分配累计权重首次达到它的值
pub(crate) fn percentiles_from<I>(buckets: I, total: i64) -> Vec<i64>
where
    I: IntoIterator<Item = (i64, i64)>,
{
    if total <= 0 {
        return Vec::new();
    }
    let mut out  = vec![0i64; 100];
    let mut cum  = 0i64;
    let mut next = 0usize;
    let mut last = None;
    for (value, weight) in buckets {
        if weight <= 0 {
            continue;
        }
        cum += weight;
        last = Some(value);
        let p = ((100 * cum as i128) / total as i128).min(99) as usize;
        while next <= p {
            out[next] = value;
            next += 1;
        }
    }
    if let Some(v) = last {
        out[next.min(100)..].iter_mut().for_each(|slot| *slot = v);
    }
    out
}

// ── 能力接口 ──────────────────────────────────────────────────────────────────

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::LinearHist {}
    impl Sealed for super::LogHist {}
    impl Sealed for super::SparseHist {}
    impl Sealed for super::Histogram {}
}

pub trait HistogramOps: sealed::Sealed {
    fn record_value(&mut self, value: i64, weight: i64);
    fn mean(&self) -> f64;
    fn std_dev(&self) -> f64;
    /// 100 个百分位（0..=99）；无桶数据时为空
    fn percentiles(&self) -> Vec<i64>;
    /// 稀疏桶：桶下沿（或越界值本身）→ 权重
    fn buckets(&self) -> BTreeMap<i64, i64>;
    fn stats(&self) -> &RunningStats;
    fn same_geometry(&self, other: &Self) -> bool;
    /// 逐桶合并，要求几何一致
    fn combine(&mut self, other: &Self) -> Result<()>;
    fn fresh_with_same_shape(&self) -> Self where Self: Sized;

    fn count(&self)   -> i64 { self.stats().count }
    fn samples(&self) -> i64 { self.stats().samples }
    fn min(&self)     -> i64 { self.stats().min }
    fn max(&self)     -> i64 { self.stats().max }
}

// ── Histogram ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Histogram {
    Linear(LinearHist),
    Logarithmic(LogHist),
    External(SparseHist),
}

impl Histogram {
    /// `with_buckets = false` 时只维护均值/计数（avg 聚合）
    pub fn new(params: &HistogramParams, extent: Extent, with_buckets: bool) -> Self {
        match params.kind {
            HistogramKind::Linear =>
                Self::Linear(LinearHist::new(extent, params.num_buckets, with_buckets)),
            HistogramKind::Logarithmic =>
                Self::Logarithmic(LogHist::new(extent, params.num_buckets, params.split_pow, with_buckets)),
        }
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Linear(_)      => "linear",
            Self::Logarithmic(_) => "logarithmic",
            Self::External(_)    => "external",
        }
    }

    /// 关闭远端离群值丢弃（extent 不是表级缓存时使用）；External 本来就不丢弃
    pub fn without_discard(self) -> Self {
        match self {
            Self::Linear(h)      => Self::Linear(h.without_discard()),
            Self::Logarithmic(h) => Self::Logarithmic(h.without_discard()),
            external             => external,
        }
    }

    /// 导出为稀疏桶形式，供跨进程传输
    pub fn export(&self) -> Histogram {
        Self::External(SparseHist::from_parts(self.buckets(), self.stats().clone()))
    }

    pub fn fast_mergeable(&self, other: &Histogram) -> bool {
        match (self, other) {
            (Self::Linear(a), Self::Linear(b))           => a.same_geometry(b),
            (Self::Logarithmic(a), Self::Logarithmic(b)) => a.same_geometry(b),
            (Self::External(_), Self::External(_))       => true,
            _ => false,
        }
    }

    /// 跨 extent 合并：在并集 extent 上新建同变体直方图，灌入双方的稀疏桶
    pub fn rebuild_merge(&self, other: &Histogram) -> Result<Histogram> {
        match (self, other) {
            (Self::Linear(a), Self::Linear(b))           => Ok(Self::Linear(a.rebuilt_with(b))),
            (Self::Logarithmic(a), Self::Logarithmic(b)) => Ok(Self::Logarithmic(a.rebuilt_with(b))),
            (Self::External(a), Self::External(b))       => {
                let mut out = a.clone();
                out.combine(b)?;
                Ok(Self::External(out))
            }
            _ => Err(self.mismatch(other)),
        }
    }

    /// `fast` 且几何一致时原地合并，否则重建
    pub fn merge(&mut self, other: &Histogram, fast: bool) -> Result<()> {
        if fast && self.fast_mergeable(other) {
            return self.combine(other);
        }
        let rebuilt = self.rebuild_merge(other)?;
        *self = rebuilt;
        Ok(())
    }

    fn mismatch(&self, other: &Histogram) -> OlapError {
        OlapError::HistogramMismatch(format!(
            "cannot merge {} histogram with {} histogram",
            self.variant_name(),
            other.variant_name(),
        ))
    }
}

impl HistogramOps for Histogram {
    fn record_value(&mut self, value: i64, weight: i64) {
        match self {
            Self::Linear(h)      => h.record_value(value, weight),
            Self::Logarithmic(h) => h.record_value(value, weight),
            Self::External(h)    => h.record_value(value, weight),
        }
    }

    fn mean(&self) -> f64 {
        self.stats().mean
    }

    fn std_dev(&self) -> f64 {
        self.stats().std_dev()
    }

    fn percentiles(&self) -> Vec<i64> {
        match self {
            Self::Linear(h)      => h.percentiles(),
            Self::Logarithmic(h) => h.percentiles(),
            Self::External(h)    => h.percentiles(),
        }
    }

    fn buckets(&self) -> BTreeMap<i64, i64> {
        match self {
            Self::Linear(h)      => h.buckets(),
            Self::Logarithmic(h) => h.buckets(),
            Self::External(h)    => h.buckets(),
        }
    }

    fn stats(&self) -> &RunningStats {
        match self {
            Self::Linear(h)      => h.stats(),
            Self::Logarithmic(h) => h.stats(),
            Self::External(h)    => h.stats(),
        }
    }

    fn same_geometry(&self, other: &Self) -> bool {
        self.fast_mergeable(other)
    }

    fn combine(&mut self, other: &Self) -> Result<()> {
        match (self, other) {
            (Self::Linear(a), Self::Linear(b))           => a.combine(b),
            (Self::Logarithmic(a), Self::Logarithmic(b)) => a.combine(b),
            (Self::External(a), Self::External(b))       => a.combine(b),
            (this, other) => Err(this.mismatch(other)),
        }
    }

    fn fresh_with_same_shape(&self) -> Self {
        match self {
            Self::Linear(h)      => Self::Linear(h.fresh_with_same_shape()),
            Self::Logarithmic(h) => Self::Logarithmic(h.fresh_with_same_shape()),
            Self::External(h)    => Self::External(h.fresh_with_same_shape()),
        }
    }
}

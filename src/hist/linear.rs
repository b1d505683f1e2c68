//! 线性直方图
//!
//! 桶宽 = 区间宽度 / 目标桶数；区间过小时桶宽退化为 1（< 100）或宽度 / 100。
//! 低于 extent.min 的值进 underliers，超出最后一个桶的值进 outliers：
//! 参与均值/计数/标准差，不参与百分位。

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use crate::common::{OlapError, Result};
use super::{percentiles_from, Extent, HistogramOps, RunningStats};

enum Slot {
    Under,
    Bucket(usize),
    Over,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearHist {
    extent:         Extent,
    target_buckets: usize,
    bucket_size:    i64,
    num_buckets:    usize,
    /// 每桶权重；不跟踪百分位时为空
    values:         Vec<i64>,
    averages:       Vec<f64>,
    outliers:       Vec<(i64, i64)>,
    underliers:     Vec<(i64, i64)>,
    stats:          RunningStats,
    /// 远端离群值丢弃规则；extent 不是表级缓存时关闭
    discard:        bool,
}

impl LinearHist {
    pub fn new(extent: Extent, target_buckets: usize, with_buckets: bool) -> Self {
        let size            = extent.width();
        let mut num_buckets = target_buckets.max(1) as i64;
        let mut bucket_size = size / num_buckets;
        if bucket_size == 0 {
            if size < 100 {
                bucket_size = 1;
                num_buckets = size;
            } else {
                bucket_size = size / 100;
                num_buckets = size / bucket_size;
            }
        }
        let num_buckets = num_buckets as usize + 1;
        let slots       = if with_buckets { num_buckets + 1 } else { 0 };
        Self {
            extent,
            target_buckets,
            bucket_size,
            num_buckets,
            values:     vec![0; slots],
            averages:   vec![0.0; slots],
            outliers:   Vec::new(),
            underliers: Vec::new(),
            stats:      RunningStats::default(),
            discard:    true,
        }
    }

    /// 记录所有值，不套用丢弃规则
    pub fn without_discard(mut self) -> Self {
        self.discard = false;
        self
    }

    pub fn extent(&self)      -> Extent { self.extent }
    pub fn bucket_size(&self) -> i64    { self.bucket_size }
    pub fn num_buckets(&self) -> usize  { self.num_buckets }
    pub fn outliers(&self)    -> &[(i64, i64)] { &self.outliers }
    pub fn underliers(&self)  -> &[(i64, i64)] { &self.underliers }

    pub fn tracks_buckets(&self) -> bool { !self.values.is_empty() }

    fn slot(&self, v: i64) -> Slot {
        let idx = (v as i128 - self.extent.min as i128) / self.bucket_size as i128;
        if v < self.extent.min {
            Slot::Under
        } else if idx >= self.values.len() as i128 {
            Slot::Over
        } else {
            Slot::Bucket(idx as usize)
        }
    }

    fn bucket_edge(&self, idx: usize) -> i64 {
        let edge = self.extent.min as i128 + idx as i128 * self.bucket_size as i128;
        edge.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    /// 只放桶，不更新运行统计
    pub(crate) fn place(&mut self, v: i64, weight: i64) {
        if !self.tracks_buckets() {
            return;
        }
        match self.slot(v) {
            Slot::Under => self.underliers.push((v, weight)),
            Slot::Over  => self.outliers.push((v, weight)),
            Slot::Bucket(i) => {
                self.values[i]   += weight;
                self.averages[i] += (v as f64 - self.averages[i]) * weight as f64 / self.values[i] as f64;
            }
        }
    }

    /// 不做丢弃判断（对数直方图的子区间使用）
    pub(crate) fn record_unchecked(&mut self, v: i64, weight: i64) {
        self.stats.record(v, weight);
        self.place(v, weight);
    }

    pub(crate) fn stats_mut(&mut self) -> &mut RunningStats { &mut self.stats }

    /// 按桶下沿的已入桶权重（不含越界值）
    pub(crate) fn bucketed(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.values
            .iter()
            .enumerate()
            .filter(|(_, w)| **w > 0)
            .map(move |(i, w)| (self.bucket_edge(i), *w))
    }

    pub(crate) fn bucketed_total(&self) -> i64 {
        self.values.iter().sum()
    }

    /// 在两者 extent 的并集上重建
    pub(crate) fn rebuilt_with(&self, other: &LinearHist) -> LinearHist {
        let extent = self.extent.union(&other.extent);
        let mut out = LinearHist::new(extent, self.target_buckets, self.tracks_buckets() || other.tracks_buckets());
        for (v, w) in self.buckets().into_iter().chain(other.buckets()) {
            out.place(v, w);
        }
        out.stats = self.stats.clone();
        out.stats.merge(&other.stats);
        out.discard = self.discard && other.discard;
        out
    }
}

impl HistogramOps for LinearHist {
    fn record_value(&mut self, value: i64, weight: i64) {
        if self.discard && self.extent.discards(value) {
            return;
        }
        self.record_unchecked(value, weight);
    }

    fn mean(&self) -> f64 { self.stats.mean }

    fn std_dev(&self) -> f64 { self.stats.std_dev() }

    fn percentiles(&self) -> Vec<i64> {
        percentiles_from(self.bucketed(), self.bucketed_total())
    }

    fn buckets(&self) -> BTreeMap<i64, i64> {
        let mut out = BTreeMap::new();
        for (v, w) in self.bucketed().chain(self.underliers.iter().copied()).chain(self.outliers.iter().copied()) {
            *out.entry(v).or_insert(0) += w;
        }
        out
    }

    fn stats(&self) -> &RunningStats { &self.stats }

    fn same_geometry(&self, other: &Self) -> bool {
        self.extent == other.extent
            && self.bucket_size == other.bucket_size
            && self.num_buckets == other.num_buckets
            && self.values.len() == other.values.len()
    }

    fn combine(&mut self, other: &Self) -> Result<()> {
        if !self.same_geometry(other) {
            return Err(OlapError::HistogramMismatch(format!(
                "linear geometry differs: [{}, {}]/{} vs [{}, {}]/{}",
                self.extent.min, self.extent.max, self.bucket_size,
                other.extent.min, other.extent.max, other.bucket_size,
            )));
        }
        for i in 0..self.values.len() {
            let (ca, cb) = (self.values[i], other.values[i]);
            if ca + cb > 0 {
                self.averages[i] = (self.averages[i] * ca as f64 + other.averages[i] * cb as f64)
                    / (ca + cb) as f64;
            }
            self.values[i] = ca + cb;
        }
        self.outliers.extend_from_slice(&other.outliers);
        self.underliers.extend_from_slice(&other.underliers);
        self.stats.merge(&other.stats);
        self.discard &= other.discard;
        Ok(())
    }

    fn fresh_with_same_shape(&self) -> Self {
        LinearHist { discard: self.discard, ..LinearHist::new(self.extent, self.target_buckets, self.tracks_buckets()) }
    }
}

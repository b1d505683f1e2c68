//! 稀疏精确直方图（External 变体）

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use crate::common::Result;
use super::{percentiles_from, HistogramOps, RunningStats};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseHist {
    buckets: BTreeMap<i64, i64>,
    stats:   RunningStats,
}

impl SparseHist {
    pub fn new() -> Self { Self::default() }

    pub fn from_parts(buckets: BTreeMap<i64, i64>, stats: RunningStats) -> Self {
        Self { buckets, stats }
    }
}

impl HistogramOps for SparseHist {
    fn record_value(&mut self, value: i64, weight: i64) {
        self.stats.record(value, weight);
        *self.buckets.entry(value).or_insert(0) += weight;
    }

    fn mean(&self) -> f64 { self.stats.mean }

    fn std_dev(&self) -> f64 { self.stats.std_dev() }

    fn percentiles(&self) -> Vec<i64> {
        let total = self.buckets.values().sum();
        percentiles_from(self.buckets.iter().map(|(v, w)| (*v, *w)), total)
    }

    fn buckets(&self) -> BTreeMap<i64, i64> { self.buckets.clone() }

    fn stats(&self) -> &RunningStats { &self.stats }

    fn same_geometry(&self, _other: &Self) -> bool { true }

    fn combine(&mut self, other: &Self) -> Result<()> {
        for (v, w) in &other.buckets {
            *self.buckets.entry(*v).or_insert(0) += w;
        }
        self.stats.merge(&other.stats);
        Ok(())
    }

    fn fresh_with_same_shape(&self) -> Self { Self::new() }
}

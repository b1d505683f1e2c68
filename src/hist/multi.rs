//! 对数（多段）直方图
//!
//! ```text
//! min                                                   max
//!  │ last │ ... │   sub 2   │        sub 1 │    sub 0     │
//!  └──────┴─────┴───────────┴──────────────┴──────────────┘
//!                                   各段宽度逐层减半，从高端锚定
//! ```
//!
//! 值落入第一个包含它的子区间；高于 max 的进 sub 0，低于 min 的进最后一段。

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use crate::common::{OlapError, Result};
use super::{percentiles_from, Extent, HistogramOps, LinearHist, RunningStats};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogHist {
    extent:         Extent,
    target_buckets: usize,
    split_pow:      u32,
    subs:           Vec<LinearHist>,
    stats:          RunningStats,
    discard:        bool,
}

impl LogHist {
    pub fn new(extent: Extent, target_buckets: usize, split_pow: u32, with_buckets: bool) -> Self {
        let pow    = split_pow.clamp(1, 62);
        let target = target_buckets.max(1) as i64;

        let mut t = extent.width();
        let mut n = 0;
        while t > target {
            t >>= pow;
            n += 1;
        }

        let mut size  = extent.width();
        let mut right = extent.max;
        let mut subs  = Vec::with_capacity(n + 1);
        for _ in 0..n {
            size >>= pow;
            let lo = right - size;
            subs.push(LinearHist::new(Extent::new(lo, right), target_buckets, with_buckets));
            right = lo;
        }
        subs.push(LinearHist::new(Extent::new(extent.min, right), target_buckets, with_buckets));

        Self { extent, target_buckets, split_pow: pow, subs, stats: RunningStats::default(), discard: true }
    }

    pub fn without_discard(mut self) -> Self {
        self.discard = false;
        self
    }

    pub fn extent(&self) -> Extent { self.extent }

    pub fn sub_extents(&self) -> Vec<Extent> {
        self.subs.iter().map(LinearHist::extent).collect()
    }

    fn route(&self, v: i64) -> usize {
        if v > self.extent.max {
            return 0;
        }
        self.subs
            .iter()
            .position(|s| s.extent().contains(v))
            .unwrap_or(self.subs.len() - 1)
    }

    fn place(&mut self, v: i64, weight: i64) {
        let i = self.route(v);
        self.subs[i].place(v, weight);
        self.subs[i].stats_mut().record(v, weight);
    }

    pub(crate) fn rebuilt_with(&self, other: &LogHist) -> LogHist {
        let extent  = self.extent.union(&other.extent);
        let buckets = self.subs.iter().chain(&other.subs).any(LinearHist::tracks_buckets);
        let mut out = LogHist::new(extent, self.target_buckets, self.split_pow, buckets);
        for (v, w) in self.buckets().into_iter().chain(other.buckets()) {
            out.place(v, w);
        }
        out.stats = self.stats.clone();
        out.stats.merge(&other.stats);
        out.discard = self.discard && other.discard;
        out
    }
}

impl HistogramOps for LogHist {
    fn record_value(&mut self, value: i64, weight: i64) {
        if self.discard && self.extent.discards(value) {
            return;
        }
        self.stats.record(value, weight);
        let i = self.route(value);
        self.subs[i].record_unchecked(value, weight);
    }

    fn mean(&self) -> f64 { self.stats.mean }

    fn std_dev(&self) -> f64 { self.stats.std_dev() }

    fn percentiles(&self) -> Vec<i64> {
        let mut merged: BTreeMap<i64, i64> = BTreeMap::new();
        for sub in &self.subs {
            for (v, w) in sub.bucketed() {
                *merged.entry(v).or_insert(0) += w;
            }
        }
        let total = merged.values().sum();
        percentiles_from(merged, total)
    }

    fn buckets(&self) -> BTreeMap<i64, i64> {
        let mut out = BTreeMap::new();
        for sub in &self.subs {
            for (v, w) in sub.buckets() {
                *out.entry(v).or_insert(0) += w;
            }
        }
        out
    }

    fn stats(&self) -> &RunningStats { &self.stats }

    fn same_geometry(&self, other: &Self) -> bool {
        self.extent == other.extent
            && self.subs.len() == other.subs.len()
            && self.subs.iter().zip(&other.subs).all(|(a, b)| a.same_geometry(b))
    }

    fn combine(&mut self, other: &Self) -> Result<()> {
        if !self.same_geometry(other) {
            return Err(OlapError::HistogramMismatch(format!(
                "logarithmic geometry differs: {} vs {} sub-ranges over [{}, {}] / [{}, {}]",
                self.subs.len(), other.subs.len(),
                self.extent.min, self.extent.max, other.extent.min, other.extent.max,
            )));
        }
        for (a, b) in self.subs.iter_mut().zip(&other.subs) {
            a.combine(b)?;
        }
        self.stats.merge(&other.stats);
        self.discard &= other.discard;
        Ok(())
    }

    fn fresh_with_same_shape(&self) -> Self {
        let buckets = self.subs.iter().any(LinearHist::tracks_buckets);
        LogHist { discard: self.discard, ..LogHist::new(self.extent, self.target_buckets, self.split_pow, buckets) }
    }
}

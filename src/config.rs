//! 引擎配置
//!
//! 显式传递，不存在进程级全局状态：`TableRegistry` 持有 `Arc<EngineConfig>`，
//! 每个 `Table` 共享同一份。

use serde::{Deserialize, Serialize};
use crate::field_type::CompressionType;

/// 满 block 的记录数
pub const CHUNK_SIZE: usize = 65536;
/// 不同值个数 ≤ 该阈值时使用 bucket 编码
pub const CARDINALITY_THRESHOLD: usize = 5000;
/// 单个 block 内最多保留的分组数
pub const INTERNAL_RESULT_LIMIT: usize = 100_000;
/// 正则缓存的基数上限
pub const REGEX_CACHE_SIZE: usize = 100_000;
/// 线性直方图目标桶数
pub const NUM_BUCKETS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub chunk_size:            usize,
    pub cardinality_threshold: usize,
    pub internal_result_limit: usize,
    pub regex_cache_size:      usize,
    pub num_buckets:           usize,
    /// 对数直方图每层把区间右移 `pow` 位
    pub log_hist_split_pow:    u32,
    pub workers:               usize,
    /// 每调度多少个 block 做一次回收检查点
    pub checkpoint_every:      usize,
    pub recycle_slabs:         bool,
    pub max_pooled_slabs:      usize,
    pub cached_queries:        bool,
    pub compression:           CompressionType,
    pub lock_retries:          u32,
    pub lock_backoff_ms:       u64,
    pub top_strings:           usize,
    /// 表级 int 统计在样本数超过该值后不再细化
    pub int_info_sample_limit: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self {
            chunk_size:            CHUNK_SIZE,
            cardinality_threshold: CARDINALITY_THRESHOLD,
            internal_result_limit: INTERNAL_RESULT_LIMIT,
            regex_cache_size:      REGEX_CACHE_SIZE,
            num_buckets:           NUM_BUCKETS,
            log_hist_split_pow:    1,
            workers,
            checkpoint_every:      64,
            recycle_slabs:         true,
            max_pooled_slabs:      8,
            cached_queries:        false,
            compression:           CompressionType::Gzip,
            lock_retries:          10,
            lock_backoff_ms:       10,
            top_strings:           20,
            int_info_sample_limit: 1024,
        }
    }
}

impl EngineConfig {
    pub fn with_chunk_size(mut self, n: usize) -> Self {
        self.chunk_size = n.max(1);
        self
    }
    pub fn with_cardinality_threshold(mut self, n: usize) -> Self {
        self.cardinality_threshold = n;
        self
    }
    pub fn with_internal_result_limit(mut self, n: usize) -> Self {
        self.internal_result_limit = n;
        self
    }
    pub fn with_regex_cache_size(mut self, n: usize) -> Self {
        self.regex_cache_size = n;
        self
    }
    pub fn with_num_buckets(mut self, n: usize) -> Self {
        self.num_buckets = n.max(1);
        self
    }
    pub fn with_workers(mut self, n: usize) -> Self {
        self.workers = n.max(1);
        self
    }
    pub fn with_checkpoint_every(mut self, n: usize) -> Self {
        self.checkpoint_every = n.max(1);
        self
    }
    pub fn with_recycle_slabs(mut self, on: bool) -> Self {
        self.recycle_slabs = on;
        self
    }
    pub fn with_cached_queries(mut self, on: bool) -> Self {
        self.cached_queries = on;
        self
    }
    pub fn with_compression(mut self, c: CompressionType) -> Self {
        self.compression = c;
        self
    }
    pub fn with_lock_retries(mut self, retries: u32, backoff_ms: u64) -> Self {
        self.lock_retries    = retries;
        self.lock_backoff_ms = backoff_ms;
        self
    }
}

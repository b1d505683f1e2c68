//! Slab 池
//!
//! 紧凑查询循环里每个 block 都要分配 `列数 × 记录数` 的大数组。形状相同的
//! slab 在 block 释放后归还池中，下次加载时清零复用。池由一把锁保护，
//! 所有并发加载共享。

use parking_lot::Mutex;
use tracing::trace;
use crate::record::{RecordSlab, SlabShape};

#[derive(Debug, Default)]
pub struct SlabPool {
    slabs:      Mutex<Vec<RecordSlab>>,
    max_pooled: usize,
}

impl SlabPool {
    pub fn new(max_pooled: usize) -> Self {
        Self { slabs: Mutex::new(Vec::new()), max_pooled }
    }

    /// 取出同形状的 slab（清零），没有则新分配
    pub fn checkout(&self, shape: SlabShape) -> RecordSlab {
        let reused = {
            let mut slabs = self.slabs.lock();
            slabs
                .iter()
                .position(|s| s.shape() == shape)
                .map(|pos| slabs.swap_remove(pos))
        };
        match reused {
            Some(mut slab) => {
                trace!(width = shape.width, len = shape.len, "reusing pooled slab");
                slab.reset();
                slab
            }
            None => RecordSlab::allocate(shape),
        }
    }

    /// 归还；池满时直接丢弃
    pub fn recycle(&self, slab: RecordSlab) {
        let mut slabs = self.slabs.lock();
        if slabs.len() < self.max_pooled {
            slabs.push(slab);
        }
    }

    /// 检查点回收：只保留 `keep` 个
    pub fn trim(&self, keep: usize) -> usize {
        let mut slabs = self.slabs.lock();
        let dropped   = slabs.len().saturating_sub(keep);
        slabs.truncate(keep);
        dropped
    }

    pub fn len(&self)      -> usize { self.slabs.lock().len() }
    pub fn is_empty(&self) -> bool  { self.slabs.lock().is_empty() }
}

//! Block 级 extent 索引
//!
//! 只读 `info.db` 中每个 int 列的 [min, max]，在完整解码前判断 block 能否跳过：
//! - **should_load** — 任一 `gt` / `lt` 条件在 min 与 max 上都不成立时跳过
//! - **is_trivial**  — `gt` / `lt` 条件对 block 内每条记录都成立时，
//!   查询缓存 key 不包含它

use std::collections::BTreeMap;
use crate::filter::{Filter, IntOp};
use crate::hist::Extent;
use crate::meta::{BlockInfo, IntInfo};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockExtents {
    ints:        BTreeMap<String, IntInfo>,
    num_records: u64,
}

impl BlockExtents {
    pub fn from_info(info: &BlockInfo) -> Self {
        Self { ints: info.int_info.clone(), num_records: info.num_records as u64 }
    }

    pub fn extent(&self, column: &str) -> Option<Extent> {
        self.ints.get(column).map(IntInfo::extent)
    }

    /// 区间条件在极值记录上的结果：(min 处, max 处)；列不在本 block 时为 None
    fn probe(&self, filter: &Filter) -> Option<(bool, bool)> {
        let Filter::Int(f) = filter else { return None };
        if !matches!(f.op, IntOp::Gt | IntOp::Lt) {
            return None;
        }
        let info = self.ints.get(&f.column)?;
        Some((f.op.test(info.min, f.value), f.op.test(info.max, f.value)))
    }

    pub fn should_load(&self, filters: &[Filter]) -> bool {
        // 没有任何 int 统计时无从判断
        if self.ints.is_empty() {
            return true;
        }
        filters.iter().all(|f| match f {
            Filter::Int(i) if matches!(i.op, IntOp::Gt | IntOp::Lt) => {
                self.probe(f).is_some_and(|(lo, hi)| lo || hi)
            }
            _ => true,
        })
    }

    /// 恒真的区间条件；要求该列在 block 的每条记录上都有值
    pub fn is_trivial(&self, filter: &Filter) -> bool {
        let Some((lo, hi)) = self.probe(filter) else { return false };
        let populated = self.ints.get(filter.column()).is_some_and(|i| i.count == self.num_records);
        lo && hi && populated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::config::EngineConfig;
    use crate::lock::NoLock;
    use crate::table::Table;

    fn extents(min: i64, max: i64, count: u64, num_records: u32) -> BlockExtents {
        let mut info = BlockInfo { num_records, ..BlockInfo::default() };
        info.int_info.insert("age".into(), IntInfo { min, max, avg: 0.0, count });
        BlockExtents::from_info(&info)
    }

    fn filters(ops: &[(IntOp, i64)]) -> (tempfile::TempDir, Vec<Filter>) {
        let dir = tempfile::tempdir().unwrap();
        let t   = Table::new("t", dir.path(), Arc::new(EngineConfig::default()), Arc::new(NoLock));
        t.get_or_assign_key("age").unwrap();
        t.get_or_assign_key("name").unwrap();
        let fs = ops.iter().map(|(op, v)| Filter::int(&t, "age", *op, *v).unwrap()).collect();
        (dir, fs)
    }

    #[test]
    fn skips_disjoint_ranges() {
        let e = extents(10, 20, 5, 5);
        let (_d, f) = filters(&[(IntOp::Gt, 25)]);
        assert!(!e.should_load(&f));
        let (_d, f) = filters(&[(IntOp::Lt, 10)]);
        assert!(!e.should_load(&f));
        let (_d, f) = filters(&[(IntOp::Gt, 15), (IntOp::Lt, 30)]);
        assert!(e.should_load(&f));
        // eq / neq 不参与剪枝
        let (_d, f) = filters(&[(IntOp::Eq, 99)]);
        assert!(e.should_load(&f));
    }

    #[test]
    fn missing_column_means_no_match() {
        let mut info = BlockInfo { num_records: 3, ..BlockInfo::default() };
        info.int_info.insert("other".into(), IntInfo::new(1));
        let e = BlockExtents::from_info(&info);
        let (_d, f) = filters(&[(IntOp::Gt, 0)]);
        assert!(!e.should_load(&f));
        assert!(BlockExtents::default().should_load(&f));
    }

    #[test]
    fn trivial_filters_need_full_population() {
        let (_d, f) = filters(&[(IntOp::Gt, 5), (IntOp::Lt, 15)]);
        let full = extents(10, 20, 5, 5);
        assert!(full.is_trivial(&f[0]));
        assert!(!full.is_trivial(&f[1]));
        let sparse = extents(10, 20, 4, 5);
        assert!(!sparse.is_trivial(&f[0]));
    }
}

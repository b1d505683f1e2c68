//! 记录存储（structure-of-arrays）
//!
//! ```text
//! RecordSlab  (len 条记录 × width 列)
//! ┌───────────────────────────────────────────────┐
//! │ tags : [ColumnKind; len*width]   槽位类型标签 │
//! │ ints : [i64;        len*width]   仅含 int 列时│
//! │ strs : [StrId;      len*width]   仅含 str 列时│
//! │ sets : [Vec<StrId>; len*width]   仅含 set 列时│
//! └───────────────────────────────────────────────┘
//! record r 的 col c 槽位 = r * width + c
//! ```
//!
//! 一个 block 只分配少量大数组，每条记录是其中的一段切片；slab 属于分配它的
//! block，不在 block 之间共享。

use crate::common::{ColumnId, ColumnKind, StrId};
use crate::field_type::Value;

// ── SlabShape ─────────────────────────────────────────────────────────────────

/// slab 的形状；只有形状完全一致的 slab 才能复用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlabShape {
    pub width: usize,
    pub len:   usize,
    pub ints:  bool,
    pub strs:  bool,
    pub sets:  bool,
}

impl SlabShape {
    pub fn full(width: usize, len: usize) -> Self {
        Self { width, len, ints: true, strs: true, sets: true }
    }
}

// ── RecordSlab ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct RecordSlab {
    shape: SlabShape,
    tags:  Vec<ColumnKind>,
    ints:  Vec<i64>,
    strs:  Vec<StrId>,
    sets:  Vec<Vec<StrId>>,
}

impl RecordSlab {
    pub fn allocate(shape: SlabShape) -> Self {
        let n = shape.width * shape.len;
        Self {
            shape,
            tags: vec![ColumnKind::Absent; n],
            ints: if shape.ints { vec![0; n] } else { Vec::new() },
            strs: if shape.strs { vec![0; n] } else { Vec::new() },
            sets: if shape.sets { vec![Vec::new(); n] } else { Vec::new() },
        }
    }

    pub fn shape(&self)    -> SlabShape { self.shape }
    pub fn len(&self)      -> usize     { self.shape.len }
    pub fn width(&self)    -> usize     { self.shape.width }
    pub fn is_empty(&self) -> bool      { self.shape.len == 0 }

    /// 复用前清零
    pub fn reset(&mut self) {
        self.tags.fill(ColumnKind::Absent);
        self.ints.fill(0);
        self.strs.fill(0);
        self.sets.iter_mut().for_each(Vec::clear);
    }

    #[inline]
    fn slot(&self, row: usize, col: ColumnId) -> Option<usize> {
        let col = col as usize;
        (row < self.shape.len && col < self.shape.width).then(|| row * self.shape.width + col)
    }

    pub fn record(&self, row: usize) -> Record<'_> {
        Record { slab: self, row }
    }

    pub fn records(&self) -> impl Iterator<Item = Record<'_>> {
        (0..self.shape.len).map(move |row| Record { slab: self, row })
    }

    pub fn kind(&self, row: usize, col: ColumnId) -> ColumnKind {
        self.slot(row, col).map(|i| self.tags[i]).unwrap_or(ColumnKind::Absent)
    }

    // 未分配的类型数组在首次写入时补齐

    pub fn set_int(&mut self, row: usize, col: ColumnId, v: i64) -> bool {
        let Some(i) = self.slot(row, col) else { return false };
        if self.ints.is_empty() {
            self.ints       = vec![0; self.tags.len()];
            self.shape.ints = true;
        }
        self.ints[i] = v;
        self.tags[i] = ColumnKind::Int;
        true
    }

    pub fn set_str(&mut self, row: usize, col: ColumnId, id: StrId) -> bool {
        let Some(i) = self.slot(row, col) else { return false };
        if self.strs.is_empty() {
            self.strs       = vec![0; self.tags.len()];
            self.shape.strs = true;
        }
        self.strs[i] = id;
        self.tags[i] = ColumnKind::Str;
        true
    }

    /// 向 set 槽位追加一个成员（已存在则忽略）
    pub fn push_set(&mut self, row: usize, col: ColumnId, id: StrId) -> bool {
        let Some(i) = self.slot(row, col) else { return false };
        if self.sets.is_empty() {
            self.sets       = vec![Vec::new(); self.tags.len()];
            self.shape.sets = true;
        }
        if self.tags[i] != ColumnKind::Set {
            self.sets[i].clear();
        }
        if !self.sets[i].contains(&id) {
            self.sets[i].push(id);
        }
        self.tags[i] = ColumnKind::Set;
        true
    }

    /// 拷贝到更大的形状（列数增长或追加记录时使用）
    pub fn resized(&self, width: usize, len: usize) -> RecordSlab {
        let width = width.max(self.shape.width);
        let mut out = RecordSlab::allocate(SlabShape {
            width,
            len,
            ints: self.shape.ints,
            strs: self.shape.strs,
            sets: self.shape.sets,
        });
        for row in 0..self.shape.len.min(len) {
            for col in 0..self.shape.width {
                let src = row * self.shape.width + col;
                let dst = row * width + col;
                out.tags[dst] = self.tags[src];
                match self.tags[src] {
                    ColumnKind::Int    => out.ints[dst] = self.ints[src],
                    ColumnKind::Str    => out.strs[dst] = self.strs[src],
                    ColumnKind::Set    => out.sets[dst] = self.sets[src].clone(),
                    ColumnKind::Absent => {}
                }
            }
        }
        out
    }
}

// ── Record ────────────────────────────────────────────────────────────────────

/// 单条记录的只读视图
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    slab: &'a RecordSlab,
    row:  usize,
}

impl<'a> Record<'a> {
    pub fn row(&self) -> usize { self.row }

    pub fn kind(&self, col: ColumnId) -> ColumnKind {
        self.slab.kind(self.row, col)
    }

    pub fn int(&self, col: ColumnId) -> Option<i64> {
        let i = self.slab.slot(self.row, col)?;
        (self.slab.tags[i] == ColumnKind::Int).then(|| self.slab.ints[i])
    }

    pub fn str_id(&self, col: ColumnId) -> Option<StrId> {
        let i = self.slab.slot(self.row, col)?;
        (self.slab.tags[i] == ColumnKind::Str).then(|| self.slab.strs[i])
    }

    pub fn set(&self, col: ColumnId) -> Option<&'a [StrId]> {
        let i = self.slab.slot(self.row, col)?;
        (self.slab.tags[i] == ColumnKind::Set).then(|| self.slab.sets[i].as_slice())
    }
}

// ── Row ───────────────────────────────────────────────────────────────────────

/// 行存交给核心的一行：按列名组织
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    fields: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self { Self::default() }

    pub fn int(mut self, name: &str, v: i64) -> Self {
        self.fields.push((name.into(), Value::Int(v)));
        self
    }

    pub fn str(mut self, name: &str, v: &str) -> Self {
        self.fields.push((name.into(), Value::Str(v.into())));
        self
    }

    pub fn set<S: AsRef<str>>(mut self, name: &str, members: &[S]) -> Self {
        let v = members.iter().map(|s| s.as_ref().to_string()).collect();
        self.fields.push((name.into(), Value::Set(v)));
        self
    }

    pub fn field(mut self, name: &str, v: Value) -> Self {
        self.fields.push((name.into(), v));
        self
    }

    pub fn fields(&self) -> &[(String, Value)] { &self.fields }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_tagged_per_kind() {
        let mut slab = RecordSlab::allocate(SlabShape::full(3, 2));
        assert!(slab.set_int(0, 0, 42));
        assert!(slab.set_str(1, 1, 7));
        assert!(slab.push_set(1, 2, 3));
        assert!(slab.push_set(1, 2, 3));
        assert!(slab.push_set(1, 2, 4));

        let r0 = slab.record(0);
        assert_eq!(r0.int(0), Some(42));
        assert_eq!(r0.str_id(0), None);
        assert_eq!(r0.kind(1), ColumnKind::Absent);

        let r1 = slab.record(1);
        assert_eq!(r1.str_id(1), Some(7));
        assert_eq!(r1.set(2), Some(&[3, 4][..]));
        // 超出宽度的列视为未填充
        assert_eq!(r1.kind(9), ColumnKind::Absent);
    }

    #[test]
    fn out_of_range_writes_are_rejected() {
        let mut slab = RecordSlab::allocate(SlabShape::full(2, 2));
        assert!(!slab.set_int(2, 0, 1));
        assert!(!slab.set_int(0, 2, 1));
    }

    #[test]
    fn lazy_arrays_and_reset() {
        let shape    = SlabShape { width: 2, len: 4, ints: false, strs: false, sets: false };
        let mut slab = RecordSlab::allocate(shape);
        assert!(slab.set_int(3, 1, -5));
        assert!(slab.shape().ints);
        slab.reset();
        assert_eq!(slab.record(3).int(1), None);
    }

    #[test]
    fn resize_keeps_values() {
        let mut slab = RecordSlab::allocate(SlabShape::full(1, 2));
        slab.set_int(1, 0, 9);
        let bigger = slab.resized(3, 5);
        assert_eq!(bigger.len(), 5);
        assert_eq!(bigger.width(), 3);
        assert_eq!(bigger.record(1).int(0), Some(9));
        assert_eq!(bigger.record(4).kind(0), ColumnKind::Absent);
    }
}

//! LoadSpec：一次加载需要解码哪些列、是否复用 slab、加载时字符串替换

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use regex::Regex;
use crate::common::{ColumnKind, OlapError, Result};
use crate::record::SlabShape;
use crate::slab::SlabPool;
use crate::table::Table;

// ── StrReplace ────────────────────────────────────────────────────────────────

/// 加载时对 block 字符串表做的正则替换
#[derive(Debug, Clone)]
pub struct StrReplace {
    pattern:     Regex,
    replacement: String,
}

impl StrReplace {
    pub fn new(pattern: &str, replacement: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|source| OlapError::Regex { pattern: pattern.to_string(), source })?;
        Ok(Self { pattern, replacement: replacement.to_string() })
    }

    pub fn apply<'a>(&self, s: &'a str) -> Cow<'a, str> {
        self.pattern.replace_all(s, self.replacement.as_str())
    }
}

/// 依次应用所有替换
pub fn apply_all<'a>(replacements: &[StrReplace], s: &'a str) -> Cow<'a, str> {
    let mut out = Cow::Borrowed(s);
    for r in replacements {
        if let Cow::Owned(changed) = r.apply(&out) {
            out = Cow::Owned(changed);
        }
    }
    out
}

// ── LoadSpec ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LoadSpec {
    columns:      BTreeMap<String, ColumnKind>,
    load_all:     bool,
    recycle:      bool,
    replacements: HashMap<String, Vec<StrReplace>>,
    slabs:        Arc<SlabPool>,
}

impl LoadSpec {
    pub fn new(table: &Table) -> Self {
        Self {
            columns:      BTreeMap::new(),
            load_all:     false,
            recycle:      table.config().recycle_slabs,
            replacements: HashMap::new(),
            slabs:        Arc::clone(table.slab_pool()),
        }
    }

    /// 解码所有列
    pub fn all(table: &Table) -> Self {
        Self { load_all: true, ..Self::new(table) }
    }

    pub fn with_recycle(mut self, on: bool) -> Self {
        self.recycle = on;
        self
    }

    pub fn int(&mut self, table: &Table, name: &str) -> Result<()> {
        self.require(table, name, ColumnKind::Int)
    }

    pub fn str(&mut self, table: &Table, name: &str) -> Result<()> {
        self.require(table, name, ColumnKind::Str)
    }

    pub fn set(&mut self, table: &Table, name: &str) -> Result<()> {
        self.require(table, name, ColumnKind::Set)
    }

    fn require(&mut self, table: &Table, name: &str, kind: ColumnKind) -> Result<()> {
        let id = table
            .key_id(name)
            .ok_or_else(|| OlapError::MissingColumn(name.to_string()))?;
        match table.column_kind(id) {
            ColumnKind::Absent => {}
            k if k == kind     => {}
            k => return Err(OlapError::TypeMismatch { column: name.to_string(), expected: k, found: kind }),
        }
        self.columns.insert(name.to_string(), kind);
        Ok(())
    }

    /// 给某列的字符串表加替换规则（隐含加载该列）
    pub fn replace(&mut self, table: &Table, column: &str, pattern: &str, replacement: &str) -> Result<()> {
        let id   = table.key_id(column).ok_or_else(|| OlapError::MissingColumn(column.to_string()))?;
        let kind = match table.column_kind(id) {
            ColumnKind::Set => ColumnKind::Set,
            _               => ColumnKind::Str,
        };
        self.require(table, column, kind)?;
        self.replacements
            .entry(column.to_string())
            .or_default()
            .push(StrReplace::new(pattern, replacement)?);
        Ok(())
    }

    pub fn replacements(&self, column: &str) -> &[StrReplace] {
        self.replacements.get(column).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn wants(&self, kind: ColumnKind, name: &str) -> bool {
        self.load_all || self.columns.get(name) == Some(&kind)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, ColumnKind)> + '_ {
        self.columns.iter().map(|(n, k)| (n.as_str(), *k))
    }

    pub fn load_all(&self)  -> bool      { self.load_all }
    pub fn recycle(&self)   -> bool      { self.recycle }
    pub fn slab_pool(&self) -> &SlabPool { &self.slabs }

    /// 只为请求的列类型分配数组
    pub fn slab_shape(&self, width: usize, len: usize) -> SlabShape {
        if self.load_all {
            return SlabShape::full(width, len);
        }
        let has = |k| self.columns.values().any(|c| *c == k);
        SlabShape {
            width,
            len,
            ints: has(ColumnKind::Int),
            strs: has(ColumnKind::Str),
            sets: has(ColumnKind::Set),
        }
    }
}

//! Block / Table 持久化元数据
//!
//! - `<table>/<block>/info.db` — `BlockInfo`：记录数 + 每列统计（按列名）
//! - `<table>/info.db`         — `SavedTableInfo`：KeyTable + 表级统计
//!
//! 统计按列名而非列 ID 保存：块内字符串 ID 不会泄漏到块外。

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use crate::common::{ColumnKind, OlapError, Result};
use crate::hist::Extent;

pub const INFO_FILE: &str = "info.db";

// ── IntInfo ───────────────────────────────────────────────────────────────────

/// int 列的 min / max / 均值 / 填充记录数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntInfo {
    pub min:   i64,
    pub max:   i64,
    pub avg:   f64,
    pub count: u64,
}

impl IntInfo {
    pub fn new(v: i64) -> Self {
        Self { min: v, max: v, avg: v as f64, count: 1 }
    }

    pub fn update(&mut self, v: i64) {
        self.min    = self.min.min(v);
        self.max    = self.max.max(v);
        self.count += 1;
        self.avg   += (v as f64 - self.avg) / self.count as f64;
    }

    pub fn merge(&mut self, other: &IntInfo) {
        let total = self.count + other.count;
        if total > 0 {
            self.avg = (self.avg * self.count as f64 + other.avg * other.count as f64) / total as f64;
        }
        self.min   = self.min.min(other.min);
        self.max   = self.max.max(other.max);
        self.count = total;
    }

    pub fn extent(&self) -> Extent {
        Extent::new(self.min, self.max)
    }
}

// ── StrInfo ───────────────────────────────────────────────────────────────────

/// str 列的高频值与基数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrInfo {
    pub top_strings: BTreeMap<String, u64>,
    pub cardinality: u64,
}

impl StrInfo {
    pub fn update(&mut self, s: &str, occurrences: u64) {
        match self.top_strings.get_mut(s) {
            Some(n) => *n += occurrences,
            None    => {
                self.top_strings.insert(s.to_string(), occurrences);
                self.cardinality += 1;
            }
        }
    }

    /// 只保留出现次数最多的 `keep` 个
    pub fn prune(&mut self, keep: usize) {
        if self.top_strings.len() <= keep {
            return;
        }
        let mut ranked: Vec<(String, u64)> = std::mem::take(&mut self.top_strings).into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(keep);
        self.top_strings = ranked.into_iter().collect();
    }
}

// ── BlockInfo ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub num_records: u32,
    pub int_info:    BTreeMap<String, IntInfo>,
    pub str_info:    BTreeMap<String, StrInfo>,
}

impl BlockInfo {
    pub fn read(block_dir: &Path) -> Result<Self> {
        let path = block_dir.join(INFO_FILE);
        let data = fs::read(&path)?;
        bincode::deserialize(&data)
            .map_err(|e| OlapError::decode(path.display().to_string(), e.to_string()))
    }

    pub fn write(&self, block_dir: &Path) -> Result<()> {
        let data = bincode::serialize(self)
            .map_err(|e| OlapError::Encode(format!("block info: {e}")))?;
        write_file_atomic(&block_dir.join(INFO_FILE), &data)
            .map_err(|e| OlapError::Encode(format!("block info: {e}")))
    }
}

// ── SavedTableInfo ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SavedTableInfo {
    /// 按列 ID 排列的 (列名, 类型)
    pub columns:  Vec<(String, ColumnKind)>,
    pub int_info: BTreeMap<String, IntInfo>,
    pub str_info: BTreeMap<String, StrInfo>,
}

impl SavedTableInfo {
    pub fn read(table_dir: &Path) -> Result<Option<Self>> {
        let path = table_dir.join(INFO_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        bincode::deserialize(&data)
            .map(Some)
            .map_err(|e| OlapError::decode(path.display().to_string(), e.to_string()))
    }

    pub fn write(&self, table_dir: &Path) -> Result<()> {
        let data = bincode::serialize(self)?;
        write_file_atomic(&table_dir.join(INFO_FILE), &data)
    }
}

// ── 原子写 ────────────────────────────────────────────────────────────────────

/// 先写 `<path>.tmp` 再 rename
pub fn write_file_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = PathBuf::from(path);
    let name    = path
        .file_name()
        .map(|n| format!("{}.tmp", n.to_string_lossy()))
        .ok_or_else(|| OlapError::Unsupported(format!("not a file path: {}", path.display())))?;
    tmp.set_file_name(name);
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

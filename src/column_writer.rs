//! 列写入器与 block 落盘
//!
//! 每列独立维护：
//!   - 新建的 intern 表（目标 block 专用，写出的 ID 稠密）
//!   - value → 升序 record id 列表
//!
//! 不同值个数 ≤ `cardinality_threshold` 时写 Bucket 形式，否则写 Positional 形式。
//!
//! `encode_block` 的落盘顺序：
//! ```text
//! lock <dir>
//!   └─ 写 <dir>.partial/  →  重读 info.db 校验  →  <dir> → <dir>.old
//!                                              →  <dir>.partial → <dir>
//!                                              →  删除 <dir>.old
//! ```

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use crate::block::{load_block, TableBlock};
use crate::column::{write_column_file, ColumnData, PositionalValues, SavedBucket, SavedColumn};
use crate::common::{ColumnId, ColumnKind, OlapError, Result, RowId, StrId};
use crate::encoding::{delta_encode_ids, delta_encode_values};
use crate::intern::InternTable;
use crate::meta::{BlockInfo, IntInfo, StrInfo};
use crate::record::Row;
use crate::table::{KeyTable, Table};

// ── ColumnWriter ──────────────────────────────────────────────────────────────

pub struct ColumnWriter {
    name:    String,
    kind:    ColumnKind,
    strings: InternTable,
    values:  BTreeMap<i64, Vec<RowId>>,
    // 最大 record id + 1
    rows:    RowId,
}

impl ColumnWriter {
    pub fn new(name: &str, kind: ColumnKind) -> Self {
        Self {
            name:    name.to_string(),
            kind,
            strings: InternTable::new(),
            values:  BTreeMap::new(),
            rows:    0,
        }
    }

    pub fn kind(&self) -> ColumnKind { self.kind }

    /// 记录必须按 id 升序追加
    pub fn add_int(&mut self, row: RowId, v: i64) {
        self.push(v, row);
    }

    pub fn add_str(&mut self, row: RowId, s: &str) {
        let id = self.strings.intern(s);
        self.push(id as i64, row);
    }

    fn push(&mut self, value: i64, row: RowId) {
        let rows = self.values.entry(value).or_default();
        if rows.last() != Some(&row) {
            rows.push(row);
        }
        self.rows = self.rows.max(row + 1);
    }

    pub fn cardinality(&self) -> usize { self.values.len() }

    /// 把本列统计写进 block 的 info
    pub fn record_stats(&self, info: &mut BlockInfo, top_strings: usize) {
        match self.kind {
            ColumnKind::Int => {
                let (Some((&min, _)), Some((&max, _))) = (self.values.first_key_value(), self.values.last_key_value())
                else { return };
                let count: u64 = self.values.values().map(|r| r.len() as u64).sum();
                let sum: f64   = self.values.iter().map(|(v, r)| *v as f64 * r.len() as f64).sum();
                info.int_info.insert(
                    self.name.clone(),
                    IntInfo { min, max, avg: sum / count.max(1) as f64, count },
                );
            }
            ColumnKind::Str | ColumnKind::Set => {
                let mut stats = StrInfo::default();
                for (id, rows) in &self.values {
                    if let Some(s) = self.strings.resolve(*id as StrId) {
                        stats.update(s, rows.len() as u64);
                    }
                }
                stats.prune(top_strings);
                info.str_info.insert(self.name.clone(), stats);
            }
            ColumnKind::Absent => {}
        }
    }

    pub fn finalize(self, cardinality_threshold: usize) -> SavedColumn {
        let data = if self.values.len() <= cardinality_threshold {
            ColumnData::Buckets(
                self.values
                    .iter()
                    .map(|(value, rows)| SavedBucket { value: *value, deltas: delta_encode_ids(rows) })
                    .collect(),
            )
        } else {
            self.positional()
        };
        SavedColumn {
            name:    self.name,
            kind:    self.kind,
            strings: self.strings.strings().to_vec(),
            data,
        }
    }

    fn positional(&self) -> ColumnData {
        let len         = self.rows as usize;
        let mut present = vec![false; len];
        let values = match self.kind {
            ColumnKind::Int => {
                let mut dense = vec![0i64; len];
                for (v, rows) in &self.values {
                    for &r in rows {
                        dense[r as usize]   = *v;
                        present[r as usize] = true;
                    }
                }
                PositionalValues::Ints { value_delta: true, values: delta_encode_values(&dense) }
            }
            ColumnKind::Str => {
                let mut dense = vec![0 as StrId; len];
                for (v, rows) in &self.values {
                    for &r in rows {
                        dense[r as usize]   = *v as StrId;
                        present[r as usize] = true;
                    }
                }
                PositionalValues::Strs(dense)
            }
            _ => {
                let mut dense = vec![Vec::new(); len];
                for (v, rows) in &self.values {
                    for &r in rows {
                        dense[r as usize].push(*v as StrId);
                        present[r as usize] = true;
                    }
                }
                PositionalValues::Sets(dense)
            }
        };
        ColumnData::Positional { present, values }
    }
}

/// 按记录顺序把 block 的每个已填充槽位喂给对应列的 writer
fn collect_writers(keys: &KeyTable, block: &TableBlock) -> Result<BTreeMap<ColumnId, ColumnWriter>> {
    let mut writers = BTreeMap::new();
    let width = block.slab().width();
    for rec in block.records() {
        let row = RowId::try_from(rec.row())
            .map_err(|_| OlapError::Encode(format!("block {} has too many records", block.name())))?;
        for col in (0..width).map(|c| c as ColumnId) {
            let kind = rec.kind(col);
            if kind == ColumnKind::Absent {
                continue;
            }
            let writer = match writers.entry(col) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => {
                    let name = keys
                        .name(col)
                        .ok_or_else(|| OlapError::Encode(format!("column #{col} has no name")))?;
                    e.insert(ColumnWriter::new(name, kind))
                }
            };
            let lookup = |id: StrId| {
                block.resolve_str(col, id).ok_or_else(|| {
                    OlapError::Encode(format!("block {}: dangling string id {id} in column #{col}", block.name()))
                })
            };
            match kind {
                ColumnKind::Int => {
                    if let Some(v) = rec.int(col) {
                        writer.add_int(row, v);
                    }
                }
                ColumnKind::Str => {
                    if let Some(id) = rec.str_id(col) {
                        writer.add_str(row, lookup(id)?);
                    }
                }
                ColumnKind::Set => {
                    for &id in rec.set(col).unwrap_or(&[]) {
                        writer.add_str(row, lookup(id)?);
                    }
                }
                ColumnKind::Absent => {}
            }
        }
    }
    Ok(writers)
}

// ── Block 落盘 ────────────────────────────────────────────────────────────────

fn sibling(dir: &Path, suffix: &str) -> PathBuf {
    let mut name = dir.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn write_failed(path: &Path) -> impl FnOnce(io::Error) -> OlapError + '_ {
    move |e| OlapError::Encode(format!("{}: {e}", path.display()))
}

/// 写入 `<dir>.partial` 并校验，返回 (info, 字节数)
fn write_partial(table: &Table, block: &TableBlock, partial: &Path) -> Result<(BlockInfo, u64)> {
    if partial.exists() {
        fs::remove_dir_all(partial).map_err(write_failed(partial))?;
    }
    fs::create_dir_all(partial).map_err(write_failed(partial))?;

    let config  = table.config();
    let writers = collect_writers(&table.key_table(), block)?;
    let mut info  = BlockInfo { num_records: block.len() as u32, ..BlockInfo::default() };
    let mut bytes = 0;
    for writer in writers.into_values() {
        writer.record_stats(&mut info, config.top_strings);
        let saved = writer.finalize(config.cardinality_threshold);
        bytes += write_column_file(partial, &saved, config.compression)?;
    }
    info.write(partial)?;

    let check = BlockInfo::read(partial)
        .map_err(|e| OlapError::Encode(format!("validating {}: {e}", partial.display())))?;
    if check.num_records != info.num_records {
        return Err(OlapError::Encode(format!(
            "validating {}: wrote {} records, read back {}",
            partial.display(), info.num_records, check.num_records,
        )));
    }
    Ok((info, bytes))
}

/// 把内存 block 整体写到 `dir`，替换已有内容
pub fn encode_block(table: &Table, block: &TableBlock, dir: &Path) -> Result<BlockInfo> {
    if let Some(parent) = dir.parent() {
        fs::create_dir_all(parent).map_err(write_failed(parent))?;
    }
    let _guard = table.grab_lock(dir)?;
    encode_block_locked(table, block, dir)
}

/// 调用方已持有 `dir` 的锁
fn encode_block_locked(table: &Table, block: &TableBlock, dir: &Path) -> Result<BlockInfo> {
    let partial = sibling(dir, ".partial");
    let old     = sibling(dir, ".old");

    let (info, bytes) = match write_partial(table, block, &partial) {
        Ok(done) => done,
        Err(e) => {
            let _ = fs::remove_dir_all(&partial);
            return Err(e);
        }
    };

    if dir.exists() {
        if old.exists() {
            fs::remove_dir_all(&old).map_err(write_failed(&old))?;
        }
        fs::rename(dir, &old).map_err(write_failed(dir))?;
    }
    fs::rename(&partial, dir).map_err(write_failed(dir))?;
    if old.exists() {
        if let Err(e) = fs::remove_dir_all(&old) {
            warn!(dir = %old.display(), error = %e, "cannot remove replaced block");
        }
    }

    table.forget_block_info(dir);
    table.register_block(dir);
    info!(
        table   = table.name(),
        block   = %dir.display(),
        records = info.num_records,
        columns = info.int_info.len() + info.str_info.len(),
        bytes,
        "sealed block"
    );
    Ok(info)
}

/// 在锁内补齐未满的 block，返回写入的记录数
///
/// 其他写入者可能刚改过这个 block，所以拿到锁以后先丢掉缓存的 info 再读。
fn top_up_block(table: &Table, dir: &Path, rows: &[Row]) -> Result<usize> {
    let chunk  = table.config().chunk_size.max(1);
    let _guard = table.grab_lock(dir)?;
    table.forget_block_info(dir);
    let have = table.load_block_info(dir)?.num_records as usize;
    if have >= chunk {
        return Ok(0);
    }
    let Some(mut block) = load_block(table, dir, None, true)? else { return Ok(0) };
    let take = (chunk - have).min(rows.len());
    block.append_rows(table, &rows[..take])?;
    encode_block_locked(table, &block, dir)?;
    Ok(take)
}

/// 行存批次 → block
///
/// 先补齐最新的未满 block，剩余记录按 `chunk_size` 切成新 block。未满 block
/// 的锁拿不到时放弃补齐，全部写进新 block。返回写过的目录。
pub fn seal_rows(table: &Table, rows: &[Row]) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    if rows.is_empty() {
        return Ok(written);
    }
    let chunk    = table.config().chunk_size.max(1);
    let mut rest = rows;

    if let Some(dir) = table.block_dirs()?.pop() {
        match top_up_block(table, &dir, rest) {
            Ok(0) => {}
            Ok(take) => {
                written.push(dir);
                rest = &rest[take..];
            }
            Err(OlapError::LockTimeout(resource)) => {
                warn!(table = table.name(), block = %resource, "partial block is locked, writing new blocks");
            }
            Err(e) => return Err(e),
        }
    }

    for batch in rest.chunks(chunk) {
        let dir   = table.next_block_dir()?;
        let block = TableBlock::from_rows(table, batch)?;
        encode_block(table, &block, &dir)?;
        written.push(dir);
    }
    table.save_info()?;
    Ok(written)
}

//! TableBlock：一个 block 在内存中的形态
//!
//! ```text
//! <table>/<block>/
//!   ├─ info.db                  BlockInfo（记录数 + 列统计）
//!   ├─ int_<col>.db[.gz|.lz4]   SavedColumn
//!   ├─ str_<col>.db[.gz|.lz4]
//!   ├─ set_<col>.db[.gz|.lz4]
//!   └─ cache/<md5>.db.gz        查询缓存
//! ```
//!
//! 字符串 ID 只在本 block 的 intern 表内有效；跨 block 一律按字符串值重新解析。

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};
use crate::column::read_column_file;
use crate::column_reader::unpack_column;
use crate::common::{ColumnId, ColumnKind, OlapError, Result, StrId};
use crate::compression;
use crate::field_type::Value;
use crate::intern::InternTable;
use crate::load_spec::LoadSpec;
use crate::meta::{BlockInfo, INFO_FILE};
use crate::record::{Record, RecordSlab, Row, SlabShape};
use crate::table::Table;

/// 不是 block 的目录名
const RESERVED_DIRS: &[&str] = &["cache", INFO_FILE, "ingest"];

/// 写入中、待删除或已损坏的目录后缀
const TRANSIENT_SUFFIXES: &[&str] = &[".old", ".partial", ".broken", ".lock", ".export"];

pub fn looks_like_block(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !RESERVED_DIRS.contains(&name)
        && !TRANSIENT_SUFFIXES.iter().any(|s| name.ends_with(s))
}

// ── BlockColumn ───────────────────────────────────────────────────────────────

/// 列在本 block 内的元数据
#[derive(Debug, Default, Clone)]
pub struct BlockColumn {
    pub kind:    ColumnKind,
    pub strings: InternTable,
}

// ── TableBlock ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct TableBlock {
    dir:     Option<PathBuf>,
    info:    Arc<BlockInfo>,
    columns: HashMap<ColumnId, BlockColumn>,
    slab:    RecordSlab,
}

impl TableBlock {
    pub fn new(slab: RecordSlab) -> Self {
        let info = BlockInfo { num_records: slab.len() as u32, ..BlockInfo::default() };
        Self { dir: None, info: Arc::new(info), columns: HashMap::new(), slab }
    }

    /// 行存批次 → 内存 block；分配列 ID、确定列类型并更新表级统计
    pub fn from_rows(table: &Table, rows: &[Row]) -> Result<Self> {
        let mut block = Self::new(RecordSlab::allocate(SlabShape::full(0, 0)));
        block.append_rows(table, rows)?;
        Ok(block)
    }

    pub fn append_rows(&mut self, table: &Table, rows: &[Row]) -> Result<()> {
        let mut resolved = Vec::with_capacity(rows.len());
        for row in rows {
            let mut fields = Vec::with_capacity(row.fields().len());
            for (name, value) in row.fields() {
                let id = table.get_or_assign_key(name)?;
                table.set_column_kind(id, value.kind())?;
                fields.push((id, value));
            }
            resolved.push(fields);
        }

        let start = self.len();
        self.grow(table.num_columns(), start + rows.len());
        for (offset, fields) in resolved.into_iter().enumerate() {
            for (id, value) in fields {
                self.set_value(table, start + offset, id, value);
            }
        }
        Ok(())
    }

    /// 合并另一个 block 的记录；字符串按值重新 intern
    pub fn append_block(&mut self, table: &Table, other: &TableBlock) -> Result<()> {
        let start = self.len();
        self.grow(table.num_columns().max(other.slab.width()), start + other.len());
        for rec in other.records() {
            let row = start + rec.row();
            for col in 0..other.slab.width() as ColumnId {
                match rec.kind(col) {
                    ColumnKind::Int => {
                        if let Some(v) = rec.int(col) {
                            self.slab.set_int(row, col, v);
                        }
                    }
                    ColumnKind::Str => {
                        let s = rec.str_id(col).and_then(|sid| other.resolve_str(col, sid));
                        let s = s.ok_or_else(|| dangling(other, col))?;
                        let sid = self.column_mut(col, ColumnKind::Str).strings.intern(s);
                        self.slab.set_str(row, col, sid);
                    }
                    ColumnKind::Set => {
                        for member in rec.set(col).unwrap_or(&[]) {
                            let s   = other.resolve_str(col, *member).ok_or_else(|| dangling(other, col))?;
                            let sid = self.column_mut(col, ColumnKind::Set).strings.intern(s);
                            self.slab.push_set(row, col, sid);
                        }
                    }
                    ColumnKind::Absent => {}
                }
            }
        }
        Ok(())
    }

    fn grow(&mut self, width: usize, len: usize) {
        if width != self.slab.width() || len != self.slab.len() {
            self.slab = self.slab.resized(width, len);
        }
        let mut info = (*self.info).clone();
        info.num_records = len as u32;
        self.info = Arc::new(info);
    }

    fn set_value(&mut self, table: &Table, row: usize, id: ColumnId, value: &Value) {
        match value {
            Value::Int(v) => {
                table.update_int_info(id, *v);
                self.slab.set_int(row, id, *v);
            }
            Value::Str(s) => {
                table.update_str_info(id, s, 1);
                let sid = self.column_mut(id, ColumnKind::Str).strings.intern(s);
                self.slab.set_str(row, id, sid);
            }
            Value::Set(members) => {
                for s in members {
                    table.update_str_info(id, s, 1);
                    let sid = self.column_mut(id, ColumnKind::Set).strings.intern(s);
                    self.slab.push_set(row, id, sid);
                }
            }
        }
    }

    // ── 访问 ──────────────────────────────────────────────────────────────────

    pub fn dir(&self) -> Option<&Path> { self.dir.as_deref() }

    pub fn name(&self) -> String {
        self.dir
            .as_ref()
            .and_then(|d| d.file_name())
            .map_or_else(|| "<memory>".to_string(), |n| n.to_string_lossy().into_owned())
    }

    pub fn info(&self)      -> &BlockInfo      { &self.info }
    pub fn len(&self)       -> usize           { self.slab.len() }
    pub fn is_empty(&self)  -> bool            { self.slab.is_empty() }
    pub fn slab(&self)      -> &RecordSlab     { &self.slab }
    pub fn slab_mut(&mut self) -> &mut RecordSlab { &mut self.slab }
    pub fn into_slab(self)  -> RecordSlab      { self.slab }

    pub fn records(&self) -> impl Iterator<Item = Record<'_>> {
        self.slab.records()
    }

    pub fn column(&self, id: ColumnId) -> Option<&BlockColumn> {
        self.columns.get(&id)
    }

    pub fn column_mut(&mut self, id: ColumnId, kind: ColumnKind) -> &mut BlockColumn {
        let col = self.columns.entry(id).or_default();
        if col.kind == ColumnKind::Absent {
            col.kind = kind;
        }
        col
    }

    pub fn columns(&self) -> impl Iterator<Item = (ColumnId, &BlockColumn)> + '_ {
        self.columns.iter().map(|(id, c)| (*id, c))
    }

    pub fn resolve_str(&self, col: ColumnId, id: StrId) -> Option<&str> {
        self.columns.get(&col)?.strings.resolve(id)
    }
}

fn dangling(block: &TableBlock, col: ColumnId) -> OlapError {
    OlapError::decode(block.name(), format!("string id of column #{col} has no intern entry"))
}

// ── 加载 ──────────────────────────────────────────────────────────────────────

/// 从磁盘加载一个 block
///
/// `load_spec` 为空或 `load_all` 时解码所有列。记录数为 0 的 block 返回 `None`。
pub fn load_block(
    table:     &Table,
    dir:       &Path,
    load_spec: Option<&LoadSpec>,
    load_all:  bool,
) -> Result<Option<TableBlock>> {
    let info = table.load_block_info(dir)?;
    if info.num_records == 0 {
        return Ok(None);
    }
    let len      = info.num_records as usize;
    let width    = table.num_columns();
    let load_all = load_all || load_spec.map_or(true, LoadSpec::load_all);

    let shape = match load_spec {
        Some(spec) if !load_all => spec.slab_shape(width, len),
        _                       => SlabShape::full(width, len),
    };
    let slab = match load_spec {
        Some(spec) if spec.recycle() => spec.slab_pool().checkout(shape),
        _                            => RecordSlab::allocate(shape),
    };
    let mut block = TableBlock { dir: Some(dir.to_path_buf()), info, columns: HashMap::new(), slab };

    if let Err(e) = decode_columns(table, &mut block, dir, load_spec, load_all) {
        if let Some(spec) = load_spec.filter(|s| s.recycle()) {
            spec.slab_pool().recycle(block.into_slab());
        }
        return Err(e);
    }
    debug!(block = %block.name(), records = len, columns = block.columns.len(), "loaded block");
    Ok(Some(block))
}

fn decode_columns(
    table:     &Table,
    block:     &mut TableBlock,
    dir:       &Path,
    load_spec: Option<&LoadSpec>,
    load_all:  bool,
) -> Result<()> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();

    for path in files {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        let Some((kind, col)) = ColumnKind::parse_file_stem(compression::strip_extension(file_name)) else {
            continue;
        };
        if !load_all && !load_spec.is_some_and(|s| s.wants(kind, col)) {
            continue;
        }
        let saved = read_column_file(&path)?;
        trace!(block = %block.name(), column = %saved.name, encoding = ?saved.encoding(), "decoding column");
        let replacements = load_spec.map_or(&[][..], |s| s.replacements(&saved.name));
        unpack_column(table, block, saved, replacements)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::lock::NoLock;

    fn table(dir: &Path) -> Table {
        Table::new("t", dir, Arc::new(EngineConfig::default()), Arc::new(NoLock))
    }

    #[test]
    fn block_names() {
        assert!(looks_like_block("block_000001"));
        assert!(looks_like_block("1699999999"));
        assert!(!looks_like_block("cache"));
        assert!(!looks_like_block("info.db"));
        assert!(!looks_like_block("block_1.partial"));
        assert!(!looks_like_block("block_1.old"));
        assert!(!looks_like_block("block_1.broken"));
        assert!(!looks_like_block(".hidden"));
    }

    #[test]
    fn rows_populate_slab_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let t   = table(dir.path());
        let rows = vec![
            Row::new().int("age", 10).str("state", "CA"),
            Row::new().int("age", 30).set("tags", &["a", "b"]),
        ];
        let block = TableBlock::from_rows(&t, &rows).unwrap();
        assert_eq!(block.len(), 2);
        assert_eq!(block.info().num_records, 2);

        let age   = t.key_id("age").unwrap();
        let state = t.key_id("state").unwrap();
        let tags  = t.key_id("tags").unwrap();
        let r0    = block.slab().record(0);
        assert_eq!(r0.int(age), Some(10));
        assert_eq!(block.resolve_str(state, r0.str_id(state).unwrap()), Some("CA"));
        assert_eq!(r0.kind(tags), ColumnKind::Absent);
        assert_eq!(block.slab().record(1).set(tags).map(<[_]>::len), Some(2));
        assert_eq!(t.int_extent(age), Some(crate::hist::Extent::new(10, 30)));
    }

    #[test]
    fn conflicting_kinds_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let t   = table(dir.path());
        let rows = vec![Row::new().int("x", 1), Row::new().str("x", "one")];
        assert!(matches!(TableBlock::from_rows(&t, &rows), Err(OlapError::TypeMismatch { .. })));
    }

    #[test]
    fn append_block_reinterns_strings() {
        let dir = tempfile::tempdir().unwrap();
        let t   = table(dir.path());
        let mut a = TableBlock::from_rows(&t, &[Row::new().str("s", "x")]).unwrap();
        let b     = TableBlock::from_rows(&t, &[Row::new().str("s", "y"), Row::new().str("s", "x")]).unwrap();
        a.append_block(&t, &b).unwrap();

        let s = t.key_id("s").unwrap();
        let labels: Vec<_> = a.records()
            .map(|r| a.resolve_str(s, r.str_id(s).unwrap()).unwrap().to_string())
            .collect();
        assert_eq!(labels, ["x", "y", "x"]);
        assert_eq!(a.column(s).unwrap().strings.len(), 2);
    }

    #[test]
    fn failed_decode_returns_slab_to_pool() {
        let dir = tempfile::tempdir().unwrap();
        let t   = table(dir.path());
        let rows: Vec<_> = (0..4).map(|i| Row::new().int("n", i)).collect();
        let dirs = crate::column_writer::seal_rows(&t, &rows).unwrap();
        fs::write(dirs[0].join("int_n.db.gz"), b"not a column").unwrap();

        let load = LoadSpec::all(&t).with_recycle(true);
        assert!(t.slab_pool().is_empty());
        assert!(load_block(&t, &dirs[0], Some(&load), false).is_err());
        assert_eq!(t.slab_pool().len(), 1);
    }
}

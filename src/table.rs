//! Table 元数据与注册表
//!
//! ```text
//! TableRegistry (owned，无全局状态)
//!   └─ name → Arc<Table>            首次查找时创建
//!        ├─ KeyTable      RwLock    列名 ↔ ColumnId，列类型
//!        ├─ int / str 统计 RwLock    表级 extent（直方图按它建桶）
//!        ├─ blocks        Mutex     已知 block 列表
//!        ├─ block_infos   Mutex     info.db 缓存
//!        └─ slabs         SlabPool  跨 block 复用的记录数组
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use crate::block::looks_like_block;
use crate::common::{ColumnId, ColumnKind, OlapError, Result};
use crate::config::EngineConfig;
use crate::hist::Extent;
use crate::lock::{FileLock, LockGuard, ResourceLock};
use crate::meta::{BlockInfo, IntInfo, SavedTableInfo, StrInfo};
use crate::slab::SlabPool;

// ── KeyTable ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct KeyTable {
    ids:   HashMap<String, ColumnId>,
    names: Vec<String>,
    kinds: Vec<ColumnKind>,
}

impl KeyTable {
    pub fn id(&self, name: &str) -> Option<ColumnId> {
        self.ids.get(name).copied()
    }

    pub fn get_or_assign(&mut self, name: &str) -> Result<ColumnId> {
        if let Some(id) = self.id(name) {
            return Ok(id);
        }
        let id = ColumnId::try_from(self.names.len())
            .map_err(|_| OlapError::Unsupported(format!("too many columns, cannot add {name}")))?;
        self.ids.insert(name.to_string(), id);
        self.names.push(name.to_string());
        self.kinds.push(ColumnKind::Absent);
        Ok(id)
    }

    pub fn name(&self, id: ColumnId) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    pub fn kind(&self, id: ColumnId) -> ColumnKind {
        self.kinds.get(id as usize).copied().unwrap_or_default()
    }

    /// 列类型一经确定不可更改
    pub fn set_kind(&mut self, id: ColumnId, kind: ColumnKind) -> Result<()> {
        let Some(slot) = self.kinds.get_mut(id as usize) else {
            return Err(OlapError::MissingColumn(format!("#{id}")));
        };
        match *slot {
            ColumnKind::Absent       => { *slot = kind; Ok(()) }
            current if current == kind => Ok(()),
            current => Err(OlapError::TypeMismatch {
                column:   self.names[id as usize].clone(),
                expected: current,
                found:    kind,
            }),
        }
    }

    pub fn len(&self)      -> usize { self.names.len() }
    pub fn is_empty(&self) -> bool  { self.names.is_empty() }

    pub fn columns(&self) -> impl Iterator<Item = (ColumnId, &str, ColumnKind)> + '_ {
        self.names
            .iter()
            .zip(&self.kinds)
            .enumerate()
            .map(|(i, (n, k))| (i as ColumnId, n.as_str(), *k))
    }
}

// ── Table ─────────────────────────────────────────────────────────────────────

pub struct Table {
    name:        String,
    dir:         PathBuf,
    config:      Arc<EngineConfig>,
    locks:       Arc<dyn ResourceLock>,
    keys:        RwLock<KeyTable>,
    int_info:    RwLock<HashMap<ColumnId, IntInfo>>,
    str_info:    RwLock<HashMap<ColumnId, StrInfo>>,
    blocks:      Mutex<BTreeSet<String>>,
    block_infos: Mutex<HashMap<PathBuf, Arc<BlockInfo>>>,
    slabs:       Arc<SlabPool>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("columns", &self.keys.read().len())
            .finish()
    }
}

impl Table {
    pub fn new(name: &str, root: &Path, config: Arc<EngineConfig>, locks: Arc<dyn ResourceLock>) -> Self {
        let slabs = Arc::new(SlabPool::new(config.max_pooled_slabs));
        Self {
            name:        name.into(),
            dir:         root.join(name),
            config,
            locks,
            keys:        RwLock::new(KeyTable::default()),
            int_info:    RwLock::new(HashMap::new()),
            str_info:    RwLock::new(HashMap::new()),
            blocks:      Mutex::new(BTreeSet::new()),
            block_infos: Mutex::new(HashMap::new()),
            slabs,
        }
    }

    pub fn name(&self)      -> &str              { &self.name }
    pub fn dir(&self)       -> &Path             { &self.dir }
    pub fn config(&self)    -> &EngineConfig     { &self.config }
    pub fn slab_pool(&self) -> &Arc<SlabPool>    { &self.slabs }
    pub fn locks(&self)     -> &dyn ResourceLock { self.locks.as_ref() }

    /// 获取 block / table 目录锁（有限重试）
    pub fn grab_lock(&self, resource: &Path) -> Result<LockGuard<'_>> {
        LockGuard::acquire(self.locks(), resource, self.config.lock_retries, self.config.lock_backoff_ms)
    }

    // ── KeyTable ──────────────────────────────────────────────────────────────

    pub fn key_id(&self, name: &str) -> Option<ColumnId> {
        self.keys.read().id(name)
    }

    pub fn get_or_assign_key(&self, name: &str) -> Result<ColumnId> {
        if let Some(id) = self.key_id(name) {
            return Ok(id);
        }
        self.keys.write().get_or_assign(name)
    }

    pub fn column_name(&self, id: ColumnId) -> Option<String> {
        self.keys.read().name(id).map(str::to_string)
    }

    pub fn column_kind(&self, id: ColumnId) -> ColumnKind {
        self.keys.read().kind(id)
    }

    pub fn set_column_kind(&self, id: ColumnId, kind: ColumnKind) -> Result<()> {
        if self.column_kind(id) == kind {
            return Ok(());
        }
        self.keys.write().set_kind(id, kind)
    }

    pub fn num_columns(&self) -> usize {
        self.keys.read().len()
    }

    pub fn key_table(&self) -> KeyTable {
        self.keys.read().clone()
    }

    // ── 表级统计 ──────────────────────────────────────────────────────────────

    /// 样本数超过上限后不再细化，缓存的 extent 可能落后于实际数据
    pub fn update_int_info(&self, id: ColumnId, v: i64) {
        let limit    = self.config.int_info_sample_limit;
        let mut info = self.int_info.write();
        match info.get_mut(&id) {
            Some(i) if i.count > limit => {}
            Some(i) => i.update(v),
            None    => { info.insert(id, IntInfo::new(v)); }
        }
    }

    pub fn update_str_info(&self, id: ColumnId, s: &str, occurrences: u64) {
        let keep     = self.config.top_strings;
        let mut info = self.str_info.write();
        let entry    = info.entry(id).or_default();
        entry.update(s, occurrences);
        if entry.top_strings.len() > keep * 2 {
            entry.prune(keep);
        }
    }

    pub fn int_info(&self, id: ColumnId) -> Option<IntInfo> {
        self.int_info.read().get(&id).copied()
    }

    pub fn str_info(&self, id: ColumnId) -> Option<StrInfo> {
        self.str_info.read().get(&id).cloned()
    }

    pub fn int_extent(&self, id: ColumnId) -> Option<Extent> {
        self.int_info(id).map(|i| i.extent())
    }

    /// 查询开始时的 extent 快照：本次查询内所有直方图共用
    pub fn extents_snapshot(&self) -> HashMap<ColumnId, Extent> {
        self.int_info.read().iter().map(|(id, i)| (*id, i.extent())).collect()
    }

    /// 表级统计缺失时，用 block 统计补齐
    pub fn absorb_block_info(&self, info: &BlockInfo) {
        let keys     = self.keys.read();
        let mut ints = self.int_info.write();
        for (name, block_int) in &info.int_info {
            let Some(id) = keys.id(name) else { continue };
            ints.entry(id)
                .and_modify(|i| { i.min = i.min.min(block_int.min); i.max = i.max.max(block_int.max); })
                .or_insert(*block_int);
        }
    }

    // ── Blocks ────────────────────────────────────────────────────────────────

    /// 扫描表目录，返回排好序的 block 目录
    pub fn block_dirs(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e)  => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if looks_like_block(&name) {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        let mut known = self.blocks.lock();
        for d in &dirs {
            if let Some(n) = d.file_name() {
                known.insert(n.to_string_lossy().into_owned());
            }
        }
        Ok(dirs)
    }

    pub fn known_blocks(&self) -> Vec<String> {
        self.blocks.lock().iter().cloned().collect()
    }

    pub fn register_block(&self, dir: &Path) {
        if let Some(n) = dir.file_name() {
            self.blocks.lock().insert(n.to_string_lossy().into_owned());
        }
    }

    /// 新 block 的目录名：`block_000042`
    pub fn next_block_dir(&self) -> Result<PathBuf> {
        let next = self
            .block_dirs()?
            .iter()
            .filter_map(|d| d.file_name()?.to_str()?.strip_prefix("block_")?.parse::<u64>().ok())
            .max()
            .map_or(0, |n| n + 1);
        Ok(self.dir.join(format!("block_{next:06}")))
    }

    pub fn load_block_info(&self, dir: &Path) -> Result<Arc<BlockInfo>> {
        if let Some(info) = self.block_infos.lock().get(dir) {
            return Ok(Arc::clone(info));
        }
        let info = Arc::new(BlockInfo::read(dir)?);
        self.block_infos.lock().insert(dir.to_path_buf(), Arc::clone(&info));
        Ok(info)
    }

    /// block 重写后必须调用，避免读到旧记录数
    pub fn forget_block_info(&self, dir: &Path) {
        self.block_infos.lock().remove(dir);
    }

    // ── 持久化 ────────────────────────────────────────────────────────────────

    pub fn load_info(&self) -> Result<bool> {
        let Some(saved) = SavedTableInfo::read(&self.dir)? else {
            return Ok(false);
        };
        let mut keys = KeyTable::default();
        for (name, kind) in &saved.columns {
            let id = keys.get_or_assign(name)?;
            if *kind != ColumnKind::Absent {
                keys.set_kind(id, *kind)?;
            }
        }
        let ints: HashMap<_, _> = saved.int_info.iter()
            .filter_map(|(n, i)| Some((keys.id(n)?, *i)))
            .collect();
        let strs: HashMap<_, _> = saved.str_info.iter()
            .filter_map(|(n, s)| Some((keys.id(n)?, s.clone())))
            .collect();
        debug!(table = %self.name, columns = keys.len(), "loaded table info");
        *self.keys.write()     = keys;
        *self.int_info.write() = ints;
        *self.str_info.write() = strs;
        Ok(true)
    }

    pub fn save_info(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let keys  = self.keys.read();
        let saved = SavedTableInfo {
            columns:  keys.columns().map(|(_, n, k)| (n.to_string(), k)).collect(),
            int_info: self.int_info.read().iter()
                .filter_map(|(id, i)| Some((keys.name(*id)?.to_string(), *i)))
                .collect(),
            str_info: self.str_info.read().iter()
                .filter_map(|(id, s)| Some((keys.name(*id)?.to_string(), s.clone())))
                .collect(),
        };
        drop(keys);
        let _guard = self.grab_lock(&self.dir.join("info"))?;
        saved.write(&self.dir)
    }
}

// ── TableRegistry ─────────────────────────────────────────────────────────────

pub struct TableRegistry {
    root:   PathBuf,
    config: Arc<EngineConfig>,
    locks:  Arc<dyn ResourceLock>,
    tables: Mutex<HashMap<String, Arc<Table>>>,
}

impl TableRegistry {
    pub fn new(root: impl Into<PathBuf>, config: EngineConfig) -> Self {
        Self {
            root:   root.into(),
            config: Arc::new(config),
            locks:  Arc::new(FileLock),
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_locks(mut self, locks: Arc<dyn ResourceLock>) -> Self {
        self.locks = locks;
        self
    }

    pub fn root(&self)   -> &Path         { &self.root }
    pub fn config(&self) -> &EngineConfig { &self.config }

    /// 按名字取表；首次查找时创建并加载 `<table>/info.db`
    pub fn table(&self, name: &str) -> Result<Arc<Table>> {
        if name.is_empty() || name.contains(|c: char| c == '/' || c == '\\') || name.starts_with('.') {
            return Err(OlapError::Unsupported(format!("invalid table name {name:?}")));
        }
        if let Some(t) = self.tables.lock().get(name) {
            return Ok(Arc::clone(t));
        }
        let table = Arc::new(Table::new(name, &self.root, Arc::clone(&self.config), Arc::clone(&self.locks)));
        if table.load_info()? {
            info!(table = name, columns = table.num_columns(), "opened table");
        }
        let mut tables = self.tables.lock();
        Ok(Arc::clone(tables.entry(name.to_string()).or_insert(table)))
    }

    /// 根目录下的表名
    pub fn list_tables(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        match fs::read_dir(&self.root) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    if entry.file_type()?.is_dir() {
                        out.push(entry.file_name().to_string_lossy().into_owned());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        out.sort();
        Ok(out)
    }

    pub fn unload(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.lock().remove(name)
    }
}

//! 记录过滤器（返回 true 表示保留）
//!
//! - **Int** — `gt | lt | eq | neq`，比较原始整数值
//! - **Str** — `eq | neq` 比较块内 ID；`re | nre` 对解析出的字符串做正则匹配
//! - **Set** — `in | nin` 判断目标字符串是否在记录的集合里
//!
//! 未填充的槽位永远不匹配。字符串 ID 只在 block 内有效，所以 `Filter` 在扫描
//! 每个 block 前先 `bind` 成 `BoundFilter`：目标字符串解析为本 block 的 ID，
//! 正则结果缓存也挂在这一份绑定上。

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use regex::Regex;
use tracing::debug;
use crate::block::TableBlock;
use crate::common::{ColumnId, ColumnKind, OlapError, Result, StrId};
use crate::intern::InternTable;
use crate::load_spec::LoadSpec;
use crate::record::Record;
use crate::table::Table;

// ── 运算符 ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntOp { Gt, Lt, Eq, Neq }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrOp { Eq, Neq, Re, Nre }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetOp { In, Nin }

impl IntOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gt  => "gt",
            Self::Lt  => "lt",
            Self::Eq  => "eq",
            Self::Neq => "neq",
        }
    }

    #[inline]
    pub fn test(self, v: i64, target: i64) -> bool {
        match self {
            Self::Gt  => v > target,
            Self::Lt  => v < target,
            Self::Eq  => v == target,
            Self::Neq => v != target,
        }
    }
}

impl StrOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq  => "eq",
            Self::Neq => "neq",
            Self::Re  => "re",
            Self::Nre => "nre",
        }
    }
}

impl SetOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::In  => "in",
            Self::Nin => "nin",
        }
    }
}

impl FromStr for IntOp {
    type Err = OlapError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gt"  => Ok(Self::Gt),
            "lt"  => Ok(Self::Lt),
            "eq"  => Ok(Self::Eq),
            "neq" => Ok(Self::Neq),
            _     => Err(OlapError::Unsupported(format!("int filter op {s:?}"))),
        }
    }
}

impl FromStr for StrOp {
    type Err = OlapError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "eq"  => Ok(Self::Eq),
            "neq" => Ok(Self::Neq),
            "re"  => Ok(Self::Re),
            "nre" => Ok(Self::Nre),
            _     => Err(OlapError::Unsupported(format!("str filter op {s:?}"))),
        }
    }
}

impl FromStr for SetOp {
    type Err = OlapError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in"  => Ok(Self::In),
            "nin" => Ok(Self::Nin),
            _     => Err(OlapError::Unsupported(format!("set filter op {s:?}"))),
        }
    }
}

// ── Filter ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntFilter {
    pub column: String,
    pub id:     ColumnId,
    pub op:     IntOp,
    pub value:  i64,
}

#[derive(Debug, Clone)]
pub struct StrFilter {
    pub column: String,
    pub id:     ColumnId,
    pub op:     StrOp,
    pub value:  String,
    regex:      Option<Arc<Regex>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetFilter {
    pub column: String,
    pub id:     ColumnId,
    pub op:     SetOp,
    pub value:  String,
}

#[derive(Debug, Clone)]
pub enum Filter {
    Int(IntFilter),
    Str(StrFilter),
    Set(SetFilter),
}

fn column_id(table: &Table, column: &str) -> Result<ColumnId> {
    table.key_id(column).ok_or_else(|| OlapError::MissingColumn(column.to_string()))
}

impl Filter {
    pub fn int(table: &Table, column: &str, op: IntOp, value: i64) -> Result<Self> {
        let id = column_id(table, column)?;
        Ok(Self::Int(IntFilter { column: column.to_string(), id, op, value }))
    }

    pub fn str(table: &Table, column: &str, op: StrOp, value: &str) -> Result<Self> {
        let id    = column_id(table, column)?;
        let regex = match op {
            StrOp::Re | StrOp::Nre => Some(Arc::new(
                Regex::new(value).map_err(|source| OlapError::Regex { pattern: value.to_string(), source })?,
            )),
            _ => None,
        };
        Ok(Self::Str(StrFilter { column: column.to_string(), id, op, value: value.to_string(), regex }))
    }

    pub fn set(table: &Table, column: &str, op: SetOp, value: &str) -> Result<Self> {
        let id = column_id(table, column)?;
        Ok(Self::Set(SetFilter { column: column.to_string(), id, op, value: value.to_string() }))
    }

    pub fn column(&self) -> &str {
        match self {
            Self::Int(f) => &f.column,
            Self::Str(f) => &f.column,
            Self::Set(f) => &f.column,
        }
    }

    pub fn id(&self) -> ColumnId {
        match self {
            Self::Int(f) => f.id,
            Self::Str(f) => f.id,
            Self::Set(f) => f.id,
        }
    }

    pub fn kind(&self) -> ColumnKind {
        match self {
            Self::Int(_) => ColumnKind::Int,
            Self::Str(_) => ColumnKind::Str,
            Self::Set(_) => ColumnKind::Set,
        }
    }

    /// 稳定的文本形式，查询缓存 key 使用
    pub fn signature(&self) -> String {
        let kind = match self {
            Self::Int(_) => "int",
            Self::Str(_) => "str",
            Self::Set(_) => "set",
        };
        format!("{kind}:{self}")
    }

    /// 绑定到一个 block：目标字符串按值解析为块内 ID
    pub fn bind<'a>(&'a self, block: &'a TableBlock, regex_cache_size: usize) -> BoundFilter<'a> {
        let strings = block.column(self.id()).map(|c| &c.strings);
        let target  = match self {
            Self::Int(_) => None,
            Self::Str(f) => strings.and_then(|s| s.id(&f.value)),
            Self::Set(f) => strings.and_then(|s| s.id(&f.value)),
        };
        let regex_cache = match self {
            Self::Str(f) if matches!(f.op, StrOp::Re | StrOp::Nre)
                && strings.map_or(0, InternTable::len) < regex_cache_size => Some(HashMap::new()),
            _ => None,
        };
        BoundFilter { filter: self, strings, target, regex_cache }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(x) => write!(f, "{}:{}:{}", x.column, x.op.as_str(), x.value),
            Self::Str(x) => write!(f, "{}:{}:{}", x.column, x.op.as_str(), x.value),
            Self::Set(x) => write!(f, "{}:{}:{}", x.column, x.op.as_str(), x.value),
        }
    }
}

// ── BoundFilter ───────────────────────────────────────────────────────────────

pub struct BoundFilter<'a> {
    filter:      &'a Filter,
    strings:     Option<&'a InternTable>,
    // 目标字符串在本 block 中的 ID；不存在时为 None
    target:      Option<StrId>,
    regex_cache: Option<HashMap<StrId, bool>>,
}

impl BoundFilter<'_> {
    pub fn filter(&self) -> &Filter { self.filter }

    pub fn matches(&mut self, rec: &Record<'_>) -> bool {
        let filter = self.filter;
        match filter {
            Filter::Int(f) => rec.int(f.id).is_some_and(|v| f.op.test(v, f.value)),
            Filter::Str(f) => {
                let Some(sid) = rec.str_id(f.id) else { return false };
                match f.op {
                    StrOp::Eq  => self.target == Some(sid),
                    StrOp::Neq => self.target != Some(sid),
                    StrOp::Re  => self.regex_match(f, sid),
                    StrOp::Nre => !self.regex_match(f, sid),
                }
            }
            Filter::Set(f) => {
                let Some(members) = rec.set(f.id) else { return false };
                let found = self.target.is_some_and(|t| members.contains(&t));
                match f.op {
                    SetOp::In  => found,
                    SetOp::Nin => !found,
                }
            }
        }
    }

    fn regex_match(&mut self, f: &StrFilter, sid: StrId) -> bool {
        if let Some(hit) = self.regex_cache.as_ref().and_then(|c| c.get(&sid)) {
            return *hit;
        }
        let (Some(re), Some(s)) = (&f.regex, self.strings.and_then(|t| t.resolve(sid))) else {
            return false;
        };
        let hit = re.is_match(s);
        if let Some(cache) = &mut self.regex_cache {
            cache.insert(sid, hit);
        }
        hit
    }
}

pub fn bind_all<'a>(filters: &'a [Filter], block: &'a TableBlock, regex_cache_size: usize) -> Vec<BoundFilter<'a>> {
    filters.iter().map(|f| f.bind(block, regex_cache_size)).collect()
}

/// 合取：全部匹配才保留
#[inline]
pub fn matches_all(bound: &mut [BoundFilter<'_>], rec: &Record<'_>) -> bool {
    bound.iter_mut().all(|f| f.matches(rec))
}

// ── 文本构建 ──────────────────────────────────────────────────────────────────

/// 文本形式的过滤条件：`col:op:value[:table]`，多个条件以 `,` 分隔
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSpec {
    pub int:              String,
    pub str:              String,
    pub set:              String,
    pub field_separator:  String,
    pub filter_separator: String,
}

impl Default for FilterSpec {
    fn default() -> Self {
        Self {
            int:              String::new(),
            str:              String::new(),
            set:              String::new(),
            field_separator:  ",".into(),
            filter_separator: ":".into(),
        }
    }
}

impl FilterSpec {
    pub fn with_int(mut self, s: &str) -> Self { self.int = s.into(); self }
    pub fn with_str(mut self, s: &str) -> Self { self.str = s.into(); self }
    pub fn with_set(mut self, s: &str) -> Self { self.set = s.into(); self }

    pub fn with_separators(mut self, field: &str, filter: &str) -> Self {
        self.field_separator  = field.into();
        self.filter_separator = filter.into();
        self
    }

    fn clauses<'a>(&'a self, list: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        list.split(self.field_separator.as_str()).filter(|c| !c.is_empty())
    }
}

/// 解析过滤条件并在 `load_spec` 中登记对应列
///
/// 第 4 段写了表名且不是本表时跳过该条件。`time` 为 (时间列, 桶宽) 时，时间列
/// 上的 int 条件对齐到桶边界。
pub fn build_filters(
    table:     &Table,
    load_spec: &mut LoadSpec,
    spec:      &FilterSpec,
    time:      Option<(&str, i64)>,
) -> Result<Vec<Filter>> {
    let mut filters = Vec::new();
    let sep = spec.filter_separator.as_str();

    for clause in spec.clauses(&spec.int) {
        let Some((col, op, value)) = split_clause(table, clause, sep)? else { continue };
        let mut value: i64 = value
            .parse()
            .map_err(|_| OlapError::Unsupported(format!("int filter value {value:?}")))?;
        if let Some((time_col, bucket)) = time {
            if col == time_col && bucket > 0 && value % bucket != 0 {
                let aligned = value / bucket * bucket;
                debug!(column = col, from = value, to = aligned, "aligning time filter to bucket");
                value = aligned;
            }
        }
        filters.push(Filter::int(table, col, op.parse()?, value)?);
        load_spec.int(table, col)?;
    }

    for clause in spec.clauses(&spec.set) {
        let Some((col, op, value)) = split_clause(table, clause, sep)? else { continue };
        filters.push(Filter::set(table, col, op.parse()?, value)?);
        load_spec.set(table, col)?;
    }

    for clause in spec.clauses(&spec.str) {
        let Some((col, op, value)) = split_clause(table, clause, sep)? else { continue };
        filters.push(Filter::str(table, col, op.parse()?, value)?);
        load_spec.str(table, col)?;
    }
    Ok(filters)
}

fn split_clause<'a>(table: &Table, clause: &'a str, sep: &str) -> Result<Option<(&'a str, &'a str, &'a str)>> {
    let tokens: Vec<&str> = clause.split(sep).collect();
    if tokens.len() < 3 {
        return Err(OlapError::Unsupported(format!("malformed filter {clause:?}")));
    }
    if tokens.len() > 3 && tokens[3] != table.name() {
        return Ok(None);
    }
    Ok(Some((tokens[0], tokens[1], tokens[2])))
}

//! 全局基础类型与错误定义

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── ID 类型别名 ───────────────────────────────────────────────────────────────

/// 表级列 ID（KeyTable 分配，进程内稳定）
pub type ColumnId = u16;
/// 块内字符串 ID（仅在单个 block 的 intern 表内有效）
pub type StrId    = i32;
/// 块内记录下标
pub type RowId    = u32;

// ── 枚举 ──────────────────────────────────────────────────────────────────────

/// 记录中每个列槽位的类型标签
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum ColumnKind {
    /// 该记录未填充此列
    #[default]
    Absent = 0,
    Int    = 1,
    Str    = 2,
    Set    = 3,
}

impl ColumnKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Absent),
            1 => Some(Self::Int),
            2 => Some(Self::Str),
            3 => Some(Self::Set),
            _ => None,
        }
    }

    /// 列文件名前缀：`int_` / `str_` / `set_`
    pub fn file_prefix(self) -> Option<&'static str> {
        match self {
            Self::Int    => Some("int_"),
            Self::Str    => Some("str_"),
            Self::Set    => Some("set_"),
            Self::Absent => None,
        }
    }

    /// 从列文件名（已去掉压缩后缀）解析出 (类型, 列名)
    pub fn parse_file_stem(stem: &str) -> Option<(Self, &str)> {
        let base = stem.strip_suffix(".db")?;
        for kind in [Self::Int, Self::Str, Self::Set] {
            if let Some(name) = kind.file_prefix().and_then(|p| base.strip_prefix(p)) {
                if !name.is_empty() {
                    return Some((kind, name));
                }
            }
        }
        None
    }
}

// ── 错误 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum OlapError {
    #[error("decode error in {path}: {reason}")]
    Decode { path: String, reason: String },
    #[error("block size changed during scan: block={block} column={column} row={row} num_records={num_records}")]
    Consistency { block: String, column: String, row: usize, num_records: usize },
    #[error("column not in key table: {0}")]
    MissingColumn(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("lock timeout: {0}")]
    LockTimeout(String),
    #[error("column type mismatch: {column} is {expected:?}, got {found:?}")]
    TypeMismatch { column: String, expected: ColumnKind, found: ColumnKind },
    #[error("histogram mismatch: {0}")]
    HistogramMismatch(String),
    #[error("invalid regex {pattern}: {source}")]
    Regex { pattern: String, #[source] source: regex::Error },
    #[error("compression error: {0}")]
    Compression(String),
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OlapError {
    pub fn decode(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode { path: path.into(), reason: reason.into() }
    }

    /// 只影响单个 block 的错误：查询把该 block 标记为 broken 并继续
    ///
    /// block 目录在扫描期间被整体替换时读到的 NotFound / UnexpectedEof 也算在内。
    pub fn is_block_scoped(&self) -> bool {
        matches!(
            self,
            Self::Decode { .. }
                | Self::Consistency { .. }
                | Self::ChecksumMismatch(_)
                | Self::Compression(_)
        ) || matches!(
            self,
            Self::Io(e) if matches!(e.kind(), std::io::ErrorKind::NotFound | std::io::ErrorKind::UnexpectedEof)
        )
    }
}

impl From<bincode::Error> for OlapError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OlapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_column_file_names() {
        assert_eq!(ColumnKind::parse_file_stem("int_age.db"), Some((ColumnKind::Int, "age")));
        assert_eq!(ColumnKind::parse_file_stem("set_tags.db"), Some((ColumnKind::Set, "tags")));
        assert_eq!(ColumnKind::parse_file_stem("str_.db"), None);
        assert_eq!(ColumnKind::parse_file_stem("info.db"), None);
        assert_eq!(ColumnKind::parse_file_stem("int_age"), None);
    }

    #[test]
    fn block_scoped_classification() {
        assert!(OlapError::decode("x", "truncated").is_block_scoped());
        assert!(!OlapError::Encode("disk full".into()).is_block_scoped());
        assert!(!OlapError::LockTimeout("b".into()).is_block_scoped());
        let gone = std::io::Error::new(std::io::ErrorKind::NotFound, "int_a.db");
        assert!(OlapError::from(gone).is_block_scoped());
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "int_a.db");
        assert!(!OlapError::from(denied).is_block_scoped());
    }
}

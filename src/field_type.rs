//! 列的物理表示：写入值、编码方式、压缩方式

use serde::{Deserialize, Serialize};
use crate::common::ColumnKind;

/// 列编码方式（每个 block 的每一列独立决定）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingType {
    /// (value, 升序 record id 列表) 对；低基数列
    Bucket,
    /// 每个记录下标一个值；高基数列
    Positional,
}

/// 列文件压缩方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CompressionType {
    None,
    #[default]
    Gzip,
    Lz4,
}

impl CompressionType {
    /// 追加在 `.db` 之后的文件后缀
    pub fn extension(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Gzip => ".gz",
            Self::Lz4  => ".lz4",
        }
    }

    pub fn from_file_name(name: &str) -> Self {
        if name.ends_with(".gz") {
            Self::Gzip
        } else if name.ends_with(".lz4") {
            Self::Lz4
        } else {
            Self::None
        }
    }
}

/// 写入值（行存交给核心封块时的表示）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Str(String),
    Set(Vec<String>),
}

impl Value {
    pub fn kind(&self) -> ColumnKind {
        match self {
            Self::Int(_) => ColumnKind::Int,
            Self::Str(_) => ColumnKind::Str,
            Self::Set(_) => ColumnKind::Set,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self { Self::Int(v) => Some(*v), _ => None }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self { Self::Int(v) }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Self::Str(s.to_string()) }
}

impl From<String> for Value {
    fn from(s: String) -> Self { Self::Str(s) }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::Set(v) => write!(f, "{}", v.join(",")),
        }
    }
}

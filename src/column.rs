//! SavedColumn：单列在单个 block 内的持久化形式
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ MAGIC "OLAPCOL1"                (8 B)     │
//! │ version (u8) kind (u8) flags (u8)        │
//! │ name          (u32 len + utf8)           │
//! │ string table  (u32 n + n × str)          │  str / set 列
//! │ payload                                  │
//! │   Bucket    : u32 n × { value i64,       │
//! │                         u32 m × delta }  │
//! │   Positional: u32 n, presence bitmap,    │
//! │               n × i64 | i32 | set        │
//! │ CRC32         (u32 LE)                   │
//! └──────────────────────────────────────────┘
//! ```
//!
//! 整个帧再按 `CompressionType` 压缩后落盘：`{int|str|set}_<name>.db[.gz|.lz4]`。

use std::fs;
use std::path::Path;
use crate::common::{ColumnKind, OlapError, Result, RowId, StrId};
use crate::compression;
use crate::encoding::{self, ByteReader};
use crate::field_type::{CompressionType, EncodingType};

const MAGIC:   &[u8; 8] = b"OLAPCOL1";
const VERSION: u8       = 1;

const FLAG_BUCKET:      u8 = 0b01;
const FLAG_VALUE_DELTA: u8 = 0b10;

// ── 数据模型 ──────────────────────────────────────────────────────────────────

/// 一个桶：值 + 持有该值的记录（delta 编码后的升序 id）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedBucket {
    /// int 列为原值；str / set 列为本文件字符串表中的 ID
    pub value:  i64,
    pub deltas: Vec<RowId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PositionalValues {
    Ints { value_delta: bool, values: Vec<i64> },
    Strs(Vec<StrId>),
    Sets(Vec<Vec<StrId>>),
}

impl PositionalValues {
    pub fn len(&self) -> usize {
        match self {
            Self::Ints { values, .. } => values.len(),
            Self::Strs(v)             => v.len(),
            Self::Sets(v)             => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnData {
    Buckets(Vec<SavedBucket>),
    Positional { present: Vec<bool>, values: PositionalValues },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedColumn {
    pub name:    String,
    pub kind:    ColumnKind,
    /// 写入时新建的 intern 表，按 ID 顺序
    pub strings: Vec<String>,
    pub data:    ColumnData,
}

impl SavedColumn {
    pub fn encoding(&self) -> EncodingType {
        match self.data {
            ColumnData::Buckets(_)        => EncodingType::Bucket,
            ColumnData::Positional { .. } => EncodingType::Positional,
        }
    }

    pub fn file_name(&self, compression: CompressionType) -> String {
        let prefix = self.kind.file_prefix().unwrap_or("int_");
        format!("{prefix}{}.db{}", self.name, compression.extension())
    }

    // ── 序列化 ────────────────────────────────────────────────────────────────

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.kind == ColumnKind::Absent {
            return Err(OlapError::Encode(format!("column {} has no type", self.name)));
        }
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.push(self.kind as u8);

        let flags = match &self.data {
            ColumnData::Buckets(_) => FLAG_BUCKET,
            ColumnData::Positional { values: PositionalValues::Ints { value_delta: true, .. }, .. }
                => FLAG_VALUE_DELTA,
            ColumnData::Positional { .. } => 0,
        };
        out.push(flags);

        encoding::put_str(&mut out, &self.name);
        encoding::put_len(&mut out, self.strings.len());
        for s in &self.strings {
            encoding::put_str(&mut out, s);
        }

        match &self.data {
            ColumnData::Buckets(buckets) => {
                encoding::put_len(&mut out, buckets.len());
                for b in buckets {
                    encoding::put_i64(&mut out, b.value);
                    encoding::put_len(&mut out, b.deltas.len());
                    for &d in &b.deltas {
                        encoding::put_u32(&mut out, d);
                    }
                }
            }
            ColumnData::Positional { present, values } => {
                if present.len() != values.len() {
                    return Err(OlapError::Encode(format!(
                        "column {}: presence bitmap covers {} rows, values {}",
                        self.name, present.len(), values.len(),
                    )));
                }
                encoding::put_len(&mut out, values.len());
                out.extend_from_slice(&encoding::pack_bits(present));
                match values {
                    PositionalValues::Ints { values, .. } => {
                        values.iter().for_each(|&v| encoding::put_i64(&mut out, v));
                    }
                    PositionalValues::Strs(ids) => {
                        ids.iter().for_each(|&v| encoding::put_i32(&mut out, v));
                    }
                    PositionalValues::Sets(sets) => {
                        for set in sets {
                            encoding::put_len(&mut out, set.len());
                            set.iter().for_each(|&v| encoding::put_i32(&mut out, v));
                        }
                    }
                }
            }
        }

        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(out)
    }

    pub fn from_bytes(data: &[u8], path: &str) -> Result<Self> {
        if data.len() < MAGIC.len() + 3 + 4 {
            return Err(OlapError::decode(path, "column file too short"));
        }
        let body_end   = data.len() - 4;
        let mut crc_le = [0u8; 4];
        crc_le.copy_from_slice(&data[body_end..]);
        if u32::from_le_bytes(crc_le) != crc32fast::hash(&data[..body_end]) {
            return Err(OlapError::ChecksumMismatch(path.to_string()));
        }

        let mut r = ByteReader::new(&data[..body_end], path);
        if r.bytes(MAGIC.len(), "magic")? != MAGIC {
            return Err(OlapError::decode(path, "bad magic"));
        }
        let version = r.u8("version")?;
        if version != VERSION {
            return Err(OlapError::decode(path, format!("unknown version {version}")));
        }
        let kind = match ColumnKind::from_u8(r.u8("kind")?) {
            Some(k) if k != ColumnKind::Absent => k,
            _ => return Err(OlapError::decode(path, "invalid column kind")),
        };
        let flags = r.u8("flags")?;
        let name  = r.string("name")?;

        let n_strings = r.count("string table", 4)?;
        let mut strings = Vec::with_capacity(n_strings);
        for _ in 0..n_strings {
            strings.push(r.string("string")?);
        }

        let data = if flags & FLAG_BUCKET != 0 {
            let n = r.count("buckets", 12)?;
            let mut buckets = Vec::with_capacity(n);
            for _ in 0..n {
                let value  = r.i64("bucket value")?;
                let m      = r.count("bucket ids", 4)?;
                let mut deltas = Vec::with_capacity(m);
                for _ in 0..m {
                    deltas.push(r.u32("bucket id")?);
                }
                buckets.push(SavedBucket { value, deltas });
            }
            ColumnData::Buckets(buckets)
        } else {
            let n       = r.count("positional values", 0)?;
            let bitmap  = r.bytes(n.div_ceil(8), "presence bitmap")?;
            let present = encoding::unpack_bits(bitmap, n);
            let values  = match kind {
                ColumnKind::Int => {
                    if n * 8 > r.remaining() {
                        return Err(OlapError::decode(path, "positional ints truncated"));
                    }
                    let mut values = Vec::with_capacity(n);
                    for _ in 0..n {
                        values.push(r.i64("int value")?);
                    }
                    PositionalValues::Ints { value_delta: flags & FLAG_VALUE_DELTA != 0, values }
                }
                ColumnKind::Str => {
                    if n * 4 > r.remaining() {
                        return Err(OlapError::decode(path, "positional strs truncated"));
                    }
                    let mut ids = Vec::with_capacity(n);
                    for _ in 0..n {
                        ids.push(r.i32("str id")?);
                    }
                    PositionalValues::Strs(ids)
                }
                _ => {
                    let mut sets = Vec::with_capacity(n.min(r.remaining() / 4));
                    for _ in 0..n {
                        let m = r.count("set members", 4)?;
                        let mut set = Vec::with_capacity(m);
                        for _ in 0..m {
                            set.push(r.i32("set member")?);
                        }
                        sets.push(set);
                    }
                    PositionalValues::Sets(sets)
                }
            };
            ColumnData::Positional { present, values }
        };

        if r.remaining() != 0 {
            return Err(OlapError::decode(path, format!("{} trailing bytes", r.remaining())));
        }
        Ok(Self { name, kind, strings, data })
    }
}

// ── 文件读写 ──────────────────────────────────────────────────────────────────

/// 写入 `dir` 下的列文件，返回落盘字节数
pub fn write_column_file(dir: &Path, col: &SavedColumn, compression: CompressionType) -> Result<u64> {
    let raw    = col.to_bytes()?;
    let packed = compression::compress(&raw, compression)
        .map_err(|e| OlapError::Encode(format!("column {}: {e}", col.name)))?;
    let path   = dir.join(col.file_name(compression));
    fs::write(&path, &packed)
        .map_err(|e| OlapError::Encode(format!("{}: {e}", path.display())))?;
    Ok(packed.len() as u64)
}

pub fn read_column_file(path: &Path) -> Result<SavedColumn> {
    let display = path.display().to_string();
    let data    = fs::read(path)?;
    let name    = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let codec   = compression::detect(name, &data);
    let raw     = compression::decompress(&data, codec)?;
    SavedColumn::from_bytes(&raw, &display)
}

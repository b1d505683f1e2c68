//! 压缩/解压（Gzip / LZ4 / None）
//!
//! 列文件与查询缓存文件整体压缩。读取时按文件后缀识别，
//! 后缀缺失时再看 gzip 魔数。

use std::io::{Read, Write};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use crate::common::{OlapError, Result};
use crate::field_type::CompressionType;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn compress(data: &[u8], codec: CompressionType) -> Result<Vec<u8>> {
    match codec {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Gzip => {
            let mut enc = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
            enc.write_all(data)
                .and_then(|_| enc.finish())
                .map_err(|e| OlapError::Compression(e.to_string()))
        }
        // 前置 4 字节原始长度，解压时无需额外携带
        CompressionType::Lz4  =>
            lz4::block::compress(data, None, true)
                .map_err(|e| OlapError::Compression(e.to_string())),
    }
}

pub fn decompress(data: &[u8], codec: CompressionType) -> Result<Vec<u8>> {
    match codec {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Gzip => {
            let mut out = Vec::with_capacity(data.len() * 4);
            GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| OlapError::Compression(e.to_string()))?;
            Ok(out)
        }
        CompressionType::Lz4  =>
            lz4::block::decompress(data, None)
                .map_err(|e| OlapError::Compression(e.to_string())),
    }
}

/// 识别文件压缩方式：先看后缀，再看魔数
pub fn detect(file_name: &str, data: &[u8]) -> CompressionType {
    match CompressionType::from_file_name(file_name) {
        CompressionType::None if data.starts_with(&GZIP_MAGIC) => CompressionType::Gzip,
        other => other,
    }
}

/// 去掉压缩后缀：`int_age.db.gz` → `int_age.db`
pub fn strip_extension(file_name: &str) -> &str {
    file_name
        .strip_suffix(".gz")
        .or_else(|| file_name.strip_suffix(".lz4"))
        .unwrap_or(file_name)
}

//! 列编码原语
//!
//! - **Delta(ids)**    — 升序 record id：首个 id + 相邻差值
//! - **Delta(values)** — 位置编码的值序列：相邻差值（非排序差），wrapping 运算
//! - **Bitmap**        — 位置编码的填充位图（bit-packed）
//! - **ByteReader**    — 带长度校验的 LE 读取器，截断文件返回 Decode 错误而非 panic

use std::io::Cursor;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crate::common::{OlapError, Result, RowId};

// ── Delta：record id ──────────────────────────────────────────────────────────

/// 输入必须严格升序
pub fn delta_encode_ids(ids: &[RowId]) -> Vec<RowId> {
    let mut out  = Vec::with_capacity(ids.len());
    let mut prev = 0;
    for &id in ids {
        out.push(id - prev);
        prev = id;
    }
    out
}

/// 运行和还原；溢出说明文件已损坏
pub fn delta_decode_ids(deltas: &[RowId], path: &str) -> Result<Vec<RowId>> {
    let mut out  = Vec::with_capacity(deltas.len());
    let mut prev: RowId = 0;
    for &d in deltas {
        prev = prev
            .checked_add(d)
            .ok_or_else(|| OlapError::decode(path, "record id delta overflow"))?;
        out.push(prev);
    }
    Ok(out)
}

// ── Delta：值序列 ─────────────────────────────────────────────────────────────

pub fn delta_encode_values(values: &[i64]) -> Vec<i64> {
    let mut out  = Vec::with_capacity(values.len());
    let mut prev = 0i64;
    for &v in values {
        out.push(v.wrapping_sub(prev));
        prev = v;
    }
    out
}

pub fn delta_decode_values(deltas: &[i64]) -> Vec<i64> {
    let mut out  = Vec::with_capacity(deltas.len());
    let mut prev = 0i64;
    for &d in deltas {
        prev = prev.wrapping_add(d);
        out.push(prev);
    }
    out
}

// ── Bitmap ────────────────────────────────────────────────────────────────────

pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; bits.len().div_ceil(8)];
    for (i, _) in bits.iter().enumerate().filter(|(_, b)| **b) {
        out[i / 8] |= 1 << (i % 8);
    }
    out
}

pub fn unpack_bits(bytes: &[u8], n: usize) -> Vec<bool> {
    (0..n)
        .map(|i| bytes.get(i / 8).map(|b| b & (1 << (i % 8)) != 0).unwrap_or(false))
        .collect()
}

// ── 写入 ──────────────────────────────────────────────────────────────────────

pub fn put_str(out: &mut Vec<u8>, s: &str) {
    put_len(out, s.len());
    out.extend_from_slice(s.as_bytes());
}

pub fn put_len(out: &mut Vec<u8>, n: usize) {
    // Vec<u8> 写入不会失败
    let _ = out.write_u32::<LittleEndian>(n as u32);
}

pub fn put_u32(out: &mut Vec<u8>, v: u32) {
    let _ = out.write_u32::<LittleEndian>(v);
}

pub fn put_i32(out: &mut Vec<u8>, v: i32) {
    let _ = out.write_i32::<LittleEndian>(v);
}

pub fn put_i64(out: &mut Vec<u8>, v: i64) {
    let _ = out.write_i64::<LittleEndian>(v);
}

// ── ByteReader ────────────────────────────────────────────────────────────────

pub struct ByteReader<'a> {
    cur:  Cursor<&'a [u8]>,
    path: &'a str,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8], path: &'a str) -> Self {
        Self { cur: Cursor::new(data), path }
    }

    pub fn remaining(&self) -> usize {
        let len = self.cur.get_ref().len();
        len.saturating_sub(self.cur.position() as usize)
    }

    fn truncated(&self, what: &str) -> OlapError {
        OlapError::decode(self.path, format!("truncated while reading {what}"))
    }

    pub fn u8(&mut self, what: &str) -> Result<u8> {
        self.cur.read_u8().map_err(|_| self.truncated(what))
    }

    pub fn u32(&mut self, what: &str) -> Result<u32> {
        self.cur.read_u32::<LittleEndian>().map_err(|_| self.truncated(what))
    }

    pub fn i32(&mut self, what: &str) -> Result<i32> {
        self.cur.read_i32::<LittleEndian>().map_err(|_| self.truncated(what))
    }

    pub fn i64(&mut self, what: &str) -> Result<i64> {
        self.cur.read_i64::<LittleEndian>().map_err(|_| self.truncated(what))
    }

    /// 读取元素个数，并确认剩余字节至少能容纳 `n * min_elem` 字节
    pub fn count(&mut self, what: &str, min_elem: usize) -> Result<usize> {
        let n = self.u32(what)? as usize;
        if n.saturating_mul(min_elem) > self.remaining() {
            return Err(OlapError::decode(
                self.path,
                format!("{what}: length {n} exceeds remaining {} bytes", self.remaining()),
            ));
        }
        Ok(n)
    }

    pub fn bytes(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(self.truncated(what));
        }
        let start = self.cur.position() as usize;
        let data: &'a [u8] = *self.cur.get_ref();
        self.cur.set_position((start + n) as u64);
        Ok(&data[start..start + n])
    }

    pub fn string(&mut self, what: &str) -> Result<String> {
        let n   = self.count(what, 1)?;
        let raw = self.bytes(n, what)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| OlapError::decode(self.path, format!("{what}: invalid utf-8")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_deltas_restore_ascending_ids() {
        let ids = vec![3, 4, 9, 100, 65535];
        let d   = delta_encode_ids(&ids);
        assert_eq!(d, vec![3, 1, 5, 91, 65435]);
        assert_eq!(delta_decode_ids(&d, "t").unwrap(), ids);
    }

    #[test]
    fn id_delta_overflow_is_decode_error() {
        let err = delta_decode_ids(&[u32::MAX, 5], "t").unwrap_err();
        assert!(err.is_block_scoped());
    }

    #[test]
    fn value_deltas_are_consecutive_differences() {
        let values = vec![10, 7, i64::MAX, i64::MIN, 0];
        let d      = delta_encode_values(&values);
        assert_eq!(d[0], 10);
        assert_eq!(d[1], -3);
        assert_eq!(delta_decode_values(&d), values);
    }

    #[test]
    fn bitmap_round_trip() {
        let bits = vec![true, false, false, true, true, false, true, false, true, true];
        let packed = pack_bits(&bits);
        assert_eq!(packed.len(), 2);
        assert_eq!(unpack_bits(&packed, bits.len()), bits);
    }

    #[test]
    fn reader_rejects_oversized_lengths() {
        let mut buf = Vec::new();
        put_len(&mut buf, 1000);
        put_i64(&mut buf, 1);
        let mut r = ByteReader::new(&buf, "col");
        assert!(r.count("values", 8).is_err());
    }

    #[test]
    fn reader_reads_strings() {
        let mut buf = Vec::new();
        put_str(&mut buf, "héllo");
        put_i32(&mut buf, -7);
        let mut r = ByteReader::new(&buf, "col");
        assert_eq!(r.string("s").unwrap(), "héllo");
        assert_eq!(r.i32("v").unwrap(), -7);
        assert_eq!(r.remaining(), 0);
        assert!(r.u8("eof").is_err());
    }
}

//! 列解码：SavedColumn → block 的记录数组
//!
//! 每个派生出的记录下标都要对照 block 当前记录数校验；越界说明 block 在读取
//! 期间被重写，返回 `Consistency`。

use tracing::debug;
use crate::block::TableBlock;
use crate::column::{ColumnData, PositionalValues, SavedBucket, SavedColumn};
use crate::common::{ColumnId, ColumnKind, OlapError, Result, StrId};
use crate::encoding::{delta_decode_ids, delta_decode_values};
use crate::load_spec::{apply_all, StrReplace};
use crate::table::Table;

pub fn unpack_column(
    table:   &Table,
    block:   &mut TableBlock,
    col:     SavedColumn,
    replace: &[StrReplace],
) -> Result<()> {
    let Some(id) = table.key_id(&col.name) else {
        debug!(block = %block.name(), column = %col.name, "column not in key table, skipping");
        return Ok(());
    };
    if id as usize >= block.slab().width() {
        debug!(block = %block.name(), column = %col.name, "column added after load started, skipping");
        return Ok(());
    }
    match table.column_kind(id) {
        ColumnKind::Absent => table.set_column_kind(id, col.kind)?,
        k if k != col.kind => {
            debug!(block = %block.name(), column = %col.name, table = ?k, file = ?col.kind, "column kind differs from table, skipping");
            return Ok(());
        }
        _ => {}
    }

    // 文件内 ID → block intern 表 ID；替换后相同的字符串合并为同一个 ID
    let remap: Vec<StrId> = match col.kind {
        ColumnKind::Str | ColumnKind::Set => {
            let strings = &mut block.column_mut(id, col.kind).strings;
            col.strings.iter().map(|s| strings.intern(&apply_all(replace, s))).collect()
        }
        _ => Vec::new(),
    };

    let mut sink = Sink { block, id, name: &col.name, kind: col.kind, remap: &remap };
    match &col.data {
        ColumnData::Buckets(buckets) => {
            for bucket in buckets {
                sink.bucket(bucket)?;
            }
        }
        ColumnData::Positional { present, values } => sink.positional(present, values)?,
    }
    Ok(())
}

struct Sink<'a> {
    block: &'a mut TableBlock,
    id:    ColumnId,
    name:  &'a str,
    kind:  ColumnKind,
    remap: &'a [StrId],
}

impl Sink<'_> {
    fn bucket(&mut self, bucket: &SavedBucket) -> Result<()> {
        let path = self.block.name();
        let rows = delta_decode_ids(&bucket.deltas, &path)?;
        match self.kind {
            ColumnKind::Int => {
                for row in rows {
                    let row = self.check(row as usize)?;
                    self.block.slab_mut().set_int(row, self.id, bucket.value);
                }
            }
            ColumnKind::Str | ColumnKind::Set => {
                let sid = StrId::try_from(bucket.value)
                    .map_err(|_| self.bad_id(bucket.value))
                    .and_then(|v| self.local(v))?;
                for row in rows {
                    let row = self.check(row as usize)?;
                    self.write_str(row, sid);
                }
            }
            ColumnKind::Absent => {}
        }
        Ok(())
    }

    fn positional(&mut self, present: &[bool], values: &PositionalValues) -> Result<()> {
        let is_present = |row: usize| present.get(row).copied().unwrap_or(false);
        match (self.kind, values) {
            (ColumnKind::Int, PositionalValues::Ints { value_delta, values }) => {
                let decoded;
                let values = if *value_delta {
                    decoded = delta_decode_values(values);
                    &decoded
                } else {
                    values
                };
                for (row, v) in values.iter().enumerate() {
                    if is_present(row) {
                        let row = self.check(row)?;
                        self.block.slab_mut().set_int(row, self.id, *v);
                    }
                }
            }
            (ColumnKind::Str, PositionalValues::Strs(ids)) => {
                for (row, sid) in ids.iter().enumerate() {
                    if is_present(row) {
                        let row = self.check(row)?;
                        let sid = self.local(*sid)?;
                        self.write_str(row, sid);
                    }
                }
            }
            (ColumnKind::Set, PositionalValues::Sets(sets)) => {
                for (row, members) in sets.iter().enumerate() {
                    if !is_present(row) {
                        continue;
                    }
                    let row = self.check(row)?;
                    for sid in members {
                        let sid = self.local(*sid)?;
                        self.write_str(row, sid);
                    }
                }
            }
            (kind, _) => {
                return Err(OlapError::decode(
                    self.block.name(),
                    format!("positional payload does not match {kind:?} column {}", self.name),
                ));
            }
        }
        Ok(())
    }

    fn write_str(&mut self, row: usize, sid: StrId) {
        let slab = self.block.slab_mut();
        if self.kind == ColumnKind::Set {
            slab.push_set(row, self.id, sid);
        } else {
            slab.set_str(row, self.id, sid);
        }
    }

    fn check(&self, row: usize) -> Result<usize> {
        let len = self.block.len();
        if row >= len {
            return Err(OlapError::Consistency {
                block:       self.block.name(),
                column:      self.name.to_string(),
                row,
                num_records: len,
            });
        }
        Ok(row)
    }

    fn local(&self, file_id: StrId) -> Result<StrId> {
        usize::try_from(file_id)
            .ok()
            .and_then(|i| self.remap.get(i).copied())
            .ok_or_else(|| self.bad_id(file_id as i64))
    }

    fn bad_id(&self, v: i64) -> OlapError {
        OlapError::decode(self.block.name(), format!("string id {v} out of range in column {}", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::config::EngineConfig;
    use crate::lock::NoLock;
    use crate::record::{RecordSlab, SlabShape};

    fn setup(len: usize) -> (tempfile::TempDir, Table, TableBlock) {
        let dir = tempfile::tempdir().unwrap();
        let t   = Table::new("t", dir.path(), Arc::new(EngineConfig::default()), Arc::new(NoLock));
        t.get_or_assign_key("n").unwrap();
        t.get_or_assign_key("s").unwrap();
        let block = TableBlock::new(RecordSlab::allocate(SlabShape::full(2, len)));
        (dir, t, block)
    }

    #[test]
    fn bucket_rows_past_end_are_consistency_errors() {
        let (_d, t, mut block) = setup(3);
        let col = SavedColumn {
            name:    "n".into(),
            kind:    ColumnKind::Int,
            strings: vec![],
            data:    ColumnData::Buckets(vec![SavedBucket { value: 5, deltas: vec![1, 3] }]),
        };
        let err = unpack_column(&t, &mut block, col, &[]).unwrap_err();
        assert!(matches!(err, OlapError::Consistency { row: 4, num_records: 3, .. }));
    }

    #[test]
    fn unknown_columns_are_skipped() {
        let (_d, t, mut block) = setup(1);
        let col = SavedColumn {
            name:    "gone".into(),
            kind:    ColumnKind::Int,
            strings: vec![],
            data:    ColumnData::Buckets(vec![SavedBucket { value: 1, deltas: vec![0] }]),
        };
        unpack_column(&t, &mut block, col, &[]).unwrap();
        assert_eq!(block.slab().record(0).int(0), None);
    }

    #[test]
    fn replacement_merges_collapsed_strings() {
        let (_d, t, mut block) = setup(3);
        let col = SavedColumn {
            name:    "s".into(),
            kind:    ColumnKind::Str,
            strings: vec!["/u/1".into(), "/u/2".into(), "/home".into()],
            data:    ColumnData::Positional {
                present: vec![true; 3],
                values:  PositionalValues::Strs(vec![0, 1, 2]),
            },
        };
        let rules = [StrReplace::new(r"\d+", "N").unwrap()];
        unpack_column(&t, &mut block, col, &rules).unwrap();
        let s   = t.key_id("s").unwrap();
        let ids: Vec<_> = block.records().map(|r| r.str_id(s).unwrap()).collect();
        assert_eq!(ids[0], ids[1]);
        assert_ne!(ids[0], ids[2]);
        assert_eq!(block.resolve_str(s, ids[0]), Some("/u/N"));
    }

    #[test]
    fn bad_string_ids_are_decode_errors() {
        let (_d, t, mut block) = setup(1);
        let col = SavedColumn {
            name:    "s".into(),
            kind:    ColumnKind::Str,
            strings: vec!["a".into()],
            data:    ColumnData::Buckets(vec![SavedBucket { value: 7, deltas: vec![0] }]),
        };
        assert!(matches!(unpack_column(&t, &mut block, col, &[]), Err(OlapError::Decode { .. })));
    }
}

//! 块内字符串 intern 表
//!
//! 字符串 ↔ 稠密 `StrId`。每个 block 的每一列各有一张，ID 不跨 block 共享：
//! 跨 block 的读写必须按字符串重新解析。

use std::collections::HashMap;
use crate::common::StrId;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct InternTable {
    ids:     HashMap<String, StrId>,
    strings: Vec<String>,
}

impl InternTable {
    pub fn new() -> Self { Self::default() }

    /// 返回已有 ID，或分配下一个稠密 ID
    pub fn intern(&mut self, s: &str) -> StrId {
        if let Some(&id) = self.ids.get(s) {
            return id;
        }
        let id = self.strings.len() as StrId;
        self.strings.push(s.to_string());
        self.ids.insert(s.to_string(), id);
        id
    }

    pub fn id(&self, s: &str) -> Option<StrId> {
        self.ids.get(s).copied()
    }

    pub fn resolve(&self, id: StrId) -> Option<&str> {
        usize::try_from(id).ok()
            .and_then(|i| self.strings.get(i))
            .map(String::as_str)
    }

    /// 按 ID 顺序排列的字符串表（写入列文件）
    pub fn strings(&self) -> &[String] { &self.strings }

    pub fn len(&self)      -> usize { self.strings.len() }
    pub fn is_empty(&self) -> bool  { self.strings.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_dense_and_stable() {
        let mut t = InternTable::new();
        assert_eq!(t.intern("b"), 0);
        assert_eq!(t.intern("a"), 1);
        assert_eq!(t.intern("b"), 0);
        assert_eq!(t.len(), 2);
        assert_eq!(t.resolve(1), Some("a"));
        assert_eq!(t.resolve(2), None);
        assert_eq!(t.resolve(-1), None);
        assert_eq!(t.id("zzz"), None);
        assert_eq!(t.strings(), &["b".to_string(), "a".to_string()]);
    }
}

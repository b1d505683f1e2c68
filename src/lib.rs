//! # olap-block-engine
//!
//! 列存 block 编解码 + 并发过滤 / 分组 / 直方图查询执行。
//!
//! ## 整体架构
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        TableRegistry                          │
//! │   Table ── KeyTable (列名 ↔ ColumnId)   表级 IntInfo/StrInfo  │
//! │     │                                                         │
//! │     ├─ 写路径  seal_rows ─► encode_block                       │
//! │     │            ColumnWriter × N  (bucket / positional)      │
//! │     │            <block>.partial ─► <block>  (ResourceLock)   │
//! │     │                                                         │
//! │     └─ 读路径  load_and_query                                  │
//! │          worker × N  (crossbeam 有界队列)                      │
//! │          ├─ BlockExtents::should_load   info.db 剪枝          │
//! │          ├─ query_cache                 cache/<md5>.db.gz     │
//! │          ├─ load_block ─► unpack_column  RecordSlab (SlabPool)│
//! │          └─ filter_and_aggregate                              │
//! │               BoundFilter × N ─► 原始分组键 ─► 标签           │
//! │               GroupResult { count, Histogram × M }           │
//! │          combine_results ─► sort_results                      │
//! └──────────────────────────────────────────────────────────────┘
//! ```

// ── 基础 ──────────────────────────────────────────────────────────────────────
pub mod common;
pub mod config;
pub mod field_type;
pub mod compression;
pub mod encoding;
pub mod intern;
pub mod lock;

// ── 存储 ──────────────────────────────────────────────────────────────────────
pub mod record;
pub mod slab;
pub mod column;
pub mod column_writer;
pub mod column_reader;
pub mod meta;
pub mod index;
pub mod table;
pub mod block;
pub mod load_spec;

// ── 查询 ──────────────────────────────────────────────────────────────────────
pub mod filter;
pub mod hist;
pub mod query;
pub mod aggregate;
pub mod combine;
pub mod query_cache;
pub mod executor;

pub use common::{ColumnId, ColumnKind, OlapError, Result};
pub use config::EngineConfig;
pub use executor::{load_and_query, load_records, QueryStats};
pub use filter::{Filter, FilterSpec, IntOp, SetOp, StrOp};
pub use query::{AggOp, OrderBy, QueryParams, QueryResults, QuerySpec};
pub use record::Row;
pub use table::{Table, TableRegistry};

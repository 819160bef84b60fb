//! Lode - a single-file transactional page store
//!
//! This crate provides the storage core of an embedded database: fixed-size
//! pages in one file, a write-ahead log for atomic commits and concurrent
//! readers, advisory locks that coordinate connections across processes, and
//! B-trees for ordered key/value storage on top of the pages.
//!
//! # Architecture
//!
//! The system is organized into several layers:
//!
//! - **Storage Layer** (`storage`): On-disk formats and raw page I/O
//!   - `DiskManager`: Positional page reads and writes on the main file
//!   - `DatabaseHeader`: The 100-byte header at the start of page 1
//!   - `BTreePage`: B-tree page header, cell pointers and cells
//!
//! - **Page Cache** (`buffer`): Page images held in memory
//!   - `PageCache`: Pinned, dirty-aware cache with a soft size bound
//!   - `LruKReplacer`: LRU-K replacement of clean, unpinned pages
//!   - `PageRef`/`PageMut`: RAII handles that unpin on drop
//!
//! - **Locking** (`lock`): The five lock levels and the log's coordination
//!   slots, backed by POSIX byte-range locks or an in-process table
//!
//! - **Write-Ahead Log** (`wal`): Frame format, checksums, recovery and
//!   checkpoint plumbing
//!
//! - **Pager** (`pager`): One connection's transactions, snapshots, page
//!   allocation, commit, rollback and checkpoint
//!
//! - **B-Tree** (`btree`): Table and index trees with cursors
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lode::btree::{BTree, Key, TreeKind};
//! use lode::common::{PageNumber, PagerConfig};
//! use lode::pager::Pager;
//!
//! let pager = Arc::new(Pager::open("test.db", PagerConfig::default()).unwrap());
//!
//! // page 1 holds the root of the first table
//! pager.begin_write().unwrap();
//! let table = BTree::open(Arc::clone(&pager), PageNumber::new(1), TreeKind::Table);
//! table.insert(&Key::Row(5), b"abc").unwrap();
//! pager.commit().unwrap();
//!
//! pager.begin_read().unwrap();
//! assert_eq!(table.get(&Key::Row(5)).unwrap(), Some(b"abc".to_vec()));
//! pager.end_read().unwrap();
//! ```

pub mod btree;
pub mod buffer;
pub mod common;
pub mod lock;
pub mod pager;
pub mod storage;
pub mod wal;

// Re-export commonly used types at the crate root
pub use btree::{BTree, Cursor, Key, TreeKind};
pub use common::{LodeError, PageNumber, PagerConfig, Result};
pub use pager::Pager;
pub use wal::{CheckpointMode, CheckpointResult};

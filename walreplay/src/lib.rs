//! Log replication core of the page server.
//!
//! A primary continuously appends records to a write-ahead log; this
//! crate keeps a follower's pages in sync with that log. The pipeline
//! looks like this:
//!
//! log appender  ->  Replicator (driver)  ->  page buffer
//!                        |
//!                        v
//!                  RedoParallel (optional worker pool)
//!
//! The driver reads records forward from a starting LSN, classifies
//! them, and applies each effect either inline or through the parallel
//! redo engine, which preserves per-page order while running unrelated
//! pages concurrently. Progress is published as a replay LSN (driver
//! position) and a minimum watermark (oldest unapplied effect), and
//! readers can block until a target LSN is fully visible.

pub mod btree;
pub mod config;
pub mod metrics;
pub mod page_buffer;
pub mod redo;
pub mod redo_parallel;
pub mod replicator;
pub mod walreader;
pub mod walrecord;

use std::sync::Arc;

use crate::page_buffer::PageBuffer;
use crate::redo::RedoFunctionTable;
use crate::walreader::WalSource;
use crate::walrecord::MvccNextId;

pub use crate::replicator::Replicator;

/// Handles to the collaborators replay drives: the log, the page buffer,
/// the recovery function registry and the process-wide MVCC horizon.
/// Cheap to clone; every replay thread holds its own copy.
#[derive(Clone)]
pub struct ReplayEnv {
    pub wal: Arc<dyn WalSource>,
    pub pages: Arc<dyn PageBuffer>,
    pub redo_table: Arc<RedoFunctionTable>,
    pub mvcc_next_id: Arc<MvccNextId>,
}

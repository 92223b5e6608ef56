//! The generic redo path: the recovery function registry, payload
//! reconstruction, and the shared routine that applies a record inline
//! or defers it to the parallel engine.

use std::collections::HashMap;

use anyhow::Context;
use bytes::BytesMut;
use tracing::trace;
use utils::lsn::Lsn;

use crate::metrics::WAL_RECORDS_APPLIED;
use crate::page_buffer::PageBuffer;
use crate::redo_parallel::{PageKey, RedoContext, RedoJob, RedoParallel};
use crate::walreader::{FetchMode, WalReader};
use crate::walrecord::{reconstruct_from_diff, Pid, RecordHeader, RecordType, RedoData};
use crate::ReplayEnv;

/// Recovery index reserved for b-tree unique statistics commits. Those
/// records take a dedicated path and are never resolved through the
/// table.
pub const RV_BTREE_GLOBAL_UNIQUE_STATS_COMMIT: u32 = 1;

/// Initial capacity of the per-thread undo/redo scratch buffers.
pub(crate) const REDO_SCRATCH_CAPACITY: usize = 8192;

/// What a redo function gets to work with.
pub struct RedoArgs<'a> {
    /// Pinned target page contents; `None` for records without a page
    /// target.
    pub page: Option<&'a mut [u8]>,
    /// The reconstructed redo payload.
    pub data: &'a [u8],
    pub record_lsn: Lsn,
}

pub type RedoFn = fn(&mut RedoArgs<'_>) -> anyhow::Result<()>;

/// Maps a record's recovery index to the function that re-applies its
/// effect. The registry is frozen before the replicator starts.
#[derive(Default)]
pub struct RedoFunctionTable {
    funcs: HashMap<u32, RedoFn>,
}

impl RedoFunctionTable {
    pub fn new() -> RedoFunctionTable {
        RedoFunctionTable::default()
    }

    pub fn register(&mut self, rcvindex: u32, redofn: RedoFn) {
        debug_assert!(rcvindex != RV_BTREE_GLOBAL_UNIQUE_STATS_COMMIT);
        self.funcs.insert(rcvindex, redofn);
    }

    pub fn get(&self, rcvindex: u32) -> Option<RedoFn> {
        self.funcs.get(&rcvindex).copied()
    }
}

/// Read the undo and redo payloads that follow a redo-family typed body,
/// leaving the effective redo bytes in `redo_buf`. Diff records are
/// reconstructed against the undo payload; everything else skips it.
pub fn read_redo_payload(
    reader: &mut WalReader,
    rec_type: RecordType,
    data: &RedoData,
    undo_buf: &mut BytesMut,
    redo_buf: &mut BytesMut,
) -> anyhow::Result<()> {
    if rec_type.is_diff() {
        reader.read_into(undo_buf, data.undo_length as usize)?;
        reader.read_into(redo_buf, data.redo_length as usize)?;
        reconstruct_from_diff(&mut redo_buf[..], &undo_buf[..]);
    } else {
        reader.skip(data.undo_length as usize);
        reader.read_into(redo_buf, data.redo_length as usize)?;
    }
    Ok(())
}

/// Apply one record's redo effect. Page-targeted records honor the
/// page-LSN guard, so re-applying an already applied record is a no-op.
pub fn apply_redo(
    pages: &dyn PageBuffer,
    table: &RedoFunctionTable,
    rcvindex: u32,
    pid: Pid,
    data: &[u8],
    record_lsn: Lsn,
) -> anyhow::Result<()> {
    let redofn = table
        .get(rcvindex)
        .with_context(|| format!("no redo function registered for recovery index {rcvindex}"))?;

    if pid.is_null() {
        redofn(&mut RedoArgs {
            page: None,
            data,
            record_lsn,
        })?;
    } else {
        let mut page = pages.pin(pid)?;
        if page.lsn() >= record_lsn {
            trace!("skipping {record_lsn} for page {pid}, already applied");
            return Ok(());
        }
        redofn(&mut RedoArgs {
            page: Some(page.data_mut()),
            data,
            record_lsn,
        })?;
        page.set_lsn(record_lsn);
        page.set_dirty();
    }
    WAL_RECORDS_APPLIED.inc();
    Ok(())
}

/// The shared entry point of the generic path. Page-targeted records go
/// to the engine when one is present; records without a page target are
/// always applied on the calling thread, which keeps them in strict log
/// order.
#[allow(clippy::too_many_arguments)]
pub fn redo_record_sync_or_dispatch_async(
    env: &ReplayEnv,
    reader: &mut WalReader,
    rec_type: RecordType,
    data: &RedoData,
    record_lsn: Lsn,
    parallel: Option<&RedoParallel>,
    undo_buf: &mut BytesMut,
    redo_buf: &mut BytesMut,
) -> anyhow::Result<()> {
    match parallel {
        Some(engine) if !data.pid.is_null() => {
            engine.add(Box::new(GenericRedoJob {
                page_key: PageKey::Page(data.pid),
                lsn: record_lsn,
                rec_type,
            }));
        }
        _ => {
            read_redo_payload(reader, rec_type, data, undo_buf, redo_buf)?;
            apply_redo(
                env.pages.as_ref(),
                &env.redo_table,
                data.rcvindex,
                data.pid,
                &redo_buf[..],
                record_lsn,
            )?;
        }
    }
    Ok(())
}

/// Deferred redo for one record. Only the coordinates travel with the
/// job; the worker re-reads the record bytes through its own reader and
/// reconstructs the payload in its own scratch buffers.
pub(crate) struct GenericRedoJob {
    page_key: PageKey,
    lsn: Lsn,
    rec_type: RecordType,
}

impl RedoJob for GenericRedoJob {
    fn page_key(&self) -> PageKey {
        self.page_key
    }

    fn lsn(&self) -> Lsn {
        self.lsn
    }

    fn execute(&self, ctx: &mut RedoContext) -> anyhow::Result<()> {
        // The worker's cached page may predate this record; reload.
        ctx.reader.seek_and_fetch(self.lsn, FetchMode::Force)?;
        let _header = RecordHeader::decode(&mut ctx.reader)?;
        let data = RedoData::decode(&mut ctx.reader)?;
        read_redo_payload(
            &mut ctx.reader,
            self.rec_type,
            &data,
            &mut ctx.undo_buf,
            &mut ctx.redo_buf,
        )?;
        apply_redo(
            ctx.pages.as_ref(),
            &ctx.table,
            data.rcvindex,
            data.pid,
            &ctx.redo_buf[..],
            self.lsn,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use crate::page_buffer::InMemoryPageBuffer;
    use crate::walreader::{InMemoryWalLog, WalSource};
    use crate::walrecord::Record;

    const RV_STORE: u32 = 20;
    const RV_EXTERN: u32 = 21;

    static EXTERN_EFFECTS: AtomicU64 = AtomicU64::new(0);

    fn rv_store(args: &mut RedoArgs<'_>) -> anyhow::Result<()> {
        let page = args.page.as_mut().expect("page-targeted record");
        page[..args.data.len()].copy_from_slice(args.data);
        Ok(())
    }

    fn rv_extern(args: &mut RedoArgs<'_>) -> anyhow::Result<()> {
        assert!(args.page.is_none());
        EXTERN_EFFECTS.fetch_add(args.data.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    fn table() -> RedoFunctionTable {
        let mut table = RedoFunctionTable::new();
        table.register(RV_STORE, rv_store);
        table.register(RV_EXTERN, rv_extern);
        table
    }

    #[test]
    fn apply_stamps_lsn_and_dirties() {
        let pages = InMemoryPageBuffer::new();
        let pid = Pid::new(1, 1);
        apply_redo(&pages, &table(), RV_STORE, pid, b"hello", Lsn(50)).unwrap();
        assert_eq!(pages.page_lsn(pid), Some(Lsn(50)));
        assert!(pages.is_dirty(pid));
        assert_eq!(pages.with_page(pid, |data| data[..5].to_vec()).unwrap(), b"hello");
    }

    #[test]
    fn already_applied_records_are_skipped() {
        let pages = InMemoryPageBuffer::new();
        let pid = Pid::new(1, 2);
        apply_redo(&pages, &table(), RV_STORE, pid, b"first", Lsn(100)).unwrap();
        apply_redo(&pages, &table(), RV_STORE, pid, b"stale", Lsn(90)).unwrap();
        assert_eq!(pages.page_lsn(pid), Some(Lsn(100)));
        assert_eq!(pages.with_page(pid, |data| data[..5].to_vec()).unwrap(), b"first");
    }

    #[test]
    fn null_pid_records_run_without_a_page() {
        let pages = InMemoryPageBuffer::new();
        let before = EXTERN_EFFECTS.load(Ordering::SeqCst);
        apply_redo(&pages, &table(), RV_EXTERN, Pid::NULL, b"abc", Lsn(10)).unwrap();
        assert_eq!(EXTERN_EFFECTS.load(Ordering::SeqCst), before + 3);
        assert_eq!(pages.page_count(), 0);
    }

    #[test]
    fn unregistered_recovery_index_is_an_error() {
        let pages = InMemoryPageBuffer::new();
        let err = apply_redo(&pages, &table(), 999, Pid::new(1, 3), b"", Lsn(10)).unwrap_err();
        assert!(err.to_string().contains("999"));
    }

    #[test]
    fn diff_payload_reconstructs_through_reader() {
        let log = Arc::new(InMemoryWalLog::new(Lsn(0)));
        let undo = b"some old page value".to_vec();
        let redo = b"some new page value!".to_vec();
        let lsn = log.append(
            1,
            &Record::DiffUndoRedo {
                rcvindex: RV_STORE,
                pid: Pid::new(1, 4),
                undo: undo.clone(),
                redo: redo.clone(),
            },
        );

        let source: Arc<dyn WalSource> = log;
        let mut reader = WalReader::new(source);
        reader.seek_and_fetch(lsn, FetchMode::Normal).unwrap();
        let _header = RecordHeader::decode(&mut reader).unwrap();
        let data = RedoData::decode(&mut reader).unwrap();

        let mut undo_buf = BytesMut::new();
        let mut redo_buf = BytesMut::new();
        read_redo_payload(
            &mut reader,
            RecordType::DiffUndoRedo,
            &data,
            &mut undo_buf,
            &mut redo_buf,
        )
        .unwrap();
        assert_eq!(&redo_buf[..], &redo[..]);
        assert_eq!(&undo_buf[..], &undo[..]);
    }
}

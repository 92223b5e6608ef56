//! The replay driver.
//!
//! A `Replicator` owns one daemon thread that follows the log appender's
//! write frontier and replays every record between its replay position
//! and that frontier, in LSN order. Each record is classified by type:
//! page-level records go through the generic redo path (inline, or as a
//! job on the parallel engine), commit/abort/heartbeat records become
//! replication delay measurements, and b-tree unique statistics commits
//! are applied straight to the b-tree root page so a query server
//! fetching the root always sees current values.
//!
//! Progress is published two ways. The replay LSN (under a mutex, with a
//! condvar notified on every advance) says how far the driver has
//! classified; in parallel mode the engine's watermark additionally says
//! how far effects have actually been applied. `wait_past_target_lsn`
//! picks the right one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

use anyhow::Context;
use bytes::BytesMut;
use tracing::{debug, error, info, trace};
use utils::lsn::Lsn;
use utils::time::now_ms;

use crate::btree::{self, UniqueStats};
use crate::config::ReplicationConf;
use crate::metrics::{REDO_SYNC_SECONDS, REPLICATION_DELAY_MSEC, WAL_RECORDS_APPLIED};
use crate::page_buffer::PageBuffer;
use crate::redo::{self, RV_BTREE_GLOBAL_UNIQUE_STATS_COMMIT, REDO_SCRATCH_CAPACITY};
use crate::redo_parallel::{PageKey, RedoContext, RedoJob, RedoParallel};
use crate::walreader::{FetchMode, WalReader};
use crate::walrecord::{
    DbExternRedoData, DoneTimeData, HaServerStateData, Pid, RecordHeader, RecordType, RedoData,
    WalDecodeError, MVCCID_NULL,
};
use crate::ReplayEnv;

struct ReplayShared {
    replay_lsn: Mutex<Lsn>,
    replay_cond: Condvar,
    shutdown: AtomicBool,
}

pub struct Replicator {
    shared: Arc<ReplayShared>,
    env: ReplayEnv,
    parallel: Option<Arc<RedoParallel>>,
    daemon: Option<thread::JoinHandle<()>>,
}

impl Replicator {
    /// Start background replay from `start_lsn`.
    ///
    /// The parallel engine (if configured) is brought up before the
    /// daemon so that no record is needlessly replayed synchronously
    /// while the pool is still starting.
    pub fn new(env: ReplayEnv, conf: ReplicationConf, start_lsn: Lsn) -> Replicator {
        let parallel = if conf.parallel_count > 0 {
            let engine = Arc::new(RedoParallel::new(conf.parallel_count, &env, &conf));
            // Effects below the starting position are already on disk;
            // waiters for targets under it must not block.
            engine.watermark().set_for_outer(start_lsn);
            Some(engine)
        } else {
            None
        };

        let shared = Arc::new(ReplayShared {
            replay_lsn: Mutex::new(start_lsn),
            replay_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let driver = ReplayDriver {
            shared: shared.clone(),
            env: env.clone(),
            conf,
            parallel: parallel.clone(),
            reader: WalReader::new(env.wal.clone()),
            undo_buf: BytesMut::with_capacity(REDO_SCRATCH_CAPACITY),
            redo_buf: BytesMut::with_capacity(REDO_SCRATCH_CAPACITY),
            replay_lsn: start_lsn,
        };
        let daemon = thread::Builder::new()
            .name("wal replicator".to_string())
            .spawn(move || driver.run())
            .expect("failed to spawn wal replicator thread");

        Replicator {
            shared,
            env,
            parallel,
            daemon: Some(daemon),
        }
    }

    /// The driver's current position: the LSN of the next record to
    /// read.
    pub fn replay_lsn(&self) -> Lsn {
        *self.shared.replay_lsn.lock().unwrap()
    }

    /// Block until every record with LSN at or below `target` has had
    /// its effect applied.
    pub fn wait_past_target_lsn(&self, target: Lsn) {
        match &self.parallel {
            Some(engine) => engine.wait_past_target_lsn(target),
            None => {
                let replay_lsn = self.shared.replay_lsn.lock().unwrap();
                let _replay_lsn = self
                    .shared
                    .replay_cond
                    .wait_while(replay_lsn, |lsn| *lsn <= target)
                    .unwrap();
            }
        }
    }

    /// Shutdown drain: block until replay has consumed the log up to the
    /// write frontier and, in parallel mode, every dispatched job has
    /// completed. Idempotent. The engine stays alive; it is torn down
    /// together with the daemon, in Drop.
    pub fn wait_replication_finish_during_shutdown(&self) {
        let replay_lsn = self.shared.replay_lsn.lock().unwrap();
        let replay_lsn = self
            .shared
            .replay_cond
            .wait_while(replay_lsn, |lsn| *lsn < self.env.wal.frontier())
            .unwrap();
        drop(replay_lsn);

        // Everything below the frontier has been dispatched by now; make
        // the dispatched work effective too.
        if let Some(engine) = &self.parallel {
            engine.wait_for_idle();
        }
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(daemon) = self.daemon.take() {
            if daemon.join().is_err() {
                error!("wal replicator thread panicked");
            }
        }
        // Only after the daemon has stopped is it certain that nothing
        // will add jobs anymore.
        if let Some(engine) = &self.parallel {
            engine.set_adding_finished();
            engine.wait_for_termination_and_stop_execution();
        }
    }
}

/// State owned by the daemon thread.
struct ReplayDriver {
    shared: Arc<ReplayShared>,
    env: ReplayEnv,
    conf: ReplicationConf,
    parallel: Option<Arc<RedoParallel>>,
    reader: WalReader,
    undo_buf: BytesMut,
    redo_buf: BytesMut,
    /// Driver-local copy of the replay position; the shared value is
    /// only ever written by this thread.
    replay_lsn: Lsn,
}

impl ReplayDriver {
    fn run(mut self) {
        info!("wal replicator starting at {}", self.replay_lsn);
        while !self.shared.shutdown.load(Ordering::Acquire) {
            let frontier = self.env.wal.frontier();
            if self.replay_lsn < frontier {
                if let Err(err) = self.redo_upto(frontier) {
                    error!("replay halted at {}: {err:#}", self.replay_lsn);
                    break;
                }
            } else {
                debug_assert!(self.replay_lsn == frontier);
                thread::sleep(self.conf.replay_poll_interval);
            }
        }
        // Let dispatched work settle before teardown proceeds.
        if let Some(engine) = &self.parallel {
            engine.wait_for_idle();
        }
        info!("wal replicator stopped at {}", self.replay_lsn);
    }

    /// Replay all records from the current position up to `end`.
    fn redo_upto(&mut self, end: Lsn) -> anyhow::Result<()> {
        debug_assert!(self.replay_lsn < end);

        // The cached log page may predate records appended to it after
        // the last fetch; reload it unconditionally once.
        self.reader
            .seek_and_fetch(self.replay_lsn, FetchMode::Force)
            .context("failed to refresh the log page")?;

        let mut sync_timer = Instant::now();
        while self.replay_lsn < end {
            self.reader
                .seek_and_fetch(self.replay_lsn, FetchMode::Normal)?;
            let header = RecordHeader::decode(&mut self.reader)?;
            if header.forward_lsn <= self.replay_lsn {
                return Err(WalDecodeError::new(
                    self.replay_lsn,
                    format!("forward lsn {} does not advance", header.forward_lsn),
                )
                .into());
            }

            match RecordType::from_u32(header.rec_type) {
                Some(rec_type) => self.dispatch_record(rec_type, &header).with_context(|| {
                    format!("failed to replay {rec_type:?} record at {}", self.replay_lsn)
                })?,
                None => trace!(
                    "ignoring record of unrecognized type {} at {}",
                    header.rec_type,
                    self.replay_lsn
                ),
            }

            {
                let mut replay_lsn = self.shared.replay_lsn.lock().unwrap();
                *replay_lsn = header.forward_lsn;
            }
            self.replay_lsn = header.forward_lsn;
            if let Some(engine) = &self.parallel {
                engine.watermark().set_for_outer(self.replay_lsn);
            }
            // Notify every advance so waiters track progress closely.
            self.shared.replay_cond.notify_all();

            REDO_SYNC_SECONDS.observe(sync_timer.elapsed().as_secs_f64());
            sync_timer = Instant::now();
        }
        Ok(())
    }

    fn dispatch_record(&mut self, rec_type: RecordType, header: &RecordHeader) -> anyhow::Result<()> {
        let record_lsn = self.replay_lsn;
        match rec_type {
            RecordType::Redo
            | RecordType::MvccRedo
            | RecordType::UndoRedo
            | RecordType::DiffUndoRedo
            | RecordType::MvccUndoRedo
            | RecordType::MvccDiffUndoRedo
            | RecordType::RunPostpone
            | RecordType::Compensate => self.read_and_redo_record(rec_type, header, record_lsn),
            RecordType::DbExternRedo => self.read_and_redo_external(record_lsn),
            RecordType::Commit | RecordType::Abort => {
                let donetime = DoneTimeData::decode(&mut self.reader)?;
                self.replication_delay_or_dispatch(record_lsn, donetime.at_time_ms);
                Ok(())
            }
            RecordType::HaServerState => {
                let state = HaServerStateData::decode(&mut self.reader)?;
                self.replication_delay_or_dispatch(record_lsn, state.at_time_ms);
                Ok(())
            }
        }
    }

    fn read_and_redo_record(
        &mut self,
        rec_type: RecordType,
        header: &RecordHeader,
        record_lsn: Lsn,
    ) -> anyhow::Result<()> {
        let data = RedoData::decode(&mut self.reader)?;

        // Reads on the page server require the MVCC horizon to stay
        // above every replicated id.
        if header.mvcc_id != MVCCID_NULL {
            self.env.mvcc_next_id.advance_past(header.mvcc_id);
        }

        // Unique-statistics commits bypass the recovery registry.
        if data.rcvindex == RV_BTREE_GLOBAL_UNIQUE_STATS_COMMIT {
            self.read_and_redo_btree_stats(rec_type, &data, record_lsn)
        } else {
            redo::redo_record_sync_or_dispatch_async(
                &self.env,
                &mut self.reader,
                rec_type,
                &data,
                record_lsn,
                self.parallel.as_deref(),
                &mut self.undo_buf,
                &mut self.redo_buf,
            )
        }
    }

    fn read_and_redo_external(&mut self, record_lsn: Lsn) -> anyhow::Result<()> {
        let data = DbExternRedoData::decode(&mut self.reader)?;
        self.reader.read_into(&mut self.redo_buf, data.length as usize)?;
        redo::apply_redo(
            self.env.pages.as_ref(),
            &self.env.redo_table,
            data.rcvindex,
            Pid::NULL,
            &self.redo_buf[..],
            record_lsn,
        )
    }

    /// Recovery aggregates unique statistics in memory instead of
    /// touching pages; here the effect must land on the root page. The
    /// payload has to be read on the driver regardless of mode, because
    /// the root page id that keys the job is inside it.
    fn read_and_redo_btree_stats(
        &mut self,
        rec_type: RecordType,
        data: &RedoData,
        record_lsn: Lsn,
    ) -> anyhow::Result<()> {
        redo::read_redo_payload(
            &mut self.reader,
            rec_type,
            data,
            &mut self.undo_buf,
            &mut self.redo_buf,
        )?;
        let (btid, stats) = btree::decode_btree_id_and_stats(&self.redo_buf[..])
            .context("malformed unique stats payload")?;
        let root_pid = btid.root_pid();

        match &self.parallel {
            Some(engine) => engine.add(Box::new(RedoJobBtreeStats {
                root_pid,
                lsn: record_lsn,
                stats,
            })),
            None => replicate_btree_stats(self.env.pages.as_ref(), root_pid, &stats, record_lsn)?,
        }
        Ok(())
    }

    fn replication_delay_or_dispatch(&mut self, record_lsn: Lsn, at_time_ms: i64) {
        match &self.parallel {
            // Measure when the job is picked up, not when the record was
            // classified; that is the delay a reader actually observes.
            Some(engine) => engine.add(Box::new(RedoJobReplicationDelay {
                lsn: record_lsn,
                start_time_ms: at_time_ms,
            })),
            None => calculate_replication_delay(at_time_ms, self.conf.log_calc_repl_delay),
        }
    }
}

/// Apply unique statistics straight onto the b-tree root page.
fn replicate_btree_stats(
    pages: &dyn PageBuffer,
    root_pid: Pid,
    stats: &UniqueStats,
    record_lsn: Lsn,
) -> anyhow::Result<()> {
    let mut root = pages
        .pin(root_pid)
        .with_context(|| format!("failed to fix b-tree root page {root_pid}"))?;
    btree::root_update_stats(root.data_mut(), stats);
    root.set_lsn(record_lsn);
    root.set_dirty();
    WAL_RECORDS_APPLIED.inc();
    Ok(())
}

struct RedoJobBtreeStats {
    root_pid: Pid,
    lsn: Lsn,
    stats: UniqueStats,
}

impl RedoJob for RedoJobBtreeStats {
    fn page_key(&self) -> PageKey {
        PageKey::Page(self.root_pid)
    }

    fn lsn(&self) -> Lsn {
        self.lsn
    }

    fn execute(&self, ctx: &mut RedoContext) -> anyhow::Result<()> {
        replicate_btree_stats(ctx.pages.as_ref(), self.root_pid, &self.stats, self.lsn)
    }
}

/// Delay measurement for commit/abort/heartbeat records. Keyed on the
/// sentinel so it keeps its place in the global order.
struct RedoJobReplicationDelay {
    lsn: Lsn,
    start_time_ms: i64,
}

impl RedoJob for RedoJobReplicationDelay {
    fn page_key(&self) -> PageKey {
        PageKey::Sentinel
    }

    fn lsn(&self) -> Lsn {
        self.lsn
    }

    fn execute(&self, ctx: &mut RedoContext) -> anyhow::Result<()> {
        calculate_replication_delay(self.start_time_ms, ctx.log_repl_delay);
        Ok(())
    }
}

/// Compute and report the delay between record generation on the primary
/// and this moment.
///
/// Some commit records arrive with an unfilled timestamp; skip those
/// rather than report a bogus value.
fn calculate_replication_delay(start_time_ms: i64, log_enabled: bool) {
    if start_time_ms <= 0 {
        debug!("replication delay skipped: non-positive source timestamp {start_time_ms} msec");
        return;
    }
    let delay_ms = now_ms() - start_time_ms;
    debug_assert!(delay_ms >= 0);
    REPLICATION_DELAY_MSEC.set(delay_ms);
    if log_enabled {
        debug!("[CALC_REPL_DELAY]: {delay_ms:9} msec");
    }
}

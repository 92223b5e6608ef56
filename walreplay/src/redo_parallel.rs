//! Parallel redo engine.
//!
//! A fixed pool of worker threads executes redo jobs concurrently while
//! keeping two guarantees the rest of the system depends on:
//!
//! * jobs that target the same page run in the order they were added
//!   (they are routed to the same worker, whose queue is FIFO);
//! * the engine always knows the smallest LSN whose effect has not been
//!   applied yet, so readers can wait for a target LSN accurately.
//!
//! The driver adds jobs in LSN order and, after advancing its replay
//! position, publishes it as the outer bound of the watermark. The
//! watermark is then `min(oldest in-flight job, outer bound)`: a replay
//! position alone only proves a record was classified, not that its
//! deferred effect has completed.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use bytes::BytesMut;
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::error;
use utils::lsn::Lsn;

use crate::config::ReplicationConf;
use crate::page_buffer::PageBuffer;
use crate::redo::{RedoFunctionTable, REDO_SCRATCH_CAPACITY};
use crate::walreader::WalReader;
use crate::walrecord::Pid;
use crate::ReplayEnv;

/// Serialization target of a redo job. Sentinel-keyed jobs have no page
/// of their own but still take part in the global completion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKey {
    Page(Pid),
    Sentinel,
}

/// Per-thread execution state handed to every job: a private log reader,
/// private scratch buffers, and shared collaborator handles.
pub struct RedoContext {
    pub reader: WalReader,
    pub pages: Arc<dyn PageBuffer>,
    pub table: Arc<RedoFunctionTable>,
    pub undo_buf: BytesMut,
    pub redo_buf: BytesMut,
    pub log_repl_delay: bool,
}

impl RedoContext {
    pub fn new(env: &ReplayEnv, conf: &ReplicationConf) -> RedoContext {
        RedoContext {
            reader: WalReader::new(env.wal.clone()),
            pages: env.pages.clone(),
            table: env.redo_table.clone(),
            undo_buf: BytesMut::with_capacity(REDO_SCRATCH_CAPACITY),
            redo_buf: BytesMut::with_capacity(REDO_SCRATCH_CAPACITY),
            log_repl_delay: conf.log_calc_repl_delay,
        }
    }
}

/// A unit of deferred replay work.
pub trait RedoJob: Send {
    fn page_key(&self) -> PageKey;
    /// LSN of the originating record; orders the job and feeds the
    /// watermark.
    fn lsn(&self) -> Lsn;
    fn execute(&self, ctx: &mut RedoContext) -> anyhow::Result<()>;
}

struct WatermarkState {
    /// LSNs of jobs added but not yet completed. The driver adds in
    /// ascending order, so the first element is the oldest.
    in_flight: BTreeSet<Lsn>,
    /// The driver's last published replay position.
    outer: Lsn,
}

/// Tracks the smallest LSN whose effect is not yet applied.
pub struct WatermarkMonitor {
    state: Mutex<WatermarkState>,
    condvar: Condvar,
}

impl WatermarkMonitor {
    fn new() -> WatermarkMonitor {
        WatermarkMonitor {
            state: Mutex::new(WatermarkState {
                in_flight: BTreeSet::new(),
                outer: Lsn::INVALID,
            }),
            condvar: Condvar::new(),
        }
    }

    fn register(&self, lsn: Lsn) {
        let mut state = self.state.lock().unwrap();
        let inserted = state.in_flight.insert(lsn);
        debug_assert!(inserted, "duplicate job lsn {lsn}");
    }

    fn complete(&self, lsn: Lsn) {
        let mut state = self.state.lock().unwrap();
        let removed = state.in_flight.remove(&lsn);
        debug_assert!(removed, "completed job {lsn} was never registered");
        drop(state);
        self.condvar.notify_all();
    }

    /// Publish the driver's replay position as the upper bound of the
    /// watermark. Monotone.
    pub fn set_for_outer(&self, lsn: Lsn) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(lsn >= state.outer);
        state.outer = lsn;
        drop(state);
        self.condvar.notify_all();
    }

    fn minimum_locked(state: &WatermarkState) -> Lsn {
        match state.in_flight.first() {
            Some(oldest) => (*oldest).min(state.outer),
            None => state.outer,
        }
    }

    /// The smallest LSN for which some effect may still be unapplied.
    pub fn minimum(&self) -> Lsn {
        let state = self.state.lock().unwrap();
        Self::minimum_locked(&state)
    }

    /// Block until every effect at or below `target` has been applied.
    pub fn wait_past(&self, target: Lsn) {
        let state = self.state.lock().unwrap();
        let _state = self
            .condvar
            .wait_while(state, |s| Self::minimum_locked(s) <= target)
            .unwrap();
    }

    /// Block until no job is queued or running.
    pub fn wait_for_idle(&self) {
        let state = self.state.lock().unwrap();
        let _state = self
            .condvar
            .wait_while(state, |s| !s.in_flight.is_empty())
            .unwrap();
    }
}

/// The worker pool. Owned by the replicator; created before the driver
/// daemon comes online and torn down after it has stopped.
pub struct RedoParallel {
    senders: Mutex<Option<Vec<Sender<Box<dyn RedoJob>>>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    watermark: Arc<WatermarkMonitor>,
    adding_finished: AtomicBool,
    worker_count: usize,
}

impl RedoParallel {
    pub fn new(worker_count: usize, env: &ReplayEnv, conf: &ReplicationConf) -> RedoParallel {
        assert!(worker_count > 0);
        let watermark = Arc::new(WatermarkMonitor::new());
        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let (tx, rx) = unbounded::<Box<dyn RedoJob>>();
            let ctx = RedoContext::new(env, conf);
            let watermark = watermark.clone();
            let handle = thread::Builder::new()
                .name(format!("redo worker {worker_id}"))
                .spawn(move || worker_main(rx, ctx, watermark))
                .expect("failed to spawn redo worker thread");
            senders.push(tx);
            workers.push(handle);
        }
        RedoParallel {
            senders: Mutex::new(Some(senders)),
            workers: Mutex::new(workers),
            watermark,
            adding_finished: AtomicBool::new(false),
            worker_count,
        }
    }

    pub fn watermark(&self) -> &WatermarkMonitor {
        &self.watermark
    }

    /// Enqueue a job. The caller adds in LSN order; per-page order falls
    /// out of routing same-page jobs to the same worker. Must not be
    /// called after [`RedoParallel::set_adding_finished`].
    pub fn add(&self, job: Box<dyn RedoJob>) {
        debug_assert!(!self.adding_finished.load(Ordering::Acquire));
        self.watermark.register(job.lsn());
        let slot = self.route(job.page_key());
        let senders = self.senders.lock().unwrap();
        senders
            .as_ref()
            .expect("parallel redo engine already stopped")[slot]
            .send(job)
            .expect("redo worker disconnected");
    }

    fn route(&self, key: PageKey) -> usize {
        match key {
            // One fixed lane keeps sentinel jobs ordered among
            // themselves.
            PageKey::Sentinel => 0,
            PageKey::Page(pid) => {
                let mut hasher = DefaultHasher::new();
                pid.hash(&mut hasher);
                (hasher.finish() % self.worker_count as u64) as usize
            }
        }
    }

    /// Latch "no more input". Irreversible.
    pub fn set_adding_finished(&self) {
        self.adding_finished.store(true, Ordering::Release);
    }

    /// Block until every job added so far has completed. Legal to call
    /// repeatedly, also while adding continues.
    pub fn wait_for_idle(&self) {
        self.watermark.wait_for_idle();
    }

    /// Block until every effect at or below `target` has been applied.
    pub fn wait_past_target_lsn(&self, target: Lsn) {
        self.watermark.wait_past(target);
    }

    /// Drain everything that was added, then stop the workers. Requires
    /// [`RedoParallel::set_adding_finished`]; safe to call repeatedly.
    pub fn wait_for_termination_and_stop_execution(&self) {
        assert!(self.adding_finished.load(Ordering::Acquire));
        self.watermark.wait_for_idle();

        // Dropping the senders disconnects the queues; workers drain and
        // exit.
        if let Some(senders) = self.senders.lock().unwrap().take() {
            drop(senders);
        }
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            if let Err(panic) = handle.join() {
                error!("redo worker panicked: {panic:?}");
            }
        }
    }
}

impl Drop for RedoParallel {
    fn drop(&mut self) {
        self.set_adding_finished();
        self.wait_for_termination_and_stop_execution();
    }
}

fn worker_main(jobs: Receiver<Box<dyn RedoJob>>, mut ctx: RedoContext, watermark: Arc<WatermarkMonitor>) {
    while let Ok(job) = jobs.recv() {
        if let Err(err) = job.execute(&mut ctx) {
            // The log is authoritative; a failing job indicates
            // corruption upstream. Completing it anyway keeps the
            // watermark moving instead of wedging every waiter.
            error!("redo job at {} failed: {err:#}", job.lsn());
        }
        watermark.complete(job.lsn());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use crate::page_buffer::InMemoryPageBuffer;
    use crate::walreader::InMemoryWalLog;
    use crate::walrecord::MvccNextId;

    fn test_env() -> ReplayEnv {
        ReplayEnv {
            wal: Arc::new(InMemoryWalLog::new(Lsn(0))),
            pages: Arc::new(InMemoryPageBuffer::new()),
            redo_table: Arc::new(RedoFunctionTable::new()),
            mvcc_next_id: Arc::new(MvccNextId::new(1)),
        }
    }

    fn conf() -> ReplicationConf {
        ReplicationConf::default()
    }

    struct RecordingJob {
        key: PageKey,
        lsn: Lsn,
        sink: Arc<StdMutex<Vec<(PageKey, Lsn)>>>,
        delay: Duration,
    }

    impl RedoJob for RecordingJob {
        fn page_key(&self) -> PageKey {
            self.key
        }

        fn lsn(&self) -> Lsn {
            self.lsn
        }

        fn execute(&self, _ctx: &mut RedoContext) -> anyhow::Result<()> {
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            self.sink.lock().unwrap().push((self.key, self.lsn));
            Ok(())
        }
    }

    #[test]
    fn watermark_minimum_tracks_oldest_unfinished() {
        let monitor = WatermarkMonitor::new();
        assert_eq!(monitor.minimum(), Lsn::INVALID);

        monitor.register(Lsn(10));
        monitor.register(Lsn(20));
        monitor.set_for_outer(Lsn(30));
        assert_eq!(monitor.minimum(), Lsn(10));

        monitor.complete(Lsn(10));
        assert_eq!(monitor.minimum(), Lsn(20));

        monitor.complete(Lsn(20));
        assert_eq!(monitor.minimum(), Lsn(30));
    }

    #[test]
    fn wait_past_blocks_until_jobs_complete() {
        let monitor = Arc::new(WatermarkMonitor::new());
        monitor.register(Lsn(10));
        monitor.set_for_outer(Lsn(30));

        let waiter = {
            let monitor = monitor.clone();
            thread::spawn(move || monitor.wait_past(Lsn(15)))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        monitor.complete(Lsn(10));
        waiter.join().unwrap();
    }

    #[test]
    fn same_key_jobs_run_in_insertion_order() {
        let env = test_env();
        let engine = RedoParallel::new(4, &env, &conf());
        let sink = Arc::new(StdMutex::new(Vec::new()));

        let keys = [
            PageKey::Page(Pid::new(1, 1)),
            PageKey::Page(Pid::new(1, 2)),
            PageKey::Page(Pid::new(1, 3)),
            PageKey::Sentinel,
        ];
        for i in 0..400u64 {
            let lsn = Lsn(100 + i * 8);
            engine.add(Box::new(RecordingJob {
                key: keys[(i % 4) as usize],
                lsn,
                sink: sink.clone(),
                delay: Duration::ZERO,
            }));
            engine.watermark().set_for_outer(Lsn(100 + (i + 1) * 8));
        }
        engine.wait_for_idle();

        let observed = sink.lock().unwrap();
        for key in keys {
            let lsns: Vec<Lsn> = observed
                .iter()
                .filter(|(k, _)| *k == key)
                .map(|(_, lsn)| *lsn)
                .collect();
            assert_eq!(lsns.len(), 100);
            assert!(lsns.windows(2).all(|w| w[0] < w[1]), "{key:?} out of order");
        }

        engine.set_adding_finished();
        engine.wait_for_termination_and_stop_execution();
    }

    #[test]
    fn wait_for_idle_waits_for_slow_jobs() {
        let env = test_env();
        let engine = RedoParallel::new(2, &env, &conf());
        let sink = Arc::new(StdMutex::new(Vec::new()));

        for i in 0..8u64 {
            engine.add(Box::new(RecordingJob {
                key: PageKey::Page(Pid::new(1, i as i32)),
                lsn: Lsn(8 + i * 8),
                sink: sink.clone(),
                delay: Duration::from_millis(5),
            }));
        }
        engine.wait_for_idle();
        assert_eq!(sink.lock().unwrap().len(), 8);

        // Idempotent, also before termination.
        engine.wait_for_idle();
    }

    #[test]
    fn termination_is_idempotent() {
        let env = test_env();
        let engine = RedoParallel::new(2, &env, &conf());
        engine.set_adding_finished();
        engine.wait_for_termination_and_stop_execution();
        engine.wait_for_termination_and_stop_execution();
        // Drop runs the same path once more.
    }
}

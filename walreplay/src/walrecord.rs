//! The log record model: identifiers, the fixed record header, the typed
//! bodies that follow it, and the builder enum the appender serializes.
//!
//! Decoding is incremental on purpose. The replay driver reads the fixed
//! header first, then (depending on the type) a small typed body, and
//! only touches the variable payload when the record is actually applied
//! on the same thread. Workers that apply a record re-read all of it
//! through their own reader.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use utils::lsn::Lsn;

use crate::walreader::{WalReadError, WalReader};

pub type TransactionId = u32;

/// Multi-version concurrency control identifier; 0 is the null value.
pub type MvccId = u64;
pub const MVCCID_NULL: MvccId = 0;

/// Identifier of a data page: the volume it lives on and the page number
/// within that volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid {
    pub volume: i32,
    pub page: i32,
}

impl Pid {
    /// Marks a record that does not target any page.
    pub const NULL: Pid = Pid {
        volume: -1,
        page: -1,
    };

    pub fn new(volume: i32, page: i32) -> Pid {
        Pid { volume, page }
    }

    pub fn is_null(&self) -> bool {
        *self == Pid::NULL
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.volume, self.page)
    }
}

/// Record type classes the replay driver recognizes. Raw tags outside
/// this set are skipped over; the log may gain record kinds the replica
/// has no use for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Redo,
    MvccRedo,
    UndoRedo,
    DiffUndoRedo,
    MvccUndoRedo,
    MvccDiffUndoRedo,
    RunPostpone,
    Compensate,
    DbExternRedo,
    Commit,
    Abort,
    HaServerState,
}

impl RecordType {
    pub fn from_u32(raw: u32) -> Option<RecordType> {
        use RecordType::*;
        match raw {
            1 => Some(Redo),
            2 => Some(MvccRedo),
            3 => Some(UndoRedo),
            4 => Some(DiffUndoRedo),
            5 => Some(MvccUndoRedo),
            6 => Some(MvccDiffUndoRedo),
            7 => Some(RunPostpone),
            8 => Some(Compensate),
            9 => Some(DbExternRedo),
            10 => Some(Commit),
            11 => Some(Abort),
            12 => Some(HaServerState),
            _ => None,
        }
    }

    pub fn to_u32(self) -> u32 {
        use RecordType::*;
        match self {
            Redo => 1,
            MvccRedo => 2,
            UndoRedo => 3,
            DiffUndoRedo => 4,
            MvccUndoRedo => 5,
            MvccDiffUndoRedo => 6,
            RunPostpone => 7,
            Compensate => 8,
            DbExternRedo => 9,
            Commit => 10,
            Abort => 11,
            HaServerState => 12,
        }
    }

    /// Whether the stored redo payload is an XOR diff against the undo
    /// payload.
    pub fn is_diff(self) -> bool {
        matches!(self, RecordType::DiffUndoRedo | RecordType::MvccDiffUndoRedo)
    }
}

/// An error happened while decoding a record out of the log.
#[derive(Error, Debug)]
#[error("{msg} at {lsn}")]
pub struct WalDecodeError {
    pub msg: String,
    pub lsn: Lsn,
}

impl WalDecodeError {
    pub fn new(lsn: Lsn, msg: impl Into<String>) -> WalDecodeError {
        WalDecodeError {
            msg: msg.into(),
            lsn,
        }
    }
}

fn read_err(lsn: Lsn) -> impl FnOnce(WalReadError) -> WalDecodeError {
    move |e| WalDecodeError::new(lsn, e.to_string())
}

/// Fixed prefix of every log record.
///
/// `forward_lsn` is the position of the next record; the replay driver
/// advances by it and nothing else, so padding between records is legal.
#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    /// Raw type tag; see [`RecordType::from_u32`].
    pub rec_type: u32,
    pub trid: TransactionId,
    /// MVCC id for the MVCC record variants, [`MVCCID_NULL`] elsewhere.
    pub mvcc_id: MvccId,
    pub forward_lsn: Lsn,
}

impl RecordHeader {
    pub const ENCODED_LEN: usize = 24;

    pub fn decode(reader: &mut WalReader) -> Result<RecordHeader, WalDecodeError> {
        let lsn = reader.position();
        let rec_type = reader.read_u32().map_err(read_err(lsn))?;
        let trid = reader.read_u32().map_err(read_err(lsn))?;
        let mvcc_id = reader.read_u64().map_err(read_err(lsn))?;
        let forward_lsn = Lsn(reader.read_u64().map_err(read_err(lsn))?);
        Ok(RecordHeader {
            rec_type,
            trid,
            mvcc_id,
            forward_lsn,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.rec_type);
        buf.put_u32_le(self.trid);
        buf.put_u64_le(self.mvcc_id);
        buf.put_u64_le(self.forward_lsn.0);
    }
}

/// Typed body shared by all redo-family records. The undo and redo
/// payloads follow it, in that order.
#[derive(Debug, Clone, Copy)]
pub struct RedoData {
    pub rcvindex: u32,
    pub pid: Pid,
    pub undo_length: u32,
    pub redo_length: u32,
}

impl RedoData {
    pub const ENCODED_LEN: usize = 20;

    pub fn decode(reader: &mut WalReader) -> Result<RedoData, WalDecodeError> {
        let lsn = reader.position();
        let rcvindex = reader.read_u32().map_err(read_err(lsn))?;
        let volume = reader.read_i32().map_err(read_err(lsn))?;
        let page = reader.read_i32().map_err(read_err(lsn))?;
        let undo_length = reader.read_u32().map_err(read_err(lsn))?;
        let redo_length = reader.read_u32().map_err(read_err(lsn))?;
        Ok(RedoData {
            rcvindex,
            pid: Pid::new(volume, page),
            undo_length,
            redo_length,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.rcvindex);
        buf.put_i32_le(self.pid.volume);
        buf.put_i32_le(self.pid.page);
        buf.put_u32_le(self.undo_length);
        buf.put_u32_le(self.redo_length);
    }
}

/// Typed body of a database-external redo record. The payload follows;
/// there is no page target.
#[derive(Debug, Clone, Copy)]
pub struct DbExternRedoData {
    pub rcvindex: u32,
    pub length: u32,
}

impl DbExternRedoData {
    pub fn decode(reader: &mut WalReader) -> Result<DbExternRedoData, WalDecodeError> {
        let lsn = reader.position();
        let rcvindex = reader.read_u32().map_err(read_err(lsn))?;
        let length = reader.read_u32().map_err(read_err(lsn))?;
        Ok(DbExternRedoData { rcvindex, length })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.rcvindex);
        buf.put_u32_le(self.length);
    }
}

/// Typed body of commit and abort records: when the transaction finished
/// on the primary, in wall-clock milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct DoneTimeData {
    pub at_time_ms: i64,
}

impl DoneTimeData {
    pub fn decode(reader: &mut WalReader) -> Result<DoneTimeData, WalDecodeError> {
        let lsn = reader.position();
        let at_time_ms = reader.read_i64().map_err(read_err(lsn))?;
        Ok(DoneTimeData { at_time_ms })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.at_time_ms);
    }
}

/// Typed body of the periodic server-state heartbeat.
#[derive(Debug, Clone, Copy)]
pub struct HaServerStateData {
    pub state: u32,
    pub at_time_ms: i64,
}

impl HaServerStateData {
    pub fn decode(reader: &mut WalReader) -> Result<HaServerStateData, WalDecodeError> {
        let lsn = reader.position();
        let state = reader.read_u32().map_err(read_err(lsn))?;
        let at_time_ms = reader.read_i64().map_err(read_err(lsn))?;
        Ok(HaServerStateData { state, at_time_ms })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.state);
        buf.put_i64_le(self.at_time_ms);
    }
}

/// XOR-diff the redo payload against the undo payload. Overlapping bytes
/// cancel out, which compresses well for records that change a few bytes
/// of a large value.
pub fn encode_diff(undo: &[u8], redo: &[u8]) -> Vec<u8> {
    redo.iter()
        .enumerate()
        .map(|(i, b)| b ^ undo.get(i).copied().unwrap_or(0))
        .collect()
}

/// Invert [`encode_diff`] in place: recover the redo payload from the
/// stored diff and the undo payload.
pub fn reconstruct_from_diff(diff: &mut [u8], undo: &[u8]) {
    for (i, b) in diff.iter_mut().enumerate() {
        if let Some(u) = undo.get(i) {
            *b ^= u;
        }
    }
}

/// A log record as handed to the appender. The replica never materializes
/// this type; it decodes header and bodies incrementally instead.
#[derive(Debug, Clone)]
pub enum Record {
    Redo {
        rcvindex: u32,
        pid: Pid,
        data: Vec<u8>,
    },
    MvccRedo {
        mvcc_id: MvccId,
        rcvindex: u32,
        pid: Pid,
        data: Vec<u8>,
    },
    UndoRedo {
        rcvindex: u32,
        pid: Pid,
        undo: Vec<u8>,
        redo: Vec<u8>,
    },
    DiffUndoRedo {
        rcvindex: u32,
        pid: Pid,
        undo: Vec<u8>,
        redo: Vec<u8>,
    },
    MvccUndoRedo {
        mvcc_id: MvccId,
        rcvindex: u32,
        pid: Pid,
        undo: Vec<u8>,
        redo: Vec<u8>,
    },
    MvccDiffUndoRedo {
        mvcc_id: MvccId,
        rcvindex: u32,
        pid: Pid,
        undo: Vec<u8>,
        redo: Vec<u8>,
    },
    RunPostpone {
        rcvindex: u32,
        pid: Pid,
        data: Vec<u8>,
    },
    Compensate {
        rcvindex: u32,
        pid: Pid,
        data: Vec<u8>,
    },
    DbExternRedo {
        rcvindex: u32,
        data: Vec<u8>,
    },
    Commit {
        at_time_ms: i64,
    },
    Abort {
        at_time_ms: i64,
    },
    HaServerState {
        state: u32,
        at_time_ms: i64,
    },
}

impl Record {
    pub fn rec_type(&self) -> RecordType {
        match self {
            Record::Redo { .. } => RecordType::Redo,
            Record::MvccRedo { .. } => RecordType::MvccRedo,
            Record::UndoRedo { .. } => RecordType::UndoRedo,
            Record::DiffUndoRedo { .. } => RecordType::DiffUndoRedo,
            Record::MvccUndoRedo { .. } => RecordType::MvccUndoRedo,
            Record::MvccDiffUndoRedo { .. } => RecordType::MvccDiffUndoRedo,
            Record::RunPostpone { .. } => RecordType::RunPostpone,
            Record::Compensate { .. } => RecordType::Compensate,
            Record::DbExternRedo { .. } => RecordType::DbExternRedo,
            Record::Commit { .. } => RecordType::Commit,
            Record::Abort { .. } => RecordType::Abort,
            Record::HaServerState { .. } => RecordType::HaServerState,
        }
    }

    pub fn mvcc_id(&self) -> MvccId {
        match self {
            Record::MvccRedo { mvcc_id, .. }
            | Record::MvccUndoRedo { mvcc_id, .. }
            | Record::MvccDiffUndoRedo { mvcc_id, .. } => *mvcc_id,
            _ => MVCCID_NULL,
        }
    }

    /// Serialize everything that follows the fixed header.
    pub(crate) fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Record::Redo { rcvindex, pid, data }
            | Record::MvccRedo { rcvindex, pid, data, .. }
            | Record::RunPostpone { rcvindex, pid, data }
            | Record::Compensate { rcvindex, pid, data } => {
                RedoData {
                    rcvindex: *rcvindex,
                    pid: *pid,
                    undo_length: 0,
                    redo_length: data.len() as u32,
                }
                .encode(buf);
                buf.put_slice(data);
            }
            Record::UndoRedo {
                rcvindex,
                pid,
                undo,
                redo,
            }
            | Record::MvccUndoRedo {
                rcvindex,
                pid,
                undo,
                redo,
                ..
            } => {
                RedoData {
                    rcvindex: *rcvindex,
                    pid: *pid,
                    undo_length: undo.len() as u32,
                    redo_length: redo.len() as u32,
                }
                .encode(buf);
                buf.put_slice(undo);
                buf.put_slice(redo);
            }
            Record::DiffUndoRedo {
                rcvindex,
                pid,
                undo,
                redo,
            }
            | Record::MvccDiffUndoRedo {
                rcvindex,
                pid,
                undo,
                redo,
                ..
            } => {
                RedoData {
                    rcvindex: *rcvindex,
                    pid: *pid,
                    undo_length: undo.len() as u32,
                    redo_length: redo.len() as u32,
                }
                .encode(buf);
                buf.put_slice(undo);
                buf.put_slice(&encode_diff(undo, redo));
            }
            Record::DbExternRedo { rcvindex, data } => {
                DbExternRedoData {
                    rcvindex: *rcvindex,
                    length: data.len() as u32,
                }
                .encode(buf);
                buf.put_slice(data);
            }
            Record::Commit { at_time_ms } | Record::Abort { at_time_ms } => {
                DoneTimeData {
                    at_time_ms: *at_time_ms,
                }
                .encode(buf);
            }
            Record::HaServerState { state, at_time_ms } => {
                HaServerStateData {
                    state: *state,
                    at_time_ms: *at_time_ms,
                }
                .encode(buf);
            }
        }
    }
}

/// Process-wide upper bound on MVCC identifiers. Reader transactions on
/// the page server derive snapshot horizons from it, so every id seen in
/// the log must be folded in; losing an update is not acceptable.
#[derive(Debug)]
pub struct MvccNextId(AtomicU64);

impl MvccNextId {
    pub fn new(initial: MvccId) -> MvccNextId {
        MvccNextId(AtomicU64::new(initial))
    }

    /// Raise the horizon strictly above `id`. Monotone; concurrent calls
    /// cannot regress it.
    pub fn advance_past(&self, id: MvccId) {
        self.0.fetch_max(id + 1, Ordering::AcqRel);
    }

    pub fn load(&self) -> MvccId {
        self.0.load(Ordering::Acquire)
    }
}

//! Positioned byte cursor over the log.
//!
//! The log is a flat, append-only byte stream fetched page by page. A
//! `WalReader` holds exactly one cached page image plus a byte cursor;
//! every replay thread owns its own reader, so no synchronization is
//! needed beyond what the underlying [`WalSource`] does internally.

use std::cmp::min;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use thiserror::Error;
use utils::lsn::{AtomicLsn, Lsn, LOG_PAGE_SIZE};

use crate::walrecord::{Record, RecordHeader, TransactionId};

/// An error happened while reading log bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalReadError {
    #[error("log position {lsn} is past the write frontier {frontier}")]
    PastFrontier { lsn: Lsn, frontier: Lsn },
}

/// Where log bytes come from.
///
/// The appender side publishes a write frontier: the next position it
/// will write. Everything strictly below the frontier is complete and
/// readable; a record only becomes visible once all its bytes are.
pub trait WalSource: Send + Sync {
    /// The current "next to write" position; monotone.
    fn frontier(&self) -> Lsn;

    /// Copy log page `page_no` into `buf` (of `LOG_PAGE_SIZE` bytes).
    /// Bytes past the end of the written log are zeroed.
    fn read_page(&self, page_no: u64, buf: &mut [u8]) -> Result<(), WalReadError>;
}

/// Whether a seek may reuse the cached page image.
///
/// `Force` exists because the cached page may predate records that were
/// appended to the same page after the last fetch; the replay loop
/// reloads once before every catch-up pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Normal,
    Force,
}

pub struct WalReader {
    source: Arc<dyn WalSource>,
    page: Box<[u8]>,
    page_no: Option<u64>,
    lsn: Lsn,
}

impl WalReader {
    pub fn new(source: Arc<dyn WalSource>) -> WalReader {
        WalReader {
            source,
            page: vec![0u8; LOG_PAGE_SIZE as usize].into_boxed_slice(),
            page_no: None,
            lsn: Lsn::INVALID,
        }
    }

    /// The cursor position the next read starts at.
    pub fn position(&self) -> Lsn {
        self.lsn
    }

    /// Position the cursor and make sure the page under it is loaded.
    pub fn seek_and_fetch(&mut self, lsn: Lsn, mode: FetchMode) -> Result<(), WalReadError> {
        self.lsn = lsn;
        if mode == FetchMode::Force {
            self.page_no = None;
        }
        self.fetch_current()
    }

    fn fetch_current(&mut self) -> Result<(), WalReadError> {
        let page_no = self.lsn.page_number();
        if self.page_no != Some(page_no) {
            self.source.read_page(page_no, &mut self.page)?;
            self.page_no = Some(page_no);
        }
        Ok(())
    }

    /// Copy the next `out.len()` bytes, advancing the cursor. Reads may
    /// cross page boundaries.
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<(), WalReadError> {
        let mut copied = 0;
        while copied < out.len() {
            self.fetch_current()?;
            let offset = self.lsn.page_offset() as usize;
            let n = min(out.len() - copied, self.lsn.remaining_in_page() as usize);
            out[copied..copied + n].copy_from_slice(&self.page[offset..offset + n]);
            copied += n;
            self.lsn += n as u64;
        }
        Ok(())
    }

    /// Advance the cursor without copying anything. The skipped page is
    /// not fetched.
    pub fn skip(&mut self, n: usize) {
        self.lsn += n as u64;
    }

    /// Read `len` bytes into `buf`, replacing its contents.
    pub fn read_into(&mut self, buf: &mut BytesMut, len: usize) -> Result<(), WalReadError> {
        buf.clear();
        buf.resize(len, 0);
        self.read_exact(&mut buf[..])
    }

    pub fn read_u32(&mut self) -> Result<u32, WalReadError> {
        let mut bytes = [0u8; 4];
        self.read_exact(&mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn read_i32(&mut self) -> Result<i32, WalReadError> {
        let mut bytes = [0u8; 4];
        self.read_exact(&mut bytes)?;
        Ok(i32::from_le_bytes(bytes))
    }

    pub fn read_u64(&mut self) -> Result<u64, WalReadError> {
        let mut bytes = [0u8; 8];
        self.read_exact(&mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn read_i64(&mut self) -> Result<i64, WalReadError> {
        let mut bytes = [0u8; 8];
        self.read_exact(&mut bytes)?;
        Ok(i64::from_le_bytes(bytes))
    }
}

/// Grow-only in-memory log. It plays both roles: the appender side used
/// by tests (and by embeddings that feed a replica from memory) and the
/// replica's read source.
///
/// Positions below the construction LSN read as zeroes.
pub struct InMemoryWalLog {
    bytes: Mutex<Vec<u8>>,
    frontier: AtomicLsn,
}

impl InMemoryWalLog {
    pub fn new(start_lsn: Lsn) -> InMemoryWalLog {
        InMemoryWalLog {
            bytes: Mutex::new(vec![0u8; start_lsn.0 as usize]),
            frontier: AtomicLsn::new(start_lsn),
        }
    }

    /// Append one record, returning the position it was written at. The
    /// frontier moves only after every byte of the record is in place.
    pub fn append(&self, trid: TransactionId, record: &Record) -> Lsn {
        let mut body = BytesMut::new();
        record.encode_body(&mut body);
        self.append_raw(record.rec_type().to_u32(), trid, record.mvcc_id(), &body)
    }

    pub(crate) fn append_raw(
        &self,
        rec_type: u32,
        trid: TransactionId,
        mvcc_id: u64,
        body: &[u8],
    ) -> Lsn {
        let mut bytes = self.bytes.lock().unwrap();
        let lsn = Lsn(bytes.len() as u64);
        let forward_lsn = (lsn + (RecordHeader::ENCODED_LEN + body.len()) as u64).align8();

        let mut encoded = BytesMut::with_capacity(RecordHeader::ENCODED_LEN + body.len());
        RecordHeader {
            rec_type,
            trid,
            mvcc_id,
            forward_lsn,
        }
        .encode(&mut encoded);
        encoded.extend_from_slice(body);

        bytes.extend_from_slice(&encoded);
        bytes.resize(forward_lsn.0 as usize, 0);
        self.frontier.store(forward_lsn);
        lsn
    }
}

impl WalSource for InMemoryWalLog {
    fn frontier(&self) -> Lsn {
        self.frontier.load()
    }

    fn read_page(&self, page_no: u64, buf: &mut [u8]) -> Result<(), WalReadError> {
        let frontier = self.frontier.load();
        let start = page_no * LOG_PAGE_SIZE;
        if start >= frontier.0 {
            return Err(WalReadError::PastFrontier {
                lsn: Lsn(start),
                frontier,
            });
        }
        let bytes = self.bytes.lock().unwrap();
        let end = min(start + LOG_PAGE_SIZE, bytes.len() as u64);
        buf.fill(0);
        buf[..(end - start) as usize].copy_from_slice(&bytes[start as usize..end as usize]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::walrecord::{Pid, RedoData};

    fn filler(len: usize, value: u8) -> Vec<u8> {
        vec![value; len]
    }

    #[test]
    fn read_crosses_page_boundary() {
        let log = Arc::new(InMemoryWalLog::new(Lsn(0)));
        // Fill most of the first page, then append a record whose payload
        // straddles the boundary.
        log.append(
            1,
            &Record::Redo {
                rcvindex: 1,
                pid: Pid::new(1, 1),
                data: filler(LOG_PAGE_SIZE as usize - 100, 0xAB),
            },
        );
        let lsn = log.append(
            1,
            &Record::Redo {
                rcvindex: 1,
                pid: Pid::new(1, 2),
                data: filler(300, 0xCD),
            },
        );

        let source: Arc<dyn WalSource> = log.clone();
        let mut reader = WalReader::new(source);
        reader.seek_and_fetch(lsn, FetchMode::Normal).unwrap();
        reader.skip(RecordHeader::ENCODED_LEN + RedoData::ENCODED_LEN);
        let mut payload = vec![0u8; 300];
        reader.read_exact(&mut payload).unwrap();
        assert!(payload.iter().all(|b| *b == 0xCD));
        assert!(reader.position() > Lsn(LOG_PAGE_SIZE));
    }

    #[test]
    fn force_fetch_sees_later_appends_to_cached_page() {
        let log = Arc::new(InMemoryWalLog::new(Lsn(0)));
        let first = log.append(
            1,
            &Record::Commit {
                at_time_ms: 1_000_000,
            },
        );

        let source: Arc<dyn WalSource> = log.clone();
        let mut reader = WalReader::new(source);
        reader.seek_and_fetch(first, FetchMode::Normal).unwrap();
        let header = RecordHeader::decode(&mut reader).unwrap();
        let second = header.forward_lsn;

        // The second record lands on the page the reader has cached.
        log.append(
            2,
            &Record::Commit {
                at_time_ms: 2_000_000,
            },
        );

        reader.seek_and_fetch(second, FetchMode::Normal).unwrap();
        let stale = RecordHeader::decode(&mut reader).unwrap();
        assert_eq!(stale.rec_type, 0);

        reader.seek_and_fetch(second, FetchMode::Force).unwrap();
        let fresh = RecordHeader::decode(&mut reader).unwrap();
        assert_eq!(fresh.trid, 2);
    }

    #[test]
    fn reading_past_frontier_fails() {
        let log = Arc::new(InMemoryWalLog::new(Lsn(0)));
        log.append(
            1,
            &Record::Commit {
                at_time_ms: 1_000_000,
            },
        );
        let source: Arc<dyn WalSource> = log.clone();
        let mut reader = WalReader::new(source);
        let err = reader
            .seek_and_fetch(Lsn(10 * LOG_PAGE_SIZE), FetchMode::Normal)
            .unwrap_err();
        assert!(matches!(err, WalReadError::PastFrontier { .. }));
    }

    #[test]
    fn start_lsn_offsets_the_first_record() {
        let log = Arc::new(InMemoryWalLog::new(Lsn(100)));
        assert_eq!(log.frontier(), Lsn(100));
        let lsn = log.append(
            1,
            &Record::Commit {
                at_time_ms: 1_000_000,
            },
        );
        assert_eq!(lsn, Lsn(100));
        assert!(log.frontier() > lsn);
        assert_eq!(log.frontier().align8(), log.frontier());
    }
}

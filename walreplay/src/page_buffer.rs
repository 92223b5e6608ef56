//! Narrow page-access surface the replication core relies on.
//!
//! The real buffer manager lives outside this crate; replay only ever
//! pins a page, mutates its contents, stamps its LSN and marks it dirty.
//! Dropping the pinned handle unpins.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use utils::lsn::Lsn;

use crate::walrecord::Pid;

/// Size of one data page in bytes.
pub const PAGE_SIZE: usize = 8192;

#[derive(Error, Debug)]
pub enum PageBufferError {
    #[error("cannot pin page {pid}: {reason}")]
    PinFailed { pid: Pid, reason: String },
}

pub trait PageBuffer: Send + Sync {
    /// Pin a page for modification. Called from the replay driver and
    /// from redo workers; implementations synchronize internally.
    fn pin(&self, pid: Pid) -> Result<Box<dyn PinnedPage + '_>, PageBufferError>;
}

pub trait PinnedPage {
    /// The LSN of the last record applied to this page.
    fn lsn(&self) -> Lsn;
    fn set_lsn(&mut self, lsn: Lsn);
    fn set_dirty(&mut self);
    fn data(&self) -> &[u8];
    fn data_mut(&mut self) -> &mut [u8];
}

struct PageState {
    lsn: Lsn,
    dirty: bool,
    data: Box<[u8]>,
}

impl PageState {
    fn new() -> PageState {
        PageState {
            lsn: Lsn::INVALID,
            dirty: false,
            data: vec![0u8; PAGE_SIZE].into_boxed_slice(),
        }
    }
}

/// Hash-map-backed page buffer. Pages spring into existence zero-filled
/// on first pin, the way a freshly formatted page would look.
#[derive(Default)]
pub struct InMemoryPageBuffer {
    pages: Mutex<HashMap<Pid, PageState>>,
}

impl InMemoryPageBuffer {
    pub fn new() -> InMemoryPageBuffer {
        InMemoryPageBuffer::default()
    }

    pub fn page_lsn(&self, pid: Pid) -> Option<Lsn> {
        self.pages.lock().unwrap().get(&pid).map(|p| p.lsn)
    }

    pub fn is_dirty(&self, pid: Pid) -> bool {
        self.pages
            .lock()
            .unwrap()
            .get(&pid)
            .map(|p| p.dirty)
            .unwrap_or(false)
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().unwrap().len()
    }

    /// Run `f` over a page's contents, if the page exists.
    pub fn with_page<R>(&self, pid: Pid, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        self.pages.lock().unwrap().get(&pid).map(|p| f(&p.data))
    }
}

struct MemPinnedPage<'a> {
    guard: MutexGuard<'a, HashMap<Pid, PageState>>,
    pid: Pid,
}

impl MemPinnedPage<'_> {
    fn state(&self) -> &PageState {
        self.guard
            .get(&self.pid)
            .expect("page disappeared while pinned")
    }

    fn state_mut(&mut self) -> &mut PageState {
        self.guard
            .get_mut(&self.pid)
            .expect("page disappeared while pinned")
    }
}

impl PinnedPage for MemPinnedPage<'_> {
    fn lsn(&self) -> Lsn {
        self.state().lsn
    }

    fn set_lsn(&mut self, lsn: Lsn) {
        self.state_mut().lsn = lsn;
    }

    fn set_dirty(&mut self) {
        self.state_mut().dirty = true;
    }

    fn data(&self) -> &[u8] {
        &self.state().data
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.state_mut().data
    }
}

impl PageBuffer for InMemoryPageBuffer {
    fn pin(&self, pid: Pid) -> Result<Box<dyn PinnedPage + '_>, PageBufferError> {
        if pid.is_null() {
            return Err(PageBufferError::PinFailed {
                pid,
                reason: "null page id".to_string(),
            });
        }
        let mut guard = self.pages.lock().unwrap();
        guard.entry(pid).or_insert_with(PageState::new);
        Ok(Box::new(MemPinnedPage { guard, pid }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_pin_creates_zero_page() {
        let buffer = InMemoryPageBuffer::new();
        let pid = Pid::new(1, 2);
        assert_eq!(buffer.page_count(), 0);
        {
            let page = buffer.pin(pid).unwrap();
            assert_eq!(page.lsn(), Lsn::INVALID);
            assert!(page.data().iter().all(|b| *b == 0));
        }
        assert_eq!(buffer.page_count(), 1);
        assert!(!buffer.is_dirty(pid));
    }

    #[test]
    fn mutations_survive_unpin() {
        let buffer = InMemoryPageBuffer::new();
        let pid = Pid::new(3, 4);
        {
            let mut page = buffer.pin(pid).unwrap();
            page.data_mut()[0] = 0x5A;
            page.set_lsn(Lsn(777));
            page.set_dirty();
        }
        assert_eq!(buffer.page_lsn(pid), Some(Lsn(777)));
        assert!(buffer.is_dirty(pid));
        assert_eq!(buffer.with_page(pid, |data| data[0]), Some(0x5A));
    }

    #[test]
    fn null_pid_cannot_be_pinned() {
        let buffer = InMemoryPageBuffer::new();
        assert!(buffer.pin(Pid::NULL).is_err());
    }
}

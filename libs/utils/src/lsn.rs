//! Log sequence numbers.
//!
//! The write-ahead log is one flat, append-only byte stream. An LSN is
//! an absolute byte position in that stream; there is no segment or
//! file split in the addressing. The stream is fetched and cached page
//! by page, so the type also carries the page arithmetic the readers
//! need.

use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Size of one log page in bytes.
pub const LOG_PAGE_SIZE: u64 = 8192;

/// An absolute byte position in the write-ahead log. Totally ordered;
/// records only ever point forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The distinguished "no position" value. No record is ever written
    /// at byte zero, so zero is free to mean "none".
    pub const INVALID: Lsn = Lsn(0);

    /// The number of the log page this position falls on.
    pub fn page_number(self) -> u64 {
        self.0 / LOG_PAGE_SIZE
    }

    /// The offset into that log page.
    pub fn page_offset(self) -> u64 {
        self.0 % LOG_PAGE_SIZE
    }

    /// Bytes left on the page this position falls on. On the page
    /// boundary the whole page is left.
    pub fn remaining_in_page(self) -> u64 {
        LOG_PAGE_SIZE - self.page_offset()
    }

    /// Round up to the 8-byte grid records are laid out on. A position
    /// already on the grid is its own alignment.
    pub fn align8(self) -> Lsn {
        Lsn(self.0.next_multiple_of(8))
    }
}

/// We tried to parse an LSN from a string, but failed
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid LSN")]
pub struct LsnParseError;

impl FromStr for Lsn {
    type Err = LsnParseError;

    /// Accepts a plain byte offset in decimal, or in hex with a `0x`
    /// prefix (the form [`Lsn`] displays as).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => s.parse::<u64>(),
        };
        parsed.map(Lsn).map_err(|_| LsnParseError)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

impl Add<u64> for Lsn {
    type Output = Lsn;

    /// Advance by a byte count. The log would take centuries to grow
    /// past `u64`, so overflow is treated as a programming error.
    fn add(self, bytes: u64) -> Lsn {
        Lsn(self.0.checked_add(bytes).expect("lsn overflow"))
    }
}

impl AddAssign<u64> for Lsn {
    fn add_assign(&mut self, bytes: u64) {
        *self = *self + bytes;
    }
}

/// A shared LSN cell. The log appender publishes its write frontier
/// through one of these; replay threads load it without locking.
pub struct AtomicLsn(AtomicU64);

impl AtomicLsn {
    pub fn new(lsn: Lsn) -> AtomicLsn {
        AtomicLsn(AtomicU64::new(lsn.0))
    }

    pub fn load(&self) -> Lsn {
        Lsn(self.0.load(Ordering::Acquire))
    }

    /// Publish a new value. Callers keep the sequence monotone; the
    /// cell itself does not enforce it.
    pub fn store(&self, lsn: Lsn) {
        self.0.store(lsn.0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        assert_eq!("8192".parse(), Ok(Lsn(8192)));
        assert_eq!("0x2000".parse(), Ok(Lsn(0x2000)));
        assert_eq!("0X7fff".parse(), Ok(Lsn(0x7FFF)));
        assert_eq!("0".parse(), Ok(Lsn::INVALID));

        "".parse::<Lsn>().unwrap_err();
        "0x".parse::<Lsn>().unwrap_err();
        "-10".parse::<Lsn>().unwrap_err();
        "wal".parse::<Lsn>().unwrap_err();
        "0x10000000000000000".parse::<Lsn>().unwrap_err();

        assert_eq!(format!("{}", Lsn(0x2A)), "0x2A");
        assert_eq!(format!("{}", Lsn::INVALID), "0x0");
        assert_eq!("0x2A".parse::<Lsn>().unwrap().to_string(), "0x2A");
    }

    #[test]
    fn page_arithmetic() {
        let lsn = Lsn(2 * LOG_PAGE_SIZE + 100);
        assert_eq!(lsn.page_number(), 2);
        assert_eq!(lsn.page_offset(), 100);
        assert_eq!(lsn.remaining_in_page(), LOG_PAGE_SIZE - 100);

        let boundary = Lsn(3 * LOG_PAGE_SIZE);
        assert_eq!(boundary.page_offset(), 0);
        assert_eq!(boundary.remaining_in_page(), LOG_PAGE_SIZE);
    }

    #[test]
    fn record_grid_alignment() {
        assert_eq!(Lsn(41).align8(), Lsn(48));
        assert_eq!(Lsn(48).align8(), Lsn(48));
        assert_eq!(Lsn::INVALID.align8(), Lsn::INVALID);
        // A header is 24 bytes, so a record starting on the grid leaves
        // its typed body on the grid as well.
        assert_eq!((Lsn(48) + 24).align8(), Lsn(72));
    }

    #[test]
    fn addition_advances() {
        let mut lsn = Lsn(100);
        lsn += 24;
        assert_eq!(lsn, Lsn(124));
        assert_eq!(lsn + 8, Lsn(132));
        assert!(lsn < lsn + 1);
    }

    #[test]
    fn atomic_cell_publishes() {
        let frontier = AtomicLsn::new(Lsn(512));
        assert_eq!(frontier.load(), Lsn(512));
        frontier.store(Lsn(1024));
        assert_eq!(frontier.load(), Lsn(1024));
    }
}

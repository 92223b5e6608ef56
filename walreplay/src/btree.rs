//! B-tree root-page statistics.
//!
//! Unique-index statistics ride the log inside ordinary redo records;
//! only their payload is b-tree specific. The replica decodes the
//! payload and writes the statistics block straight into the root page.

use bytes::{Buf, BufMut};

use crate::walrecord::Pid;

/// Identity of a b-tree: the volume it lives on and its root page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtreeId {
    pub volume: i32,
    pub root_page: i32,
}

impl BtreeId {
    pub fn root_pid(&self) -> Pid {
        Pid::new(self.volume, self.root_page)
    }
}

/// Unique-index statistics carried by global stats commit records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UniqueStats {
    pub num_nulls: i64,
    pub num_keys: i64,
    pub num_oids: i64,
}

/// Encoded size of a `(BtreeId, UniqueStats)` payload.
pub const STATS_PAYLOAD_LEN: usize = 32;

/// Offset of the statistics block within a root page. The page header
/// occupies everything before it.
const ROOT_STATS_OFFSET: usize = 16;

pub fn encode_btree_id_and_stats(btid: &BtreeId, stats: &UniqueStats) -> Vec<u8> {
    let mut buf = Vec::with_capacity(STATS_PAYLOAD_LEN);
    buf.put_i32_le(btid.volume);
    buf.put_i32_le(btid.root_page);
    buf.put_i64_le(stats.num_nulls);
    buf.put_i64_le(stats.num_keys);
    buf.put_i64_le(stats.num_oids);
    buf
}

pub fn decode_btree_id_and_stats(data: &[u8]) -> anyhow::Result<(BtreeId, UniqueStats)> {
    anyhow::ensure!(
        data.len() >= STATS_PAYLOAD_LEN,
        "unique stats payload too short: {} bytes",
        data.len()
    );
    let mut buf = data;
    let btid = BtreeId {
        volume: buf.get_i32_le(),
        root_page: buf.get_i32_le(),
    };
    let stats = UniqueStats {
        num_nulls: buf.get_i64_le(),
        num_keys: buf.get_i64_le(),
        num_oids: buf.get_i64_le(),
    };
    Ok((btid, stats))
}

/// Write the statistics block of a pinned root page. The caller stamps
/// the page LSN and dirties it.
pub fn root_update_stats(page: &mut [u8], stats: &UniqueStats) {
    let mut out = &mut page[ROOT_STATS_OFFSET..ROOT_STATS_OFFSET + 24];
    out.put_i64_le(stats.num_nulls);
    out.put_i64_le(stats.num_keys);
    out.put_i64_le(stats.num_oids);
}

/// Read the statistics block of a root page.
pub fn root_read_stats(page: &[u8]) -> UniqueStats {
    let mut buf = &page[ROOT_STATS_OFFSET..ROOT_STATS_OFFSET + 24];
    UniqueStats {
        num_nulls: buf.get_i64_le(),
        num_keys: buf.get_i64_le(),
        num_oids: buf.get_i64_le(),
    }
}

//! Wire codec for the metadata file's header and index records.
//!
//! Both records use fixed little-endian layouts with a trailing CRC over all
//! preceding bytes. The encoding is deliberately dumb: readers in other
//! processes poll these bytes while the writer rewrites them in place, so
//! every field lives at a pinned offset and a failed checksum simply means
//! "read again".
//!
//! Header, 48 bytes at file offset 0:
//!
//! ```text
//!  0..4    magic "VHDR"
//!  4..8    page_size    u32
//!  8..16   tick_num     u64
//! 16..24   index_offset u64
//! 24..32   index_length u64
//! 32..44   reserved, zero
//! 44..48   checksum     u32 over bytes 0..44
//! ```
//!
//! Index, at `index_offset`:
//!
//! ```text
//!  0..4    magic "VIDX"
//!  4..12   tick_num     u64  (must equal the header's)
//! 12..16   num_entries  u32
//! 16..     num_entries × { page u32, md_page u32, length u32, chksum u32 }
//!  +0..4   checksum     u32 over all preceding index bytes
//! ```

use std::ops::Range;

use crate::{CorruptKind, PageIndex, Tick};

pub const HEADER_MAGIC: [u8; 4] = *b"VHDR";
pub const INDEX_MAGIC: [u8; 4] = *b"VIDX";

/// Total size of the encoded header record.
pub const HEADER_SIZE: usize = 48;
/// Encoded size of one index entry.
pub const INDEX_ENTRY_SIZE: usize = 16;
/// Index bytes that are not entries: magic, tick, count, trailing checksum.
pub const INDEX_OVERHEAD: usize = 4 + 8 + 4 + 4;

const HO_MAGIC: Range<usize> = 0..4;
const HO_PAGE_SIZE: Range<usize> = 4..8;
const HO_TICK: Range<usize> = 8..16;
const HO_INDEX_OFFSET: Range<usize> = 16..24;
const HO_INDEX_LENGTH: Range<usize> = 24..32;
const HO_CHECKSUM: Range<usize> = 44..48;

const IO_MAGIC: Range<usize> = 0..4;
const IO_TICK: Range<usize> = 4..12;
const IO_COUNT: Range<usize> = 12..16;
const IO_ENTRIES: usize = 16;

/// Decoded header record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub page_size: u32,
    pub tick: Tick,
    pub index_offset: u64,
    pub index_length: u64,
}

/// One index entry as it appears on the wire.
///
/// Page offsets are in units of the header's `page_size`. `md_page` is never
/// 0 on the wire: metadata-file page 0 holds the header and index records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WireEntry {
    pub page: PageIndex,
    pub md_page: PageIndex,
    pub length: u32,
    pub chksum: u32,
}

pub fn checksum(data: &[u8]) -> u32 {
    // crc32c, same polynomial the images themselves are checksummed with.
    crc::Crc::<u32>::new(&crc::CRC_32_ISCSI).checksum(data)
}

/// Encoded size of an index with `num_entries` entries.
pub fn index_length(num_entries: usize) -> u64 {
    (INDEX_OVERHEAD + num_entries * INDEX_ENTRY_SIZE) as u64
}

pub fn encode_header(header: &Header) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[HO_MAGIC].copy_from_slice(&HEADER_MAGIC);
    buf[HO_PAGE_SIZE].copy_from_slice(&header.page_size.to_le_bytes());
    buf[HO_TICK].copy_from_slice(&header.tick.to_le_bytes());
    buf[HO_INDEX_OFFSET].copy_from_slice(&header.index_offset.to_le_bytes());
    buf[HO_INDEX_LENGTH].copy_from_slice(&header.index_length.to_le_bytes());
    let sum = checksum(&buf[..HO_CHECKSUM.start]);
    buf[HO_CHECKSUM].copy_from_slice(&sum.to_le_bytes());
    buf
}

pub fn decode_header(buf: &[u8]) -> Result<Header, CorruptKind> {
    if buf.len() < HEADER_SIZE {
        return Err(CorruptKind::Truncated);
    }
    if buf[HO_MAGIC] != HEADER_MAGIC {
        return Err(CorruptKind::BadHeaderMagic);
    }
    if read_u32(buf, HO_CHECKSUM) != checksum(&buf[..HO_CHECKSUM.start]) {
        return Err(CorruptKind::BadChecksum);
    }

    let page_size = read_u32(buf, HO_PAGE_SIZE);
    if page_size == 0 || !page_size.is_power_of_two() {
        return Err(CorruptKind::BadLength(u64::from(page_size)));
    }

    let index_length = read_u64(buf, HO_INDEX_LENGTH);
    if index_length < INDEX_OVERHEAD as u64
        || (index_length - INDEX_OVERHEAD as u64) % INDEX_ENTRY_SIZE as u64 != 0
    {
        return Err(CorruptKind::BadLength(index_length));
    }

    Ok(Header {
        page_size,
        tick: read_u64(buf, HO_TICK),
        index_offset: read_u64(buf, HO_INDEX_OFFSET),
        index_length,
    })
}

pub fn encode_index(tick: Tick, entries: &[WireEntry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(INDEX_OVERHEAD + entries.len() * INDEX_ENTRY_SIZE);
    buf.extend_from_slice(&INDEX_MAGIC);
    buf.extend_from_slice(&tick.to_le_bytes());
    buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for entry in entries {
        buf.extend_from_slice(&entry.page.to_le_bytes());
        buf.extend_from_slice(&entry.md_page.to_le_bytes());
        buf.extend_from_slice(&entry.length.to_le_bytes());
        buf.extend_from_slice(&entry.chksum.to_le_bytes());
    }
    let sum = checksum(&buf);
    buf.extend_from_slice(&sum.to_le_bytes());
    buf
}

/// Decode an index record. With `expected_tick` set, a tick that disagrees is
/// reported as a torn read even when the checksum matches; the caller re-reads
/// the header to find out which publication it raced with.
pub fn decode_index(
    buf: &[u8],
    expected_tick: Option<Tick>,
) -> Result<(Tick, Vec<WireEntry>), CorruptKind> {
    if buf.len() < INDEX_OVERHEAD {
        return Err(CorruptKind::Truncated);
    }
    if buf[IO_MAGIC] != INDEX_MAGIC {
        return Err(CorruptKind::BadIndexMagic);
    }

    let count = read_u32(buf, IO_COUNT) as usize;
    let total = INDEX_OVERHEAD + count * INDEX_ENTRY_SIZE;
    if buf.len() < total {
        return Err(CorruptKind::Truncated);
    }

    let sum_at = total - 4;
    if read_u32(buf, sum_at..total) != checksum(&buf[..sum_at]) {
        return Err(CorruptKind::BadChecksum);
    }

    let tick = read_u64(buf, IO_TICK);
    if let Some(expected) = expected_tick {
        if tick != expected {
            return Err(CorruptKind::TickMismatch {
                header: expected,
                index: tick,
            });
        }
    }

    let mut entries = Vec::with_capacity(count);
    let mut at = IO_ENTRIES;
    for _ in 0..count {
        let entry = WireEntry {
            page: read_u32(buf, at..at + 4),
            md_page: read_u32(buf, at + 4..at + 8),
            length: read_u32(buf, at + 8..at + 12),
            chksum: read_u32(buf, at + 12..at + 16),
        };

        // The writer publishes in strictly ascending page order; anything
        // else did not come from a well-formed commit.
        if entries.last().map_or(false, |last: &WireEntry| entry.page <= last.page) {
            return Err(CorruptKind::OutOfOrder);
        }

        entries.push(entry);
        at += INDEX_ENTRY_SIZE;
    }

    Ok((tick, entries))
}

fn read_u32(buf: &[u8], at: Range<usize>) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], at: Range<usize>) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at]);
    u64::from_le_bytes(bytes)
}

//! Reader-side tick controller.
//!
//! A reader never talks to the writer. It polls the metadata file under the
//! header–index–header pattern: read the header, read the index it points at,
//! read the header again. The writer publishes the index strictly before the
//! header, so matching tick numbers on both header reads prove the index
//! belongs to the tick it claims. A checksum or tick disagreement is a torn
//! read; the reader just tries again, bounded, without ever sleeping.
//!
//! A new tick is applied to the host in two passes over the diff against the
//! previous snapshot. Pass 0 drops stale pages from the page buffer, pass 1
//! lets the metadata cache evict or refresh its entries in those pages. The
//! order is load-bearing: a refresh re-reads through the page buffer and must
//! find the fresh bytes there, not the copy pass 0 was about to drop.

use std::io;
use std::mem;
use std::path::Path;

use tracing::warn;

use crate::clock::{Clock, Timespec};
use crate::codec::{self, Header, WireEntry};
use crate::file::MetadataFile;
use crate::host::{MetadataCache, PageBuffer};
use crate::sched::{EotEntry, FileId, Role};
use crate::{CorruptKind, EngineError, FileConfig, PageIndex, Tick};

/// Torn reads retried before the tick is given up as a read error.
const MAX_READ_ATTEMPTS: u32 = 100;

/// What one observed tick changed relative to the previous snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickDiff {
    pub tick: Tick,
    pub added: u32,
    pub changed: u32,
    pub removed: u32,
}

/// A reader's view of one coordinated file.
pub struct ReaderFile<C: Clock> {
    cfg: FileConfig,
    clock: C,
    md: MetadataFile,
    tick: Tick,
    end_of_tick: Timespec,
    /// Snapshot pair: `current` is what the host sees, `old` is last tick's
    /// view. They swap on every observed tick so the diff never copies.
    current: Vec<WireEntry>,
    old: Vec<WireEntry>,
}

impl<C: Clock> ReaderFile<C> {
    /// Open the metadata file read-only and validate it is one we can
    /// follow. Contents are picked up by the first `end_of_tick`, which
    /// therefore reports every already-published page as added.
    pub fn open(cfg: FileConfig, clock: C) -> Result<Self, EngineError> {
        cfg.validate()?;
        if cfg.writer {
            return Err(EngineError::Config("configuration is for the writer handle"));
        }

        let md = MetadataFile::open_read(&cfg.md_path)?;
        let header = read_header(&md)?;
        if header.page_size != cfg.page_size {
            return Err(EngineError::Config(
                "metadata file page size disagrees with the configuration",
            ));
        }

        let end_of_tick = clock
            .now()
            .map_err(EngineError::Clock)?
            .after(cfg.tick_duration());

        Ok(ReaderFile {
            cfg,
            clock,
            md,
            tick: 0,
            end_of_tick,
            current: Vec::new(),
            old: Vec::new(),
        })
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn deadline(&self) -> Timespec {
        self.end_of_tick
    }

    /// The snapshot the host currently sees, in page order.
    pub fn entries(&self) -> &[WireEntry] {
        &self.current
    }

    /// The queue entry describing this file's next end-of-tick.
    pub fn queue_entry(&self, file: FileId) -> EotEntry {
        EotEntry {
            file,
            role: Role::Reader,
            tick: self.tick,
            deadline: self.end_of_tick,
        }
    }

    /// Run one end-of-tick: probe the header and, if the writer has moved
    /// on, apply the new index to the host. `Ok(None)` means nothing had
    /// changed.
    pub fn end_of_tick(
        &mut self,
        buffer: &mut dyn PageBuffer,
        cache: Option<&mut dyn MetadataCache>,
    ) -> Result<Option<TickDiff>, EngineError> {
        let header = read_header(&self.md)?;
        if header.tick == self.tick {
            self.reschedule()?;
            return Ok(None);
        }

        let (header, entries) = read_consistent(&self.md)?;

        // Diff the new snapshot against what the host still sees. The
        // snapshot pair and the tick are only committed once both passes
        // have gone through; a host failure leaves the reader exactly where
        // it was, and the retried tick re-runs the same diff.
        let (diff, stale) = diff_snapshots(&self.current, &entries, header.tick);

        // Pass 0: the page buffer forgets every stale page.
        for &page in &stale {
            buffer.remove_entry(page)?;
        }

        // Pass 1: the metadata cache evicts or refreshes entries in them.
        if let Some(cache) = cache {
            for &page in &stale {
                cache.evict_or_refresh_entries_in_page(page, header.tick)?;
            }
        }

        mem::swap(&mut self.current, &mut self.old);
        self.current = entries;
        self.tick = header.tick;
        self.reschedule()?;
        Ok(Some(diff))
    }

    fn reschedule(&mut self) -> Result<(), EngineError> {
        self.end_of_tick = self
            .clock
            .now()
            .map_err(EngineError::Clock)?
            .after(self.cfg.tick_duration());
        Ok(())
    }
}

/// March the sorted snapshots in lockstep. Changed and removed pages must be
/// invalidated on the host; added pages need nothing, their old bytes were
/// valid through the data file until this very tick.
fn diff_snapshots(
    old: &[WireEntry],
    current: &[WireEntry],
    tick: Tick,
) -> (TickDiff, Vec<PageIndex>) {
    let mut diff = TickDiff {
        tick,
        ..TickDiff::default()
    };
    let mut stale = Vec::new();

    let (mut i, mut j) = (0usize, 0usize);
    while i < old.len() && j < current.len() {
        let (o, c) = (old[i], current[j]);
        if o.page == c.page {
            if o.md_page != c.md_page {
                diff.changed += 1;
                stale.push(o.page);
            }
            i += 1;
            j += 1;
        } else if o.page < c.page {
            diff.removed += 1;
            stale.push(o.page);
            i += 1;
        } else {
            diff.added += 1;
            j += 1;
        }
    }
    for o in &old[i..] {
        diff.removed += 1;
        stale.push(o.page);
    }
    diff.added += (current.len() - j) as u32;

    (diff, stale)
}

/// One-shot consistent read of a published metadata file.
///
/// This is the same bounded-retry protocol the reader runs each tick, usable
/// standalone by tooling that wants to look at a file some writer is live on.
pub fn read_published(path: &Path) -> Result<(Header, Vec<WireEntry>), EngineError> {
    let md = MetadataFile::open_read(path)?;
    read_consistent(&md)
}

fn read_header_once(md: &MetadataFile) -> Result<Header, EngineError> {
    let mut buf = [0u8; codec::HEADER_SIZE];
    match md.read_at(&mut buf, 0) {
        Ok(()) => codec::decode_header(&buf).map_err(EngineError::Corrupt),
        // A file shorter than its header is a writer mid-create, torn.
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            Err(EngineError::Corrupt(CorruptKind::Truncated))
        }
        Err(err) => Err(EngineError::Io(err)),
    }
}

fn read_consistent(md: &MetadataFile) -> Result<(Header, Vec<WireEntry>), EngineError> {
    retry_torn(|| {
        let header = read_header_once(md)?;

        // A torn length would have us read far out of the live region.
        let end = header.index_offset.saturating_add(header.index_length);
        if end > md.len() {
            return Err(EngineError::Corrupt(CorruptKind::BadLength(
                header.index_length,
            )));
        }

        let mut buf = vec![0u8; header.index_length as usize];
        match md.read_at(&mut buf, header.index_offset) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(EngineError::Corrupt(CorruptKind::Truncated));
            }
            Err(err) => return Err(EngineError::Io(err)),
        }
        let (tick, entries) =
            codec::decode_index(&buf, Some(header.tick)).map_err(EngineError::Corrupt)?;

        // The writer may have republished while we read the index; the
        // second header read catches that.
        let reread = read_header_once(md)?;
        if reread.tick != header.tick {
            return Err(EngineError::Corrupt(CorruptKind::TickMismatch {
                header: reread.tick,
                index: tick,
            }));
        }

        Ok((header, entries))
    })
}

fn read_header(md: &MetadataFile) -> Result<Header, EngineError> {
    retry_torn(|| read_header_once(md))
}

fn retry_torn<T>(mut op: impl FnMut() -> Result<T, EngineError>) -> Result<T, EngineError> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(EngineError::Corrupt(kind)) => {
                if attempts >= MAX_READ_ATTEMPTS {
                    warn!(?kind, attempts, "metadata file still torn, giving up");
                    return Err(EngineError::TornRead { attempts });
                }
            }
            Err(other) => return Err(other),
        }
    }
}

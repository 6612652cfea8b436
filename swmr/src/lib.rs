//! Tick-coordinated single-writer / multiple-reader views of a paged file.
//!
//! One process mutates a large paged file; any number of other processes
//! follow it with a bounded lag, without locks and without talking to the
//! writer. The only shared artifact is a small *metadata file* next to the
//! data file. At a fixed cadence, one *tick*, the writer publishes into it
//! a checksummed index of every data-file page whose current image lives in
//! the metadata file, then bumps the tick number in the header. Readers poll
//! the header; when the tick moves they fetch the index, diff it against
//! their previous snapshot, and invalidate exactly the pages that changed in
//! their host's caches.
//!
//! Publication is made atomic by protocol, not by the filesystem: the writer
//! writes the index strictly before the header, and readers read header,
//! index, header again, accepting only a tick number that held across all
//! three. Pages whose metadata-file region is republished stay readable for
//! `max_lag` further ticks on a delayed-write ledger, so a reader that lags
//! by up to `max_lag` ticks never resolves a dangling region.
//!
//! The engine is driven cooperatively. Each file's controller carries a
//! deadline, the process-wide [`EotQueue`] keeps the earliest one at its
//! head, and the host library fires due controllers from its API entry/exit
//! hooks. No threads, no locks, no signals.

mod clock;
pub mod codec;
mod file;
mod host;
mod index;
mod ledger;
mod reader;
mod sched;
mod writer;


pub use clock::{Clock, Monotonic, Timespec};
pub use host::{DirtyPage, HostError, ImageHandle, MetadataCache, PageBuffer};
pub use index::IndexEntry;
pub use reader::{read_published, ReaderFile, TickDiff};
pub use sched::{EotEntry, EotQueue, FileId, Role};
pub use writer::{MergeStats, WriterFile};

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Logical publication interval counter. Starts at 1 when the writer creates
/// the metadata file and advances by one per end-of-tick.
pub type Tick = u64;

/// Index of a page within the fixed page grid of a file, in units of
/// [`FileConfig::page_size`].
pub type PageIndex = u32;

/// Smallest tolerated reader lag bound; anything lower leaves no window
/// between publication and reuse.
pub const MIN_MAX_LAG: u32 = 3;

/// Per-file configuration, fixed for the lifetime of the handle.
#[derive(Clone, Debug)]
pub struct FileConfig {
    /// Whether this handle is the writer. Exactly one process may be.
    pub writer: bool,
    /// Page size of the data file's page grid, a power of two.
    pub page_size: u32,
    /// Tick duration in tenths of a second.
    pub tick_len: u32,
    /// Minimum number of ticks a superseded page image stays readable.
    pub max_lag: u32,
    /// Size of the metadata file, in pages.
    pub md_pages_reserved: u32,
    /// Path of the metadata file.
    pub md_path: PathBuf,
    /// Index capacity override. `None` derives the largest capacity the
    /// reserved layout supports; a smaller explicit bound gives the host
    /// deterministic back-pressure instead of a far-off overflow.
    pub index_capacity: Option<u32>,
}

impl FileConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.page_size < 512 || !self.page_size.is_power_of_two() {
            return Err(EngineError::Config("page size must be a power of two ≥ 512"));
        }
        if self.tick_len == 0 {
            return Err(EngineError::Config("tick length must be positive"));
        }
        if self.max_lag < MIN_MAX_LAG {
            return Err(EngineError::Config("max lag must be at least 3 ticks"));
        }
        if self.md_pages_reserved < 2 {
            return Err(EngineError::Config(
                "metadata file needs the index page and at least one image page",
            ));
        }
        if let Some(capacity) = self.index_capacity {
            if capacity == 0 {
                return Err(EngineError::Config("index capacity must be positive"));
            }
            let needed = codec::HEADER_SIZE as u64
                + codec::index_length(capacity as usize);
            if needed > u64::from(self.page_size) {
                return Err(EngineError::Config(
                    "index capacity does not fit the reserved index page",
                ));
            }
        }
        Ok(())
    }

    /// Number of index entries this configuration supports.
    pub fn index_slots(&self) -> usize {
        if let Some(capacity) = self.index_capacity {
            return capacity as usize;
        }

        // Header and index share page 0 of the metadata file, images start
        // at page 1; the index can use at most the remainder of page 0, and
        // never more than the whole reservation would fit.
        let by_reservation = (u64::from(self.md_pages_reserved) * u64::from(self.page_size)
            - codec::HEADER_SIZE as u64)
            / codec::INDEX_ENTRY_SIZE as u64;
        let by_index_page = (u64::from(self.page_size)
            - codec::HEADER_SIZE as u64
            - codec::INDEX_OVERHEAD as u64)
            / codec::INDEX_ENTRY_SIZE as u64;
        by_reservation.min(by_index_page) as usize
    }

    /// Exact byte size of the metadata file.
    pub fn md_len(&self) -> u64 {
        u64::from(self.md_pages_reserved) * u64::from(self.page_size)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.tick_len) * 100)
    }
}

/// Why a decoded record cannot be trusted. On the reader side every one of
/// these means "torn read, try again"; on the writer side any of them in the
/// pre-publication self-check is fatal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CorruptKind {
    BadHeaderMagic,
    BadIndexMagic,
    BadChecksum,
    /// Header and index disagree about the tick they belong to.
    TickMismatch { header: Tick, index: Tick },
    /// A length or size field no valid record could carry.
    BadLength(u64),
    /// The record runs past the bytes that exist.
    Truncated,
    /// Index entries out of page order.
    OutOfOrder,
}

impl fmt::Display for CorruptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorruptKind::BadHeaderMagic => write!(f, "header magic bytes are wrong"),
            CorruptKind::BadIndexMagic => write!(f, "index magic bytes are wrong"),
            CorruptKind::BadChecksum => write!(f, "record checksum does not validate"),
            CorruptKind::TickMismatch { header, index } => {
                write!(f, "header is at tick {} but index at tick {}", header, index)
            }
            CorruptKind::BadLength(length) => write!(f, "implausible record length {}", length),
            CorruptKind::Truncated => write!(f, "record is truncated"),
            CorruptKind::OutOfOrder => write!(f, "index entries are not in page order"),
        }
    }
}

/// Engine failure, grouped by the policy a caller applies.
#[derive(Debug)]
pub enum EngineError {
    /// Rejected configuration; nothing was constructed.
    Config(&'static str),
    /// I/O on the metadata file failed.
    Io(io::Error),
    /// A record failed validation.
    Corrupt(CorruptKind),
    /// A reader exhausted its retry budget against a file that would not
    /// decode consistently.
    TornRead { attempts: u32 },
    /// The fixed-capacity index cannot take another page.
    IndexFull { capacity: usize },
    /// The metadata file has no room for another image region.
    MdFileFull { needed_pages: u32 },
    /// A delay decision fell outside `[current, current + max_lag]`, which
    /// only a bookkeeping bug can produce.
    DelayRange {
        page: PageIndex,
        until: Tick,
        current: Tick,
    },
    /// The monotonic clock failed.
    Clock(io::Error),
    /// A host collaborator failed; the tick was aborted.
    Host(HostError),
    /// The handle was poisoned by an earlier fatal error.
    Poisoned,
}

impl EngineError {
    /// Whether this error leaves the writer handle unusable. Fatal errors
    /// poison the handle: the on-disk publication stays at the previous tick
    /// and close skips the drain.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Io(_)
                | EngineError::Corrupt(_)
                | EngineError::IndexFull { .. }
                | EngineError::MdFileFull { .. }
                | EngineError::DelayRange { .. }
                | EngineError::Clock(_)
        )
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Config(what) => write!(f, "invalid configuration: {}", what),
            EngineError::Io(err) => write!(f, "metadata file I/O failed: {}", err),
            EngineError::Corrupt(kind) => write!(f, "corrupt record: {}", kind),
            EngineError::TornRead { attempts } => {
                write!(f, "metadata file still torn after {} read attempts", attempts)
            }
            EngineError::IndexFull { capacity } => {
                write!(f, "index is full at {} entries", capacity)
            }
            EngineError::MdFileFull { needed_pages } => {
                write!(f, "no region of {} pages left in the metadata file", needed_pages)
            }
            EngineError::DelayRange {
                page,
                until,
                current,
            } => write!(
                f,
                "delay decision for page {} landed at tick {} outside the window from tick {}",
                page, until, current
            ),
            EngineError::Clock(err) => write!(f, "monotonic clock failed: {}", err),
            EngineError::Host(err) => write!(f, "host collaborator failed: {}", err),
            EngineError::Poisoned => write!(f, "file handle was poisoned by an earlier error"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        EngineError::Io(err)
    }
}

impl From<HostError> for EngineError {
    fn from(err: HostError) -> Self {
        EngineError::Host(err)
    }
}

//! Interfaces of the host library the engine calls out to.
//!
//! The engine never touches the host's page cache or metadata cache directly;
//! it drives them through these traits at every tick. Any error a collaborator
//! returns aborts the current tick and is handed back to the caller; the
//! engine's own state is left where the last committed publication put it.

use std::fmt;

use crate::{PageIndex, Tick};

/// Opaque token for a page image held by the host page buffer.
///
/// The index stores this in place of a pointer. The page buffer must validate
/// the token on every dereference and refuse it once the underlying slot has
/// been reclaimed; holding a handle confers no ownership of the image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageHandle(pub u64);

/// Failure reported by a collaborator.
#[derive(Debug)]
pub enum HostError {
    /// The handle no longer names a live image slot.
    StaleImage(ImageHandle),
    /// The collaborator failed in a way it can only describe.
    Failed(&'static str),
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::StaleImage(handle) => {
                write!(f, "page image handle {:#x} is no longer valid", handle.0)
            }
            HostError::Failed(what) => write!(f, "host collaborator failed: {}", what),
        }
    }
}

impl std::error::Error for HostError {}

/// A page the host page buffer modified during the current tick.
#[derive(Clone, Copy, Debug)]
pub struct DirtyPage {
    pub page: PageIndex,
    pub image: ImageHandle,
    pub length: u32,
}

/// The host page buffer, owner of all live page images.
pub trait PageBuffer {
    /// Tell the buffer which tick is being formed; dirty tracking restarts
    /// relative to it.
    fn set_tick(&mut self, tick: Tick) -> Result<(), HostError>;

    /// The pages modified during the current tick, in no particular order.
    fn tick_list(&mut self) -> Result<Vec<DirtyPage>, HostError>;

    /// Resolve an image handle to its bytes. Must fail with
    /// [`HostError::StaleImage`] rather than returning reused memory.
    fn image_bytes(&self, image: ImageHandle) -> Result<&[u8], HostError>;

    /// Drop the current tick list so the next tick starts clean.
    fn release_tick_list(&mut self) -> Result<(), HostError>;

    /// Release delayed-write blocks whose delay expired at `tick`.
    fn release_delayed_writes(&mut self, tick: Tick) -> Result<(), HostError>;

    /// Number of writes still parked on the buffer's delayed-write list.
    fn delayed_write_count(&self) -> usize;

    /// Reader side: invalidate the cached copy of `page`, if any.
    fn remove_entry(&mut self, page: PageIndex) -> Result<(), HostError>;
}

/// The host metadata cache layered above the page buffer.
pub trait MetadataCache {
    /// Flush dirty cache entries down into the page buffer.
    fn flush(&mut self) -> Result<(), HostError>;

    /// Reader side: evict, or refresh in place, every cache entry contained
    /// in `page`. Runs strictly after the page buffer dropped its copy of the
    /// page, so a refresh re-reads current bytes.
    fn evict_or_refresh_entries_in_page(
        &mut self,
        page: PageIndex,
        tick: Tick,
    ) -> Result<(), HostError>;

    /// Whether the cache currently holds no dirty entries.
    fn is_clean(&self) -> bool;
}

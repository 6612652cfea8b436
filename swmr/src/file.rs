//! The sidecar metadata file, and the allocator for its image region.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::{EngineError, PageIndex};

/// Scoped handle over the metadata file.
///
/// The writer creates the file truncated to its full fixed size and unlinks
/// it again when the handle drops; the file only ever exists while its writer
/// does. Readers open the same path read-only and share no state with the
/// writer beyond the bytes.
pub(crate) struct MetadataFile {
    file: File,
    path: PathBuf,
    owner: bool,
    len: u64,
}

impl MetadataFile {
    /// Create the file for the writer, truncated to exactly `len` bytes.
    pub fn create(path: &Path, len: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;

        Ok(MetadataFile {
            file,
            path: path.to_owned(),
            owner: true,
            len,
        })
    }

    /// Open an existing file read-only, for a reader.
    pub fn open_read(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let len = file.metadata()?.len();

        Ok(MetadataFile {
            file,
            path: path.to_owned(),
            owner: false,
            len,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    pub fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }
}

impl Drop for MetadataFile {
    fn drop(&mut self) {
        if !self.owner {
            return;
        }

        // Best effort only. A stale metadata file confuses nobody: readers
        // validate the tick against the writer they expect to follow.
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %err, "failed to unlink metadata file");
        }
    }
}

/// First-fit allocator over the metadata file's image region.
///
/// Page 0 belongs to the header and index records; images occupy pages
/// `1..limit`. Allocations are page-granular, so a multi-page image occupies
/// a contiguous run. Freed runs are coalesced with their neighbours and
/// preferred over fresh pages, which keeps the file at its fixed size doing
/// useful work.
pub(crate) struct RegionAllocator {
    page_size: u32,
    limit: PageIndex,
    next: PageIndex,
    free: Vec<(PageIndex, u32)>,
}

impl RegionAllocator {
    pub fn new(page_size: u32, total_pages: u32) -> Self {
        RegionAllocator {
            page_size,
            limit: total_pages,
            next: 1,
            free: Vec::new(),
        }
    }

    fn pages_for(&self, length: usize) -> u32 {
        let page_size = self.page_size as usize;
        ((length + page_size - 1) / page_size) as u32
    }

    /// Allocate a run of pages covering `length` bytes.
    pub fn alloc(&mut self, length: usize) -> Result<PageIndex, EngineError> {
        let pages = self.pages_for(length);

        for at in 0..self.free.len() {
            let (start, run) = self.free[at];
            if run < pages {
                continue;
            }
            if run == pages {
                self.free.remove(at);
            } else {
                self.free[at] = (start + pages, run - pages);
            }
            return Ok(start);
        }

        if self.next + pages > self.limit {
            return Err(EngineError::MdFileFull { needed_pages: pages });
        }

        let start = self.next;
        self.next += pages;
        Ok(start)
    }

    /// Return a run of pages covering `length` bytes starting at `page`.
    pub fn free(&mut self, page: PageIndex, length: usize) {
        let pages = self.pages_for(length);
        let at = self
            .free
            .iter()
            .position(|&(start, _)| start > page)
            .unwrap_or(self.free.len());
        self.free.insert(at, (page, pages));

        // Coalesce with the right neighbour, then the left.
        if at + 1 < self.free.len() && self.free[at].0 + self.free[at].1 == self.free[at + 1].0 {
            self.free[at].1 += self.free[at + 1].1;
            self.free.remove(at + 1);
        }
        if at > 0 && self.free[at - 1].0 + self.free[at - 1].1 == self.free[at].0 {
            self.free[at - 1].1 += self.free[at].1;
            self.free.remove(at);
        }
    }

    pub fn close(&mut self) {
        self.free.clear();
        self.next = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::RegionAllocator;
    use crate::EngineError;

    #[test]
    fn allocates_from_page_one() {
        let mut space = RegionAllocator::new(4096, 8);
        assert_eq!(space.alloc(4096).unwrap(), 1);
        assert_eq!(space.alloc(1).unwrap(), 2);
        assert_eq!(space.alloc(8192).unwrap(), 3);
    }

    #[test]
    fn reuses_freed_runs_first_fit() {
        let mut space = RegionAllocator::new(4096, 8);
        let a = space.alloc(4096).unwrap();
        let _b = space.alloc(4096).unwrap();
        space.free(a, 4096);
        assert_eq!(space.alloc(4096).unwrap(), a);
    }

    #[test]
    fn coalesces_neighbouring_runs() {
        let mut space = RegionAllocator::new(4096, 8);
        let a = space.alloc(4096).unwrap();
        let b = space.alloc(4096).unwrap();
        let _c = space.alloc(4096).unwrap();
        space.free(a, 4096);
        space.free(b, 4096);
        // A two-page image fits the coalesced hole.
        assert_eq!(space.alloc(8192).unwrap(), a);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut space = RegionAllocator::new(4096, 4);
        space.alloc(4096 * 3).unwrap();
        match space.alloc(4096) {
            Err(EngineError::MdFileFull { needed_pages: 1 }) => {}
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }
}

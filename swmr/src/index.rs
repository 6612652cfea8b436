//! The in-memory index of pages published to the metadata file.
//!
//! One entry per data-file page whose current image lives in the metadata
//! file. The entry array is kept sorted by data-file page at all times;
//! readers decode the same ordering off the wire, which is what makes the
//! two-pointer diff on their side work.

use crate::codec::WireEntry;
use crate::host::ImageHandle;
use crate::{EngineError, PageIndex, Tick};

/// Descriptor of one published (or about-to-be-published) page.
#[derive(Clone, Copy, Debug)]
pub struct IndexEntry {
    /// Page index in the data file.
    pub page: PageIndex,
    /// Page index in the metadata file, 0 while never published. Page 0 of
    /// the metadata file holds the header and index records, so 0 is free to
    /// mean "no image on disk yet".
    pub md_page: PageIndex,
    /// Bytes of the image; one page, or several for a large entry.
    pub length: u32,
    /// Checksum over the image bytes as published.
    pub chksum: u32,
    /// Live image pending publication; cleared once written out.
    pub image: Option<ImageHandle>,
    pub tick_of_last_change: Tick,
    pub tick_of_last_flush: Tick,
    /// Earliest tick at which the data-file copy of this page may be
    /// overwritten again; 0 when no delay applies.
    pub delayed_flush: Tick,
    pub clean: bool,
    pub moved_to_data_file: bool,
}

impl IndexEntry {
    fn new(page: PageIndex, image: ImageHandle, length: u32, tick: Tick) -> Self {
        IndexEntry {
            page,
            md_page: 0,
            length,
            chksum: 0,
            image: Some(image),
            tick_of_last_change: tick,
            tick_of_last_flush: 0,
            delayed_flush: 0,
            clean: false,
            moved_to_data_file: false,
        }
    }
}

/// Fixed-capacity sorted entry array.
pub(crate) struct Index {
    entries: Vec<IndexEntry>,
    capacity: usize,
}

impl Index {
    pub fn new(capacity: usize) -> Self {
        Index {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn position(&self, page: PageIndex) -> Result<usize, usize> {
        self.entries.binary_search_by_key(&page, |entry| entry.page)
    }

    /// Attach a fresh image to `page`, inserting a new entry if the page was
    /// not yet indexed. Overflowing the fixed capacity is fatal to the file
    /// handle; the caller must not publish afterwards.
    pub fn insert_or_update(
        &mut self,
        page: PageIndex,
        image: ImageHandle,
        length: u32,
        tick: Tick,
    ) -> Result<bool, EngineError> {
        match self.position(page) {
            Ok(at) => {
                let entry = &mut self.entries[at];
                entry.image = Some(image);
                entry.length = length;
                entry.tick_of_last_change = tick;
                entry.clean = false;
                Ok(false)
            }
            Err(at) => {
                if self.entries.len() >= self.capacity {
                    return Err(EngineError::IndexFull {
                        capacity: self.capacity,
                    });
                }
                self.entries.insert(at, IndexEntry::new(page, image, length, tick));
                Ok(true)
            }
        }
    }

    pub fn lookup(&self, page: PageIndex) -> Option<&IndexEntry> {
        self.position(page).ok().map(|at| &self.entries[at])
    }

    pub fn lookup_mut(&mut self, page: PageIndex) -> Option<&mut IndexEntry> {
        match self.position(page) {
            Ok(at) => Some(&mut self.entries[at]),
            Err(_) => None,
        }
    }

    /// Restore page ordering after bulk mutation of the entry array.
    pub fn sort_by_page(&mut self) {
        self.entries.sort_by_key(|entry| entry.page);
    }

    pub fn iter_sorted(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter()
    }

    pub fn entries_mut(&mut self) -> &mut [IndexEntry] {
        &mut self.entries
    }

    /// The wire form of every entry, in page order.
    pub fn to_wire(&self) -> Vec<WireEntry> {
        self.entries
            .iter()
            .map(|entry| WireEntry {
                page: entry.page,
                md_page: entry.md_page,
                length: entry.length,
                chksum: entry.chksum,
            })
            .collect()
    }

    #[cfg(test)]
    fn is_sorted(&self) -> bool {
        self.entries.windows(2).all(|w| w[0].page < w[1].page)
    }
}

#[cfg(test)]
mod tests {
    use super::Index;
    use crate::host::ImageHandle;
    use crate::EngineError;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn image(n: u64) -> ImageHandle {
        ImageHandle(n)
    }

    #[test]
    fn stays_sorted_under_random_insertion() {
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        let mut index = Index::new(512);

        for n in 0..512u64 {
            let page = rng.gen_range(0..4096);
            let _ = index.insert_or_update(page, image(n), 4096, 1);
            assert!(index.is_sorted());
        }
    }

    #[test]
    fn update_does_not_duplicate() {
        let mut index = Index::new(8);
        assert!(index.insert_or_update(5, image(1), 4096, 1).unwrap());
        assert!(!index.insert_or_update(5, image(2), 8192, 2).unwrap());

        assert_eq!(index.len(), 1);
        let entry = index.lookup(5).unwrap();
        assert_eq!(entry.image, Some(image(2)));
        assert_eq!(entry.length, 8192);
        assert_eq!(entry.tick_of_last_change, 2);
        assert!(!entry.clean);
    }

    #[test]
    fn lookup_misses_between_entries() {
        let mut index = Index::new(8);
        index.insert_or_update(2, image(1), 4096, 1).unwrap();
        index.insert_or_update(9, image(2), 4096, 1).unwrap();

        assert!(index.lookup(2).is_some());
        assert!(index.lookup(5).is_none());
        assert!(index.lookup(10).is_none());
    }

    #[test]
    fn overflow_is_fatal_and_leaves_entries_alone() {
        let mut index = Index::new(2);
        index.insert_or_update(1, image(1), 4096, 1).unwrap();
        index.insert_or_update(2, image(2), 4096, 1).unwrap();

        match index.insert_or_update(3, image(3), 4096, 1) {
            Err(EngineError::IndexFull { capacity: 2 }) => {}
            other => panic!("expected overflow, got {:?}", other),
        }
        assert_eq!(index.len(), 2);

        // Updating an existing page is still fine at capacity.
        index.insert_or_update(2, image(4), 4096, 2).unwrap();
    }

    #[test]
    fn wire_form_preserves_order() {
        let mut index = Index::new(8);
        for page in [7u32, 3, 5] {
            index.insert_or_update(page, image(u64::from(page)), 4096, 1).unwrap();
        }
        let wire = index.to_wire();
        let pages: Vec<u32> = wire.iter().map(|e| e.page).collect();
        assert_eq!(pages, vec![3, 5, 7]);
    }
}

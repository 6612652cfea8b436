#![allow(dead_code)]
//! Shared scaffolding: an in-memory host and a hand-cranked clock.

use std::cell::Cell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use tempfile::TempDir;

use swmr::{
    Clock, DirtyPage, FileConfig, HostError, ImageHandle, MetadataCache, PageBuffer, PageIndex,
    Tick, Timespec,
};

/// A clock whose time only moves when the test says so. Clones share the
/// same time, like two handles onto the same process clock.
#[derive(Clone, Default)]
pub struct TestClock {
    now: Rc<Cell<Timespec>>,
}

impl TestClock {
    pub fn advance(&self, duration: Duration) {
        self.now.set(self.now.get().after(duration));
    }
}

impl Clock for TestClock {
    fn now(&self) -> io::Result<Timespec> {
        Ok(self.now.get())
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[derive(Default)]
pub struct MockBuffer {
    pub images: HashMap<u64, Vec<u8>>,
    next_handle: u64,
    dirty: Vec<DirtyPage>,
    pub removed: Vec<PageIndex>,
    pub delayed: usize,
    pub tick: Tick,
    /// Number of upcoming `remove_entry` calls to refuse.
    pub fail_removes: usize,
}

impl MockBuffer {
    pub fn dirty_page(&mut self, page: PageIndex, fill: u8, length: usize) {
        let image = ImageHandle(self.next_handle);
        self.next_handle += 1;
        self.images.insert(image.0, vec![fill; length]);
        self.dirty.push(DirtyPage {
            page,
            image,
            length: length as u32,
        });
    }
}

impl PageBuffer for MockBuffer {
    fn set_tick(&mut self, tick: Tick) -> Result<(), HostError> {
        self.tick = tick;
        Ok(())
    }

    fn tick_list(&mut self) -> Result<Vec<DirtyPage>, HostError> {
        Ok(self.dirty.clone())
    }

    fn image_bytes(&self, image: ImageHandle) -> Result<&[u8], HostError> {
        self.images
            .get(&image.0)
            .map(Vec::as_slice)
            .ok_or(HostError::StaleImage(image))
    }

    fn release_tick_list(&mut self) -> Result<(), HostError> {
        self.dirty.clear();
        Ok(())
    }

    fn release_delayed_writes(&mut self, _tick: Tick) -> Result<(), HostError> {
        self.delayed = self.delayed.saturating_sub(1);
        Ok(())
    }

    fn delayed_write_count(&self) -> usize {
        self.delayed
    }

    fn remove_entry(&mut self, page: PageIndex) -> Result<(), HostError> {
        if self.fail_removes > 0 {
            self.fail_removes -= 1;
            return Err(HostError::Failed("page buffer refused the invalidation"));
        }
        self.removed.push(page);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockCache {
    pub flushes: u32,
    pub refreshed: Vec<(PageIndex, Tick)>,
    pub dirty: bool,
    /// Number of upcoming `evict_or_refresh_entries_in_page` calls to refuse.
    pub fail_refreshes: usize,
}

impl MetadataCache for MockCache {
    fn flush(&mut self) -> Result<(), HostError> {
        self.flushes += 1;
        self.dirty = false;
        Ok(())
    }

    fn evict_or_refresh_entries_in_page(
        &mut self,
        page: PageIndex,
        tick: Tick,
    ) -> Result<(), HostError> {
        if self.fail_refreshes > 0 {
            self.fail_refreshes -= 1;
            return Err(HostError::Failed("metadata cache refused the refresh"));
        }
        self.refreshed.push((page, tick));
        Ok(())
    }

    fn is_clean(&self) -> bool {
        !self.dirty
    }
}

pub fn writer_config(dir: &TempDir) -> FileConfig {
    FileConfig {
        writer: true,
        page_size: 4096,
        tick_len: 1,
        max_lag: 3,
        md_pages_reserved: 8,
        md_path: dir.path().join("coord.md"),
        index_capacity: None,
    }
}

pub fn reader_config(dir: &TempDir) -> FileConfig {
    FileConfig {
        writer: false,
        ..writer_config(dir)
    }
}

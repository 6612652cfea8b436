//! Writer-side tick controller.
//!
//! Creating the writer publishes tick 1 with an empty index, so the metadata
//! file is decodable from the moment it exists. Every `end_of_tick` forms the
//! next tick: collect this tick's dirty pages from the host, write their
//! images into the metadata file, then publish index and header in that
//! order, because the header's tick number is what commits the tick to
//! readers. Only after the header hits the file does the in-memory tick
//! advance, so an aborted tick leaves both views on the previous publication.

use tracing::{debug, warn};

use crate::clock::{Clock, Timespec};
use crate::codec::{self, Header, WireEntry};
use crate::file::{MetadataFile, RegionAllocator};
use crate::host::{MetadataCache, PageBuffer};
use crate::index::{Index, IndexEntry};
use crate::ledger::{Ledger, LedgerEntry};
use crate::sched::{EotEntry, FileId, Role};
use crate::{CorruptKind, EngineError, FileConfig, PageIndex, Tick};

/// What the merge step took from the host's tick list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub added: u32,
    pub modified: u32,
}

/// The writer's view of one coordinated file.
pub struct WriterFile<C: Clock> {
    cfg: FileConfig,
    clock: C,
    md: MetadataFile,
    space: RegionAllocator,
    /// Allocated on the first tick that runs, not at create.
    index: Option<Index>,
    ledger: Ledger,
    tick: Tick,
    end_of_tick: Timespec,
    poisoned: bool,
}

impl<C: Clock> WriterFile<C> {
    /// Create the metadata file and publish the empty first tick.
    pub fn create(cfg: FileConfig, clock: C) -> Result<Self, EngineError> {
        cfg.validate()?;
        if !cfg.writer {
            return Err(EngineError::Config("configuration is for a reader handle"));
        }

        let md = MetadataFile::create(&cfg.md_path, cfg.md_len())?;
        let space = RegionAllocator::new(cfg.page_size, cfg.md_pages_reserved);
        let deadline = clock
            .now()
            .map_err(EngineError::Clock)?
            .after(cfg.tick_duration());

        let mut writer = WriterFile {
            md,
            space,
            clock,
            index: None,
            ledger: Ledger::new(),
            tick: 0,
            end_of_tick: deadline,
            poisoned: false,
            cfg,
        };

        writer.publish(1, &[])?;
        writer.tick = 1;
        Ok(writer)
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn deadline(&self) -> Timespec {
        self.end_of_tick
    }

    /// The queue entry describing this file's next end-of-tick.
    pub fn queue_entry(&self, file: FileId) -> EotEntry {
        EotEntry {
            file,
            role: Role::Writer,
            tick: self.tick,
            deadline: self.end_of_tick,
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Run one end-of-tick. On success the new tick is committed both on disk
    /// and in memory. A fatal error poisons the handle: the publication on
    /// disk stays at the previous tick and close only unlinks.
    pub fn end_of_tick(
        &mut self,
        buffer: &mut dyn PageBuffer,
        cache: Option<&mut dyn MetadataCache>,
    ) -> Result<MergeStats, EngineError> {
        if self.poisoned {
            return Err(EngineError::Poisoned);
        }

        match self.run_tick(buffer, cache) {
            Err(err) if err.is_fatal() => {
                self.poisoned = true;
                Err(err)
            }
            other => other,
        }
    }

    fn run_tick(
        &mut self,
        buffer: &mut dyn PageBuffer,
        cache: Option<&mut dyn MetadataCache>,
    ) -> Result<MergeStats, EngineError> {
        let new_tick = self.tick + 1;

        // Get every modification of this tick down into the page buffer. The
        // cache may already be gone late in close; then the buffer holds all
        // remaining state anyway.
        if let Some(cache) = cache {
            cache.flush()?;
        }
        buffer.set_tick(new_tick)?;

        let slots = self.cfg.index_slots();
        let index = self.index.get_or_insert_with(|| Index::new(slots));

        // Merge the tick list.
        let mut stats = MergeStats::default();
        for dirty in buffer.tick_list()? {
            if index.insert_or_update(dirty.page, dirty.image, dirty.length, new_tick)? {
                stats.added += 1;
            } else {
                stats.modified += 1;
            }
        }

        // Resolve every pending image up front. A stale handle aborts the
        // tick here, before the allocator, the ledger, or any entry has been
        // touched, so a retried tick starts from exactly the last committed
        // publication with nothing to roll back.
        let mut staged = Vec::new();
        for (at, entry) in index.iter_sorted().enumerate() {
            let Some(image) = entry.image else { continue };
            let bytes = buffer.image_bytes(image)?;
            staged.push((at, bytes, codec::checksum(bytes)));
        }

        // Write the resolved images out. The old region of a republished
        // page moves to the ledger first: a lagging reader may still resolve
        // the page there.
        let page_size = u64::from(self.cfg.page_size);
        let entries = index.entries_mut();
        for &(at, bytes, chksum) in &staged {
            let entry = &mut entries[at];

            if entry.md_page != 0 {
                self.ledger.push(LedgerEntry {
                    page: entry.page,
                    md_page: entry.md_page,
                    length: entry.length,
                    tick: new_tick,
                });
            }

            let md_page = self.space.alloc(bytes.len())?;
            entry.length = bytes.len() as u32;
            entry.chksum = chksum;
            entry.md_page = md_page;
            self.md.write_at(bytes, u64::from(md_page) * page_size)?;

            entry.image = None;
            entry.clean = true;
            entry.tick_of_last_flush = new_tick;
        }
        index.sort_by_page();

        // Publish: index first, header second. The header commits the tick.
        let wire = index.to_wire();
        self.publish(new_tick, &wire)?;

        // The next tick starts from a clean slate.
        buffer.release_tick_list()?;
        buffer.release_delayed_writes(new_tick)?;

        // Regions every reader has necessarily moved past become reusable.
        let released = self.ledger.prune(new_tick, self.cfg.max_lag, &mut self.space);

        self.tick = new_tick;
        self.end_of_tick = self
            .clock
            .now()
            .map_err(EngineError::Clock)?
            .after(self.cfg.tick_duration());

        debug!(
            tick = new_tick,
            added = stats.added,
            modified = stats.modified,
            released,
            "tick committed"
        );
        Ok(stats)
    }

    fn publish(&mut self, tick: Tick, entries: &[WireEntry]) -> Result<(), EngineError> {
        let index_bytes = codec::encode_index(tick, entries);
        let header = Header {
            page_size: self.cfg.page_size,
            tick,
            index_offset: codec::HEADER_SIZE as u64,
            index_length: index_bytes.len() as u64,
        };
        let header_bytes = codec::encode_header(&header);

        // Never put a header on disk that this same code cannot read back.
        match codec::decode_header(&header_bytes) {
            Ok(reread) if reread == header => {}
            Ok(_) => return Err(EngineError::Corrupt(CorruptKind::BadChecksum)),
            Err(kind) => return Err(EngineError::Corrupt(kind)),
        }

        self.md.write_at(&index_bytes, header.index_offset)?;
        self.md.write_at(&header_bytes, 0)?;
        Ok(())
    }

    /// First tick at which the page buffer may overwrite `page` in the data
    /// file; the current tick means immediately.
    ///
    /// A page with no index entry is read straight from the data file by
    /// readers, and a reader up to `max_lag` ticks behind must not find bytes
    /// from a tick it has not reached yet. A page with an entry is resolved
    /// through the metadata file instead, so its data-file copy is fair game
    /// unless the entry itself carries a pending delay.
    pub fn delay_write_until(&mut self, page: PageIndex) -> Result<Tick, EngineError> {
        if self.poisoned {
            return Err(EngineError::Poisoned);
        }

        let current = self.tick;
        let max_lag = Tick::from(self.cfg.max_lag);

        let until = match self.index.as_ref().and_then(|index| index.lookup(page)) {
            None => current + max_lag,
            Some(entry) if entry.delayed_flush >= current => entry.delayed_flush,
            Some(_) => current,
        };

        if until < current || until > current + max_lag {
            self.poisoned = true;
            return Err(EngineError::DelayRange {
                page,
                until,
                current,
            });
        }
        Ok(until)
    }

    /// Publication state of `page`, if it is currently indexed.
    pub fn entry(&self, page: PageIndex) -> Option<&IndexEntry> {
        self.index.as_ref().and_then(|index| index.lookup(page))
    }

    /// Note that the authoritative copy of `page` migrated back into the data
    /// file. The entry keeps blocking data-file overwrites until every reader
    /// still resolving it through the metadata file has caught up. Returns
    /// whether the page had an entry.
    pub fn moved_to_data_file(&mut self, page: PageIndex) -> bool {
        let until = self.tick + Tick::from(self.cfg.max_lag);
        match self.index.as_mut().and_then(|index| index.lookup_mut(page)) {
            Some(entry) => {
                entry.moved_to_data_file = true;
                entry.delayed_flush = until;
                true
            }
            None => false,
        }
    }

    /// Drive ticks until the page buffer's delayed-write list drains. The
    /// buffer cannot be flushed while a delayed write is pending, so this
    /// must run before the host flushes or closes the file.
    pub fn prepare_close(
        &mut self,
        buffer: &mut dyn PageBuffer,
        mut cache: Option<&mut dyn MetadataCache>,
    ) -> Result<(), EngineError> {
        // One forced end-of-tick clears the current tick list.
        let reborrow: Option<&mut dyn MetadataCache> = match cache.as_mut() {
            Some(cache) => Some(&mut **cache),
            None => None,
        };
        self.end_of_tick(buffer, reborrow)?;

        while buffer.delayed_write_count() > 0 {
            self.clock.sleep(self.cfg.tick_duration());
            let reborrow: Option<&mut dyn MetadataCache> = match cache.as_mut() {
                Some(cache) => Some(&mut **cache),
                None => None,
            };
            self.end_of_tick(buffer, reborrow)?;
        }

        Ok(())
    }

    /// Quiesce and tear down. The metadata file is unlinked when the handle
    /// drops; a poisoned handle skips the drain and goes straight there.
    pub fn close(
        mut self,
        buffer: &mut dyn PageBuffer,
        mut cache: Option<&mut dyn MetadataCache>,
    ) -> Result<(), EngineError> {
        if !self.poisoned {
            let reborrow: Option<&mut dyn MetadataCache> = match cache.as_mut() {
                Some(cache) => Some(&mut **cache),
                None => None,
            };
            self.prepare_close(buffer, reborrow)?;
        }

        if let Some(cache) = cache {
            if !cache.is_clean() {
                warn!("metadata cache still dirty at close");
            }
        }

        self.ledger.drain(&mut self.space);
        self.space.close();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn ledger(&self) -> &Ledger {
        &self.ledger
    }
}

//! The delayed-write ledger: previous images retained for lagging readers.
//!
//! When the writer republishes a page it moves the page's old metadata-file
//! region here instead of freeing it. A reader up to `max_lag` ticks behind
//! may still hold an index that points into that region, so the region must
//! keep its bytes until every such reader has necessarily moved on.
//!
//! The ledger is a FIFO with the newest entry at the front. Entries always
//! carry the tick that retired them, so ticks are non-increasing from front
//! to back and pruning can stop at the first entry that is still young.

use std::collections::VecDeque;

use crate::file::RegionAllocator;
use crate::{PageIndex, Tick};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Data-file page whose old image this is.
    pub page: PageIndex,
    /// Metadata-file page where the old image still lives.
    pub md_page: PageIndex,
    pub length: u32,
    /// Tick at which the image was superseded.
    pub tick: Tick,
}

#[derive(Default)]
pub(crate) struct Ledger {
    entries: VecDeque<LedgerEntry>,
}

impl Ledger {
    pub fn new() -> Self {
        Ledger::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Retire an image. `entry.tick` must be the current tick, which is what
    /// keeps the front-to-back ordering intact.
    pub fn push(&mut self, entry: LedgerEntry) {
        debug_assert!(self
            .entries
            .front()
            .map_or(true, |front| front.tick <= entry.tick));
        self.entries.push_front(entry);
    }

    /// Release every region no reader can still reference at `current_tick`,
    /// returning how many were released.
    pub fn prune(&mut self, current_tick: Tick, max_lag: u32, space: &mut RegionAllocator) -> usize {
        let horizon = current_tick.saturating_sub(Tick::from(max_lag));
        let mut released = 0;

        while self.entries.back().map_or(false, |oldest| oldest.tick <= horizon) {
            if let Some(entry) = self.entries.pop_back() {
                space.free(entry.md_page, entry.length as usize);
                released += 1;
            }
        }

        released
    }

    /// Hand every remaining region back to the allocator, for close.
    pub fn drain(&mut self, space: &mut RegionAllocator) {
        while let Some(entry) = self.entries.pop_back() {
            space.free(entry.md_page, entry.length as usize);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::{Ledger, LedgerEntry};
    use crate::file::RegionAllocator;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn entry(md_page: u32, tick: u64) -> LedgerEntry {
        LedgerEntry {
            page: md_page + 100,
            md_page,
            length: 4096,
            tick,
        }
    }

    #[test]
    fn front_to_back_ticks_never_increase() {
        let mut rng = SmallRng::seed_from_u64(7);
        let mut ledger = Ledger::new();
        let mut space = RegionAllocator::new(4096, 1024);
        let mut tick = 1u64;

        for round in 0..200u32 {
            tick += u64::from(rng.gen_range(0..2u32));
            ledger.push(entry(round + 1, tick));

            if rng.gen_bool(0.3) {
                ledger.prune(tick, 3, &mut space);
            }

            let ticks: Vec<u64> = ledger.iter().map(|e| e.tick).collect();
            assert!(ticks.windows(2).all(|w| w[0] >= w[1]), "{:?}", ticks);
        }
    }

    #[test]
    fn prune_respects_the_lag_horizon() {
        let mut ledger = Ledger::new();
        let mut space = RegionAllocator::new(4096, 64);

        for tick in 2..=8u64 {
            ledger.push(entry(tick as u32, tick));
        }

        let released = ledger.prune(8, 3, &mut space);
        assert_eq!(released, 4); // ticks 2..=5
        assert!(ledger.iter().all(|e| e.tick > 8 - 3));
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn prune_before_lag_elapses_is_a_no_op() {
        let mut ledger = Ledger::new();
        let mut space = RegionAllocator::new(4096, 64);

        ledger.push(entry(1, 2));
        assert_eq!(ledger.prune(2, 3, &mut space), 0);
        assert_eq!(ledger.prune(4, 3, &mut space), 0);
        assert_eq!(ledger.prune(5, 3, &mut space), 1);
        assert!(ledger.is_empty());
    }

    #[test]
    fn pruned_regions_become_allocatable() {
        let mut ledger = Ledger::new();
        let mut space = RegionAllocator::new(4096, 4);

        let a = space.alloc(4096).unwrap();
        let b = space.alloc(4096).unwrap();
        let c = space.alloc(4096).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));

        ledger.push(entry(a, 2));
        ledger.push(entry(b, 2));
        ledger.prune(5, 3, &mut space);

        assert_eq!(space.alloc(8192).unwrap(), a);
    }
}

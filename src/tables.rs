// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-RAM bookkeeping: the logical block table, the log block table and the
//! free block ring.
//!
//! None of this touches flash directly. Operations that may need an erase
//! take a closure that performs it, so the caller decides how errors
//! propagate.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::low_level::{PhysBlock, SPINOR_MAX_LOG_NUM};

/// Where a logical block's content currently lives.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LogicalEntry {
    /// Data block, or `None` if the logical block has never been merged.
    pub phys: Option<PhysBlock>,
    /// Sequence number of the data block. The next log block for this
    /// logical block uses `seq + 1`.
    pub seq: u8,
}

/// Bitmap of written physical sector slots in a log block.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SectorMap([u32; 4]);

impl SectorMap {
    pub fn get(&self, slot: u8) -> bool {
        self.0[usize::from(slot / 32)] & (1 << (slot % 32)) != 0
    }

    pub fn set(&mut self, slot: u8) {
        self.0[usize::from(slot / 32)] |= 1 << (slot % 32);
    }

    pub fn count(&self) -> u32 {
        self.0.iter().map(|w| w.count_ones()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&w| w == 0)
    }
}

/// A physical block shadowing one logical block with recent writes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LogBlock {
    pub logical: u8,
    pub phys: PhysBlock,
    /// One more than the sequence number of the data block being shadowed.
    pub seq: u8,
    /// Logical sector stored in physical slot 0. Its own slot in turn holds
    /// logical sector 0. Only meaningful once slot 0 is written.
    pub sector_1st: u8,
    pub map: SectorMap,
    /// Logical sector held in the write-combining buffer but not yet
    /// programmed.
    pub pending: Option<u8>,
}

impl LogBlock {
    pub fn new(logical: u8, phys: PhysBlock, seq: u8) -> Self {
        Self {
            logical,
            phys,
            seq,
            sector_1st: 0,
            map: SectorMap::default(),
            pending: None,
        }
    }

    /// Physical slot that logical `sector` maps to. The mapping swaps 0 and
    /// `sector_1st` and is its own inverse, so this also maps slots back to
    /// logical sectors.
    pub fn slot_of(&self, sector: u8) -> u8 {
        swap_first(self.sector_1st, sector)
    }

    /// Checks whether logical `sector` has been programmed into this block.
    pub fn holds(&self, sector: u8) -> bool {
        self.map.get(self.slot_of(sector))
    }
}

/// Applies the slot-0 swap used by log blocks whose first written sector was
/// `first`.
pub fn swap_first(first: u8, n: u8) -> u8 {
    if n == 0 {
        first
    } else if n == first {
        0
    } else {
        n
    }
}

/// Chooses which log table slot should serve writes to `logical`.
///
/// In order of preference: a slot already shadowing `logical`; the first
/// empty slot; the slot shadowing `logical - 1`, whose owner is most likely
/// finished with sequential writes; the currently active slot.
pub fn pick_slot(
    owners: [Option<u8>; SPINOR_MAX_LOG_NUM],
    active: usize,
    logical: u8,
) -> usize {
    if let Some(i) = owners.iter().position(|&o| o == Some(logical)) {
        return i;
    }
    if let Some(i) = owners.iter().position(Option::is_none) {
        return i;
    }
    if let Some(prev) = logical.checked_sub(1) {
        if let Some(i) = owners.iter().position(|&o| o == Some(prev)) {
            return i;
        }
    }
    active
}

/// Fixed-capacity table of live log blocks.
#[derive(Clone, Debug, Default)]
pub struct LogTable {
    slots: [Option<LogBlock>; SPINOR_MAX_LOG_NUM],
    active: usize,
}

impl LogTable {
    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn active(&self) -> Option<&LogBlock> {
        self.slots[self.active].as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut LogBlock> {
        self.slots[self.active].as_mut()
    }

    pub fn owners(&self) -> [Option<u8>; SPINOR_MAX_LOG_NUM] {
        let mut owners = [None; SPINOR_MAX_LOG_NUM];
        for (o, s) in owners.iter_mut().zip(&self.slots) {
            *o = s.as_ref().map(|l| l.logical);
        }
        owners
    }

    /// Makes the slot chosen by `pick_slot` active and returns its index.
    pub fn select(&mut self, logical: u8) -> usize {
        self.active = pick_slot(self.owners(), self.active, logical);
        self.active
    }

    pub fn find(&self, logical: u8) -> Option<&LogBlock> {
        self.slots.iter().flatten().find(|l| l.logical == logical)
    }

    pub fn slot(&self, index: usize) -> Option<&LogBlock> {
        self.slots[index].as_ref()
    }

    pub fn take(&mut self, index: usize) -> Option<LogBlock> {
        self.slots[index].take()
    }

    /// Places `log` in the first empty slot, returning it back if there is
    /// none.
    pub fn insert(&mut self, log: LogBlock) -> Result<usize, LogBlock> {
        match self.slots.iter().position(Option::is_none) {
            Some(i) => {
                self.slots[i] = Some(log);
                Ok(i)
            }
            None => Err(log),
        }
    }

    pub fn put(&mut self, index: usize, log: LogBlock) {
        debug_assert!(self.slots[index].is_none());
        self.slots[index] = Some(log);
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogBlock> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }
}

/// A block handed out by the free ring.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FreeBlock {
    pub block: PhysBlock,
    /// Whether the block is known to be erased. If not, it must be erased
    /// before use.
    pub erased: bool,
}

/// Queue of free blocks.
///
/// The first `clean` entries are known to be erased; the rest may hold stale
/// data. A block pushed as clean behind a dirty one is counted as dirty, so
/// the known-erased entries are always a prefix of the queue.
#[derive(Clone, Debug, Default)]
pub struct FreeRing {
    queue: VecDeque<PhysBlock>,
    clean: usize,
}

impl FreeRing {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            clean: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clean_len(&self) -> usize {
        self.clean
    }

    /// Entries that may still hold stale data.
    pub fn dirty_len(&self) -> usize {
        self.queue.len() - self.clean
    }

    pub fn contains(&self, block: PhysBlock) -> bool {
        self.queue.contains(&block)
    }

    pub fn iter(&self) -> impl Iterator<Item = PhysBlock> + '_ {
        self.queue.iter().copied()
    }

    /// Appends a block that still needs erasing.
    pub fn push_dirty(&mut self, block: PhysBlock) {
        debug_assert!(!self.contains(block));
        self.queue.push_back(block);
    }

    /// Appends a block known to be erased.
    pub fn push_clean(&mut self, block: PhysBlock) {
        debug_assert!(!self.contains(block));
        if self.clean == self.queue.len() {
            self.clean += 1;
        }
        self.queue.push_back(block);
    }

    /// Takes the block at the front of the ring.
    pub fn pop(&mut self) -> Option<FreeBlock> {
        let block = self.queue.pop_front()?;
        let erased = self.clean > 0;
        if erased {
            self.clean -= 1;
        }
        Some(FreeBlock { block, erased })
    }

    /// Takes `block` out of the ring wherever it is.
    pub fn remove(&mut self, block: PhysBlock) -> Option<FreeBlock> {
        let i = self.queue.iter().position(|&b| b == block)?;
        let erased = i < self.clean;
        if erased {
            self.clean -= 1;
        }
        self.queue.remove(i);
        Some(FreeBlock { block, erased })
    }

    /// Drops every entry for which `keep` returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(PhysBlock) -> bool) {
        let mut kept = VecDeque::with_capacity(self.queue.len());
        let mut clean = 0;
        for (i, b) in self.queue.drain(..).enumerate() {
            if keep(b) {
                if i < self.clean {
                    clean += 1;
                }
                kept.push_back(b);
            }
        }
        self.queue = kept;
        self.clean = clean;
    }

    /// Erases every entry not known to be erased, front to back, growing the
    /// clean prefix as it goes so that an error leaves the ring consistent.
    pub fn scrub<E>(
        &mut self,
        mut erase: impl FnMut(PhysBlock) -> Result<(), E>,
    ) -> Result<(), E> {
        while self.clean < self.queue.len() {
            erase(self.queue[self.clean])?;
            self.clean += 1;
        }
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<PhysBlock> {
        self.queue.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_map_bits() {
        let mut m = SectorMap::default();
        assert!(m.is_empty());
        for slot in [0, 31, 32, 95, 127] {
            assert!(!m.get(slot));
            m.set(slot);
            assert!(m.get(slot));
        }
        assert_eq!(m.count(), 5);
        assert!(!m.get(1));
        assert!(!m.get(96));
    }

    #[test]
    fn first_sector_swap_is_involution() {
        for first in 0..16 {
            for n in 0..16 {
                assert_eq!(swap_first(first, swap_first(first, n)), n);
            }
        }
        assert_eq!(swap_first(5, 0), 5);
        assert_eq!(swap_first(5, 5), 0);
        assert_eq!(swap_first(5, 3), 3);
        assert_eq!(swap_first(0, 0), 0);
    }

    #[test]
    fn log_block_slots() {
        let mut log = LogBlock::new(3, PhysBlock(7), 1);
        log.sector_1st = 9;
        log.map.set(0);
        assert!(log.holds(9));
        assert!(!log.holds(0));
        assert_eq!(log.slot_of(0), 9);
        log.map.set(9);
        assert!(log.holds(0));
    }

    #[test]
    fn slot_policy_prefers_existing_owner() {
        assert_eq!(pick_slot([Some(4), Some(7)], 0, 7), 1);
        assert_eq!(pick_slot([None, Some(7)], 0, 7), 1);
    }

    #[test]
    fn slot_policy_then_empty_slot() {
        assert_eq!(pick_slot([Some(4), None], 0, 9), 1);
        assert_eq!(pick_slot([None, None], 1, 9), 0);
    }

    #[test]
    fn slot_policy_then_predecessor() {
        assert_eq!(pick_slot([Some(8), Some(2)], 0, 3), 1);
        assert_eq!(pick_slot([Some(2), Some(8)], 1, 3), 0);
    }

    #[test]
    fn slot_policy_falls_back_to_active() {
        assert_eq!(pick_slot([Some(8), Some(2)], 1, 5), 1);
        assert_eq!(pick_slot([Some(8), Some(2)], 0, 0), 0);
    }

    #[test]
    fn log_table_select_and_insert() {
        let mut t = LogTable::default();
        assert!(t.active().is_none());
        assert_eq!(t.select(5), 0);
        t.put(0, LogBlock::new(5, PhysBlock(1), 1));
        assert_eq!(t.select(6), 1);
        assert_eq!(t.insert(LogBlock::new(6, PhysBlock(2), 1)), Ok(1));
        assert!(t.insert(LogBlock::new(9, PhysBlock(3), 1)).is_err());
        assert_eq!(t.len(), 2);
        assert_eq!(t.select(5), 0);
        assert_eq!(t.active().map(|l| l.phys), Some(PhysBlock(1)));
        assert_eq!(t.find(6).map(|l| l.phys), Some(PhysBlock(2)));
        assert_eq!(t.take(1).map(|l| l.logical), Some(6));
        assert_eq!(t.owners(), [Some(5), None]);
    }

    #[test]
    fn free_ring_clean_prefix() {
        let mut r = FreeRing::with_capacity(4);
        r.push_clean(PhysBlock(1));
        r.push_dirty(PhysBlock(2));
        // Clean, but queued behind a dirty block.
        r.push_clean(PhysBlock(3));
        assert_eq!(r.clean_len(), 1);
        assert_eq!(r.dirty_len(), 2);

        assert_eq!(r.pop(), Some(FreeBlock { block: PhysBlock(1), erased: true }));
        assert_eq!(r.pop(), Some(FreeBlock { block: PhysBlock(2), erased: false }));
        assert_eq!(r.pop(), Some(FreeBlock { block: PhysBlock(3), erased: false }));
        assert_eq!(r.pop(), None);

        // Once empty, clean pushes extend the prefix again.
        r.push_clean(PhysBlock(4));
        r.push_clean(PhysBlock(5));
        assert_eq!(r.clean_len(), 2);
    }

    #[test]
    fn free_ring_scrub_and_remove() {
        let mut r = FreeRing::with_capacity(4);
        r.push_clean(PhysBlock(1));
        r.push_dirty(PhysBlock(2));
        r.push_dirty(PhysBlock(3));

        let mut erased = Vec::new();
        r.scrub::<()>(|b| {
            erased.push(b);
            Ok(())
        }).unwrap();
        assert_eq!(erased, [PhysBlock(2), PhysBlock(3)]);
        assert_eq!(r.clean_len(), 3);

        assert_eq!(r.remove(PhysBlock(2)), Some(FreeBlock { block: PhysBlock(2), erased: true }));
        assert_eq!(r.remove(PhysBlock(2)), None);
        assert_eq!(r.clean_len(), 2);
        assert_eq!(r.to_vec(), [PhysBlock(1), PhysBlock(3)]);
    }

    #[test]
    fn free_ring_scrub_stops_on_error() {
        let mut r = FreeRing::with_capacity(4);
        r.push_dirty(PhysBlock(1));
        r.push_dirty(PhysBlock(2));
        let result = r.scrub(|b| if b == PhysBlock(2) { Err(()) } else { Ok(()) });
        assert_eq!(result, Err(()));
        assert_eq!(r.clean_len(), 1);
    }

    #[test]
    fn free_ring_retain_keeps_prefix_consistent() {
        let mut r = FreeRing::with_capacity(4);
        r.push_clean(PhysBlock(1));
        r.push_clean(PhysBlock(2));
        r.push_dirty(PhysBlock(3));
        r.push_dirty(PhysBlock(4));
        r.retain(|b| b.0 % 2 == 0);
        assert_eq!(r.to_vec(), [PhysBlock(2), PhysBlock(4)]);
        assert_eq!(r.clean_len(), 1);
    }
}

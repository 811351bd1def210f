// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Partition record journal.
//!
//! The metadata block is written one sector at a time, each sector holding a
//! complete `RecordSector`. The entry with the highest generation is current.
//! When the block fills up it is erased and the journal restarts at sector 0.

use crate::low_level::{is_erased, Flash, PartitionRecord, PhysBlock, RecordSector, Sector};

#[derive(Clone, Debug)]
pub(crate) struct Journal {
    block: PhysBlock,
    spb: u8,
    /// Sector the next entry goes into, or `None` if the block is full.
    next: Option<u8>,
    generation: u32,
    current: Option<PartitionRecord>,
}

impl Journal {
    /// A journal that has not been loaded yet.
    pub fn empty(block: PhysBlock, spb: u8) -> Self {
        Self {
            block,
            spb,
            next: Some(0),
            generation: 0,
            current: None,
        }
    }

    /// Scans the metadata block for the newest valid entry.
    pub fn load<F: Flash>(flash: &F, block: PhysBlock, spb: u8, buf: &mut Sector) -> Result<Self, F::Error> {
        let mut newest: Option<(u8, u32, PartitionRecord)> = None;
        for slot in 0..spb {
            flash.read_sector(block.lba(spb, slot), buf)?;
            if let Some(entry) = RecordSector::parse(buf) {
                let generation = entry.generation.get();
                let better = match newest {
                    None => true,
                    Some((_, g, _)) => (generation.wrapping_sub(g) as i32) > 0,
                };
                if better {
                    newest = Some((slot, generation, entry.record));
                }
            }
        }

        // Append after the newest entry, skipping anything a torn append
        // left behind.
        let start = match newest {
            Some((slot, _, _)) => slot + 1,
            None => 0,
        };
        let mut next = None;
        for slot in start..spb {
            flash.read_sector(block.lba(spb, slot), buf)?;
            if is_erased(buf) {
                next = Some(slot);
                break;
            }
        }

        Ok(Self {
            block,
            spb,
            next,
            generation: newest.map(|(_, g, _)| g).unwrap_or(0),
            current: newest.map(|(_, _, r)| r),
        })
    }

    pub fn record(&self) -> Option<PartitionRecord> {
        self.current
    }

    /// Appends `record` as the new current entry.
    pub fn append<F: Flash>(&mut self, flash: &mut F, record: PartitionRecord, buf: &mut Sector) -> Result<(), F::Error> {
        let slot = match self.next {
            Some(slot) => slot,
            None => {
                flash.erase_block(self.block)?;
                0
            }
        };
        let generation = self.generation.wrapping_add(1);
        RecordSector::emit(buf, record, generation);
        flash.program_sector(self.block.lba(self.spb, slot), buf)?;

        self.next = if slot + 1 < self.spb { Some(slot + 1) } else { None };
        self.generation = generation;
        self.current = Some(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_flash::FakeFlash;
    use crate::low_level::{BlockRange, SECTOR_SIZE};

    fn record(n: u8) -> PartitionRecord {
        PartitionRecord::new(BlockRange::new(1, n), BlockRange::new(1 + n, 2), 0)
    }

    #[test]
    fn blank_block_has_no_record() {
        let flash = FakeFlash::new(2, 4);
        let mut buf = [0; SECTOR_SIZE];
        let j = Journal::load(&flash, PhysBlock(0), 4, &mut buf).unwrap();
        assert_eq!(j.record(), None);
        assert_eq!(j.next, Some(0));
    }

    #[test]
    fn newest_entry_wins_across_reload() {
        let mut flash = FakeFlash::new(2, 4);
        let mut buf = [0; SECTOR_SIZE];
        let mut j = Journal::load(&flash, PhysBlock(0), 4, &mut buf).unwrap();
        j.append(&mut flash, record(3), &mut buf).unwrap();
        j.append(&mut flash, record(4), &mut buf).unwrap();

        let j = Journal::load(&flash, PhysBlock(0), 4, &mut buf).unwrap();
        assert_eq!(j.record(), Some(record(4)));
        assert_eq!(j.next, Some(2));
        assert_eq!(j.generation, 2);
    }

    #[test]
    fn journal_wraps_by_erasing() {
        let mut flash = FakeFlash::new(2, 4);
        let mut buf = [0; SECTOR_SIZE];
        let mut j = Journal::load(&flash, PhysBlock(0), 4, &mut buf).unwrap();
        for n in 2..12 {
            j.append(&mut flash, record(n), &mut buf).unwrap();
            let reloaded = Journal::load(&flash, PhysBlock(0), 4, &mut buf).unwrap();
            assert_eq!(reloaded.record(), Some(record(n)));
        }
        // Ten appends into four slots: erased at the fifth and ninth.
        assert_eq!(flash.erase_count(PhysBlock(0)), 2);
        assert_eq!(flash.erase_count(PhysBlock(1)), 0);
    }

    #[test]
    fn torn_append_is_skipped() {
        let mut flash = FakeFlash::new(2, 4);
        let mut buf = [0; SECTOR_SIZE];
        let mut j = Journal::load(&flash, PhysBlock(0), 4, &mut buf).unwrap();
        j.append(&mut flash, record(3), &mut buf).unwrap();
        flash.cut_power_after(0, true);
        assert!(j.append(&mut flash, record(4), &mut buf).is_err());
        flash.restore_power();

        let mut j = Journal::load(&flash, PhysBlock(0), 4, &mut buf).unwrap();
        assert_eq!(j.record(), Some(record(3)));
        assert_eq!(j.next, Some(2));
        j.append(&mut flash, record(5), &mut buf).unwrap();
        let j = Journal::load(&flash, PhysBlock(0), 4, &mut buf).unwrap();
        assert_eq!(j.record(), Some(record(5)));
    }
}

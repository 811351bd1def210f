// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sector-level access with verification, shared by every other module.

use crate::low_level::{
    is_erased, sector_data_mut, sector_head, sector_is_valid, sector_tag, seal_sector,
    Flash, PhysBlock, Sector, SectorHead, SectorTag, FILLER_FILL, TORN_FILL, UNWRITTEN_FILL,
};
use crate::tables::{LogBlock, LogTable, LogicalEntry};
use crate::{Error, Fatal};

/// Outcome of a verified sector read.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Checked {
    /// The checksum matches the header.
    Valid,
    /// Every byte reads as erased.
    Erased,
    /// Anything else, after retries: a torn program or plain garbage.
    Corrupt,
}

/// A flash device plus the parameters needed to talk to it.
pub(crate) struct Device<F> {
    pub flash: F,
    pub spb: u8,
    retries: u8,
    verify: bool,
}

impl<F: Flash> Device<F> {
    pub fn new(flash: F, spb: u8, retries: u8, verify: bool) -> Self {
        Self { flash, spb, retries, verify }
    }

    pub fn into_inner(self) -> F {
        self.flash
    }

    /// Reads `lba` into `out` and classifies what came back.
    ///
    /// A sector that fails its checksum is re-read up to the configured
    /// number of times before it's declared corrupt, to ride out marginal
    /// reads.
    pub fn read_checked(&self, lba: u32, out: &mut Sector) -> Result<Checked, F::Error> {
        for _ in 0..=self.retries {
            self.flash.read_sector(lba, out)?;
            if sector_is_valid(out) {
                return Ok(Checked::Valid);
            }
            if is_erased(out) {
                return Ok(Checked::Erased);
            }
        }
        Ok(Checked::Corrupt)
    }

    /// Programs `buf` into `lba`, and if write verification is on, reads it
    /// back to make sure it stuck.
    pub fn program(&mut self, lba: u32, buf: &Sector) -> Result<(), Error<F::Error>> {
        self.flash.program_sector(lba, buf)?;
        self.verify_program(lba, buf)
    }

    fn verify_program(&mut self, lba: u32, buf: &Sector) -> Result<(), Error<F::Error>> {
        if self.verify {
            let mut readback = [0; crate::low_level::SECTOR_SIZE];
            for _ in 0..=self.retries {
                self.flash.read_sector(lba, &mut readback)?;
                if readback == *buf {
                    return Ok(());
                }
            }
            return fatal!(Fatal::WriteNotDurable { lba });
        }
        Ok(())
    }

    pub fn erase(&mut self, block: PhysBlock) -> Result<(), F::Error> {
        trace!("erase block {}", block.0);
        self.flash.erase_block(block)
    }

    /// Checks whether `block` reads erased. A shallow check samples the
    /// first two and the last sector; a deep one reads every sector.
    pub fn block_blank(&self, block: PhysBlock, deep: bool, buf: &mut Sector) -> Result<bool, F::Error> {
        let last = self.spb - 1;
        let mut check = |slot: u8| -> Result<bool, F::Error> {
            self.flash.read_sector_raw(block.lba(self.spb, slot), buf)?;
            Ok(is_erased(buf))
        };
        if deep {
            for slot in 0..self.spb {
                if !check(slot)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
        for slot in [0, 1.min(last), last] {
            if !check(slot)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Erases `block` unless it already reads blank. Returns whether it
    /// erased.
    pub fn erase_if_used(&mut self, block: PhysBlock, deep: bool, buf: &mut Sector) -> Result<bool, F::Error> {
        if self.block_blank(block, deep, buf)? {
            return Ok(false);
        }
        self.erase(block)?;
        Ok(true)
    }

    /// Resolves logical sector `sector` of logical block `logical` and reads
    /// it into `out`.
    ///
    /// The log block wins if it holds the sector, otherwise the data block
    /// is read. Never-written sectors come back filled with
    /// `UNWRITTEN_FILL`; sectors that fail verification come back filled
    /// with `TORN_FILL`.
    pub fn read_logical(
        &self,
        logs: &LogTable,
        table: &[LogicalEntry],
        logical: u8,
        sector: u8,
        out: &mut Sector,
    ) -> Result<(), F::Error> {
        if let Some(log) = logs.find(logical) {
            if log.holds(sector) {
                return self.read_log(log, sector, out);
            }
        }
        self.read_data(table[usize::from(logical)], logical, sector, out)
    }

    pub fn read_log(&self, log: &LogBlock, sector: u8, out: &mut Sector) -> Result<(), F::Error> {
        let lba = log.phys.lba(self.spb, log.slot_of(sector));
        let ok = self.read_checked(lba, out)? == Checked::Valid && {
            let h = sector_head(out);
            h.logical_blk == log.logical && h.blkseq == log.seq && h.sector == sector
        };
        if ok {
            present(out);
        } else {
            warn!("log sector {} of logical block {} failed verification", sector, log.logical);
            fill(out, log.logical, sector, TORN_FILL);
        }
        Ok(())
    }

    /// Reads logical `sector` from the data block described by `entry`.
    ///
    /// Data blocks keep the slot-0 swap of the log block they were merged
    /// into, so the directly addressed slot may hold a different sector. Its
    /// header then names the slot holding ours.
    pub fn read_data(
        &self,
        entry: LogicalEntry,
        logical: u8,
        sector: u8,
        out: &mut Sector,
    ) -> Result<(), F::Error> {
        let block = match entry.phys {
            Some(b) => b,
            None => {
                fill(out, logical, sector, UNWRITTEN_FILL);
                return Ok(());
            }
        };
        let mut state = self.read_checked(block.lba(self.spb, sector), out)?;
        if state == Checked::Valid {
            let other = sector_head(out).sector;
            if other != sector && other < self.spb {
                state = self.read_checked(block.lba(self.spb, other), out)?;
            }
        }
        let ok = state == Checked::Valid && {
            let h = sector_head(out);
            h.logical_blk == logical && h.sector == sector
        };
        if ok {
            present(out);
        } else {
            warn!("data sector {} of logical block {} in block {} failed verification",
                sector, logical, block.0);
            fill(out, logical, sector, TORN_FILL);
        }
        Ok(())
    }

    /// Seals `buf` as logical `sector` of `log` and programs it into the
    /// slot the sector maps to.
    ///
    /// The slot is recorded in `log`'s map once the device accepts the
    /// program, and not before, so after an error the map still describes
    /// what is on flash.
    pub fn program_log_sector(
        &mut self,
        log: &mut LogBlock,
        sector: u8,
        tag: SectorTag,
        buf: &mut Sector,
    ) -> Result<(), Error<F::Error>> {
        if !log.map.get(0) {
            log.sector_1st = sector;
        }
        let slot = log.slot_of(sector);
        debug_assert!(!log.map.get(slot));
        seal_sector(buf, SectorHead {
            logical_blk: log.logical,
            blkseq: log.seq,
            sector,
        }, tag);
        let lba = log.phys.lba(self.spb, slot);
        self.flash.program_sector(lba, buf)?;
        log.map.set(slot);
        self.verify_program(lba, buf)
    }
}

/// Presents a verified sector to callers: merge fillers read as unwritten.
fn present(out: &mut Sector) {
    if sector_tag(out) == SectorTag::Filler {
        sector_data_mut(out).fill(UNWRITTEN_FILL);
    }
}

/// Synthesizes a sector for logical `sector` whose payload is all `byte`.
pub(crate) fn fill(out: &mut Sector, logical: u8, sector: u8, byte: u8) {
    sector_data_mut(out).fill(byte);
    seal_sector(out, SectorHead {
        logical_blk: logical,
        blkseq: 0,
        sector,
    }, SectorTag::Fresh);
}

/// Marks `out` as a merge filler.
pub(crate) fn fill_filler(out: &mut Sector) {
    sector_data_mut(out).fill(FILLER_FILL);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_flash::FakeFlash;
    use crate::low_level::{sector_data, SECTOR_SIZE};

    fn device() -> Device<FakeFlash> {
        Device::new(FakeFlash::new(4, 8), 8, 1, true)
    }

    #[test]
    fn checked_reads_classify() {
        let mut dev = device();
        let mut buf = [0; SECTOR_SIZE];
        assert_eq!(dev.read_checked(0, &mut buf), Ok(Checked::Erased));

        fill(&mut buf, 1, 2, 0x11);
        dev.program(0, &buf).unwrap();
        assert_eq!(dev.read_checked(0, &mut buf), Ok(Checked::Valid));

        dev.flash.poke(1, 100, 0);
        assert_eq!(dev.read_checked(1, &mut buf), Ok(Checked::Corrupt));
    }

    #[test]
    fn data_reads_follow_first_sector_swap() {
        let mut dev = device();
        let mut log = LogBlock::new(0, PhysBlock(1), 1);
        let mut buf = [0; SECTOR_SIZE];
        // First write is sector 3, so it lands in slot 0.
        for sector in [3, 0, 1, 2, 4, 5, 6, 7] {
            sector_data_mut(&mut buf).fill(sector);
            dev.program_log_sector(&mut log, sector, SectorTag::Fresh, &mut buf).unwrap();
        }
        assert_eq!(sector_head(dev.flash.sector(8).try_into().unwrap()).sector, 3);
        assert_eq!(sector_head(dev.flash.sector(11).try_into().unwrap()).sector, 0);

        let entry = LogicalEntry { phys: Some(PhysBlock(1)), seq: 1 };
        for sector in 0..8 {
            dev.read_data(entry, 0, sector, &mut buf).unwrap();
            assert!(sector_data(&buf).iter().all(|&b| b == sector), "sector {sector}");
        }
    }

    #[test]
    fn unwritten_and_filler_sectors_read_as_fill() {
        let mut dev = device();
        let mut buf = [0; SECTOR_SIZE];
        dev.read_data(LogicalEntry::default(), 2, 5, &mut buf).unwrap();
        assert!(sector_data(&buf).iter().all(|&b| b == UNWRITTEN_FILL));

        let mut log = LogBlock::new(0, PhysBlock(2), 1);
        fill_filler(&mut buf);
        dev.program_log_sector(&mut log, 0, SectorTag::Filler, &mut buf).unwrap();
        assert!(sector_data(dev.flash.sector(16).try_into().unwrap()).iter().all(|&b| b == FILLER_FILL));

        let entry = LogicalEntry { phys: Some(PhysBlock(2)), seq: 1 };
        dev.read_data(entry, 0, 0, &mut buf).unwrap();
        assert!(sector_data(&buf).iter().all(|&b| b == UNWRITTEN_FILL));
    }

    #[test]
    fn corrupt_sectors_read_as_torn() {
        let mut dev = device();
        let mut log = LogBlock::new(0, PhysBlock(1), 1);
        let mut buf = [0; SECTOR_SIZE];
        dev.program_log_sector(&mut log, 0, SectorTag::Fresh, &mut buf).unwrap();
        dev.flash.poke(8, 0, 0x7F);

        let entry = LogicalEntry { phys: Some(PhysBlock(1)), seq: 1 };
        dev.read_data(entry, 0, 0, &mut buf).unwrap();
        assert!(sector_data(&buf).iter().all(|&b| b == TORN_FILL));
    }

    #[test]
    fn blank_checks() {
        let mut dev = device();
        let mut buf = [0; SECTOR_SIZE];
        assert!(dev.block_blank(PhysBlock(3), true, &mut buf).unwrap());
        // Something in the middle of the block only shows up on a deep scan.
        dev.flash.poke(3 * 8 + 4, 9, 0);
        assert!(dev.block_blank(PhysBlock(3), false, &mut buf).unwrap());
        assert!(!dev.block_blank(PhysBlock(3), true, &mut buf).unwrap());
        assert!(dev.erase_if_used(PhysBlock(3), true, &mut buf).unwrap());
        assert!(!dev.erase_if_used(PhysBlock(3), true, &mut buf).unwrap());
        assert_eq!(dev.flash.erase_count(PhysBlock(3)), 1);
    }
}

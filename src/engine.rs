// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Read path, write path, merging and free block management.

use core::ops::{Deref, DerefMut};

use crate::device::fill_filler;
use crate::low_level::{
    is_erased, sector_data, sector_data_mut, sector_tag, Flash, PhysBlock, SectorTag,
    DATA_SIZE_PER_LOGICAL_SECTOR, SECTOR_SIZE, SPINOR_MAX_LOG_NUM,
};
use crate::tables::{LogBlock, LogicalEntry};
use crate::{Error, Fatal, Ftl, MoveMode, Region};

const DS: u32 = DATA_SIZE_PER_LOGICAL_SECTOR as u32;

/// Most free blocks allowed to wait for an erase before the ring is scrubbed.
///
/// A superseded data block keeps its header until erased, so every waiting
/// block can be an older generation of some logical block. Recovery orders
/// generations by wrapping comparison of 8-bit sequence numbers, which needs
/// all of them within 127 of each other: this many old ones, plus the data
/// block, its log block and a salvage copy.
pub(crate) const MAX_UNERASED_FREE: usize = 64;

/// What happens to a data block superseded by a merge.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Retire {
    /// Queue it on the free ring for a lazy erase.
    Recycle,
    /// Erase it immediately and keep it out of the ring. Used when the block
    /// is about to leave the logical area.
    EraseNow,
}

impl<F: Flash> Ftl<F> {
    /// Reads `buf.len()` bytes of logical space starting at `addr`.
    pub fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error<F::Error>> {
        if buf.is_empty() {
            return Ok(());
        }
        self.check_range(addr, buf.len())?;

        if self.read_cached(addr, buf) {
            return Ok(());
        }
        self.flush_pending()?;

        let mut addr = addr;
        let mut buf = buf;
        while !buf.is_empty() {
            let (logical, sector, offset) = self.locate(addr);
            let n = (DATA_SIZE_PER_LOGICAL_SECTOR - offset).min(buf.len());
            self.dev.read_logical(&self.logs, &self.logical, logical, sector, &mut self.scratch)?;
            buf[..n].copy_from_slice(&sector_data(&self.scratch)[offset..offset + n]);
            addr += n as u32;
            buf = &mut buf[n..];
        }
        Ok(())
    }

    /// Writes `data` into logical space starting at `addr`.
    ///
    /// A write that ends partway into a sector is held in RAM until a later
    /// write completes the sector, something else needs the log block, or
    /// `flush` is called.
    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), Error<F::Error>> {
        if data.is_empty() {
            return Ok(());
        }
        self.check_range(addr, data.len())?;

        let taken = self.write_cached(addr, data)?;
        let mut addr = addr + taken as u32;
        let mut data = &data[taken..];

        while !data.is_empty() {
            let (logical, sector, offset) = self.locate(addr);
            let n = (DATA_SIZE_PER_LOGICAL_SECTOR - offset).min(data.len());

            self.switch_log_block(logical)?;
            self.check_and_update_log_block(logical, sector)?;

            if offset != 0 || n != DATA_SIZE_PER_LOGICAL_SECTOR {
                // The log block doesn't hold this sector, or we'd have merged
                // above, so the data block has the current contents.
                let entry = self.logical[usize::from(logical)];
                self.dev.read_data(entry, logical, sector, &mut self.cache)?;
            }
            sector_data_mut(&mut self.cache)[offset..offset + n].copy_from_slice(&data[..n]);

            let log = self.logs.active_mut()
                .expect("check_and_update_log_block leaves an active log block");
            if offset + n < DATA_SIZE_PER_LOGICAL_SECTOR {
                log.pending = Some(sector);
            } else {
                self.dev.program_log_sector(log, sector, SectorTag::Fresh, &mut self.cache)?;
            }

            addr += n as u32;
            data = &data[n..];
        }
        Ok(())
    }

    /// Reads in either addressing mode.
    pub fn read_in(&mut self, region: Region, addr: u32, buf: &mut [u8]) -> Result<(), Error<F::Error>> {
        match region {
            Region::Logical => self.read(addr, buf),
            Region::Physical => self.read_physical(addr, buf),
        }
    }

    /// Writes in either addressing mode.
    pub fn write_in(&mut self, region: Region, addr: u32, data: &[u8]) -> Result<(), Error<F::Error>> {
        match region {
            Region::Logical => self.write(addr, data),
            Region::Physical => self.write_physical(addr, data),
        }
    }

    /// Reads raw flash inside the physical area. `addr` is a device byte
    /// address; neither it nor the length need be sector aligned.
    pub fn read_physical(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error<F::Error>> {
        if buf.is_empty() {
            return Ok(());
        }
        self.check_physical_span(addr, buf.len())?;

        let sector = SECTOR_SIZE as u32;
        if addr % sector == 0 && buf.len() % SECTOR_SIZE == 0 {
            self.dev.flash.read_sectors(addr / sector, buf)?;
            return Ok(());
        }

        let mut lba = addr / sector;
        let mut buf = buf;
        let head = (addr % sector) as usize;
        if head != 0 {
            let n = (SECTOR_SIZE - head).min(buf.len());
            self.dev.flash.read_sector(lba, &mut self.scratch)?;
            buf[..n].copy_from_slice(&self.scratch[head..head + n]);
            buf = &mut buf[n..];
            lba += 1;
        }
        let whole = buf.len() / SECTOR_SIZE * SECTOR_SIZE;
        let (middle, tail) = buf.split_at_mut(whole);
        if !middle.is_empty() {
            self.dev.flash.read_sectors(lba, middle)?;
            lba += (whole / SECTOR_SIZE) as u32;
        }
        if !tail.is_empty() {
            self.dev.flash.read_sector(lba, &mut self.scratch)?;
            let n = tail.len();
            tail.copy_from_slice(&self.scratch[..n]);
        }
        Ok(())
    }

    /// Programs raw flash inside the physical area. `addr` and the length
    /// must be sector aligned and the destination must be erased.
    pub fn write_physical(&mut self, addr: u32, data: &[u8]) -> Result<(), Error<F::Error>> {
        if data.is_empty() {
            return Ok(());
        }
        if addr % SECTOR_SIZE as u32 != 0 || data.len() % SECTOR_SIZE != 0 {
            return Err(Error::NotPermitted);
        }
        self.check_physical_span(addr, data.len())?;

        let lba = addr / SECTOR_SIZE as u32;
        if self.config.verify_writes {
            self.dev.flash.read_sector_raw(lba, &mut self.scratch)?;
            if !is_erased(&self.scratch) {
                return fatal!(Fatal::NotErased { lba });
            }
        }
        self.dev.flash.program_sectors(lba, data)?;
        if self.config.verify_writes {
            self.dev.flash.read_sector(lba, &mut self.scratch)?;
            if self.scratch[..] != data[..SECTOR_SIZE] {
                return fatal!(Fatal::WriteNotDurable { lba });
            }
        }
        Ok(())
    }

    /// Commits the sector held in the write-combining buffer, if any.
    pub fn flush(&mut self) -> Result<(), Error<F::Error>> {
        self.flush_pending()
    }

    /// Merges the active log block into a new data block.
    pub fn swap(&mut self) -> Result<(), Error<F::Error>> {
        let active = self.logs.active_index();
        self.merge_slot(active, Retire::Recycle)
    }

    /// Copies whole logical sectors from `src` to `dst`. Addresses and
    /// `size` must be multiples of the logical sector payload, and `dst`
    /// must not lie above `src`.
    ///
    /// Each copied sector is tagged with the logical sector it came from,
    /// which lets `MoveMode::SkipMoved` resume an interrupted move without
    /// copying again what already landed.
    pub fn move_sectors(
        &mut self,
        dst: u32,
        src: u32,
        size: u32,
        mode: MoveMode,
    ) -> Result<(), Error<F::Error>> {
        if dst % DS != 0 || src % DS != 0 || size % DS != 0 || dst > src {
            return Err(Error::InvalidArgument);
        }
        if size == 0 {
            return Ok(());
        }
        self.check_range(src, size as usize)?;

        self.flush_pending()?;

        let spb = u32::from(self.geometry.sectors_per_block);
        let mut skipping = mode == MoveMode::SkipMoved;
        let mut dst_lba = dst / DS;
        let mut src_lba = src / DS;
        for _ in 0..size / DS {
            let (dst_blk, dst_sector) = ((dst_lba / spb) as u8, (dst_lba % spb) as u8);
            let (src_blk, src_sector) = ((src_lba / spb) as u8, (src_lba % spb) as u8);
            // Logical sector numbers stay well below the reserved tag values.
            let tag = SectorTag::MovedFrom(src_lba as u16);

            let already = skipping && {
                self.dev.read_logical(&self.logs, &self.logical, dst_blk, dst_sector, &mut self.scratch)?;
                sector_tag(&self.scratch) == tag
            };
            if already {
                dst_lba += 1;
                src_lba += 1;
                continue;
            }
            skipping = false;

            self.switch_log_block(dst_blk)?;
            self.check_and_update_log_block(dst_blk, dst_sector)?;
            self.dev.read_logical(&self.logs, &self.logical, src_blk, src_sector, &mut self.cache)?;
            let log = self.logs.active_mut()
                .expect("check_and_update_log_block leaves an active log block");
            self.dev.program_log_sector(log, dst_sector, tag, &mut self.cache)?;

            dst_lba += 1;
            src_lba += 1;
        }
        Ok(())
    }

    /// Lends a free block to an outside user. The active log block is merged
    /// first so the ring holds as much as it can.
    ///
    /// The block comes back erased. It returns to the free ring, as needing
    /// an erase, when the guard is given back or dropped; until then the
    /// guard holds this `Ftl` exclusively.
    pub fn borrow_block(&mut self) -> Result<BorrowedBlock<'_, F>, Error<F::Error>> {
        self.swap()?;
        for i in 0..SPINOR_MAX_LOG_NUM {
            if !self.free.is_empty() {
                break;
            }
            self.merge_slot(i, Retire::Recycle)?;
        }
        let block = match self.free.pop() {
            Some(fb) => {
                if !fb.erased {
                    self.dev.erase(fb.block)?;
                }
                fb.block
            }
            None => return Err(Error::NoSpace),
        };
        trace!("lent block {}", block.0);
        Ok(BorrowedBlock { ftl: self, block, returned: false })
    }

    // ------------------------------------------------------------------
    // Internals.

    fn check_range(&self, addr: u32, len: usize) -> Result<(), Error<F::Error>> {
        let end = u64::from(addr) + len as u64;
        if end > u64::from(self.logical_size()) {
            return Err(Error::OutOfRange);
        }
        Ok(())
    }

    fn check_physical_span(&self, addr: u32, len: usize) -> Result<(), Error<F::Error>> {
        let block_bytes = u64::from(self.geometry.block_bytes());
        let phys = self.geometry.physical;
        let first = u64::from(addr) / block_bytes;
        let end = (u64::from(addr) + len as u64 + block_bytes - 1) / block_bytes;
        if first < u64::from(phys.start) || end > u64::from(phys.end()) {
            return Err(Error::NotPermitted);
        }
        Ok(())
    }

    /// Splits a logical address into logical block, logical sector and
    /// offset within the sector payload.
    fn locate(&self, addr: u32) -> (u8, u8, usize) {
        let spb = u32::from(self.geometry.sectors_per_block);
        let lba = addr / DS;
        ((lba / spb) as u8, (lba % spb) as u8, (addr % DS) as usize)
    }

    /// Logical address of the start of a logical sector.
    fn sector_address(&self, logical: u8, sector: u8) -> u32 {
        let spb = u32::from(self.geometry.sectors_per_block);
        (u32::from(logical) * spb + u32::from(sector)) * DS
    }

    /// The pending sector's logical block, sector number and address.
    fn pending(&self) -> Option<(u8, u8, u32)> {
        let log = self.logs.active()?;
        let sector = log.pending?;
        Some((log.logical, sector, self.sector_address(log.logical, sector)))
    }

    /// Serves a read entirely from the write-combining buffer, if it can.
    fn read_cached(&self, addr: u32, buf: &mut [u8]) -> bool {
        let start = match self.pending() {
            Some((_, _, start)) => start,
            None => return false,
        };
        let end = u64::from(addr) + buf.len() as u64;
        if addr < start || end > u64::from(start + DS) {
            return false;
        }
        let offset = (addr - start) as usize;
        buf.copy_from_slice(&sector_data(&self.cache)[offset..offset + buf.len()]);
        true
    }

    /// Applies as much of a write as falls into the pending sector, flushing
    /// the sector if the write completes it or doesn't touch it at all.
    /// Returns the number of bytes consumed.
    fn write_cached(&mut self, addr: u32, data: &[u8]) -> Result<usize, Error<F::Error>> {
        let start = match self.pending() {
            Some((_, _, start)) => start,
            None => return Ok(0),
        };
        if addr < start || addr >= start + DS {
            self.flush_pending()?;
            return Ok(0);
        }
        let offset = (addr - start) as usize;
        let n = (DATA_SIZE_PER_LOGICAL_SECTOR - offset).min(data.len());
        sector_data_mut(&mut self.cache)[offset..offset + n].copy_from_slice(&data[..n]);
        if offset + n == DATA_SIZE_PER_LOGICAL_SECTOR {
            self.flush_pending()?;
        }
        Ok(n)
    }

    pub(crate) fn flush_pending(&mut self) -> Result<(), Error<F::Error>> {
        let log = match self.logs.active_mut() {
            Some(log) => log,
            None => return Ok(()),
        };
        if let Some(sector) = log.pending {
            self.dev.program_log_sector(log, sector, SectorTag::Fresh, &mut self.cache)?;
            log.pending = None;
        }
        Ok(())
    }

    /// Points the active log slot at the one that should serve `logical`.
    fn switch_log_block(&mut self, logical: u8) -> Result<(), Error<F::Error>> {
        if self.logs.active().map(|l| l.logical) == Some(logical) {
            return Ok(());
        }
        self.flush_pending()?;
        self.logs.select(logical);
        Ok(())
    }

    /// Makes sure the active slot holds a log block for `logical` with room
    /// for `sector`, merging whatever was there if not.
    fn check_and_update_log_block(&mut self, logical: u8, sector: u8) -> Result<(), Error<F::Error>> {
        let index = self.logs.active_index();
        match self.logs.active() {
            Some(log) if log.logical == logical && !log.holds(sector) => return Ok(()),
            Some(_) => self.merge_slot(index, Retire::Recycle)?,
            None => (),
        }
        self.new_log_block(index, logical)
    }

    fn new_log_block(&mut self, index: usize, logical: u8) -> Result<(), Error<F::Error>> {
        let block = self.take_free_block(index)?;
        let seq = self.logical[usize::from(logical)].seq.wrapping_add(1);
        trace!("log block {} for logical block {} seq {}", block.0, logical, seq);
        self.logs.put(index, LogBlock::new(logical, block, seq));
        Ok(())
    }

    /// Takes a block off the free ring, erasing it if needed. If the ring is
    /// empty, merges log blocks other than the one in slot `keep` until a
    /// superseded data block turns up.
    fn take_free_block(&mut self, keep: usize) -> Result<PhysBlock, Error<F::Error>> {
        loop {
            if let Some(fb) = self.free.pop() {
                if !fb.erased {
                    self.dev.erase(fb.block)?;
                }
                return Ok(fb.block);
            }
            let victim = (0..SPINOR_MAX_LOG_NUM)
                .find(|&i| i != keep && self.logs.slot(i).is_some());
            match victim {
                Some(i) => self.merge_slot(i, Retire::Recycle)?,
                None => return fatal!(Fatal::OutOfBlocks),
            }
        }
    }

    /// Merges the log block in slot `index`, if any, and empties the slot.
    pub(crate) fn merge_slot(&mut self, index: usize, retire: Retire) -> Result<(), Error<F::Error>> {
        if index == self.logs.active_index() {
            self.flush_pending()?;
        }
        let mut log = match self.logs.take(index) {
            Some(log) => log,
            None => return Ok(()),
        };
        let result = self.merge_log(&mut log, retire);
        // Unless the swap into the logical table happened, the slot keeps the
        // log with the map of what actually reached flash, so a retry picks up
        // where this attempt stopped.
        if result.is_err() && self.logical[usize::from(log.logical)].phys != Some(log.phys) {
            self.logs.put(index, log);
        }
        result
    }

    /// Fills every unwritten slot of `log` in place, from the current data
    /// block or with filler, then makes `log` the data block.
    ///
    /// The table swap happens only once the whole block is on flash, so a
    /// power loss part way through leaves the old data block authoritative.
    pub(crate) fn merge_log(&mut self, log: &mut LogBlock, retire: Retire) -> Result<(), Error<F::Error>> {
        debug_assert!(log.pending.is_none());
        let entry = self.logical[usize::from(log.logical)];
        for sector in 0..self.geometry.sectors_per_block {
            if log.holds(sector) {
                continue;
            }
            let tag = match entry.phys {
                Some(_) => {
                    self.dev.read_data(entry, log.logical, sector, &mut self.scratch)?;
                    let tag = sector_tag(&self.scratch);
                    if tag == SectorTag::Filler {
                        fill_filler(&mut self.scratch);
                    }
                    tag
                }
                None => {
                    fill_filler(&mut self.scratch);
                    SectorTag::Filler
                }
            };
            self.dev.program_log_sector(log, sector, tag, &mut self.scratch)?;
        }

        self.logical[usize::from(log.logical)] = LogicalEntry {
            phys: Some(log.phys),
            seq: log.seq,
        };
        trace!("merged logical block {} into block {}", log.logical, log.phys.0);
        if let Some(old) = entry.phys {
            match retire {
                Retire::Recycle => {
                    self.free.push_dirty(old);
                    if self.free.dirty_len() >= MAX_UNERASED_FREE {
                        trace!("scrubbing {} free blocks", self.free.dirty_len());
                        let dev = &mut self.dev;
                        self.free.scrub(|b| dev.erase(b))?;
                    }
                }
                Retire::EraseNow => self.dev.erase(old)?,
            }
        }
        Ok(())
    }
}

/// A free block on loan from an `Ftl`. See `Ftl::borrow_block`.
pub struct BorrowedBlock<'a, F: Flash> {
    ftl: &'a mut Ftl<F>,
    block: PhysBlock,
    returned: bool,
}

impl<F: Flash> BorrowedBlock<'_, F> {
    pub fn block(&self) -> PhysBlock {
        self.block
    }

    /// Returns the block to the free ring.
    pub fn give_back(mut self) {
        self.put_back();
    }

    fn put_back(&mut self) {
        if !self.returned {
            self.returned = true;
            self.ftl.free.push_dirty(self.block);
            trace!("block {} returned", self.block.0);
        }
    }
}

/// Gives access to the device, so the borrowed block can be programmed.
impl<F: Flash> Deref for BorrowedBlock<'_, F> {
    type Target = F;

    fn deref(&self) -> &F {
        &self.ftl.dev.flash
    }
}

impl<F: Flash> DerefMut for BorrowedBlock<'_, F> {
    fn deref_mut(&mut self) -> &mut F {
        &mut self.ftl.dev.flash
    }
}

impl<F: Flash> Drop for BorrowedBlock<'_, F> {
    fn drop(&mut self) {
        self.put_back();
    }
}

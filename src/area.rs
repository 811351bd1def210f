// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Moving the boundary between the logical and physical areas.

use crate::engine::Retire;
use crate::low_level::{
    is_erased, BlockRange, Flash, PartitionRecord, PhysBlock, SPINOR_MAX_LOG_NUM,
};
use crate::tables::LogBlock;
use crate::{AreaSide, Error, Fatal, Ftl, Geometry};

/// Result of `Ftl::new_physical_area`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NewArea {
    /// Device byte address of the carved blocks.
    pub address: u32,
    /// Size of the carved range, a whole number of blocks.
    pub size: u32,
    /// The record persisted for the new layout.
    pub record: PartitionRecord,
}

impl<F: Flash> Ftl<F> {
    /// Moves at least `size` bytes' worth of blocks from the logical area to
    /// the physical area, on the side the physical area already sits.
    ///
    /// The carved blocks must not be needed to hold logical data: the
    /// logical blocks that fall off the end of the shrunk logical space must
    /// already be unused (see `trim_unused_logical_area`). Data blocks that
    /// happen to sit in the carved range are copied elsewhere. The carved
    /// blocks come back erased.
    pub fn new_physical_area(&mut self, size: u32) -> Result<NewArea, Error<F::Error>> {
        let g = self.geometry;
        let block_bytes = g.block_bytes();
        let blocks = (u64::from(size) + u64::from(block_bytes) - 1) / u64::from(block_bytes);
        if blocks == 0 {
            return Err(Error::InvalidArgument);
        }
        let n = u8::try_from(blocks).map_err(|_| Error::NoSpace)?;
        let remaining = match g.logical.len.checked_sub(n) {
            Some(r) if r >= 2 => r,
            _ => return Err(Error::NoSpace),
        };

        self.quiesce()?;
        if usize::from(n) >= self.free.len() {
            return Err(Error::NoSpace);
        }
        let kept = usize::from(remaining - 1);
        if self.logical[kept..].iter().any(|e| e.phys.is_some()) {
            return Err(Error::NotPermitted);
        }

        let carved = match g.side {
            AreaSide::Front => BlockRange::new(g.logical.start, n),
            AreaSide::Back => BlockRange::new((g.logical.end() - u16::from(n)) as u8, n),
        };
        info!("carving blocks {:?} out of logical area {:?}", carved, g.logical);

        for block in carved.blocks() {
            if let Some(fb) = self.free.remove(block) {
                if !fb.erased {
                    self.dev.erase(block)?;
                }
            }
        }

        for logical in 0..remaining - 1 {
            let entry = self.logical[usize::from(logical)];
            let old = match entry.phys {
                Some(b) if carved.contains(b) => b,
                _ => continue,
            };
            let target = match self.free.pop() {
                Some(fb) => {
                    if !fb.erased {
                        self.dev.erase(fb.block)?;
                    }
                    fb.block
                }
                None => return fatal!(Fatal::OutOfBlocks),
            };
            trace!("relocating logical block {} from block {} to {}", logical, old.0, target.0);
            let mut log = LogBlock::new(logical, target, entry.seq.wrapping_add(1));
            self.merge_log(&mut log, Retire::EraseNow)?;
        }

        self.geometry = Geometry::split(g.sectors_per_block, g.span, g.physical.len + n, g.side);
        self.persist()?;

        Ok(NewArea {
            address: PhysBlock(carved.start).byte_address(g.sectors_per_block),
            size: u32::from(n) * block_bytes,
            record: self.geometry.record(self.config.firmware_lba_offset),
        })
    }

    /// Checks that `[addr, addr + size)` is a block-aligned range inside the
    /// physical area, and returns it as blocks.
    pub fn check_physical_area(&self, addr: u32, size: u32) -> Result<BlockRange, Error<F::Error>> {
        let block_bytes = self.geometry.block_bytes();
        if addr % block_bytes != 0 || size % block_bytes != 0 {
            return Err(Error::InvalidArgument);
        }
        let start = u8::try_from(addr / block_bytes).map_err(|_| Error::NotPermitted)?;
        let len = u8::try_from(size / block_bytes).map_err(|_| Error::NotPermitted)?;
        let range = BlockRange::new(start, len);
        if !self.geometry.physical.covers(range) {
            return Err(Error::NotPermitted);
        }
        Ok(range)
    }

    /// Hands blocks of the physical area back to the logical area. The range
    /// must border the logical area. Blocks are erased as needed.
    pub fn del_physical_area(&mut self, addr: u32, size: u32) -> Result<PartitionRecord, Error<F::Error>> {
        let range = self.check_physical_area(addr, size)?;
        let g = self.geometry;
        let borders = match g.side {
            AreaSide::Front => range.end() == u16::from(g.logical.start),
            AreaSide::Back => u16::from(range.start) == g.logical.end(),
        };
        if !borders {
            return Err(Error::NotPermitted);
        }
        let referenced = self.logical.iter().filter_map(|e| e.phys)
            .chain(self.logs.iter().map(|l| l.phys))
            .chain(self.free.iter())
            .any(|b| range.contains(b));
        if referenced {
            return Err(Error::NotPermitted);
        }

        self.flush_pending()?;
        let dev = &mut self.dev;
        self.free.scrub(|b| dev.erase(b))?;
        for block in range.blocks() {
            self.dev.erase_if_used(block, true, &mut self.scratch)?;
            self.free.push_clean(block);
        }

        self.geometry = Geometry::split(g.sectors_per_block, g.span, g.physical.len - range.len, g.side);
        info!("returned blocks {:?}, logical area now {:?}", range, self.geometry.logical);
        self.persist()?;
        Ok(self.geometry.record(self.config.firmware_lba_offset))
    }

    /// Finds how much of a physical area range is in use, assuming it's
    /// filled from the front. Walking back from the end, blank blocks are
    /// skipped. The first block that is programmed near its start but not at
    /// its end is erased and counted as unused; the first block whose last
    /// sector is programmed ends the walk.
    ///
    /// Returns the byte length of the used prefix.
    pub fn trim_physical_area(&mut self, addr: u32, size: u32) -> Result<u32, Error<F::Error>> {
        let range = self.check_physical_area(addr, size)?;
        self.flush_pending()?;

        let spb = self.geometry.sectors_per_block;
        let mut used = range.len;
        for block in range.blocks().rev() {
            self.dev.flash.read_sector_raw(block.lba(spb, spb - 1), &mut self.scratch)?;
            if !is_erased(&self.scratch) {
                break;
            }
            used -= 1;
            if self.dev.erase_if_used(block, false, &mut self.scratch)? {
                info!("erased partly written block {}", block.0);
                break;
            }
        }
        Ok(u32::from(used) * self.geometry.block_bytes())
    }

    /// Releases every logical block from the first one starting at or after
    /// `start` to the end of the logical space. Their contents read as never
    /// written afterwards.
    pub fn trim_unused_logical_area(&mut self, start: u32) -> Result<(), Error<F::Error>> {
        let dpb = u64::from(self.geometry.data_per_block());
        let first = (u64::from(start) + dpb - 1) / dpb;
        if first * dpb > u64::from(self.logical_size()) {
            return Err(Error::NotPermitted);
        }
        let first = first as u8;

        for i in 0..SPINOR_MAX_LOG_NUM {
            if self.logs.slot(i).map_or(false, |l| l.logical >= first) {
                if let Some(log) = self.logs.take(i) {
                    self.free.push_dirty(log.phys);
                }
            }
        }
        let mut released = 0;
        for entry in &mut self.logical[usize::from(first)..] {
            if let Some(block) = entry.phys.take() {
                self.free.push_dirty(block);
                released += 1;
            }
        }

        let dev = &mut self.dev;
        self.free.scrub(|b| dev.erase(b))?;
        info!("trimmed logical blocks from {}, {} data blocks released", first, released);
        Ok(())
    }

    /// Merges every log block.
    fn quiesce(&mut self) -> Result<(), Error<F::Error>> {
        for i in 0..SPINOR_MAX_LOG_NUM {
            self.merge_slot(i, Retire::Recycle)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_flash::FakeFlash;
    use crate::low_level::SECTOR_SIZE;
    use crate::{Census, Config};

    const DPB: u32 = 4 * 505;
    const BLOCK: u32 = 4 * SECTOR_SIZE as u32;

    fn pattern(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed ^ (i as u8).wrapping_mul(13)).collect()
    }

    fn fill_blocks(ftl: &mut Ftl<FakeFlash>, count: u8) {
        for b in 0..count {
            ftl.write(u32::from(b) * DPB, &pattern(b, DPB as usize)).unwrap();
        }
    }

    fn check_blocks(ftl: &mut Ftl<FakeFlash>, count: u8) {
        let mut buf = vec![0; DPB as usize];
        for b in 0..count {
            ftl.read(u32::from(b) * DPB, &mut buf).unwrap();
            assert_eq!(buf, pattern(b, DPB as usize), "logical block {b}");
        }
    }

    #[test]
    fn carve_from_front_relocates_data() {
        let config = Config { side: AreaSide::Front, ..Config::default() };
        let mut ftl = Ftl::open(FakeFlash::new(10, 4), config).unwrap();
        fill_blocks(&mut ftl, 4);

        let area = ftl.new_physical_area(3000).unwrap();
        assert_eq!(area.address, BLOCK);
        assert_eq!(area.size, 2 * BLOCK);
        assert_eq!(ftl.geometry().physical, BlockRange::new(1, 2));
        assert_eq!(ftl.geometry().logical, BlockRange::new(3, 7));
        assert_eq!(ftl.logical_size(), 6 * DPB);
        assert_eq!(ftl.record(), Some(area.record));
        assert_eq!(area.record.physical(), Some(BlockRange::new(1, 2)));

        // Relocated away and left erased for the new owner.
        assert!(ftl.dev.block_blank(PhysBlock(1), true, &mut [0; SECTOR_SIZE]).unwrap());
        assert!(ftl.dev.block_blank(PhysBlock(2), true, &mut [0; SECTOR_SIZE]).unwrap());
        check_blocks(&mut ftl, 4);

        let mut ftl = Ftl::open(ftl.close().unwrap(), config).unwrap();
        assert_eq!(ftl.geometry().logical, BlockRange::new(3, 7));
        check_blocks(&mut ftl, 4);
    }

    #[test]
    fn carve_rejections() {
        let mut ftl = Ftl::open(FakeFlash::new(10, 4), Config::default()).unwrap();
        assert_eq!(ftl.new_physical_area(0), Err(Error::InvalidArgument));
        assert_eq!(ftl.new_physical_area(8 * BLOCK), Err(Error::NoSpace));
        assert_eq!(ftl.new_physical_area(u32::MAX), Err(Error::NoSpace));

        // The last logical block is in use, so it can't go away.
        ftl.write(7 * DPB, &[1; 600]).unwrap();
        assert_eq!(ftl.new_physical_area(BLOCK), Err(Error::NotPermitted));
        ftl.trim_unused_logical_area(7 * DPB).unwrap();
        let area = ftl.new_physical_area(BLOCK).unwrap();
        assert_eq!(area.address, 9 * BLOCK);
        assert_eq!(ftl.geometry().logical, BlockRange::new(1, 8));
    }

    #[test]
    fn check_area_bounds() {
        let config = Config { physical_blocks: 3, ..Config::default() };
        let ftl = Ftl::open(FakeFlash::new(10, 4), config).unwrap();
        assert_eq!(ftl.geometry().physical, BlockRange::new(7, 3));

        assert_eq!(ftl.check_physical_area(7 * BLOCK, 3 * BLOCK), Ok(BlockRange::new(7, 3)));
        assert_eq!(ftl.check_physical_area(8 * BLOCK, BLOCK), Ok(BlockRange::new(8, 1)));
        assert_eq!(ftl.check_physical_area(7 * BLOCK + 512, BLOCK), Err(Error::InvalidArgument));
        assert_eq!(ftl.check_physical_area(7 * BLOCK, 100), Err(Error::InvalidArgument));
        assert_eq!(ftl.check_physical_area(6 * BLOCK, BLOCK), Err(Error::NotPermitted));
        assert_eq!(ftl.check_physical_area(8 * BLOCK, 3 * BLOCK), Err(Error::NotPermitted));
        assert_eq!(ftl.check_physical_area(1000 * BLOCK, BLOCK), Err(Error::NotPermitted));
    }

    #[test]
    fn delete_returns_blocks_to_logical_area() {
        let config = Config { physical_blocks: 3, ..Config::default() };
        let mut ftl = Ftl::open(FakeFlash::new(10, 4), config).unwrap();
        let before = ftl.census().free_blocks;
        ftl.write_physical(7 * BLOCK, &[0x42; 2 * SECTOR_SIZE]).unwrap();

        // Not next to the logical area.
        assert_eq!(ftl.del_physical_area(8 * BLOCK, BLOCK), Err(Error::NotPermitted));

        let record = ftl.del_physical_area(7 * BLOCK, BLOCK).unwrap();
        assert_eq!(record.logical(), Some(BlockRange::new(1, 7)));
        assert_eq!(record.physical(), Some(BlockRange::new(8, 2)));
        assert_eq!(ftl.logical_size(), 6 * DPB);
        assert_eq!(ftl.census().free_blocks, before + 1);
        assert_eq!(ftl.flash().erase_count(PhysBlock(7)), 1);

        // The returned block is usable logical space.
        fill_blocks(&mut ftl, 6);
        check_blocks(&mut ftl, 6);

        let mut ftl = Ftl::open(ftl.close().unwrap(), config).unwrap();
        assert_eq!(ftl.geometry().logical, BlockRange::new(1, 7));
        check_blocks(&mut ftl, 6);
    }

    #[test]
    fn trim_finds_used_prefix() {
        let config = Config { physical_blocks: 3, ..Config::default() };
        let mut ftl = Ftl::open(FakeFlash::new(10, 4), config).unwrap();
        // Block 7 fully written, block 8 only at the front.
        ftl.write_physical(7 * BLOCK, &[0x11; 4 * SECTOR_SIZE]).unwrap();
        ftl.write_physical(8 * BLOCK, &[0x22; SECTOR_SIZE]).unwrap();

        assert_eq!(ftl.trim_physical_area(7 * BLOCK, 3 * BLOCK), Ok(BLOCK));
        assert_eq!(ftl.flash().erase_count(PhysBlock(8)), 1);
        assert_eq!(ftl.flash().erase_count(PhysBlock(9)), 0);
        assert_eq!(ftl.flash().erase_count(PhysBlock(7)), 0);

        // Nothing left to trim the second time around.
        assert_eq!(ftl.trim_physical_area(7 * BLOCK, 3 * BLOCK), Ok(BLOCK));
        assert_eq!(ftl.trim_physical_area(8 * BLOCK, 2 * BLOCK), Ok(0));
        assert_eq!(ftl.trim_physical_area(7 * BLOCK, BLOCK), Ok(BLOCK));
    }

    #[test]
    fn trim_unused_logical_releases_blocks() {
        let mut ftl = Ftl::open(FakeFlash::new(10, 4), Config::default()).unwrap();
        fill_blocks(&mut ftl, 4);
        ftl.write(3 * DPB + 10, &[7; 20]).unwrap();

        // Rounds up to the next block boundary.
        ftl.trim_unused_logical_area(DPB - 100).unwrap();
        check_blocks(&mut ftl, 1);
        let mut buf = vec![0; 3 * DPB as usize];
        ftl.read(DPB, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAB));
        assert_eq!(ftl.census(), Census {
            data_blocks: 0,
            log_blocks: 1,
            free_blocks: 8,
            clean_free_blocks: 8,
        });

        // Stays trimmed across a reopen.
        let mut ftl = Ftl::open(ftl.close().unwrap(), Config::default()).unwrap();
        ftl.read(DPB, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAB));
        check_blocks(&mut ftl, 1);
    }

    #[test]
    fn trim_unused_logical_bounds() {
        let mut ftl = Ftl::open(FakeFlash::new(10, 4), Config::default()).unwrap();
        let size = ftl.logical_size();
        assert_eq!(ftl.trim_unused_logical_area(size), Ok(()));
        assert_eq!(ftl.trim_unused_logical_area(size + 1), Err(Error::NotPermitted));
        assert_eq!(ftl.trim_unused_logical_area(u32::MAX), Err(Error::NotPermitted));
    }
}

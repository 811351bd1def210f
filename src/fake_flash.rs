// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory NOR flash for tests.

use crate::low_level::{Flash, PhysBlock, Sector, SECTOR_SIZE};

/// Simulated NOR part. Erased bytes read as `0xFF`. Programming a sector
/// twice without an erase in between panics, since real parts would silently
/// AND the data together.
#[derive(Clone)]
pub struct FakeFlash {
    sectors_per_block: u8,
    data: Vec<u8>,
    programmed: Vec<bool>,
    erase_counts: Vec<u32>,
    programs: u64,
    cut: Option<PowerCut>,
    dead: bool,
}

#[derive(Copy, Clone, Debug)]
struct PowerCut {
    programs_left: u64,
    tear: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FakeFlashError {
    PowerLoss,
}

impl FakeFlash {
    pub fn new(blocks: u16, sectors_per_block: u8) -> Self {
        let sectors = usize::from(blocks) * usize::from(sectors_per_block);
        Self {
            sectors_per_block,
            data: vec![0xFF; sectors * SECTOR_SIZE],
            programmed: vec![false; sectors],
            erase_counts: vec![0; usize::from(blocks)],
            programs: 0,
            cut: None,
            dead: false,
        }
    }

    /// Arranges for power to fail on the program after the next `programs`
    /// successful ones. With `tear`, the failing program lands its first half
    /// before the lights go out.
    pub fn cut_power_after(&mut self, programs: u64, tear: bool) {
        self.cut = Some(PowerCut { programs_left: programs, tear });
    }

    pub fn restore_power(&mut self) {
        self.cut = None;
        self.dead = false;
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn sector(&self, lba: u32) -> &[u8] {
        let start = lba as usize * SECTOR_SIZE;
        &self.data[start..start + SECTOR_SIZE]
    }

    /// Overwrites one byte without any of the usual NOR rules, for simulating
    /// corruption.
    pub fn poke(&mut self, lba: u32, offset: usize, value: u8) {
        self.data[lba as usize * SECTOR_SIZE + offset] = value;
        self.programmed[lba as usize] = true;
    }

    pub fn erase_count(&self, block: PhysBlock) -> u32 {
        self.erase_counts[usize::from(block.0)]
    }

    pub fn total_erases(&self) -> u32 {
        self.erase_counts.iter().sum()
    }

    pub fn program_count(&self) -> u64 {
        self.programs
    }

    fn check_power(&self) -> Result<(), FakeFlashError> {
        if self.dead {
            Err(FakeFlashError::PowerLoss)
        } else {
            Ok(())
        }
    }
}

impl Flash for FakeFlash {
    type Error = FakeFlashError;

    fn block_count(&self) -> u16 {
        self.erase_counts.len() as u16
    }

    fn sectors_per_block(&self) -> u8 {
        self.sectors_per_block
    }

    fn read_sector(&self, lba: u32, dest: &mut Sector) -> Result<(), Self::Error> {
        self.check_power()?;
        dest.copy_from_slice(self.sector(lba));
        Ok(())
    }

    fn program_sector(&mut self, lba: u32, data: &Sector) -> Result<(), Self::Error> {
        self.check_power()?;
        let index = lba as usize;
        if self.programmed[index] {
            panic!("attempt to double-program sector {lba}");
        }
        let start = index * SECTOR_SIZE;
        if let Some(cut) = &mut self.cut {
            if cut.programs_left == 0 {
                if cut.tear {
                    let half = SECTOR_SIZE / 2;
                    self.data[start..start + half].copy_from_slice(&data[..half]);
                    self.programmed[index] = true;
                }
                self.dead = true;
                return Err(FakeFlashError::PowerLoss);
            }
            cut.programs_left -= 1;
        }
        self.data[start..start + SECTOR_SIZE].copy_from_slice(data);
        self.programmed[index] = true;
        self.programs += 1;
        Ok(())
    }

    fn erase_block(&mut self, block: PhysBlock) -> Result<(), Self::Error> {
        self.check_power()?;
        let spb = usize::from(self.sectors_per_block);
        let first = usize::from(block.0) * spb;
        self.data[first * SECTOR_SIZE..(first + spb) * SECTOR_SIZE].fill(0xFF);
        self.programmed[first..first + spb].fill(false);
        self.erase_counts[usize::from(block.0)] += 1;
        Ok(())
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reconstruction of the RAM tables from flash at open time.
//!
//! Nothing about the tables is persisted. Every sector header names the
//! logical block and sequence number it belongs to, so a scan of the logical
//! area finds each logical block's data block and log block, if any. The
//! metadata journal only records how the managed span is divided.

use alloc::vec::Vec;
use core::cmp::Ordering;

use crate::device::{fill_filler, Checked};
use crate::engine::Retire;
use crate::low_level::{
    sector_head, sector_tag, Flash, PhysBlock, RecordFlag, SectorTag,
};
use crate::meta::Journal;
use crate::tables::{swap_first, FreeRing, LogBlock, LogTable, LogicalEntry};
use crate::{sequence_compare, Error, Ftl, Geometry};

/// What sampling a block's first sectors says about it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Class {
    Erased,
    /// Programmed, but not by us, or torn on its very first sector.
    Garbage,
    Member { logical: u8, seq: u8 },
}

/// What a full scan of a member block found.
#[derive(Copy, Clone, Debug)]
enum Contents {
    /// Every slot holds a valid sector.
    Complete,
    /// Some slots are still erased.
    Partial(LogBlock),
    /// A slot failed verification, which is what a program interrupted by
    /// power loss leaves behind. The map covers the slots that did verify.
    Torn(LogBlock),
}

#[derive(Copy, Clone, Debug)]
struct Candidate {
    block: PhysBlock,
    seq: u8,
    contents: Contents,
}

/// How to bring the tables up, based on the journal.
#[derive(Copy, Clone, Debug)]
enum Plan {
    /// The persisted layout is current.
    Adopt(Geometry),
    /// The persisted layout is stale. Scan under the configured one and
    /// persist it; `deep` asks for every free block to be verified erased.
    Rescan { deep: bool },
    /// No usable layout. Erase the whole configured logical area.
    Format,
}

impl<F: Flash> Ftl<F> {
    pub(crate) fn rebuild(&mut self) -> Result<(), Error<F::Error>> {
        let meta = self.config.meta_block;
        let spb = self.geometry.sectors_per_block;
        self.journal = Journal::load(&self.dev.flash, meta, spb, &mut self.scratch)?;

        match self.plan() {
            Plan::Adopt(g) => {
                self.geometry = g;
                self.scan(false)?;
            }
            Plan::Rescan { deep } => {
                self.scan(deep)?;
                self.persist()?;
            }
            Plan::Format => {
                self.format()?;
                self.persist()?;
            }
        }

        let c = self.census();
        info!("rebuilt: {} data, {} log, {} free ({} erased), {} bytes logical",
            c.data_blocks, c.log_blocks, c.free_blocks, c.clean_free_blocks,
            self.logical_size());
        Ok(())
    }

    fn plan(&self) -> Plan {
        let configured = self.geometry;
        let record = match self.journal.record() {
            Some(r) => r,
            None => {
                info!("no partition record");
                return Plan::Format;
            }
        };
        let persisted = match Geometry::from_record(&record, &configured) {
            Some(g) => g,
            None => {
                warn!("partition record {:?} doesn't fit span {:?}", record, configured.span);
                return Plan::Format;
            }
        };

        let first_boot = record.flag() == RecordFlag::FirstBoot;
        let same_firmware = record.firmware_flash_lba_offset.get() == self.config.firmware_lba_offset;
        if same_firmware && !first_boot {
            return Plan::Adopt(persisted);
        }
        if !configured.logical.covers(persisted.logical) {
            warn!("configured logical area {:?} drops part of {:?}",
                configured.logical, persisted.logical);
            return Plan::Format;
        }
        info!("partition record is stale (first boot: {}), re-deriving layout", first_boot);
        Plan::Rescan { deep: first_boot }
    }

    fn reset_tables(&mut self) {
        self.logical.fill(LogicalEntry::default());
        self.logs = LogTable::default();
        self.free = FreeRing::with_capacity(usize::from(self.geometry.span.len));
    }

    /// Erases everything in the logical area.
    fn format(&mut self) -> Result<(), Error<F::Error>> {
        info!("formatting logical area {:?}", self.geometry.logical);
        self.reset_tables();
        for block in self.geometry.logical.blocks() {
            self.dev.erase_if_used(block, true, &mut self.scratch)?;
            self.free.push_clean(block);
        }
        Ok(())
    }

    fn scan(&mut self, deep: bool) -> Result<(), Error<F::Error>> {
        let g = self.geometry;
        let limit = g.logical_blocks();
        self.reset_tables();

        let mut clean = Vec::new();
        let mut dirty = Vec::new();
        let mut members: Vec<(u8, Candidate)> = Vec::new();
        for block in g.logical.blocks() {
            match self.classify(block)? {
                Class::Erased => clean.push(block),
                Class::Garbage => dirty.push(block),
                Class::Member { logical, seq } if logical < limit => {
                    let contents = self.scan_block(block, logical, seq)?;
                    members.push((logical, Candidate { block, seq, contents }));
                }
                Class::Member { logical, .. } => {
                    trace!("block {} holds logical block {}, past the end", block.0, logical);
                    dirty.push(block);
                }
            }
        }

        if deep {
            for &block in &clean {
                if self.dev.erase_if_used(block, true, &mut self.scratch)? {
                    info!("block {} wasn't fully erased", block.0);
                }
            }
        }

        let mut logs = Vec::new();
        let mut torn = Vec::new();
        for logical in 0..limit {
            let mut pool: Vec<Candidate> = members.iter()
                .filter(|(l, _)| *l == logical)
                .map(|(_, c)| *c)
                .collect();

            while let Some(i) = newest(&pool) {
                let c = pool.swap_remove(i);
                let log = match c.contents {
                    Contents::Complete => {
                        self.logical[usize::from(logical)] = LogicalEntry {
                            phys: Some(c.block),
                            seq: c.seq,
                        };
                        break;
                    }
                    Contents::Partial(log) | Contents::Torn(log) => log,
                };

                // A log block shadows the data block one generation older.
                let mut entry = LogicalEntry { phys: None, seq: c.seq.wrapping_sub(1) };
                if let Some(j) = pool.iter().position(|b| b.seq == entry.seq) {
                    if !matches!(pool[j].contents, Contents::Complete) {
                        // Only a salvage copies out of an incomplete block,
                        // and it was interrupted. Start it over.
                        warn!("dropping interrupted copy in block {}", c.block.0);
                        self.dev.erase(c.block)?;
                        clean.push(c.block);
                        continue;
                    }
                    entry.phys = Some(pool.swap_remove(j).block);
                }
                self.logical[usize::from(logical)] = entry;
                match c.contents {
                    Contents::Torn(_) => torn.push(log),
                    _ => logs.push(log),
                }
                break;
            }
            dirty.extend(pool.iter().map(|c| c.block));
        }

        for block in clean {
            self.free.push_clean(block);
        }
        for block in dirty {
            self.free.push_dirty(block);
        }

        for log in logs {
            if let Err(mut log) = self.logs.insert(log) {
                info!("merging surplus log block {} of logical block {}", log.phys.0, log.logical);
                self.merge_log(&mut log, Retire::Recycle)?;
            }
        }
        for log in torn {
            self.salvage(log)?;
        }

        let dev = &mut self.dev;
        self.free.scrub(|b| dev.erase(b))?;
        Ok(())
    }

    /// Samples the first two and the last sector of `block`.
    fn classify(&mut self, block: PhysBlock) -> Result<Class, F::Error> {
        let spb = self.geometry.sectors_per_block;
        match self.dev.read_checked(block.lba(spb, 0), &mut self.scratch)? {
            Checked::Valid => {
                let head = sector_head(&self.scratch);
                Ok(Class::Member { logical: head.logical_blk, seq: head.blkseq })
            }
            Checked::Corrupt => Ok(Class::Garbage),
            Checked::Erased => {
                if self.dev.block_blank(block, false, &mut self.scratch)? {
                    Ok(Class::Erased)
                } else {
                    Ok(Class::Garbage)
                }
            }
        }
    }

    /// Reads every slot of a member block and rebuilds its sector map.
    fn scan_block(&mut self, block: PhysBlock, logical: u8, seq: u8) -> Result<Contents, F::Error> {
        let spb = self.geometry.sectors_per_block;
        let mut log = LogBlock::new(logical, block, seq);
        let mut torn = false;
        for slot in 0..spb {
            match self.dev.read_checked(block.lba(spb, slot), &mut self.scratch)? {
                Checked::Erased => (),
                Checked::Corrupt => torn = true,
                Checked::Valid => {
                    let head = sector_head(&self.scratch);
                    if slot == 0 {
                        log.sector_1st = head.sector;
                    }
                    let fits = head.logical_blk == logical
                        && head.blkseq == seq
                        && head.sector < spb
                        && swap_first(log.sector_1st, head.sector) == slot;
                    if fits {
                        log.map.set(slot);
                    } else {
                        torn = true;
                    }
                }
            }
        }
        Ok(if torn {
            warn!("block {} (logical block {} seq {}) is torn", block.0, logical, seq);
            Contents::Torn(log)
        } else if log.map.count() == u32::from(spb) {
            Contents::Complete
        } else {
            Contents::Partial(log)
        })
    }

    /// Rescues what landed in a torn log block before the tear. A torn slot
    /// can't be programmed again, so the good sectors are copied into a
    /// fresh block one generation newer, which is then merged.
    fn salvage(&mut self, torn: LogBlock) -> Result<(), Error<F::Error>> {
        let fresh = match self.free.pop() {
            Some(fb) => {
                if !fb.erased {
                    self.dev.erase(fb.block)?;
                }
                fb.block
            }
            None => {
                warn!("no room to salvage logical block {}, discarding block {}",
                    torn.logical, torn.phys.0);
                self.dev.erase(torn.phys)?;
                self.free.push_clean(torn.phys);
                return Ok(());
            }
        };
        info!("salvaging block {} into block {}", torn.phys.0, fresh.0);

        let mut copy = LogBlock::new(torn.logical, fresh, torn.seq.wrapping_add(1));
        for sector in 0..self.geometry.sectors_per_block {
            if !torn.holds(sector) {
                continue;
            }
            self.dev.read_log(&torn, sector, &mut self.scratch)?;
            let tag = sector_tag(&self.scratch);
            if tag == SectorTag::Filler {
                fill_filler(&mut self.scratch);
            }
            self.dev.program_log_sector(&mut copy, sector, tag, &mut self.scratch)?;
        }
        self.merge_log(&mut copy, Retire::Recycle)?;
        self.free.push_dirty(torn.phys);
        Ok(())
    }
}

/// Index of the candidate with the newest sequence number.
fn newest(pool: &[Candidate]) -> Option<usize> {
    (0..pool.len()).reduce(|best, i| {
        if sequence_compare(pool[i].seq, pool[best].seq) == Ordering::Greater {
            i
        } else {
            best
        }
    })
}

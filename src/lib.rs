// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A log-block flash translation layer for raw SPI-NOR.
//!
//! The translation layer exposes a linear, byte-addressed *logical* space on
//! top of erase-block-oriented NOR flash. Each logical block is backed by one
//! physical *data block*. Recent writes to a logical block land in a *log
//! block* instead, which is later merged with the data block into a fresh
//! full image. At most `SPINOR_MAX_LOG_NUM` log blocks are live at once.
//!
//! Every sector carries a small header naming the logical block, its version
//! and the logical sector number, sealed by a checksum. That is enough for
//! `Ftl::open` to rebuild all RAM state from flash after a power loss.
//!
//! Part of the managed span can be carved out as a *physical area*, handed to
//! another consumer as raw flash, and later returned. The layout is recorded
//! in a journal in a dedicated metadata block.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[cfg(feature = "log")]
extern crate log as __raw_log;

#[macro_use]
mod debug;

pub mod low_level;

mod area;
mod device;
mod engine;
mod meta;
mod rebuild;
mod shared;
mod tables;

#[cfg(test)]
mod fake_flash;

use alloc::vec;
use alloc::vec::Vec;

use crate::device::Device;
use crate::low_level::{
    data_size_per_logical_block, BlockRange, Flash, PartitionRecord, PhysBlock, Sector,
    MAX_BLOCK_SECTORS, SECTOR_SIZE,
};
use crate::meta::Journal;
use crate::tables::{FreeRing, LogTable, LogicalEntry};

pub use crate::area::NewArea;
pub use crate::engine::BorrowedBlock;
pub use crate::shared::SharedFtl;

/// Errors produced by translation layer operations, generic over the
/// device's error type.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Error<E> {
    /// Misaligned address or size, or an invalid configuration.
    InvalidArgument,
    /// The request runs past the end of the logical space.
    OutOfRange,
    /// The request touches flash outside the region it's allowed in, or
    /// blocks that are still in use.
    NotPermitted,
    /// Not enough free blocks to carry out the request.
    NoSpace,
    /// A shared handle was used without a successful `init`.
    NotOpen,
    /// A condition the layer cannot recover from. The device should be
    /// considered failed until the next open.
    Fatal(Fatal),
    /// The device reported an error.
    Flash(E),
}

impl<E> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Self::Flash(e)
    }
}

/// Unrecoverable conditions.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Fatal {
    /// No free block could be found for the write path, even after merging
    /// every other log block. Indicates a sizing bug.
    OutOfBlocks,
    /// A sector read back differently from what was just programmed into it.
    WriteNotDurable { lba: u32 },
    /// A raw physical-area write targeted a sector that wasn't erased.
    NotErased { lba: u32 },
}

/// Which side of the logical area, inside the managed span, the physical
/// area sits on.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum AreaSide {
    /// Physical area occupies the start of the span.
    Front,
    /// Physical area occupies the end of the span.
    #[default]
    Back,
}

/// Addressing mode for `Ftl::read_in` and `Ftl::write_in`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Region {
    /// Addresses are offsets into the logical space.
    Logical,
    /// Addresses are raw device byte addresses inside the physical area.
    Physical,
}

/// Behavior of `Ftl::move_sectors` for destination sectors that already
/// hold a copy of their source.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MoveMode {
    /// Copy every sector.
    Always,
    /// Skip leading destination sectors already tagged as moved from their
    /// source, and copy everything from the first one that isn't.
    SkipMoved,
}

/// Open-time configuration.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    /// Block holding the partition record journal. Must lie outside `span`.
    pub meta_block: PhysBlock,
    /// Blocks divided between the logical and physical areas. `None` means
    /// every block after `meta_block`.
    pub span: Option<BlockRange>,
    /// Size of the physical area on first use, or whenever the persisted
    /// layout is discarded.
    pub physical_blocks: u8,
    /// Where the physical area sits.
    pub side: AreaSide,
    /// Sector offset of the firmware image the layout belongs to. A change
    /// causes the layout to be re-derived from this configuration.
    pub firmware_lba_offset: u32,
    /// Read back every program and check it landed.
    pub verify_writes: bool,
    /// Number of re-reads before a sector that fails its checksum is
    /// declared corrupt.
    pub read_retries: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            meta_block: PhysBlock(0),
            span: None,
            physical_blocks: 0,
            side: AreaSide::Back,
            firmware_lba_offset: 0,
            verify_writes: false,
            read_retries: 2,
        }
    }
}

impl Config {
    /// Checks this configuration against `flash` and derives the geometry
    /// it describes.
    pub fn validate<F: Flash>(&self, flash: &F) -> Result<Geometry, Error<F::Error>> {
        let spb = flash.sectors_per_block();
        if spb == 0 || spb > MAX_BLOCK_SECTORS {
            return Err(Error::InvalidArgument);
        }
        let blocks = flash.block_count().min(256);
        let meta = u16::from(self.meta_block.0);
        if meta >= blocks {
            return Err(Error::InvalidArgument);
        }
        let span = match self.span {
            Some(span) => span,
            None => {
                let len = (blocks - meta - 1).min(255);
                BlockRange::new((meta + 1).min(255) as u8, len as u8)
            }
        };
        if span.end() > blocks || span.contains(self.meta_block) {
            return Err(Error::InvalidArgument);
        }
        // The logical area needs one addressable block plus one spare.
        if u16::from(self.physical_blocks) + 2 > u16::from(span.len) {
            return Err(Error::InvalidArgument);
        }
        Ok(Geometry::split(spb, span, self.physical_blocks, self.side))
    }
}

/// How the managed span is currently divided.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Geometry {
    pub sectors_per_block: u8,
    pub span: BlockRange,
    pub logical: BlockRange,
    pub physical: BlockRange,
    pub side: AreaSide,
}

impl Geometry {
    /// Divides `span` into a physical area of `physical` blocks on `side`
    /// and a logical area made of the rest.
    pub fn split(sectors_per_block: u8, span: BlockRange, physical: u8, side: AreaSide) -> Self {
        let rest = span.len - physical;
        let (logical, physical) = match side {
            AreaSide::Front => (
                BlockRange::new(span.start + physical, rest),
                BlockRange::new(span.start, physical),
            ),
            AreaSide::Back => (
                BlockRange::new(span.start, rest),
                BlockRange::new((span.end() - u16::from(physical)) as u8, physical),
            ),
        };
        Self { sectors_per_block, span, logical, physical, side }
    }

    /// Interprets a persisted record within `configured.span`. Returns `None`
    /// if the record doesn't describe a valid division of that span.
    pub fn from_record(record: &PartitionRecord, configured: &Geometry) -> Option<Self> {
        let logical = record.logical()?;
        let physical = record.physical()?;
        let span = configured.span;
        if logical.len < 2 || u16::from(logical.len) + u16::from(physical.len) != u16::from(span.len) {
            return None;
        }
        let side = if physical.is_empty() {
            configured.side
        } else if physical.end() == u16::from(logical.start) {
            AreaSide::Front
        } else if logical.end() == u16::from(physical.start) {
            AreaSide::Back
        } else {
            return None;
        };
        let g = Self::split(configured.sectors_per_block, span, physical.len, side);
        if g.logical != logical || (!physical.is_empty() && g.physical != physical) {
            return None;
        }
        Some(g)
    }

    /// Number of addressable logical blocks. One block of the logical area
    /// is always kept spare so a merge can find somewhere to go.
    pub fn logical_blocks(&self) -> u8 {
        self.logical.len.saturating_sub(1)
    }

    pub fn data_per_block(&self) -> u32 {
        data_size_per_logical_block(self.sectors_per_block) as u32
    }

    pub fn block_bytes(&self) -> u32 {
        u32::from(self.sectors_per_block) * SECTOR_SIZE as u32
    }

    /// Bytes of logical space.
    pub fn logical_size(&self) -> u32 {
        u32::from(self.logical_blocks()) * self.data_per_block()
    }

    pub fn record(&self, firmware_lba_offset: u32) -> PartitionRecord {
        PartitionRecord::new(self.logical, self.physical, firmware_lba_offset)
    }
}

/// Counts of blocks by role, for introspection.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Census {
    pub data_blocks: usize,
    pub log_blocks: usize,
    pub free_blocks: usize,
    pub clean_free_blocks: usize,
}

/// An open translation layer over a flash device.
pub struct Ftl<F: Flash> {
    dev: Device<F>,
    config: Config,
    geometry: Geometry,
    logical: Vec<LogicalEntry>,
    logs: LogTable,
    free: FreeRing,
    journal: Journal,
    scratch: Sector,
    cache: Sector,
}

impl<F: Flash> Ftl<F> {
    /// Takes ownership of `flash` and rebuilds the translation state from its
    /// contents. On a blank device this formats the logical area.
    ///
    /// On failure the device is handed back inside the error.
    pub fn open(flash: F, config: Config) -> Result<Self, OpenError<F>> {
        let geometry = match config.validate(&flash) {
            Ok(g) => g,
            Err(cause) => return Err(OpenError { flash, cause }),
        };
        let spb = geometry.sectors_per_block;
        let mut ftl = Self {
            dev: Device::new(flash, spb, config.read_retries, config.verify_writes),
            config,
            geometry,
            logical: vec![LogicalEntry::default(); usize::from(geometry.span.len)],
            logs: LogTable::default(),
            free: FreeRing::with_capacity(usize::from(geometry.span.len)),
            journal: Journal::empty(config.meta_block, spb),
            scratch: [0; SECTOR_SIZE],
            cache: [0; SECTOR_SIZE],
        };
        match ftl.rebuild() {
            Ok(()) => Ok(ftl),
            Err(cause) => Err(OpenError {
                flash: ftl.dev.into_inner(),
                cause,
            }),
        }
    }

    /// Commits any buffered write and hands the device back.
    pub fn close(mut self) -> Result<F, CloseError<F>> {
        match self.flush_pending() {
            Ok(()) => Ok(self.dev.into_inner()),
            Err(cause) => Err(CloseError {
                flash: self.dev.into_inner(),
                cause,
            }),
        }
    }

    /// Hands the device back without touching flash. Anything still in the
    /// write-combining buffer is lost, as it would be on power loss.
    pub fn into_flash(self) -> F {
        self.dev.into_inner()
    }

    pub fn flash(&self) -> &F {
        &self.dev.flash
    }

    /// Bytes of logical space.
    pub fn logical_size(&self) -> u32 {
        self.geometry.logical_size()
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Most recently persisted partition record.
    pub fn record(&self) -> Option<PartitionRecord> {
        self.journal.record()
    }

    pub fn census(&self) -> Census {
        Census {
            data_blocks: self.logical.iter().filter(|e| e.phys.is_some()).count(),
            log_blocks: self.logs.len(),
            free_blocks: self.free.len(),
            clean_free_blocks: self.free.clean_len(),
        }
    }

    /// Appends the current geometry to the metadata journal.
    fn persist(&mut self) -> Result<(), Error<F::Error>> {
        let record = self.geometry.record(self.config.firmware_lba_offset);
        self.journal.append(&mut self.dev.flash, record, &mut self.scratch)?;
        info!("persisted layout: logical {:?} physical {:?}",
            self.geometry.logical, self.geometry.physical);
        Ok(())
    }
}

/// Error returned by `Ftl::open`, carrying the device back to the caller.
pub struct OpenError<F: Flash> {
    flash: F,
    cause: Error<F::Error>,
}

impl<F: Flash> OpenError<F> {
    pub fn into_inner(self) -> F {
        self.flash
    }

    pub fn into_parts(self) -> (F, Error<F::Error>) {
        (self.flash, self.cause)
    }

    pub fn cause(&self) -> &Error<F::Error> {
        &self.cause
    }
}

impl<F: Flash> core::fmt::Debug for OpenError<F>
    where F::Error: core::fmt::Debug,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OpenError").field("cause", &self.cause).finish()
    }
}

/// Error returned by `Ftl::close` when the final flush fails.
pub struct CloseError<F: Flash> {
    flash: F,
    cause: Error<F::Error>,
}

impl<F: Flash> CloseError<F> {
    pub fn into_inner(self) -> F {
        self.flash
    }

    pub fn into_parts(self) -> (F, Error<F::Error>) {
        (self.flash, self.cause)
    }

    pub fn cause(&self) -> &Error<F::Error> {
        &self.cause
    }
}

impl<F: Flash> core::fmt::Debug for CloseError<F>
    where F::Error: core::fmt::Debug,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CloseError").field("cause", &self.cause).finish()
    }
}

/// Compares two sequence numbers, treating them as wrapping.
pub(crate) fn sequence_compare(a: u8, b: u8) -> core::cmp::Ordering {
    (a.wrapping_sub(b) as i8).cmp(&0)
}

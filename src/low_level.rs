// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::mem::size_of;
use zerocopy::{AsBytes, FromBytes, Unaligned};
use num_traits::FromPrimitive;

//////////////////////////////////////////////////////////////////////////////
// Convenience wrappers for zerocopy.

pub fn cast_prefix<T>(bytes: &[u8]) -> (&T, &[u8])
    where T: FromBytes + Unaligned,
{
    let (lv, rest) = zerocopy::LayoutVerified::<_, T>::new_unaligned_from_prefix(bytes)
        .expect("type does not fit in sector");
    (lv.into_ref(), rest)
}

pub(crate) fn cast_prefix_mut<T>(bytes: &mut [u8]) -> (&mut T, &mut [u8])
    where T: AsBytes + FromBytes + Unaligned,
{
    let (lv, rest) = zerocopy::LayoutVerified::<_, T>::new_unaligned_from_prefix(bytes)
        .expect("type does not fit in sector");
    (lv.into_mut(), rest)
}

pub fn cast_suffix<T>(bytes: &[u8]) -> (&[u8], &T)
    where T: FromBytes + Unaligned,
{
    let (rest, lv) = zerocopy::LayoutVerified::<_, T>::new_unaligned_from_suffix(bytes)
        .expect("type does not fit in sector");
    (rest, lv.into_ref())
}

pub(crate) fn cast_suffix_mut<T>(bytes: &mut [u8]) -> (&mut [u8], &mut T)
    where T: AsBytes + FromBytes + Unaligned,
{
    let (rest, lv) = zerocopy::LayoutVerified::<_, T>::new_unaligned_from_suffix(bytes)
        .expect("type does not fit in sector");
    (rest, lv.into_mut())
}

//////////////////////////////////////////////////////////////////////////////
// Geometry constants.

/// Bytes in one flash sector, the unit of reads and programs.
pub const SECTOR_SIZE: usize = 512;

/// One flash sector's worth of bytes.
pub type Sector = [u8; SECTOR_SIZE];

/// Sectors per erase block on the parts this layer was built for (64 KiB
/// blocks).
pub const SPINOR_BLOCK_SECTORS: u8 = 128;

/// Largest supported number of sectors per erase block. Bounded by the width
/// of the per-log-block sector bitmap.
pub const MAX_BLOCK_SECTORS: u8 = 128;

/// Number of log blocks that may be live at once.
pub const SPINOR_MAX_LOG_NUM: usize = 2;

/// Payload bytes carried by each logical sector, after the header and tail.
pub const DATA_SIZE_PER_LOGICAL_SECTOR: usize =
    SECTOR_SIZE - size_of::<SectorHead>() - size_of::<SectorTail>();

/// Fill byte returned for logical data that has never been written.
pub const UNWRITTEN_FILL: u8 = 0xAB;
/// Fill byte programmed into sectors that a merge had to invent.
pub const FILLER_FILL: u8 = 0xBC;
/// Fill byte returned for sectors that could not be verified.
pub const TORN_FILL: u8 = 0xBD;

/// Payload bytes carried by one logical block on a device with
/// `sectors_per_block` sectors per erase block.
pub const fn data_size_per_logical_block(sectors_per_block: u8) -> usize {
    sectors_per_block as usize * DATA_SIZE_PER_LOGICAL_SECTOR
}

//////////////////////////////////////////////////////////////////////////////
// At-rest layout.

/// Shorthand for a `u16` in little-endian representation.
type U16LE = zerocopy::U16<byteorder::LittleEndian>;
/// Shorthand for a `u32` in little-endian representation.
type U32LE = zerocopy::U32<byteorder::LittleEndian>;

/// Header at offset 0 of every sector written by the translation layer.
///
/// The header names the logical sector the payload belongs to, and the
/// version of the logical block it was written under. Recovery identifies a
/// block by reading the header of its physical sector 0.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct SectorHead {
    /// Index of the logical block this sector belongs to.
    pub logical_blk: u8,
    /// Sequence number of the logical block at the time of writing. Bumped
    /// each time the logical block moves to a new physical block.
    pub blkseq: u8,
    /// Logical sector number within the logical block.
    pub sector: u8,
}

impl SectorHead {
    /// Constant mixed into every checksum so that all-zero headers do not
    /// verify either.
    pub const CHECKSUM_SALT: u16 = 0x1234;

    /// Computes the checksum expected in the tail of a sector carrying this
    /// header.
    ///
    /// An erased header (`FF FF FF`) never produces `0xFFFF`, so erased
    /// sectors can't be mistaken for valid ones.
    pub fn checksum(&self) -> u16 {
        let word = u32::from(self.logical_blk)
            | u32::from(self.blkseq) << 8
            | u32::from(self.sector) << 16;
        // Fold twice so that the carry out of the first fold is absorbed.
        let mut sum = (word & 0xFFFF) + (word >> 16);
        sum = (sum & 0xFFFF) + (sum >> 16);
        (sum as u16).wrapping_add(Self::CHECKSUM_SALT)
    }
}

/// Trailer in the final four bytes of every sector.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct SectorTail {
    /// Encoded `SectorTag`.
    pub extend: U16LE,
    /// `SectorHead::checksum` of the header at the other end of the sector.
    pub checksum: U16LE,
}

impl SectorTail {
    /// Checks for the pattern left by an erase. The tail is programmed along
    /// with the rest of the sector, so a sector whose tail still reads erased
    /// was never (completely) programmed.
    pub fn is_erased(&self) -> bool {
        self.extend.get() == 0xFFFF && self.checksum.get() == 0xFFFF
    }
}

/// Meaning of the `extend` field of a sector tail.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SectorTag {
    /// Ordinary write through the logical write path.
    Fresh,
    /// Invented by a merge for a logical block that never had a data block.
    /// Carries `FILLER_FILL` on flash and reads back as `UNWRITTEN_FILL`.
    Filler,
    /// Copied by `move_sectors` from the given logical sector.
    MovedFrom(u16),
}

impl SectorTag {
    const FRESH: u16 = 0xFFFF;
    const FILLER: u16 = 0xFFFE;

    pub fn decode(raw: u16) -> Self {
        match raw {
            Self::FRESH => Self::Fresh,
            Self::FILLER => Self::Filler,
            lba => Self::MovedFrom(lba),
        }
    }

    pub fn encode(self) -> u16 {
        match self {
            Self::Fresh => Self::FRESH,
            Self::Filler => Self::FILLER,
            Self::MovedFrom(lba) => {
                debug_assert!(lba < Self::FILLER);
                lba
            }
        }
    }
}

/// Header of a sector buffer.
pub fn sector_head(sector: &Sector) -> &SectorHead {
    cast_prefix::<SectorHead>(sector).0
}

/// Tail of a sector buffer.
pub fn sector_tail(sector: &Sector) -> &SectorTail {
    cast_suffix::<SectorTail>(sector).1
}

/// Tag of a sector buffer.
pub fn sector_tag(sector: &Sector) -> SectorTag {
    SectorTag::decode(sector_tail(sector).extend.get())
}

/// Payload of a sector buffer.
pub fn sector_data(sector: &Sector) -> &[u8] {
    let start = size_of::<SectorHead>();
    &sector[start..start + DATA_SIZE_PER_LOGICAL_SECTOR]
}

/// Payload of a sector buffer, mutably.
pub fn sector_data_mut(sector: &mut Sector) -> &mut [u8] {
    let start = size_of::<SectorHead>();
    &mut sector[start..start + DATA_SIZE_PER_LOGICAL_SECTOR]
}

/// Checks whether the checksum in the tail matches the header.
pub fn sector_is_valid(sector: &Sector) -> bool {
    sector_tail(sector).checksum.get() == sector_head(sector).checksum()
}

/// Writes `head` and `tag` into a sector buffer and seals it with a fresh
/// checksum. The payload is left alone.
pub fn seal_sector(sector: &mut Sector, head: SectorHead, tag: SectorTag) {
    *cast_prefix_mut::<SectorHead>(sector).0 = head;
    let tail = cast_suffix_mut::<SectorTail>(sector).1;
    tail.extend = tag.encode().into();
    tail.checksum = head.checksum().into();
}

/// Checks whether every byte reads as erased NOR flash.
pub fn is_erased(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0xFF)
}

//////////////////////////////////////////////////////////////////////////////
// Partition record.

/// Persisted description of how the managed span is divided between the
/// logical area and the physical (raw) area.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct PartitionRecord {
    /// `EXPECTED_MAGIC` on any record written by this layer.
    pub magic: U32LE,
    /// First physical block of the logical area.
    pub logical_phyblk: U32LE,
    /// Number of physical blocks in the logical area.
    pub logical_blknum: U32LE,
    /// First physical block of the physical area.
    pub physical_phyblk: U32LE,
    /// Number of physical blocks in the physical area.
    pub physical_blknum: U32LE,
    /// Sector offset of the firmware image this layout was made for.
    pub firmware_flash_lba_offset: U32LE,
    /// Encoded `RecordFlag`.
    pub first_flag: U32LE,
}

impl PartitionRecord {
    /// Bits we expect to find in the `magic` field ("part" in ASCII).
    pub const EXPECTED_MAGIC: u32 = 0x7061_7274;

    pub fn new(logical: BlockRange, physical: BlockRange, firmware_lba_offset: u32) -> Self {
        Self {
            magic: Self::EXPECTED_MAGIC.into(),
            logical_phyblk: u32::from(logical.start).into(),
            logical_blknum: u32::from(logical.len).into(),
            physical_phyblk: u32::from(physical.start).into(),
            physical_blknum: u32::from(physical.len).into(),
            firmware_flash_lba_offset: firmware_lba_offset.into(),
            first_flag: (RecordFlag::Settled as u32).into(),
        }
    }

    pub fn magic_valid(&self) -> bool {
        self.magic.get() == Self::EXPECTED_MAGIC
    }

    /// Logical area described by the record, if its fields fit a block
    /// range at all.
    pub fn logical(&self) -> Option<BlockRange> {
        BlockRange::from_u32(self.logical_phyblk.get(), self.logical_blknum.get())
    }

    /// Physical area described by the record.
    pub fn physical(&self) -> Option<BlockRange> {
        BlockRange::from_u32(self.physical_phyblk.get(), self.physical_blknum.get())
    }

    /// Decoded flag. Unknown values are treated as a first boot, which only
    /// costs a deeper scan.
    pub fn flag(&self) -> RecordFlag {
        RecordFlag::from_u32(self.first_flag.get()).unwrap_or(RecordFlag::FirstBoot)
    }
}

/// Defined values for the `PartitionRecord::first_flag` field.
#[derive(Copy, Clone, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
pub enum RecordFlag {
    /// Layout has been in use by this layer already.
    Settled = 0,
    /// Layout was rewritten by an external tool; free blocks must be
    /// re-verified on the next open.
    FirstBoot = 1,
}

/// A journal entry holding a `PartitionRecord`, one per sector of the
/// metadata block.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct RecordSector {
    pub record: PartitionRecord,
    /// Incremented on every append; the highest valid generation wins.
    pub generation: U32LE,
    /// CRC32 of the above data, in order.
    pub crc: U32LE,
}

impl RecordSector {
    /// Compute the _expected_ CRC given all the other contents of `self`.
    pub fn expected_crc(&self) -> u32 {
        let algo = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
        let mut digest = algo.digest();
        digest.update(self.record.as_bytes());
        digest.update(self.generation.as_bytes());
        digest.finalize()
    }

    /// Checks if the CRC field correctly describes the other fields in `self`.
    pub fn crc_valid(&self) -> bool {
        self.crc.get() == self.expected_crc()
    }

    /// Reads the entry at the start of `sector`, if one is there. The zero
    /// padding must be intact too, so a program cut short after the entry
    /// itself landed is not mistaken for a complete one.
    pub fn parse(sector: &Sector) -> Option<&Self> {
        let (entry, padding) = cast_prefix::<Self>(sector);
        if entry.crc_valid() && entry.record.magic_valid() && padding.iter().all(|&b| b == 0) {
            Some(entry)
        } else {
            None
        }
    }

    /// Lays out an entry at the start of `sector`, zero-filling the rest.
    pub fn emit(sector: &mut Sector, record: PartitionRecord, generation: u32) {
        let (entry, tail) = cast_prefix_mut::<Self>(sector);
        *entry = Self {
            record,
            generation: generation.into(),
            crc: 0.into(),
        };
        entry.crc = entry.expected_crc().into();
        tail.fill(0);
    }
}

//////////////////////////////////////////////////////////////////////////////
// Blocks.

/// Index of an erase block on the device.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysBlock(pub u8);

impl PhysBlock {
    /// Sector address of sector `sector` inside this block.
    pub fn lba(self, sectors_per_block: u8, sector: u8) -> u32 {
        u32::from(self.0) * u32::from(sectors_per_block) + u32::from(sector)
    }

    /// Byte address of the start of this block.
    pub fn byte_address(self, sectors_per_block: u8) -> u32 {
        self.lba(sectors_per_block, 0) * SECTOR_SIZE as u32
    }
}

/// A run of consecutive erase blocks.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockRange {
    pub start: u8,
    pub len: u8,
}

impl BlockRange {
    pub const fn new(start: u8, len: u8) -> Self {
        Self { start, len }
    }

    fn from_u32(start: u32, len: u32) -> Option<Self> {
        let start = u8::try_from(start).ok()?;
        let len = u8::try_from(len).ok()?;
        let r = Self { start, len };
        if r.end() > 256 {
            return None;
        }
        Some(r)
    }

    /// Index one past the last block. Widened because a range may end at
    /// block 255.
    pub fn end(&self) -> u16 {
        u16::from(self.start) + u16::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, block: PhysBlock) -> bool {
        block.0 >= self.start && u16::from(block.0) < self.end()
    }

    /// Checks whether `other` lies entirely inside `self`.
    pub fn covers(&self, other: BlockRange) -> bool {
        other.start >= self.start && other.end() <= self.end()
    }

    pub fn overlaps(&self, other: BlockRange) -> bool {
        u16::from(self.start) < other.end() && u16::from(other.start) < self.end()
    }

    pub fn blocks(&self) -> impl DoubleEndedIterator<Item = PhysBlock> {
        (u16::from(self.start)..self.end()).map(|b| PhysBlock(b as u8))
    }
}

//////////////////////////////////////////////////////////////////////////////
// Flash device interface.

/// Trait describing a raw NOR flash device for the purposes of the
/// translation layer.
///
/// Addresses are sector indices (LBAs) counted from the start of the device.
/// Sector `lba` lives in block `lba / sectors_per_block()`.
pub trait Flash {
    /// Error type that can be produced during flash accesses.
    type Error;

    /// Returns the number of erase blocks on the device. This is expected to
    /// be cheap and never change.
    fn block_count(&self) -> u16;

    /// Returns the number of sectors in one erase block. Must be between 1
    /// and `MAX_BLOCK_SECTORS`.
    fn sectors_per_block(&self) -> u8;

    /// Reads sector `lba` into `dest`.
    ///
    /// On success, `dest` should be fully overwritten with data from the
    /// device. Erased sectors read back as all `0xFF`.
    fn read_sector(&self, lba: u32, dest: &mut Sector) -> Result<(), Self::Error>;

    /// Reads sector `lba` bypassing any retry or correction layer the driver
    /// may have. Used for cheap "is this erased" probes.
    ///
    /// The default implementation uses `read_sector`.
    fn read_sector_raw(&self, lba: u32, dest: &mut Sector) -> Result<(), Self::Error> {
        self.read_sector(lba, dest)
    }

    /// Programs `data` into sector `lba`, which the caller promises has been
    /// erased.
    ///
    /// On error, the sector _may or may not_ contain the data, or may
    /// contain part of it.
    fn program_sector(&mut self, lba: u32, data: &Sector) -> Result<(), Self::Error>;

    /// Erases one block, leaving every byte in it reading `0xFF`.
    fn erase_block(&mut self, block: PhysBlock) -> Result<(), Self::Error>;

    /// Reads `dest.len() / SECTOR_SIZE` consecutive sectors starting at `lba`.
    /// `dest` must be a whole number of sectors long.
    ///
    /// The default implementation uses `read_sector`.
    fn read_sectors(&self, lba: u32, dest: &mut [u8]) -> Result<(), Self::Error> {
        debug_assert!(dest.len() % SECTOR_SIZE == 0);
        for (i, chunk) in dest.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            let chunk: &mut Sector = chunk.try_into()
                .expect("chunks_exact_mut yields whole sectors");
            self.read_sector(lba + i as u32, chunk)?;
        }
        Ok(())
    }

    /// Programs consecutive sectors starting at `lba` from `data`, which must
    /// be a whole number of sectors long.
    ///
    /// The default implementation uses `program_sector`.
    fn program_sectors(&mut self, lba: u32, data: &[u8]) -> Result<(), Self::Error> {
        debug_assert!(data.len() % SECTOR_SIZE == 0);
        for (i, chunk) in data.chunks_exact(SECTOR_SIZE).enumerate() {
            let chunk: &Sector = chunk.try_into()
                .expect("chunks_exact yields whole sectors");
            self.program_sector(lba + i as u32, chunk)?;
        }
        Ok(())
    }
}

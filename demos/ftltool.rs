// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom, Write};

use norftl::low_level::{
    sector_data, sector_head, sector_is_valid, sector_tag, Flash, PhysBlock, Sector,
    SECTOR_SIZE,
};
use norftl::{Config, Ftl};

#[derive(Parser)]
struct Ftltool {
    /// Sectors per erase block of the image.
    #[clap(short = 'b', long, default_value_t = 128)]
    sectors_per_block: u8,

    /// Blocks to set aside as the physical area when formatting.
    #[clap(short, long, default_value_t = 0)]
    physical_blocks: u8,

    image_file: std::path::PathBuf,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Creates an erased image of the given number of blocks.
    Create {
        blocks: u16,
    },
    /// Opens the image and prints its layout.
    Info,
    Read {
        #[clap(parse(try_from_str = parse_int))]
        addr: u32,
        #[clap(parse(try_from_str = parse_int))]
        len: u32,
    },
    Write {
        #[clap(parse(try_from_str = parse_int))]
        addr: u32,
        value: String,
    },
    /// Decodes one raw sector without opening the translation layer.
    Sector {
        #[clap(parse(try_from_str = parse_int))]
        lba: u32,
    },
    NewArea {
        #[clap(parse(try_from_str = parse_int))]
        size: u32,
    },
    DelArea {
        #[clap(parse(try_from_str = parse_int))]
        addr: u32,
        #[clap(parse(try_from_str = parse_int))]
        size: u32,
    },
    TrimArea {
        #[clap(parse(try_from_str = parse_int))]
        addr: u32,
        #[clap(parse(try_from_str = parse_int))]
        size: u32,
    },
}

fn parse_int(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();
    let args = Ftltool::parse();

    if let Cmd::Create { blocks } = args.cmd {
        let len = u64::from(blocks) * u64::from(args.sectors_per_block) * SECTOR_SIZE as u64;
        let mut f = std::fs::File::create(&args.image_file)
            .with_context(|| format!("creating {}", args.image_file.display()))?;
        let erased = [0xFF; SECTOR_SIZE];
        for _ in 0..len / SECTOR_SIZE as u64 {
            f.write_all(&erased)?;
        }
        println!("created {blocks} blocks of {} sectors", args.sectors_per_block);
        return Ok(());
    }

    let img = FlashImage::open(&args.image_file, args.sectors_per_block)
        .with_context(|| format!("opening image file {}", args.image_file.display()))?;

    if let Cmd::Sector { lba } = args.cmd {
        let mut sector = [0; SECTOR_SIZE];
        img.read_sector(lba, &mut sector)?;
        let head = sector_head(&sector);
        println!("block {} sector {}", lba / u32::from(args.sectors_per_block),
            lba % u32::from(args.sectors_per_block));
        println!("- header: logical block {} seq {} sector {}",
            head.logical_blk, head.blkseq, head.sector);
        println!("- tag {:?}", sector_tag(&sector));
        println!("- checksum {}",
            if sector_is_valid(&sector) { "valid" } else { "INVALID" });
        println!("{}", pretty_hex::pretty_hex(&sector_data(&sector)));
        return Ok(());
    }

    let config = Config {
        physical_blocks: args.physical_blocks,
        ..Config::default()
    };
    let mut ftl = match Ftl::open(img, config) {
        Ok(ftl) => ftl,
        Err(e) => bail!("could not open: {:?}", e.cause()),
    };

    match args.cmd {
        Cmd::Create { .. } | Cmd::Sector { .. } => unreachable!(),
        Cmd::Info => {
            let g = ftl.geometry();
            println!("{} sectors per block", g.sectors_per_block);
            println!("logical area: blocks {}..{}", g.logical.start, g.logical.end());
            println!("physical area: blocks {}..{}", g.physical.start, g.physical.end());
            println!("logical space: {} bytes", ftl.logical_size());
            println!("{:#?}", ftl.census());
            match ftl.record() {
                Some(r) => println!("{r:#?}"),
                None => println!("no partition record"),
            }
        }
        Cmd::Read { addr, len } => {
            let mut buf = vec![0; len as usize];
            ftl.read(addr, &mut buf).map_err(|e| anyhow!("read failed: {e:?}"))?;
            println!("{}", pretty_hex::pretty_hex(&buf));
        }
        Cmd::Write { addr, value } => {
            ftl.write(addr, value.as_bytes()).map_err(|e| anyhow!("write failed: {e:?}"))?;
            println!("ok");
        }
        Cmd::NewArea { size } => {
            let area = ftl.new_physical_area(size)
                .map_err(|e| anyhow!("carving failed: {e:?}"))?;
            println!("physical area now {:#x} + {:#x}", area.address, area.size);
        }
        Cmd::DelArea { addr, size } => {
            ftl.del_physical_area(addr, size)
                .map_err(|e| anyhow!("delete failed: {e:?}"))?;
            println!("returned to logical area");
        }
        Cmd::TrimArea { addr, size } => {
            let used = ftl.trim_physical_area(addr, size)
                .map_err(|e| anyhow!("trim failed: {e:?}"))?;
            println!("{used:#x} bytes in use");
        }
    }

    match ftl.close() {
        Ok(_) => Ok(()),
        Err(e) => bail!("could not close: {:?}", e.cause()),
    }
}

/// A device image in a regular file, with NOR programming rules applied.
struct FlashImage {
    file: RefCell<std::fs::File>,
    blocks: u16,
    sectors_per_block: u8,
}

impl FlashImage {
    fn open(path: impl AsRef<std::path::Path>, sectors_per_block: u8) -> Result<Self, anyhow::Error> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(false)
            .open(path)?;
        let block_bytes = u64::from(sectors_per_block) * SECTOR_SIZE as u64;
        if block_bytes == 0 {
            bail!("blocks must hold at least one sector");
        }
        let file_len = file.metadata()?.len();
        if file_len % block_bytes != 0 {
            bail!("file is not a whole number of blocks in length");
        }
        let blocks = u16::try_from(file_len / block_bytes)
            .context("file too large")?;

        Ok(Self {
            file: file.into(),
            blocks,
            sectors_per_block,
        })
    }

    fn seek(&self, lba: u32) -> Result<std::cell::RefMut<'_, std::fs::File>, std::io::Error> {
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(u64::from(lba) * SECTOR_SIZE as u64))?;
        Ok(file)
    }
}

impl Flash for FlashImage {
    type Error = std::io::Error;

    fn block_count(&self) -> u16 {
        self.blocks
    }

    fn sectors_per_block(&self) -> u8 {
        self.sectors_per_block
    }

    fn read_sector(&self, lba: u32, dest: &mut Sector) -> Result<(), Self::Error> {
        self.seek(lba)?.read_exact(dest)
    }

    fn program_sector(&mut self, lba: u32, data: &Sector) -> Result<(), Self::Error> {
        // Programming only clears bits.
        let mut current = [0; SECTOR_SIZE];
        self.read_sector(lba, &mut current)?;
        for (c, d) in current.iter_mut().zip(data) {
            *c &= d;
        }
        self.seek(lba)?.write_all(&current)
    }

    fn erase_block(&mut self, block: PhysBlock) -> Result<(), Self::Error> {
        let mut file = self.seek(block.lba(self.sectors_per_block, 0))?;
        let erased = [0xFF; SECTOR_SIZE];
        for _ in 0..self.sectors_per_block {
            file.write_all(&erased)?;
        }
        Ok(())
    }
}

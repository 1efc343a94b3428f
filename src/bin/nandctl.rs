//! Poke at an emulated SPI NAND from the command line.
//!
//! The flash lives in a memory-mapped file. Without `--file` a temporary one is used and
//! thrown away on exit, so only single-command experiments make sense; pass `--file` to keep
//! state (including the wear-leveling map) between invocations.

use anyhow::{bail, ensure, Context, Result};
use byte_unit::Byte;
use clap::{Args, Parser, Subcommand};
use simplelog::{ConfigBuilder, LevelFilter, SimpleLogger};
use time::macros::format_description;

use std::fs::File;
use std::path::PathBuf;

use spi_nand_flash::{
    blockdev::{load_image, BlockDevice, FlashBlockDevice, WlBlockDevice},
    config::{Config, EmulConfig, Layout},
    nand::{device::NandDevice, emul::EmulNand, PageUtil},
    util::{check_pattern, fill_pattern},
};

#[derive(Args, Debug)]
struct FlashOptions {
    /// Backing file for the emulated flash; reused and kept if it already exists
    #[clap(long)]
    file: Option<PathBuf>,

    /// Layout of the flash to emulate, as BLOCKSxPAGESxBYTES
    #[clap(long, conflicts_with = "size")]
    layout: Option<Layout>,

    /// Size in bytes of the emulated flash (page data plus OOB), with 64 pages of 2048 bytes per
    /// block
    #[clap(long)]
    size: Option<usize>,

    /// Blocks per spare block reserved for wear-leveling garbage collection
    #[clap(long, default_value_t = 45)]
    gc_factor: u32,

    /// Corrected-bit count at which a read rewrites its data
    #[clap(long)]
    refresh_threshold: Option<u8>,

    /// Read back and compare every programmed page
    #[clap(long)]
    verify: bool,
}

impl FlashOptions {
    fn config(&self) -> Config {
        Config {
            gc_factor: self.gc_factor,
            ecc_refresh_threshold: self.refresh_threshold,
            verify_writes: self.verify,
            ..Default::default()
        }
    }

    fn open(&self) -> Result<FlashBlockDevice<EmulNand>> {
        let mut emul = match self.layout {
            Some(layout) => EmulConfig::with_layout(layout),
            None => EmulConfig {
                size: self.size.unwrap_or(EmulConfig::DEFAULT_SIZE),
                ..Default::default()
            },
        };
        if let Some(path) = &self.file {
            emul.path = Some(path.clone());
            emul.keep_dump = true;
            emul.reuse_existing = true;
        }

        let config = self.config();
        let nand = EmulNand::open(&emul, &config).context("could not open emulated flash")?;
        let device = NandDevice::init_device(nand, &config)?;
        Ok(FlashBlockDevice::new(device)?)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the chip's identity and layout
    Info,

    /// Erase every good block, marking blocks whose erase fails as bad
    EraseChip,

    /// Erase one block
    EraseBlock { block: u32 },

    /// List the blocks marked bad
    BadBlocks,

    /// Mark a block bad
    MarkBad { block: u32 },

    /// Tally the ECC status of every written page
    EccStats,

    /// Program a page with a seeded pseudo-random pattern
    WritePattern {
        page: u32,
        #[clap(long, default_value_t = 0x12345678)]
        seed: u64,
    },

    /// Read a page, checking it against a pattern seed if one is given
    ReadPage {
        page: u32,
        #[clap(long)]
        seed: Option<u64>,
    },

    /// Copy one page to another inside the chip
    CopyPage { src: u32, dst: u32 },

    /// Write a pattern to a wear-leveled sector
    WlWrite {
        sector: u32,
        #[clap(long, default_value_t = 0x12345678)]
        seed: u64,
    },

    /// Read a wear-leveled sector, checking it against a pattern seed if one is given
    WlRead {
        sector: u32,
        #[clap(long)]
        seed: Option<u64>,
    },

    /// Discard a wear-leveled sector
    WlTrim { sector: u32 },

    /// Stream a file into the wear-leveled device from sector 0
    WlLoad { path: PathBuf },
}

impl Command {
    fn is_wear_leveled(&self) -> bool {
        matches!(
            self,
            Command::WlWrite { .. }
                | Command::WlRead { .. }
                | Command::WlTrim { .. }
                | Command::WlLoad { .. }
        )
    }

    fn execute_raw(self, flash: &FlashBlockDevice<EmulNand>) -> Result<()> {
        let device = flash.device();
        let page_size = device.sector_size();

        match self {
            Command::Info => {
                let info = flash.flash_info();
                let geometry = &info.geometry;
                println!("Chip:       {}", info.device.chip_name);
                if let Some(vendor) = info.vendor() {
                    println!("Vendor:     {vendor}");
                }
                println!(
                    "Layout:     {} blocks x {} pages x {} bytes",
                    geometry.num_blocks,
                    geometry.pages_per_block(),
                    geometry.page_size()
                );
                println!("Capacity:   {}", human(geometry.total_size()));
                println!("ECC:        refresh at {} bits", geometry.ecc.refresh_threshold);
                let backing = device.with_nand(|n| n.flash().path().display().to_string());
                println!("Backing:    {backing}");
            }

            Command::EraseChip => device.erase_chip()?,

            Command::EraseBlock { block } => flash.erase_block(block)?,

            Command::BadBlocks => {
                let stats = device.bad_block_stats()?;
                for block in &stats.blocks {
                    println!("{block:6}");
                }
                println!("{} of {} blocks bad", stats.count, device.num_blocks());
            }

            Command::MarkBad { block } => flash.mark_bad_block(block)?,

            Command::EccStats => {
                let stats = device.ecc_stats()?;
                println!("Pages read:          {}", stats.pages);
                println!("Corrected:           {}", stats.total);
                println!("Uncorrectable:       {}", stats.uncorrected);
                println!("At refresh level:    {}", stats.exceeding_threshold);
            }

            Command::WritePattern { page, seed } => {
                ensure!(flash.is_free_page(page)?, "page {page} is not free");
                let mut data = vec![0u8; page_size];
                fill_pattern(seed, &mut data);
                flash.program_page(page, &data)?;
            }

            Command::ReadPage { page, seed } => {
                let mut buf = vec![0u8; page_size];
                let ecc = flash.read_page(page, 0, &mut buf)?;
                println!("ECC: {ecc:?}");
                report(&buf, seed)?;
            }

            Command::CopyPage { src, dst } => flash.copy_page(src, dst)?,

            _ => unreachable!(),
        }

        Ok(())
    }

    fn execute_wl(self, wl: &mut WlBlockDevice<EmulNand>) -> Result<()> {
        let page_size = wl.geometry().write_size;

        match self {
            Command::WlWrite { sector, seed } => {
                let mut data = vec![0u8; page_size];
                fill_pattern(seed, &mut data);
                wl.write(&data, sector_addr(sector, page_size))?;
                wl.sync()?;
            }

            Command::WlRead { sector, seed } => {
                let mut buf = vec![0u8; page_size];
                wl.read(&mut buf, sector_addr(sector, page_size), page_size)?;
                report(&buf, seed)?;
            }

            Command::WlTrim { sector } => {
                wl.erase(sector_addr(sector, page_size), page_size as u64)?;
                wl.sync()?;
            }

            Command::WlLoad { path } => {
                let file = File::open(&path)
                    .with_context(|| format!("could not open {}", path.display()))?;
                let loaded = load_image(wl, file)?;
                println!(
                    "Loaded {} into {} sectors",
                    human(loaded),
                    loaded.div_ceil(page_size as u64)
                );
            }

            _ => unreachable!(),
        }

        Ok(())
    }
}

fn sector_addr(sector: u32, page_size: usize) -> u64 {
    u64::from(sector) * page_size as u64
}

fn human(bytes: u64) -> String {
    Byte::from_bytes(u128::from(bytes))
        .get_appropriate_unit(true)
        .to_string()
}

fn report(buf: &[u8], seed: Option<u64>) -> Result<()> {
    if let Some(seed) = seed {
        if !check_pattern(seed, buf) {
            bail!("content does not match pattern {seed:#x}");
        }
        println!("Pattern {seed:#x} matches");
    } else if buf.is_erased() {
        println!("Erased");
    } else {
        for line in buf[..64.min(buf.len())].chunks(16) {
            let hex: Vec<_> = line.iter().map(|b| format!("{b:02x}")).collect();
            println!("{}", hex.join(" "));
        }
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(flatten)]
    flash: FlashOptions,

    /// More logging; repeat for more
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let log_cfg = ConfigBuilder::new()
        .set_time_format_custom(format_description!("[hour]:[minute]:[second].[subsecond]"))
        .build();
    SimpleLogger::init(level, log_cfg)?;
    howudoin::init(howudoin::consumers::TermLine::default());

    let flash = args.flash.open()?;
    if args.cmd.is_wear_leveled() {
        let mut wl = WlBlockDevice::with_log_map(flash)?;
        let result = args.cmd.execute_wl(&mut wl);
        wl.close()?;
        result
    } else {
        let result = args.cmd.execute_raw(&flash);
        flash.close()?;
        result
    }
}

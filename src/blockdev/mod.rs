//! Block devices over NAND: the raw flash view and the wear-leveled logical view
//!
//! Both speak the same [BlockDevice] trait, so a filesystem driver (see [crate::diskio]) can sit
//! on either. A wear-leveled device owns the flash device it wraps; releasing it releases both.

use std::io::Read;

use crate::error::Result;
use crate::nand::spi::vendor;
use crate::nand::{DeviceInfo, EccStatus, Geometry};
use crate::util::ReadExt;

pub mod flash;
pub mod wl;

pub use crate::nand::device::EccStats;
pub use flash::FlashBlockDevice;
pub use wl::WlBlockDevice;

/// Sizes a block device reports to its users; all in bytes
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockGeometry {
    pub disk_size: u64,
    pub read_size: usize,
    pub write_size: usize,
    pub erase_size: usize,
    pub recommended_read_size: usize,
    pub recommended_write_size: usize,
    pub recommended_erase_size: usize,
}

/// Snapshot of the flash under a block device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashInfo {
    pub device: DeviceInfo,
    pub geometry: Geometry,
    pub last_ecc_status: EccStatus,
}

impl FlashInfo {
    /// Vendor name for the manufacturer ID, if it is one we know
    pub fn vendor(&self) -> Option<&'static str> {
        vendor::vendor_name(self.device.manufacturer_id)
    }
}

/// Device-specific requests
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Ioctl {
    IsBadBlock(u32),
    MarkBadBlock(u32),
    IsFreePage(u32),
    GetPageEccStatus(u32),
    GetFlashInfo,
    /// Scans every block
    GetBadBlockCount,
    CopyPage { src: u32, dst: u32 },
    /// Scans every written page
    GetEccStats,
    /// Logical sectors the wear-leveling map can hold
    GetAvailableSectors,
    TrimSector(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoctlResponse {
    Done,
    Flag(bool),
    Ecc(EccStatus),
    FlashInfo(FlashInfo),
    Count(u32),
    EccStats(EccStats),
}

pub trait BlockDevice: Send {
    fn geometry(&self) -> BlockGeometry;

    /// Read `len` bytes at `src_addr` into the start of `dst`
    fn read(&mut self, dst: &mut [u8], src_addr: u64, len: usize) -> Result<()>;

    fn write(&mut self, src: &[u8], dst_addr: u64) -> Result<()>;

    fn erase(&mut self, addr: u64, len: u64) -> Result<()>;

    fn ioctl(&mut self, cmd: Ioctl) -> Result<IoctlResponse>;

    fn sync(&mut self) -> Result<()>;

    /// Flush and free everything this device owns, including devices it wraps
    fn release(self: Box<Self>) -> Result<()>;
}

/// Stream `reader` into `bdev` from address 0, one write unit at a time. The final unit is
/// padded with 0xFF. Returns the number of bytes taken from the reader.
pub fn load_image(bdev: &mut dyn BlockDevice, mut reader: impl Read) -> anyhow::Result<u64> {
    let geometry = bdev.geometry();
    let unit = geometry.write_size;

    let rpt = howudoin::new()
        .label("Loading image")
        .set_len(geometry.disk_size / unit as u64);

    let mut buf = vec![0u8; unit];
    let mut addr = 0u64;
    let mut loaded = 0u64;
    loop {
        let n = reader.read_unit(&mut buf)?;
        if n == 0 {
            break;
        }
        loaded += n as u64;

        anyhow::ensure!(
            addr + unit as u64 <= geometry.disk_size,
            "image does not fit in {} bytes",
            geometry.disk_size
        );
        bdev.write(&buf, addr)?;
        addr += unit as u64;
        rpt.inc();
    }

    bdev.sync()?;
    rpt.close();
    Ok(loaded)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{Config, EmulConfig, Layout};
    use crate::ftl::LogMap;
    use crate::nand::device::NandDevice;
    use crate::nand::emul::EmulNand;
    use crate::util::fill_pattern;

    fn wl_bdev() -> WlBlockDevice<EmulNand> {
        let layout = Layout {
            blocks: 32,
            pages_per_block: 16,
            bytes_per_page: 512,
        };
        let nand = EmulNand::open(&EmulConfig::with_layout(layout), &Config::default()).unwrap();
        let flash =
            FlashBlockDevice::new(NandDevice::init_device(nand, &Config::default()).unwrap())
                .unwrap();
        WlBlockDevice::new(flash, Box::new(LogMap::new(45))).unwrap()
    }

    #[test]
    fn test_load_image() -> anyhow::Result<()> {
        let mut bdev = wl_bdev();
        let mut image = vec![0u8; 3 * 512 + 100];
        fill_pattern(17, &mut image);

        assert_eq!(load_image(&mut bdev, &image[..])?, image.len() as u64);

        let mut buf = vec![0u8; 4 * 512];
        bdev.read(&mut buf, 0, 4 * 512)?;
        assert_eq!(buf[..image.len()], image[..]);
        assert!(buf[image.len()..].iter().all(|&b| b == 0xFF));
        Ok(())
    }

    #[test]
    fn test_load_image_too_big() {
        let mut bdev = wl_bdev();
        let image = vec![0u8; bdev.geometry().disk_size as usize + 1];
        assert!(load_image(&mut bdev, &image[..]).is_err());
    }
}

//! The disk I/O table a FAT driver calls into
//!
//! Drives are registered explicitly on a [DiskIo] the caller owns; sector numbers and sizes are
//! those of the block device's read unit.

use log::{debug, error};

use crate::blockdev::{BlockDevice, Ioctl, IoctlResponse};
use crate::error::{Error, Result};

/// Number of drive slots
pub const MAX_DRIVES: usize = 10;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DiskStatus {
    Ready,
    NoDisk,
}

/// Control requests from the filesystem
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DiskControl {
    CtrlSync,
    GetSectorCount,
    GetSectorSize,
    /// Erase block size, in sectors
    GetBlockSize,
    /// Both ends inclusive
    CtrlTrim { start: u32, end: u32 },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DiskControlResponse {
    Done,
    Count(u32),
    Size(usize),
}

pub struct DiskIo {
    drives: [Option<Box<dyn BlockDevice>>; MAX_DRIVES],
}

impl Default for DiskIo {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskIo {
    pub fn new() -> Self {
        Self {
            drives: Default::default(),
        }
    }

    /// Put `device` on drive number `drive`
    pub fn register(&mut self, drive: u8, device: Box<dyn BlockDevice>) -> Result<()> {
        let slot = self
            .drives
            .get_mut(drive as usize)
            .ok_or_else(|| Error::invalid_arg(format!("drive {drive} out of range")))?;
        if slot.is_some() {
            return Err(Error::InvalidState("drive already registered"));
        }
        *slot = Some(device);
        Ok(())
    }

    /// Take the device off `drive`, handing it back to the caller to release
    pub fn unregister(&mut self, drive: u8) -> Option<Box<dyn BlockDevice>> {
        self.drives.get_mut(drive as usize)?.take()
    }

    fn device(&mut self, drive: u8) -> Result<&mut dyn BlockDevice> {
        match self.drives.get_mut(drive as usize) {
            Some(Some(device)) => Ok(device.as_mut()),
            _ => Err(Error::InvalidState("no device registered on drive")),
        }
    }

    pub fn initialize(&mut self, drive: u8) -> DiskStatus {
        self.status(drive)
    }

    pub fn status(&mut self, drive: u8) -> DiskStatus {
        match self.device(drive) {
            Ok(_) => DiskStatus::Ready,
            Err(_) => DiskStatus::NoDisk,
        }
    }

    /// Read `count` sectors starting at `sector` into `buf`
    pub fn read(&mut self, drive: u8, buf: &mut [u8], sector: u32, count: u32) -> Result<()> {
        debug!("read drive {drive}: sector {sector}, count {count}");
        let device = self.device(drive)?;
        let sector_size = device.geometry().read_size;
        if buf.len() < count as usize * sector_size {
            return Err(Error::invalid_arg("buffer smaller than the requested sectors"));
        }

        for (i, chunk) in buf.chunks_exact_mut(sector_size).take(count as usize).enumerate() {
            let addr = (u64::from(sector) + i as u64) * sector_size as u64;
            device
                .read(chunk, addr, sector_size)
                .inspect_err(|e| error!("read of drive {drive} failed: {e}"))?;
        }
        Ok(())
    }

    /// Write `count` sectors from `buf` starting at `sector`
    pub fn write(&mut self, drive: u8, buf: &[u8], sector: u32, count: u32) -> Result<()> {
        debug!("write drive {drive}: sector {sector}, count {count}");
        let device = self.device(drive)?;
        let sector_size = device.geometry().write_size;
        if buf.len() < count as usize * sector_size {
            return Err(Error::invalid_arg("buffer smaller than the requested sectors"));
        }

        for (i, chunk) in buf.chunks_exact(sector_size).take(count as usize).enumerate() {
            let addr = (u64::from(sector) + i as u64) * sector_size as u64;
            device
                .write(chunk, addr)
                .inspect_err(|e| error!("write of drive {drive} failed: {e}"))?;
        }
        Ok(())
    }

    pub fn ioctl(&mut self, drive: u8, cmd: DiskControl) -> Result<DiskControlResponse> {
        let device = self.device(drive)?;
        let geometry = device.geometry();

        match cmd {
            DiskControl::CtrlSync => {
                device.sync()?;
                Ok(DiskControlResponse::Done)
            }
            DiskControl::GetSectorCount => Ok(DiskControlResponse::Count(sector_count(device)?)),
            DiskControl::GetSectorSize => Ok(DiskControlResponse::Size(geometry.read_size)),
            DiskControl::GetBlockSize => Ok(DiskControlResponse::Count(
                (geometry.erase_size / geometry.read_size) as u32,
            )),
            DiskControl::CtrlTrim { start, end } => {
                let available = sector_count(device)?;
                if start > end || end >= available {
                    return Err(Error::invalid_arg(format!(
                        "trim of sectors {start}..={end} on a {available}-sector disk"
                    )));
                }
                for sector in start..=end {
                    device.ioctl(Ioctl::TrimSector(sector))?;
                }
                Ok(DiskControlResponse::Done)
            }
        }
    }
}

/// The engine's capacity on wear-leveled devices, the raw page count otherwise
fn sector_count(device: &mut dyn BlockDevice) -> Result<u32> {
    match device.ioctl(Ioctl::GetAvailableSectors) {
        Ok(IoctlResponse::Count(count)) => Ok(count),
        Ok(_) => Err(Error::InvalidState("unexpected ioctl response")),
        Err(Error::NotSupported) => {
            let geometry = device.geometry();
            Ok((geometry.disk_size / geometry.read_size as u64) as u32)
        }
        Err(e) => Err(e),
    }
}

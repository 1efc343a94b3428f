//! The raw flash view: byte addresses map straight onto physical pages

use log::info;

use super::{BlockDevice, BlockGeometry, FlashInfo, Ioctl, IoctlResponse};
use crate::error::{Error, Result};
use crate::nand::device::NandDevice;
use crate::nand::{EccStatus, Nand};

/// A block device exposing every physical page of a [NandDevice]
pub struct FlashBlockDevice<N: Nand> {
    device: NandDevice<N>,
}

impl<N: Nand> FlashBlockDevice<N> {
    /// Wrap a device that is in raw mode
    pub fn new(device: NandDevice<N>) -> Result<Self> {
        if device.is_wear_leveled() {
            return Err(Error::InvalidState(
                "raw block device over a wear-leveled device",
            ));
        }
        Ok(Self { device })
    }

    pub fn device(&self) -> &NandDevice<N> {
        &self.device
    }

    pub fn read_page(&self, page: u32, offset: usize, buf: &mut [u8]) -> Result<EccStatus> {
        self.device.read_page(page, offset, buf)
    }

    pub fn program_page(&self, page: u32, data: &[u8]) -> Result<()> {
        self.device.program_page(page, data)
    }

    pub fn erase_block(&self, block: u32) -> Result<()> {
        self.device.erase_block(block)
    }

    pub fn is_free_page(&self, page: u32) -> Result<bool> {
        self.device.is_free(page)
    }

    pub fn is_bad_block(&self, block: u32) -> Result<bool> {
        self.device.is_bad(block)
    }

    pub fn mark_bad_block(&self, block: u32) -> Result<()> {
        self.device.mark_bad(block)
    }

    pub fn copy_page(&self, src: u32, dst: u32) -> Result<()> {
        self.device.copy_page(src, dst)
    }

    pub fn flash_info(&self) -> FlashInfo {
        FlashInfo {
            device: self.device.info().clone(),
            geometry: self.device.geometry().clone(),
            last_ecc_status: self.device.last_ecc_status(),
        }
    }

    /// Release the device and everything it owns
    pub fn close(self) -> Result<()> {
        info!("closing flash block device");
        self.device.deinit_device()
    }

    /// Split a byte address into page and offset
    fn locate(&self, addr: u64) -> Result<(u32, usize)> {
        let geometry = self.device.geometry();
        let page = addr >> geometry.log2_page_size;
        let offset = (addr & (geometry.page_size() as u64 - 1)) as usize;
        let page = u32::try_from(page)
            .map_err(|_| Error::invalid_arg(format!("address {addr:#x} out of range")))?;
        Ok((page, offset))
    }
}

impl<N: Nand> BlockDevice for FlashBlockDevice<N> {
    fn geometry(&self) -> BlockGeometry {
        let geometry = self.device.geometry();
        BlockGeometry {
            disk_size: geometry.total_size(),
            read_size: geometry.page_size(),
            write_size: geometry.page_size(),
            erase_size: geometry.block_size(),
            recommended_read_size: geometry.page_size(),
            recommended_write_size: geometry.page_size(),
            recommended_erase_size: geometry.block_size(),
        }
    }

    fn read(&mut self, dst: &mut [u8], src_addr: u64, len: usize) -> Result<()> {
        if len > dst.len() {
            return Err(Error::invalid_arg(format!(
                "read of {len} bytes into a {}-byte buffer",
                dst.len()
            )));
        }
        let (page, offset) = self.locate(src_addr)?;
        if offset + len > self.device.geometry().page_size() {
            return Err(Error::invalid_arg(format!(
                "read of {len} bytes at {src_addr:#x} crosses a page boundary"
            )));
        }

        self.read_page(page, offset, &mut dst[..len]).map(|_| ())
    }

    fn write(&mut self, src: &[u8], dst_addr: u64) -> Result<()> {
        let (page, offset) = self.locate(dst_addr)?;
        if offset != 0 {
            return Err(Error::invalid_arg(format!(
                "write at {dst_addr:#x} is not page-aligned"
            )));
        }
        if src.len() != self.device.geometry().page_size() {
            return Err(Error::invalid_arg(format!(
                "write of {} bytes, pages are {}",
                src.len(),
                self.device.geometry().page_size()
            )));
        }

        self.program_page(page, src)
    }

    fn erase(&mut self, addr: u64, len: u64) -> Result<()> {
        let geometry = self.device.geometry();
        let block_size = geometry.block_size() as u64;
        if addr % block_size != 0 || len % block_size != 0 || len == 0 {
            return Err(Error::invalid_arg(format!(
                "erase of {len} bytes at {addr:#x} is not block-aligned"
            )));
        }

        let first = addr / block_size;
        let last = addr.checked_add(len).map(|end| end / block_size);
        let Some(last) = last.filter(|&last| last <= u64::from(geometry.num_blocks)) else {
            return Err(Error::invalid_arg(format!(
                "erase of {len} bytes at {addr:#x} runs past the end of the device"
            )));
        };

        for block in first..last {
            self.erase_block(block as u32)?;
        }
        Ok(())
    }

    fn ioctl(&mut self, cmd: Ioctl) -> Result<IoctlResponse> {
        Ok(match cmd {
            Ioctl::IsBadBlock(block) => IoctlResponse::Flag(self.is_bad_block(block)?),
            Ioctl::MarkBadBlock(block) => {
                self.mark_bad_block(block)?;
                IoctlResponse::Done
            }
            Ioctl::IsFreePage(page) => IoctlResponse::Flag(self.is_free_page(page)?),
            Ioctl::GetPageEccStatus(page) => {
                IoctlResponse::Ecc(self.device.page_ecc_status(page)?)
            }
            Ioctl::GetFlashInfo => IoctlResponse::FlashInfo(self.flash_info()),
            Ioctl::GetBadBlockCount => {
                IoctlResponse::Count(self.device.bad_block_stats()?.count)
            }
            Ioctl::CopyPage { src, dst } => {
                self.copy_page(src, dst)?;
                IoctlResponse::Done
            }
            Ioctl::GetEccStats => IoctlResponse::EccStats(self.device.ecc_stats()?),
            Ioctl::GetAvailableSectors | Ioctl::TrimSector(_) => {
                return Err(Error::NotSupported)
            }
        })
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn release(self: Box<Self>) -> Result<()> {
        self.close()
    }
}

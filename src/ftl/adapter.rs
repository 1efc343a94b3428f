//! The shim between a flash-translation engine and the flash it runs on
//!
//! The same adapter drives either a bare device (while its lock is already held) or a flash
//! block device (which takes the device lock per call). Errors are translated, never retried:
//! recovery is the engine's business.

use log::warn;

use super::{FlashTarget, Ftl, FtlError};
use crate::blockdev::flash::FlashBlockDevice;
use crate::error::{Error, Result};
use crate::nand::device::Chip;
use crate::nand::{EccStatus, Geometry, Nand};

/// State the shim keeps between calls for one attached engine
#[derive(Debug, Default)]
pub struct ShimState {
    refresh_pending: bool,
}

/// Where the adapter sends the engine's requests
pub enum Attachment<'a, N: Nand> {
    /// Straight to the primitives of a device whose lock the caller holds
    Direct(&'a mut Chip<N>),

    /// Through a flash block device, one locked call at a time
    BlockDevice(&'a FlashBlockDevice<N>),
}

pub struct NandAdapter<'a, N: Nand> {
    target: Attachment<'a, N>,
    shim: &'a mut ShimState,
}

impl<'a, N: Nand> NandAdapter<'a, N> {
    pub fn direct(chip: &'a mut Chip<N>, shim: &'a mut ShimState) -> Self {
        Self {
            target: Attachment::Direct(chip),
            shim,
        }
    }

    pub fn block_device(bdev: &'a FlashBlockDevice<N>, shim: &'a mut ShimState) -> Self {
        Self {
            target: Attachment::BlockDevice(bdev),
            shim,
        }
    }

    fn geometry(&self) -> &Geometry {
        match &self.target {
            Attachment::Direct(chip) => chip.geometry(),
            Attachment::BlockDevice(bdev) => bdev.device().geometry(),
        }
    }

    /// Did a read since the last call come back corrected enough to need rewriting?
    pub fn take_refresh(&mut self) -> bool {
        std::mem::take(&mut self.shim.refresh_pending)
    }

    fn translate(&self, err: Error) -> FtlError {
        match err {
            Error::EccUncorrectable { page } => FtlError::Ecc { page },
            Error::ProgramFailed { page } => FtlError::BadBlock {
                block: self.geometry().block_of(page),
            },
            Error::EraseFailed { block } => FtlError::BadBlock { block },
            e => FtlError::Device(e),
        }
    }

    fn note_ecc(&mut self, status: EccStatus) {
        if status.exceeds(self.geometry().ecc.refresh_threshold) {
            self.shim.refresh_pending = true;
        }
    }
}

impl<N: Nand> FlashTarget for NandAdapter<'_, N> {
    fn log2_page_size(&self) -> u8 {
        self.geometry().log2_page_size
    }

    fn log2_pages_per_block(&self) -> u8 {
        self.geometry().log2_pages_per_block
    }

    fn num_blocks(&self) -> u32 {
        self.geometry().num_blocks
    }

    fn is_bad(&mut self, block: u32) -> Result<bool, FtlError> {
        let result = match &mut self.target {
            Attachment::Direct(chip) => chip.is_bad(block),
            Attachment::BlockDevice(bdev) => bdev.is_bad_block(block),
        };
        result.map_err(|e| self.translate(e))
    }

    fn mark_bad(&mut self, block: u32) -> Result<(), FtlError> {
        warn!("retiring bad block {block}");
        let result = match &mut self.target {
            Attachment::Direct(chip) => chip.mark_bad(block),
            Attachment::BlockDevice(bdev) => bdev.mark_bad_block(block),
        };
        result.map_err(|e| self.translate(e))
    }

    fn erase(&mut self, block: u32) -> Result<(), FtlError> {
        let result = match &mut self.target {
            Attachment::Direct(chip) => chip.erase_block(block),
            Attachment::BlockDevice(bdev) => bdev.erase_block(block),
        };
        result.map_err(|e| self.translate(e))
    }

    fn prog(&mut self, page: u32, data: &[u8]) -> Result<(), FtlError> {
        let result = match &mut self.target {
            Attachment::Direct(chip) => chip.program(page, data),
            Attachment::BlockDevice(bdev) => bdev.program_page(page, data),
        };
        result.map_err(|e| self.translate(e))
    }

    fn is_free(&mut self, page: u32) -> Result<bool, FtlError> {
        let result = match &mut self.target {
            Attachment::Direct(chip) => chip.is_free(page),
            Attachment::BlockDevice(bdev) => bdev.is_free_page(page),
        };
        result.map_err(|e| self.translate(e))
    }

    fn read(&mut self, page: u32, offset: usize, buf: &mut [u8]) -> Result<(), FtlError> {
        let result = match &mut self.target {
            Attachment::Direct(chip) => chip.read(page, offset, buf),
            Attachment::BlockDevice(bdev) => bdev.read_page(page, offset, buf),
        };
        match result {
            Ok(status) => {
                self.note_ecc(status);
                Ok(())
            }
            Err(e) => Err(self.translate(e)),
        }
    }

    fn copy(&mut self, src: u32, dst: u32) -> Result<(), FtlError> {
        let result = match &mut self.target {
            Attachment::Direct(chip) => chip.copy(src, dst),
            Attachment::BlockDevice(bdev) => bdev.copy_page(src, dst),
        };
        result.map_err(|e| self.translate(e))
    }
}

/// Read a logical sector, rewriting it through the engine when the flash had to correct
/// enough bits to reach the refresh threshold.
///
/// A failed rewrite is reported as the error of the read.
pub fn read_refreshing<N: Nand>(
    engine: &mut dyn Ftl,
    adapter: &mut NandAdapter<'_, N>,
    sector: u32,
    buf: &mut [u8],
) -> Result<()> {
    adapter.take_refresh();
    engine.read(adapter, sector, buf)?;

    if adapter.take_refresh() {
        warn!("refreshing sector {sector} after ECC correction");
        engine.write(adapter, sector, buf)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use crate::nand::device::NandDevice;
    use crate::nand::spi::sim::{SimChip, SimLayout};
    use crate::nand::spi::SpiNand;
    use crate::nand::DeviceInfo;

    fn sim_device() -> NandDevice<SpiNand<SimChip>> {
        let nand = SpiNand::with_geometry(
            SimChip::new(SimLayout::SMALL),
            SimLayout::SMALL.geometry(),
            DeviceInfo::default(),
            &Config::default(),
        );
        NandDevice::init_device(nand, &Config::default()).unwrap()
    }

    #[test]
    fn test_error_translation() -> anyhow::Result<()> {
        let device = sim_device();
        device.with_nand(|nand| {
            nand.transport_mut().fail_program(37);
            nand.transport_mut().fail_erase(4);
            nand.transport_mut().set_ecc(40, EccStatus::Uncorrectable);
        });

        device.with_chip(|chip| {
            let mut shim = ShimState::default();
            let mut adapter = NandAdapter::direct(chip, &mut shim);

            assert!(matches!(
                adapter.prog(37, &[0u8; 512]),
                Err(FtlError::BadBlock { block: 2 })
            ));
            assert!(matches!(
                adapter.erase(4),
                Err(FtlError::BadBlock { block: 4 })
            ));
            let mut buf = [0u8; 512];
            assert!(matches!(
                adapter.read(40, 0, &mut buf),
                Err(FtlError::Ecc { page: 40 })
            ));
            assert!(matches!(
                adapter.read(1 << 20, 0, &mut buf),
                Err(FtlError::Device(Error::InvalidArgument(_)))
            ));
        });
        Ok(())
    }

    #[test]
    fn test_refresh_flag() -> anyhow::Result<()> {
        let device = sim_device();
        device.with_nand(|nand| {
            nand.transport_mut().set_ecc(8, EccStatus::Corrected1To3);
            nand.transport_mut().set_ecc(9, EccStatus::Corrected4To6);
        });

        let bdev = FlashBlockDevice::new(device)?;
        let mut shim = ShimState::default();
        let mut adapter = NandAdapter::block_device(&bdev, &mut shim);
        let mut buf = [0u8; 16];

        adapter.read(8, 0, &mut buf)?;
        assert!(!adapter.take_refresh());

        adapter.read(9, 0, &mut buf)?;
        assert!(adapter.take_refresh());
        assert!(!adapter.take_refresh());
        Ok(())
    }

    #[test]
    fn test_block_device_mode() -> anyhow::Result<()> {
        let bdev = FlashBlockDevice::new(sim_device())?;
        let mut shim = ShimState::default();
        let mut adapter = NandAdapter::block_device(&bdev, &mut shim);

        assert_eq!(adapter.log2_page_size(), 9);
        assert_eq!(adapter.log2_pages_per_block(), 4);
        assert_eq!(adapter.num_blocks(), 32);

        assert!(adapter.is_free(17)?);
        adapter.prog(17, &[0x42; 512])?;
        assert!(!adapter.is_free(17)?);
        adapter.copy(17, 18)?;

        let mut buf = [0u8; 512];
        adapter.read(18, 0, &mut buf)?;
        assert_eq!(buf, [0x42; 512]);

        adapter.erase(1)?;
        assert!(adapter.is_free(17)?);

        assert!(!adapter.is_bad(6)?);
        adapter.mark_bad(6)?;
        assert!(adapter.is_bad(6)?);
        Ok(())
    }
}

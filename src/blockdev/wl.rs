//! The wear-leveled view: a logical disk mapped onto flash by an engine
//!
//! Addresses are logical; the engine decides where each page lands and moves data around
//! during garbage collection. `erase` only trims, since the engine owns erasure.

use log::{info, warn};

use super::flash::FlashBlockDevice;
use super::{BlockDevice, BlockGeometry, Ioctl, IoctlResponse};
use crate::error::{Error, Result};
use crate::ftl::adapter::{read_refreshing, NandAdapter, ShimState};
use crate::ftl::{Ftl, LogMap};
use crate::nand::Nand;

pub struct WlBlockDevice<N: Nand> {
    flash: FlashBlockDevice<N>,
    engine: Box<dyn Ftl>,
    shim: ShimState,
}

impl<N: Nand> WlBlockDevice<N> {
    /// Layer `engine` over `flash`, picking up any map already on flash.
    ///
    /// The device under `flash` refuses its own sector operations until this is released.
    pub fn new(flash: FlashBlockDevice<N>, mut engine: Box<dyn Ftl>) -> Result<Self> {
        flash.device().claim_composed()?;

        let mut shim = ShimState::default();
        let attached = {
            let mut adapter = NandAdapter::block_device(&flash, &mut shim);
            engine.resume(&mut adapter).or_else(|e| {
                info!("no usable map on flash ({e}), starting empty");
                engine.clear(&mut adapter)
            })
        };
        if let Err(e) = attached {
            flash.device().release_composed();
            return Err(e.into());
        }

        info!(
            "wear-leveled block device: {} sectors of {} bytes",
            engine.capacity(),
            flash.device().geometry().page_size()
        );
        Ok(Self {
            flash,
            engine,
            shim,
        })
    }

    /// Layer a [LogMap] sized by the device configuration over `flash`
    pub fn with_log_map(flash: FlashBlockDevice<N>) -> Result<Self> {
        let engine = LogMap::from_config(flash.device().config());
        Self::new(flash, Box::new(engine))
    }

    pub fn flash(&self) -> &FlashBlockDevice<N> {
        &self.flash
    }

    pub fn capacity(&self) -> u32 {
        self.engine.capacity()
    }

    fn page_size(&self) -> usize {
        self.flash.device().geometry().page_size()
    }

    fn parts(&mut self) -> (&mut dyn Ftl, NandAdapter<'_, N>) {
        let Self {
            flash,
            engine,
            shim,
        } = self;
        (engine.as_mut(), NandAdapter::block_device(flash, shim))
    }

    /// Check a byte span is a whole number of pages inside the logical disk and return its
    /// first sector and sector count
    fn sectors(&self, addr: u64, len: usize) -> Result<(u32, u32)> {
        let page_size = self.page_size() as u64;
        if addr % page_size != 0 || len as u64 % page_size != 0 {
            return Err(Error::invalid_arg(format!(
                "{len} bytes at {addr:#x} are not whole pages"
            )));
        }

        let first = addr / page_size;
        let count = len as u64 / page_size;
        if first + count > u64::from(self.capacity()) {
            return Err(Error::invalid_arg(format!(
                "{len} bytes at {addr:#x} run past the end of the disk"
            )));
        }
        Ok((first as u32, count as u32))
    }

    /// Sync and split back into the flash device and the engine
    pub fn detach(mut self) -> Result<(FlashBlockDevice<N>, Box<dyn Ftl>)> {
        BlockDevice::sync(&mut self)?;
        self.flash.device().release_composed();
        Ok((self.flash, self.engine))
    }

    /// Sync, then release the flash device underneath
    pub fn close(mut self) -> Result<()> {
        let synced = BlockDevice::sync(&mut self);
        if let Err(e) = &synced {
            warn!("sync before release failed: {e}");
        }
        self.flash.device().release_composed();
        self.flash.close()?;
        synced
    }
}

impl<N: Nand> BlockDevice for WlBlockDevice<N> {
    fn geometry(&self) -> BlockGeometry {
        let page_size = self.page_size();
        BlockGeometry {
            disk_size: u64::from(self.capacity()) * page_size as u64,
            read_size: page_size,
            write_size: page_size,
            erase_size: page_size,
            recommended_read_size: page_size,
            recommended_write_size: page_size,
            recommended_erase_size: self.flash.device().geometry().block_size(),
        }
    }

    fn read(&mut self, dst: &mut [u8], src_addr: u64, len: usize) -> Result<()> {
        if len > dst.len() {
            return Err(Error::invalid_arg(format!(
                "read of {len} bytes into a {}-byte buffer",
                dst.len()
            )));
        }
        let (first, _) = self.sectors(src_addr, len)?;
        let page_size = self.page_size();

        let (engine, mut adapter) = self.parts();
        for (sector, chunk) in (first..).zip(dst[..len].chunks_exact_mut(page_size)) {
            read_refreshing(engine, &mut adapter, sector, chunk)?;
        }
        Ok(())
    }

    fn write(&mut self, src: &[u8], dst_addr: u64) -> Result<()> {
        if src.is_empty() {
            return Err(Error::invalid_arg("empty write"));
        }
        let (first, _) = self.sectors(dst_addr, src.len())?;
        let page_size = self.page_size();

        let (engine, mut adapter) = self.parts();
        for (sector, chunk) in (first..).zip(src.chunks_exact(page_size)) {
            engine.write(&mut adapter, sector, chunk)?;
        }
        Ok(())
    }

    fn erase(&mut self, addr: u64, len: u64) -> Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| Error::invalid_arg(format!("erase of {len} bytes")))?;
        let (first, count) = self.sectors(addr, len)?;

        let (engine, mut adapter) = self.parts();
        for sector in first..first + count {
            engine.trim(&mut adapter, sector)?;
        }
        engine.gc(&mut adapter)?;
        Ok(())
    }

    fn ioctl(&mut self, cmd: Ioctl) -> Result<IoctlResponse> {
        match cmd {
            Ioctl::GetAvailableSectors => Ok(IoctlResponse::Count(self.capacity())),
            Ioctl::TrimSector(sector) => {
                let (engine, mut adapter) = self.parts();
                engine.trim(&mut adapter, sector)?;
                Ok(IoctlResponse::Done)
            }
            Ioctl::GetFlashInfo | Ioctl::GetBadBlockCount | Ioctl::GetEccStats => {
                self.flash.ioctl(cmd)
            }
            _ => Err(Error::NotSupported),
        }
    }

    fn sync(&mut self) -> Result<()> {
        let (engine, mut adapter) = self.parts();
        Ok(engine.sync(&mut adapter)?)
    }

    fn release(self: Box<Self>) -> Result<()> {
        self.close()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{Config, EmulConfig, Layout};
    use crate::ftl::LogMap;
    use crate::nand::device::NandDevice;
    use crate::nand::emul::EmulNand;
    use crate::nand::spi::sim::{SimChip, SimLayout};
    use crate::nand::spi::SpiNand;
    use crate::nand::{DeviceInfo, EccStatus, PageUtil};
    use crate::util::{check_pattern, fill_pattern};

    const TEST_LAYOUT: Layout = Layout {
        blocks: 32,
        pages_per_block: 16,
        bytes_per_page: 512,
    };

    fn emul_flash(cfg: &EmulConfig) -> FlashBlockDevice<EmulNand> {
        let nand = EmulNand::open(cfg, &Config::default()).unwrap();
        FlashBlockDevice::new(NandDevice::init_device(nand, &Config::default()).unwrap()).unwrap()
    }

    fn emul_wl() -> WlBlockDevice<EmulNand> {
        let flash = emul_flash(&EmulConfig::with_layout(TEST_LAYOUT));
        WlBlockDevice::new(flash, Box::new(LogMap::new(45))).unwrap()
    }

    fn sim_wl(chip: SimChip) -> WlBlockDevice<SpiNand<SimChip>> {
        let nand = SpiNand::with_geometry(
            chip,
            SimLayout::SMALL.geometry(),
            DeviceInfo::default(),
            &Config::default(),
        );
        let device = NandDevice::init_device(nand, &Config::default()).unwrap();
        let flash = FlashBlockDevice::new(device).unwrap();
        WlBlockDevice::new(flash, Box::new(LogMap::new(45))).unwrap()
    }

    #[test]
    fn test_log_map_follows_config() -> anyhow::Result<()> {
        let config = Config {
            gc_factor: 8,
            ..Default::default()
        };
        let nand = EmulNand::open(&EmulConfig::with_layout(TEST_LAYOUT), &config)?;
        let flash = FlashBlockDevice::new(NandDevice::init_device(nand, &config)?)?;

        let wl = WlBlockDevice::with_log_map(flash)?;
        assert_eq!(wl.capacity(), 26 * 15);
        wl.close()?;
        Ok(())
    }

    #[test]
    fn test_geometry() {
        let wl = emul_wl();
        let geometry = wl.geometry();
        assert_eq!(geometry.disk_size, u64::from(wl.capacity()) * 512);
        assert!(geometry.disk_size < 32 * 16 * 512);
        assert_eq!(geometry.write_size, 512);
        assert_eq!(geometry.recommended_erase_size, 16 * 512);
    }

    #[test]
    fn test_multi_page_round_trip() -> anyhow::Result<()> {
        let mut wl = emul_wl();
        let mut data = vec![0u8; 4 * 512];
        fill_pattern(42, &mut data);
        wl.write(&data, 10 * 512)?;

        let mut buf = vec![0u8; 4 * 512];
        wl.read(&mut buf, 10 * 512, 4 * 512)?;
        assert_eq!(buf, data);

        // One page out of the middle
        wl.read(&mut buf, 12 * 512, 512)?;
        assert_eq!(buf[..512], data[1024..1536]);
        Ok(())
    }

    #[test]
    fn test_alignment_enforced() {
        let mut wl = emul_wl();
        let end = wl.geometry().disk_size;
        let mut buf = vec![0u8; 1024];

        assert!(matches!(
            wl.write(&buf[..512], 100),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            wl.write(&buf[..300], 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(wl.write(&[], 0), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            wl.write(&buf[..512], end),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            wl.read(&mut buf, 256, 512),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            wl.read(&mut buf[..512], 0, 1024),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            wl.erase(0, 100),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_erase_trims() -> anyhow::Result<()> {
        let mut wl = emul_wl();
        let data = vec![0x5A; 3 * 512];
        wl.write(&data, 0)?;

        wl.erase(512, 1024)?;
        let mut buf = vec![0u8; 3 * 512];
        wl.read(&mut buf, 0, 3 * 512)?;
        assert_eq!(buf[..512], [0x5A; 512]);
        assert!(buf[512..].is_erased());
        Ok(())
    }

    #[test]
    fn test_ioctls() -> anyhow::Result<()> {
        let mut wl = emul_wl();
        let capacity = wl.capacity();
        assert_eq!(
            wl.ioctl(Ioctl::GetAvailableSectors)?,
            IoctlResponse::Count(capacity)
        );

        wl.write(&[0x01; 512], 0)?;
        assert_eq!(wl.ioctl(Ioctl::TrimSector(0))?, IoctlResponse::Done);
        let mut buf = vec![0u8; 512];
        wl.read(&mut buf, 0, 512)?;
        assert!(buf.is_erased());

        assert_eq!(wl.ioctl(Ioctl::GetBadBlockCount)?, IoctlResponse::Count(0));
        assert!(matches!(
            wl.ioctl(Ioctl::GetFlashInfo)?,
            IoctlResponse::FlashInfo(_)
        ));
        assert!(matches!(
            wl.ioctl(Ioctl::GetEccStats)?,
            IoctlResponse::EccStats(_)
        ));
        assert!(matches!(
            wl.ioctl(Ioctl::IsBadBlock(0)),
            Err(Error::NotSupported)
        ));
        assert!(matches!(
            wl.ioctl(Ioctl::CopyPage { src: 0, dst: 1 }),
            Err(Error::NotSupported)
        ));
        Ok(())
    }

    #[test]
    fn test_device_claimed_while_composed() -> anyhow::Result<()> {
        let wl = emul_wl();
        assert!(matches!(
            wl.flash().device().write_sector(0, &[0; 512]),
            Err(Error::InvalidState(_))
        ));

        let (flash, _engine) = wl.detach()?;
        flash.device().write_sector(0, &[0; 512])?;
        Ok(())
    }

    #[test]
    fn test_refresh_on_read() -> anyhow::Result<()> {
        let mut wl = sim_wl(SimChip::new(SimLayout::SMALL));
        let mut data = vec![0u8; 512];
        fill_pattern(3, &mut data);
        wl.write(&data, 0)?;

        wl.flash()
            .device()
            .with_nand(|nand| nand.transport_mut().set_ecc(0, EccStatus::Corrected4To6));

        let mut buf = vec![0u8; 512];
        wl.read(&mut buf, 0, 512)?;
        assert!(check_pattern(3, &buf));
        assert!(!wl.flash().is_free_page(1)?);
        Ok(())
    }

    #[test]
    fn test_program_failure_retires_block() -> anyhow::Result<()> {
        let chip = SimChip::new(SimLayout::SMALL);
        let mut wl = sim_wl(chip);
        wl.flash()
            .device()
            .with_nand(|nand| nand.transport_mut().fail_program(2));

        let mut data = vec![0u8; 4 * 512];
        fill_pattern(8, &mut data);
        wl.write(&data, 0)?;

        let mut buf = vec![0u8; 4 * 512];
        wl.read(&mut buf, 0, 4 * 512)?;
        assert_eq!(buf, data);
        assert!(wl.flash().is_bad_block(0)?);
        assert_eq!(wl.ioctl(Ioctl::GetBadBlockCount)?, IoctlResponse::Count(1));
        Ok(())
    }

    #[test]
    fn test_uncorrectable_read_fails() -> anyhow::Result<()> {
        let mut wl = sim_wl(SimChip::new(SimLayout::SMALL));
        wl.write(&[0x77; 512], 0)?;
        wl.flash()
            .device()
            .with_nand(|nand| nand.transport_mut().set_ecc(0, EccStatus::Uncorrectable));

        let mut buf = vec![0u8; 512];
        assert!(matches!(
            wl.read(&mut buf, 0, 512),
            Err(Error::EccUncorrectable { page: 0 })
        ));
        Ok(())
    }

    #[test]
    fn test_data_survives_reopen() -> anyhow::Result<()> {
        let cfg = EmulConfig {
            keep_dump: true,
            ..EmulConfig::with_layout(TEST_LAYOUT)
        };
        let flash = emul_flash(&cfg);
        let path = flash.device().with_nand(|n| n.flash().path().to_owned());

        let mut wl = WlBlockDevice::new(flash, Box::new(LogMap::new(45)))?;
        let mut data = vec![0u8; 8 * 512];
        fill_pattern(99, &mut data);
        wl.write(&data, 512)?;
        Box::new(wl).release()?;
        assert!(path.exists());

        let cfg = EmulConfig {
            path: Some(path.clone()),
            reuse_existing: true,
            keep_dump: false,
            ..cfg
        };
        let mut wl = WlBlockDevice::new(emul_flash(&cfg), Box::new(LogMap::new(45)))?;
        let mut buf = vec![0u8; 8 * 512];
        wl.read(&mut buf, 512, 8 * 512)?;
        assert_eq!(buf, data);

        wl.close()?;
        assert!(!path.exists());
        Ok(())
    }
}

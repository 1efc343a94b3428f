//! The device instance: one NAND backend behind one mutex
//!
//! Every primitive takes the lock for its whole duration, including the wait for the chip to
//! become ready, so callers on different threads serialize transparently. The scratch buffers
//! live inside the lock and are never reachable once a call returns.

use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::ftl::adapter::{read_refreshing, NandAdapter, ShimState};
use crate::ftl::{Ftl, LogMap};
use crate::nand::{DeviceInfo, EccStatus, Geometry, Nand, Scratch};

/// A backend plus the buffers and bookkeeping that go with it. Only reachable under the
/// device lock.
#[derive(Debug)]
pub struct Chip<N: Nand> {
    nand: N,
    scratch: Scratch,
    last_ecc: EccStatus,
}

impl<N: Nand> Chip<N> {
    fn new(nand: N) -> Result<Self> {
        let scratch = Scratch::new(nand.geometry().page_size())?;
        Ok(Self {
            nand,
            scratch,
            last_ecc: EccStatus::Ok,
        })
    }

    pub fn geometry(&self) -> &Geometry {
        self.nand.geometry()
    }

    fn check_span(&self, page: u32, offset: usize, len: usize) -> Result<()> {
        self.geometry().check_page(page)?;
        let page_size = self.geometry().page_size();
        match offset.checked_add(len) {
            Some(end) if end <= page_size => Ok(()),
            _ => Err(Error::invalid_arg(format!(
                "{len} bytes at offset {offset} cross the end of a {page_size}-byte page"
            ))),
        }
    }

    pub fn read(&mut self, page: u32, offset: usize, buf: &mut [u8]) -> Result<EccStatus> {
        self.check_span(page, offset, buf.len())?;
        match self.nand.read(page, offset, buf) {
            Ok(status) => {
                self.last_ecc = status;
                Ok(status)
            }
            Err(e) => {
                if let Error::EccUncorrectable { .. } = e {
                    self.last_ecc = EccStatus::Uncorrectable;
                    warn!("uncorrectable read of page {page}");
                } else {
                    debug!("read of page {page} failed: {e}");
                }
                Err(e)
            }
        }
    }

    pub fn ecc_status(&mut self, page: u32) -> Result<EccStatus> {
        self.geometry().check_page(page)?;
        let status = self.nand.ecc_status(page)?;
        self.last_ecc = status;
        Ok(status)
    }

    pub fn program(&mut self, page: u32, data: &[u8]) -> Result<()> {
        self.check_span(page, 0, data.len())?;
        if data.len() != self.geometry().page_size() {
            return Err(Error::invalid_arg(format!(
                "program of {} bytes, pages are {}",
                data.len(),
                self.geometry().page_size()
            )));
        }
        self.nand
            .program(page, data, &mut self.scratch)
            .inspect_err(|e| debug!("program of page {page} failed: {e}"))
    }

    pub fn erase_block(&mut self, block: u32) -> Result<()> {
        self.geometry().check_block(block)?;
        self.nand
            .erase_block(block)
            .inspect_err(|e| debug!("erase of block {block} failed: {e}"))
    }

    pub fn is_free(&mut self, page: u32) -> Result<bool> {
        self.geometry().check_page(page)?;
        self.nand.is_free(page)
    }

    pub fn is_bad(&mut self, block: u32) -> Result<bool> {
        self.geometry().check_block(block)?;
        self.nand.is_bad(block)
    }

    pub fn mark_bad(&mut self, block: u32) -> Result<()> {
        self.geometry().check_block(block)?;
        warn!("marking block {block} bad");
        self.nand.mark_bad(block)
    }

    pub fn copy(&mut self, src: u32, dst: u32) -> Result<()> {
        self.geometry().check_page(src)?;
        self.geometry().check_page(dst)?;
        self.nand
            .copy(src, dst, &mut self.scratch)
            .inspect_err(|e| debug!("copy of page {src} to {dst} failed: {e}"))
    }

    pub fn last_ecc_status(&self) -> EccStatus {
        self.last_ecc
    }
}

/// Logical sector operations; what they mean depends on the device mode
trait SectorOps<N: Nand> {
    fn capacity(&self, chip: &Chip<N>) -> u32;

    fn read_sector(&mut self, chip: &mut Chip<N>, sector: u32, buf: &mut [u8]) -> Result<()>;

    fn write_sector(&mut self, chip: &mut Chip<N>, sector: u32, data: &[u8]) -> Result<()>;

    fn trim(&mut self, chip: &mut Chip<N>, sector: u32) -> Result<()>;

    fn sync(&mut self, chip: &mut Chip<N>) -> Result<()>;

    fn gc(&mut self, chip: &mut Chip<N>) -> Result<()>;

    /// Copy by reading into the temp buffer and writing it back out
    fn copy_sector(&mut self, chip: &mut Chip<N>, src: u32, dst: u32) -> Result<()> {
        let mut temp = mem::take(&mut chip.scratch.temp);
        let result = self
            .read_sector(chip, src, &mut temp)
            .and_then(|()| self.write_sector(chip, dst, &temp));
        chip.scratch.temp = temp;
        result
    }
}

/// Sectors are physical pages
#[derive(Debug, Default)]
struct RawOps;

impl<N: Nand> SectorOps<N> for RawOps {
    fn capacity(&self, chip: &Chip<N>) -> u32 {
        chip.geometry().num_pages()
    }

    fn read_sector(&mut self, chip: &mut Chip<N>, sector: u32, buf: &mut [u8]) -> Result<()> {
        chip.read(sector, 0, buf).map(|_| ())
    }

    fn write_sector(&mut self, chip: &mut Chip<N>, sector: u32, data: &[u8]) -> Result<()> {
        chip.program(sector, data)
    }

    fn trim(&mut self, chip: &mut Chip<N>, sector: u32) -> Result<()> {
        // Nothing to forget without a map.
        chip.geometry().check_page(sector)
    }

    fn sync(&mut self, _chip: &mut Chip<N>) -> Result<()> {
        Ok(())
    }

    fn gc(&mut self, _chip: &mut Chip<N>) -> Result<()> {
        Ok(())
    }

    fn copy_sector(&mut self, chip: &mut Chip<N>, src: u32, dst: u32) -> Result<()> {
        chip.copy(src, dst)
    }
}

/// Sectors are logical, mapped by an attached engine
struct WearLeveledOps {
    engine: Box<dyn Ftl>,
    shim: ShimState,
}

impl<N: Nand> SectorOps<N> for WearLeveledOps {
    fn capacity(&self, _chip: &Chip<N>) -> u32 {
        self.engine.capacity()
    }

    fn read_sector(&mut self, chip: &mut Chip<N>, sector: u32, buf: &mut [u8]) -> Result<()> {
        let mut adapter = NandAdapter::direct(chip, &mut self.shim);
        read_refreshing(self.engine.as_mut(), &mut adapter, sector, buf)
    }

    fn write_sector(&mut self, chip: &mut Chip<N>, sector: u32, data: &[u8]) -> Result<()> {
        let mut adapter = NandAdapter::direct(chip, &mut self.shim);
        Ok(self.engine.write(&mut adapter, sector, data)?)
    }

    fn trim(&mut self, chip: &mut Chip<N>, sector: u32) -> Result<()> {
        let mut adapter = NandAdapter::direct(chip, &mut self.shim);
        Ok(self.engine.trim(&mut adapter, sector)?)
    }

    fn sync(&mut self, chip: &mut Chip<N>) -> Result<()> {
        let mut adapter = NandAdapter::direct(chip, &mut self.shim);
        Ok(self.engine.sync(&mut adapter)?)
    }

    fn gc(&mut self, chip: &mut Chip<N>) -> Result<()> {
        let mut adapter = NandAdapter::direct(chip, &mut self.shim);
        Ok(self.engine.gc(&mut adapter)?)
    }
}

/// What the sector operations of a device do
enum Ops {
    Raw(RawOps),
    WearLeveled(WearLeveledOps),
    /// A wear-leveled block device owns the engine and drives this device through its flash
    /// block device; sector operations here would bypass its map
    Composed,
}

struct Inner<N: Nand> {
    chip: Chip<N>,
    ops: Ops,
}

impl<N: Nand> Inner<N> {
    fn split(&mut self) -> Result<(&mut dyn SectorOps<N>, &mut Chip<N>)> {
        let ops: &mut dyn SectorOps<N> = match &mut self.ops {
            Ops::Raw(raw) => raw,
            Ops::WearLeveled(wl) => wl,
            Ops::Composed => {
                return Err(Error::InvalidState(
                    "device is in use by a wear-leveled block device",
                ))
            }
        };
        Ok((ops, &mut self.chip))
    }
}

/// Result of a full bad-block scan
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BadBlockStats {
    pub count: u32,
    pub blocks: Vec<u32>,
}

/// Result of a full ECC scan over every written page
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct EccStats {
    /// Written pages that were checked
    pub pages: u32,
    /// Pages that needed any correction
    pub total: u32,
    pub uncorrected: u32,
    /// Pages whose correction reached the refresh threshold
    pub exceeding_threshold: u32,
}

/// A NAND device shared between threads
pub struct NandDevice<N: Nand> {
    geometry: Geometry,
    info: DeviceInfo,
    config: Config,
    inner: Mutex<Inner<N>>,
}

impl<N: Nand> NandDevice<N> {
    /// Take ownership of a detected backend and allocate its scratch buffers
    pub fn init_device(nand: N, config: &Config) -> Result<Self> {
        let geometry = nand.geometry().clone();
        let info = nand.info().clone();
        let chip = Chip::new(nand)?;

        info!(
            "{} ready: {} blocks of {} x {} bytes",
            if info.chip_name.is_empty() {
                "NAND"
            } else {
                info.chip_name.as_str()
            },
            geometry.num_blocks,
            geometry.pages_per_block(),
            geometry.page_size()
        );

        Ok(Self {
            geometry,
            info,
            config: config.clone(),
            inner: Mutex::new(Inner {
                chip,
                ops: Ops::Raw(RawOps),
            }),
        })
    }

    /// Sync an attached engine and release the device
    pub fn deinit_device(self) -> Result<()> {
        let mut inner = self.inner.into_inner().unwrap_or_else(PoisonError::into_inner);
        let (ops, chip) = inner.split()?;
        ops.sync(chip)?;
        info!("released NAND device");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner<N>> {
        // The protected state is plain bytes; a panic mid-operation leaves nothing to repair.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run `f` on the backend under the device lock
    pub fn with_nand<R>(&self, f: impl FnOnce(&mut N) -> R) -> R {
        f(&mut self.lock().chip.nand)
    }

    /// Run `f` on the checked primitives under the device lock
    pub fn with_chip<R>(&self, f: impl FnOnce(&mut Chip<N>) -> R) -> R {
        f(&mut self.lock().chip)
    }

    pub fn read_page(&self, page: u32, offset: usize, buf: &mut [u8]) -> Result<EccStatus> {
        self.lock().chip.read(page, offset, buf)
    }

    pub fn program_page(&self, page: u32, data: &[u8]) -> Result<()> {
        self.lock().chip.program(page, data)
    }

    pub fn erase_block(&self, block: u32) -> Result<()> {
        self.lock().chip.erase_block(block)
    }

    pub fn is_free(&self, page: u32) -> Result<bool> {
        self.lock().chip.is_free(page)
    }

    pub fn is_bad(&self, block: u32) -> Result<bool> {
        self.lock().chip.is_bad(block)
    }

    pub fn mark_bad(&self, block: u32) -> Result<()> {
        self.lock().chip.mark_bad(block)
    }

    pub fn copy_page(&self, src: u32, dst: u32) -> Result<()> {
        self.lock().chip.copy(src, dst)
    }

    pub fn page_ecc_status(&self, page: u32) -> Result<EccStatus> {
        self.lock().chip.ecc_status(page)
    }

    /// The correction level reported by the most recent read
    pub fn last_ecc_status(&self) -> EccStatus {
        self.lock().chip.last_ecc_status()
    }

    /// Check the indicator of every block
    pub fn bad_block_stats(&self) -> Result<BadBlockStats> {
        let rpt = howudoin::new()
            .label("Scanning for bad blocks")
            .set_len(u64::from(self.geometry.num_blocks));

        let mut stats = BadBlockStats::default();
        for block in 0..self.geometry.num_blocks {
            rpt.inc();
            if self.is_bad(block)? {
                stats.count += 1;
                stats.blocks.push(block);
            }
        }

        rpt.close();
        Ok(stats)
    }

    /// Load every written page and tally what the ECC engine had to do
    pub fn ecc_stats(&self) -> Result<EccStats> {
        let rpt = howudoin::new()
            .label("Scanning ECC status")
            .set_len(u64::from(self.geometry.num_pages()));
        let threshold = self.geometry.ecc.refresh_threshold;

        let mut stats = EccStats::default();
        for page in 0..self.geometry.num_pages() {
            rpt.inc();

            let mut inner = self.lock();
            if inner.chip.is_free(page)? {
                continue;
            }
            let status = inner.chip.ecc_status(page)?;
            drop(inner);

            stats.pages += 1;
            if status.is_corrected() || status.is_uncorrectable() {
                stats.total += 1;
            }
            if status.is_uncorrectable() {
                stats.uncorrected += 1;
            }
            if status.exceeds(threshold) {
                stats.exceeding_threshold += 1;
            }
        }

        rpt.close();
        Ok(stats)
    }

    pub fn read_sector(&self, sector: u32, buf: &mut [u8]) -> Result<()> {
        let mut inner = self.lock();
        let (ops, chip) = inner.split()?;
        ops.read_sector(chip, sector, buf)
    }

    pub fn write_sector(&self, sector: u32, data: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        let (ops, chip) = inner.split()?;
        ops.write_sector(chip, sector, data)
    }

    pub fn trim(&self, sector: u32) -> Result<()> {
        let mut inner = self.lock();
        let (ops, chip) = inner.split()?;
        ops.trim(chip, sector)
    }

    pub fn sync(&self) -> Result<()> {
        let mut inner = self.lock();
        let (ops, chip) = inner.split()?;
        ops.sync(chip)
    }

    pub fn gc(&self) -> Result<()> {
        let mut inner = self.lock();
        let (ops, chip) = inner.split()?;
        ops.gc(chip)
    }

    pub fn copy_sector(&self, src: u32, dst: u32) -> Result<()> {
        let mut inner = self.lock();
        let (ops, chip) = inner.split()?;
        ops.copy_sector(chip, src, dst)
    }

    /// Number of sectors: every page in raw mode, the engine's capacity when wear-leveled
    pub fn capacity(&self) -> Result<u32> {
        let mut inner = self.lock();
        let (ops, chip) = inner.split()?;
        Ok(ops.capacity(chip))
    }

    pub fn sector_size(&self) -> usize {
        self.geometry.page_size()
    }

    pub fn block_size(&self) -> usize {
        self.geometry.block_size()
    }

    pub fn num_blocks(&self) -> u32 {
        self.geometry.num_blocks
    }

    /// Erase every good block, retiring the ones that fail, and forget any wear-leveling map
    pub fn erase_chip(&self) -> Result<()> {
        let mut inner = self.lock();
        if let Ops::Composed = inner.ops {
            return Err(Error::InvalidState(
                "device is in use by a wear-leveled block device",
            ));
        }

        let rpt = howudoin::new()
            .label("Erasing chip")
            .set_len(u64::from(self.geometry.num_blocks));

        let Inner { chip, ops } = &mut *inner;
        for block in 0..self.geometry.num_blocks {
            rpt.inc();
            if chip.is_bad(block)? {
                continue;
            }
            match chip.erase_block(block) {
                Ok(()) => (),
                Err(Error::EraseFailed { .. }) => chip.mark_bad(block)?,
                Err(e) => return Err(e),
            }
        }
        rpt.close();

        if let Ops::WearLeveled(wl) = ops {
            let mut adapter = NandAdapter::direct(chip, &mut wl.shim);
            wl.engine.clear(&mut adapter)?;
        }
        Ok(())
    }

    /// Put `engine` in charge of the sector operations.
    ///
    /// The engine first tries to rebuild its map from flash and starts empty if it cannot.
    pub fn attach_wear_leveling(&self, engine: Box<dyn Ftl>) -> Result<()> {
        let mut inner = self.lock();
        if !matches!(inner.ops, Ops::Raw(_)) {
            return Err(Error::InvalidState("wear leveling is already attached"));
        }

        let mut wl = WearLeveledOps {
            engine,
            shim: ShimState::default(),
        };
        {
            let mut adapter = NandAdapter::direct(&mut inner.chip, &mut wl.shim);
            if let Err(e) = wl.engine.resume(&mut adapter) {
                info!("no usable map on flash ({e}), starting empty");
                wl.engine.clear(&mut adapter)?;
            }
        }

        info!(
            "wear leveling attached: {} sectors of {} bytes",
            wl.engine.capacity(),
            self.geometry.page_size()
        );
        inner.ops = Ops::WearLeveled(wl);
        Ok(())
    }

    /// Attach a [LogMap] sized by this device's configuration
    pub fn attach_log_map(&self) -> Result<()> {
        self.attach_wear_leveling(Box::new(LogMap::from_config(&self.config)))
    }

    /// Sync and hand back the attached engine, returning the device to raw mode. Does nothing
    /// if no engine is attached.
    pub fn detach_wear_leveling(&self) -> Result<Option<Box<dyn Ftl>>> {
        let mut inner = self.lock();
        let Inner { chip, ops } = &mut *inner;
        let Ops::WearLeveled(wl) = ops else {
            return Ok(None);
        };

        let mut adapter = NandAdapter::direct(chip, &mut wl.shim);
        wl.engine.sync(&mut adapter)?;

        match mem::replace(ops, Ops::Raw(RawOps)) {
            Ops::WearLeveled(wl) => Ok(Some(wl.engine)),
            _ => Ok(None),
        }
    }

    pub fn is_wear_leveled(&self) -> bool {
        matches!(self.lock().ops, Ops::WearLeveled(_))
    }

    pub(crate) fn claim_composed(&self) -> Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        match inner.ops {
            Ops::Raw(_) => {
                inner.ops = Ops::Composed;
                Ok(())
            }
            Ops::WearLeveled(_) => Err(Error::InvalidState(
                "device already has wear leveling attached",
            )),
            Ops::Composed => Err(Error::InvalidState(
                "device is in use by a wear-leveled block device",
            )),
        }
    }

    pub(crate) fn release_composed(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if let Ops::Composed = inner.ops {
            inner.ops = Ops::Raw(RawOps);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::config::{EmulConfig, Layout};
    use crate::ftl::LogMap;
    use crate::nand::emul::EmulNand;
    use crate::nand::spi::sim::{SimChip, SimLayout};
    use crate::nand::spi::SpiNand;
    use crate::nand::PageUtil;
    use crate::util::{check_pattern, fill_pattern};

    const TEST_LAYOUT: Layout = Layout {
        blocks: 32,
        pages_per_block: 16,
        bytes_per_page: 512,
    };

    fn emul_device(layout: Layout) -> NandDevice<EmulNand> {
        let nand = EmulNand::open(&EmulConfig::with_layout(layout), &Config::default()).unwrap();
        NandDevice::init_device(nand, &Config::default()).unwrap()
    }

    fn sim_device(chip: SimChip) -> NandDevice<SpiNand<SimChip>> {
        let nand = SpiNand::with_geometry(
            chip,
            SimLayout::SMALL.geometry(),
            DeviceInfo::default(),
            &Config::default(),
        );
        NandDevice::init_device(nand, &Config::default()).unwrap()
    }

    #[test]
    fn test_end_to_end() -> anyhow::Result<()> {
        let nand = EmulNand::open(&EmulConfig::default(), &Config::default())?;
        let device = NandDevice::init_device(nand, &Config::default())?;
        assert_eq!(device.sector_size(), 2048);
        assert_eq!(device.block_size(), 2048 * 64);

        let page = 20 * 64;
        device.erase_block(20)?;
        assert!(device.is_free(page)?);

        let mut pattern = vec![0; 2048];
        fill_pattern(0x12345678, &mut pattern);
        device.program_page(page, &pattern)?;
        assert!(!device.is_free(page)?);

        let mut buf = vec![0; 2048];
        device.read_page(page, 0, &mut buf)?;
        assert!(check_pattern(0x12345678, &buf));

        device.copy_page(page, page + 1)?;
        buf.fill(0);
        device.read_page(page + 1, 0, &mut buf)?;
        assert!(check_pattern(0x12345678, &buf));

        device.deinit_device()?;
        Ok(())
    }

    #[test]
    fn test_first_middle_last_block() -> anyhow::Result<()> {
        let device = sim_device(SimChip::new(SimLayout::SMALL));
        let ppb = device.geometry().pages_per_block();
        let mut buf = vec![0; 512];

        for block in [0, 16, 31] {
            let page = block * ppb + 3;
            fill_pattern(u64::from(page), &mut buf);
            device.program_page(page, &buf)?;
        }
        for block in [0, 16, 31] {
            let page = block * ppb + 3;
            device.read_page(page, 0, &mut buf)?;
            assert!(check_pattern(u64::from(page), &buf), "block {block}");
        }
        Ok(())
    }

    #[test]
    fn test_bad_block_round_trip() -> anyhow::Result<()> {
        let device = emul_device(TEST_LAYOUT);
        for block in [0, 7, 30] {
            assert!(!device.is_bad(block)?);
            device.mark_bad(block)?;
            assert!(device.is_bad(block)?);
        }

        let stats = device.bad_block_stats()?;
        assert_eq!(stats.count, 3);
        assert_eq!(stats.blocks, [0, 7, 30]);
        Ok(())
    }

    #[test]
    fn test_argument_checks() {
        let device = emul_device(TEST_LAYOUT);
        let num_pages = device.geometry().num_pages();
        let mut buf = vec![0; 512];

        assert!(matches!(
            device.read_page(num_pages, 0, &mut buf),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            device.read_page(0, 1, &mut buf),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            device.program_page(0, &buf[..100]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            device.erase_block(32),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            device.copy_page(0, num_pages),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_last_ecc_status() -> anyhow::Result<()> {
        let device = sim_device(SimChip::new(SimLayout::SMALL));
        device.with_nand(|nand| {
            nand.transport_mut().set_ecc(5, EccStatus::Corrected4To6);
            nand.transport_mut().set_ecc(6, EccStatus::Uncorrectable);
        });

        let mut buf = vec![0; 512];
        assert_eq!(device.read_page(5, 0, &mut buf)?, EccStatus::Corrected4To6);
        assert_eq!(device.last_ecc_status(), EccStatus::Corrected4To6);

        assert!(matches!(
            device.read_page(6, 0, &mut buf),
            Err(Error::EccUncorrectable { page: 6 })
        ));
        assert_eq!(device.last_ecc_status(), EccStatus::Uncorrectable);
        assert_eq!(device.page_ecc_status(6)?, EccStatus::Uncorrectable);

        device.read_page(7, 0, &mut buf)?;
        assert_eq!(device.last_ecc_status(), EccStatus::Ok);
        Ok(())
    }

    #[test]
    fn test_ecc_stats() -> anyhow::Result<()> {
        let device = sim_device(SimChip::new(SimLayout::SMALL));
        let data = vec![0x3C; 512];
        for page in [1, 2, 3, 4] {
            device.program_page(page, &data)?;
        }
        device.with_nand(|nand| {
            let sim = nand.transport_mut();
            sim.set_ecc(2, EccStatus::Corrected1To3);
            sim.set_ecc(3, EccStatus::Corrected4To6);
            sim.set_ecc(4, EccStatus::Uncorrectable);
            // Never written, so never scanned
            sim.set_ecc(9, EccStatus::Uncorrectable);
        });

        let stats = device.ecc_stats()?;
        assert_eq!(
            stats,
            EccStats {
                pages: 4,
                total: 3,
                uncorrected: 1,
                exceeding_threshold: 1,
            }
        );
        Ok(())
    }

    #[test]
    fn test_raw_sectors() -> anyhow::Result<()> {
        let device = emul_device(TEST_LAYOUT);
        assert_eq!(device.capacity()?, 32 * 16);

        let mut buf = vec![0; 512];
        fill_pattern(11, &mut buf);
        device.write_sector(40, &buf)?;
        device.copy_sector(40, 41)?;
        device.trim(40)?;
        device.sync()?;
        device.gc()?;

        buf.fill(0);
        device.read_sector(41, &mut buf)?;
        assert!(check_pattern(11, &buf));
        Ok(())
    }

    #[test]
    fn test_erase_chip() -> anyhow::Result<()> {
        let device = sim_device(SimChip::new(SimLayout::SMALL).with_factory_bad(3));
        device.with_nand(|nand| nand.transport_mut().fail_erase(9));
        device.program_page(16 * 5, &[0x00; 512])?;

        device.erase_chip()?;
        assert!(device.is_free(16 * 5)?);
        assert_eq!(device.bad_block_stats()?.blocks, [3, 9]);
        Ok(())
    }

    #[test]
    fn test_wear_leveled_sectors() -> anyhow::Result<()> {
        let device = emul_device(TEST_LAYOUT);
        device.attach_wear_leveling(Box::new(LogMap::new(45)))?;
        assert!(device.is_wear_leveled());
        assert!(device.attach_wear_leveling(Box::new(LogMap::new(45))).is_err());
        assert!(device.claim_composed().is_err());

        let capacity = device.capacity()?;
        assert!(capacity < device.geometry().num_pages());

        let mut buf = vec![0; 512];
        for sector in [0, 1, capacity - 1] {
            fill_pattern(u64::from(sector), &mut buf);
            device.write_sector(sector, &buf)?;
        }
        device.copy_sector(1, 2)?;
        device.trim(0)?;

        device.read_sector(0, &mut buf)?;
        assert!(buf.is_erased());
        device.read_sector(2, &mut buf)?;
        assert!(check_pattern(1, &buf));
        device.read_sector(capacity - 1, &mut buf)?;
        assert!(check_pattern(u64::from(capacity - 1), &buf));

        assert!(device.detach_wear_leveling()?.is_some());
        assert!(device.detach_wear_leveling()?.is_none());
        assert!(!device.is_wear_leveled());

        // Reattaching finds the synced map again
        device.attach_wear_leveling(Box::new(LogMap::new(45)))?;
        device.read_sector(2, &mut buf)?;
        assert!(check_pattern(1, &buf));
        Ok(())
    }

    #[test]
    fn test_attach_log_map_uses_config() -> anyhow::Result<()> {
        let config = Config {
            gc_factor: 8,
            ..Default::default()
        };
        let nand = EmulNand::open(&EmulConfig::with_layout(TEST_LAYOUT), &config)?;
        let device = NandDevice::init_device(nand, &config)?;

        device.attach_log_map()?;
        assert_eq!(device.capacity()?, 26 * 15);
        Ok(())
    }

    #[test]
    fn test_refresh_on_corrected_read() -> anyhow::Result<()> {
        let device = sim_device(SimChip::new(SimLayout::SMALL));
        device.attach_wear_leveling(Box::new(LogMap::new(45)))?;

        let mut buf = vec![0; 512];
        fill_pattern(77, &mut buf);
        device.write_sector(0, &buf)?;

        // A fresh map starts at block 0, so sector 0 sits in page 0.
        device.with_nand(|nand| {
            nand.transport_mut()
                .set_ecc(0, EccStatus::Corrected4To6)
        });

        buf.fill(0);
        device.read_sector(0, &mut buf)?;
        assert!(check_pattern(77, &buf));

        // The read moved the data on to the next page
        assert!(!device.is_free(1)?);
        device.with_nand(|nand| {
            assert!(check_pattern(77, &nand.transport().page(1)[..512]));
        });
        Ok(())
    }

    #[test]
    fn test_erase_chip_clears_map() -> anyhow::Result<()> {
        let device = emul_device(TEST_LAYOUT);
        device.attach_wear_leveling(Box::new(LogMap::new(45)))?;
        device.write_sector(5, &[0x11; 512])?;

        device.erase_chip()?;
        let mut buf = vec![0; 512];
        device.read_sector(5, &mut buf)?;
        assert!(buf.is_erased());
        Ok(())
    }

    #[test]
    fn test_composed_blocks_sector_ops() -> anyhow::Result<()> {
        let device = emul_device(TEST_LAYOUT);
        device.claim_composed()?;
        assert!(matches!(
            device.write_sector(0, &[0; 512]),
            Err(Error::InvalidState(_))
        ));
        assert!(device.erase_chip().is_err());
        assert!(device.attach_wear_leveling(Box::new(LogMap::new(45))).is_err());

        // Page primitives stay available
        device.program_page(0, &[0; 512])?;

        device.release_composed();
        device.write_sector(1, &[0; 512])?;
        Ok(())
    }

    #[test]
    fn test_concurrent_callers() -> anyhow::Result<()> {
        let device = Arc::new(emul_device(TEST_LAYOUT));

        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let device = Arc::clone(&device);
                thread::spawn(move || -> crate::error::Result<()> {
                    let mut buf = vec![0; 512];
                    for i in 0..32 {
                        let page = t * 64 + i;
                        fill_pattern(u64::from(page), &mut buf);
                        device.program_page(page, &buf)?;
                        device.read_page(page, 0, &mut buf)?;
                        assert!(check_pattern(u64::from(page), &buf));
                    }
                    Ok(())
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("worker panicked")?;
        }
        assert!(!device.is_free(3 * 64 + 31)?);
        Ok(())
    }
}

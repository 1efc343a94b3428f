//! NAND emulation on top of a memory-mapped file, for running the stack on a host
//!
//! Writes AND into the backing bytes and erases fill with 0xFF, so data behaves the way it
//! does on a real array: programming can only clear bits.

use std::ffi::c_void;
use std::fs::{self, File, OpenOptions};
use std::num::NonZeroUsize;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::{process, slice};

use log::{error, info};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::config::{Config, EmulConfig};
use crate::error::{Error, Result};
use crate::nand::{
    DeviceInfo, EccStatus, Geometry, Nand, Scratch, BAD_BLOCK_MARKER_OFFSET, MARKER_ERASED,
    MARKER_SET, USED_MARKER_OFFSET,
};

/// Bytes of OOB emulated after every page
pub const OOB_SIZE: usize = 64;

/// Running totals of the traffic an emulated flash has seen
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct EmulStats {
    pub read_ops: u64,
    pub write_ops: u64,
    pub erase_ops: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// A byte-addressable region backed by a shared file mapping
#[derive(Debug)]
pub struct MmapFlash {
    map: NonNull<c_void>,
    size: usize,
    _file: File,
    path: PathBuf,
    keep_dump: bool,
    stats: EmulStats,
}

// SAFETY: the mapping is owned exclusively by this value and only reached through `&self` /
// `&mut self`, exactly like a `Vec<u8>` would be.
unsafe impl Send for MmapFlash {}

fn temp_path() -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("nand-emul-{}-{n}", process::id()))
}

impl MmapFlash {
    /// Create (or reopen) the backing file, map it, and put it in the erased state
    pub fn open(config: &EmulConfig) -> Result<Self> {
        let len = NonZeroUsize::new(config.size)
            .ok_or_else(|| Error::invalid_arg("emulated flash size must be non-zero"))?;

        // A file this call creates is removed again if the mapping cannot be set up.
        let (path, file, created) = match &config.path {
            Some(path) => {
                let existed = path.exists();
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)?;
                (path.clone(), file, !existed)
            }
            None => {
                let path = temp_path();
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(&path)?;
                (path, file, true)
            }
        };

        let mapped = Self::map_file(&file, len, config.reuse_existing);
        let (map, reuse) = match mapped {
            Ok(mapped) => mapped,
            Err(e) => {
                if created {
                    if let Err(e) = fs::remove_file(&path) {
                        error!("failed to remove {}: {e}", path.display());
                    }
                }
                return Err(e);
            }
        };

        let mut flash = Self {
            map,
            size: config.size,
            _file: file,
            path,
            keep_dump: config.keep_dump,
            stats: EmulStats::default(),
        };

        if !reuse {
            flash.mem_mut().fill(0xFF);
        }

        info!(
            "NAND emulation on {} ({} bytes{})",
            flash.path.display(),
            flash.size,
            if reuse { ", reused" } else { "" }
        );
        Ok(flash)
    }

    fn mem(&self) -> &[u8] {
        // SAFETY: `map` points at `size` mapped bytes for as long as `self` lives.
        unsafe { slice::from_raw_parts(self.map.as_ptr() as *const u8, self.size) }
    }

    fn mem_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `mem`, and `&mut self` guarantees exclusivity.
        unsafe { slice::from_raw_parts_mut(self.map.as_ptr() as *mut u8, self.size) }
    }

    fn range(&self, addr: usize, len: usize) -> Result<Range<usize>> {
        match addr.checked_add(len) {
            Some(end) if end <= self.size => Ok(addr..end),
            _ => Err(Error::InvalidSize {
                addr,
                len,
                size: self.size,
            }),
        }
    }

    /// Size `file` to `len` bytes and map it. Reports whether the old content is kept.
    fn map_file(
        file: &File,
        len: NonZeroUsize,
        reuse_existing: bool,
    ) -> Result<(NonNull<c_void>, bool)> {
        let size = len.get() as u64;
        let reuse = reuse_existing && file.metadata()?.len() == size;
        file.set_len(size)?;

        // SAFETY: a fresh shared mapping of a file we hold open; no other mapping aliases it.
        let map = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                0,
            )?
        };
        Ok((map, reuse))
    }

    pub fn read(&mut self, addr: usize, dst: &mut [u8]) -> Result<()> {
        let range = self.range(addr, dst.len())?;
        dst.copy_from_slice(&self.mem()[range]);

        self.stats.read_ops += 1;
        self.stats.read_bytes += dst.len() as u64;
        Ok(())
    }

    /// AND `src` into the region at `addr`
    pub fn write(&mut self, addr: usize, src: &[u8]) -> Result<()> {
        let range = self.range(addr, src.len())?;
        for (cell, &bits) in self.mem_mut()[range].iter_mut().zip(src) {
            *cell &= bits;
        }

        self.stats.write_ops += 1;
        self.stats.write_bytes += src.len() as u64;
        Ok(())
    }

    /// Return `len` bytes at `addr` to 0xFF
    pub fn erase(&mut self, addr: usize, len: usize) -> Result<()> {
        let range = self.range(addr, len)?;
        self.mem_mut()[range].fill(0xFF);

        self.stats.erase_ops += 1;
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> EmulStats {
        self.stats
    }

    pub fn clear_stats(&mut self) {
        self.stats = EmulStats::default();
    }
}

impl Drop for MmapFlash {
    fn drop(&mut self) {
        // SAFETY: unmapping the mapping created in `open`; nothing borrows it past this point.
        if let Err(e) = unsafe { munmap(self.map, self.size) } {
            error!("failed to unmap {}: {e}", self.path.display());
        }

        if !self.keep_dump {
            if let Err(e) = fs::remove_file(&self.path) {
                error!("failed to remove {}: {e}", self.path.display());
            }
        }
    }
}

/// Page/block primitives over a [MmapFlash].
///
/// Each page occupies `page_size + OOB_SIZE` bytes of the file, so the used and bad markers
/// live in the file exactly where they live on a chip.
#[derive(Debug)]
pub struct EmulNand {
    flash: MmapFlash,
    geometry: Geometry,
    info: DeviceInfo,
    verify_writes: bool,
}

impl EmulNand {
    pub fn open(emul: &EmulConfig, config: &Config) -> Result<Self> {
        if !emul.bytes_per_page.is_power_of_two() || !emul.pages_per_block.is_power_of_two() {
            return Err(Error::invalid_arg(
                "emulated page size and pages per block must be powers of two",
            ));
        }

        let block_stride = (emul.bytes_per_page + OOB_SIZE) * emul.pages_per_block as usize;
        let num_blocks = u32::try_from(emul.size / block_stride)
            .map_err(|_| Error::invalid_arg("emulated flash too large"))?;
        if num_blocks == 0 {
            return Err(Error::invalid_arg(format!(
                "emulated flash of {} bytes cannot hold one {block_stride}-byte block",
                emul.size
            )));
        }

        let mut geometry = Geometry::new(
            emul.bytes_per_page.trailing_zeros() as u8,
            emul.pages_per_block.trailing_zeros() as u8,
            num_blocks,
        );
        if let Some(threshold) = config.ecc_refresh_threshold {
            geometry.ecc.refresh_threshold = threshold;
        }

        Ok(Self {
            flash: MmapFlash::open(emul)?,
            geometry,
            info: DeviceInfo {
                manufacturer_id: 0,
                device_id: 0,
                chip_name: "emulated".into(),
            },
            verify_writes: config.verify_writes,
        })
    }

    pub fn flash(&self) -> &MmapFlash {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut MmapFlash {
        &mut self.flash
    }

    fn stride(&self) -> usize {
        self.geometry.page_size() + OOB_SIZE
    }

    fn page_addr(&self, page: u32) -> usize {
        page as usize * self.stride()
    }

    fn read_marker(&mut self, page: u32, offset: usize) -> Result<[u8; 2]> {
        let mut marker = [0u8; 2];
        let addr = self.page_addr(page) + self.geometry.page_size() + offset;
        self.flash.read(addr, &mut marker)?;
        Ok(marker)
    }

    fn write_marker(&mut self, page: u32, offset: usize) -> Result<()> {
        let addr = self.page_addr(page) + self.geometry.page_size() + offset;
        self.flash.write(addr, &MARKER_SET)
    }
}

impl Nand for EmulNand {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn read(&mut self, page: u32, offset: usize, buf: &mut [u8]) -> Result<EccStatus> {
        let addr = self.page_addr(page) + offset;
        self.flash.read(addr, buf)?;
        Ok(EccStatus::Ok)
    }

    fn ecc_status(&mut self, page: u32) -> Result<EccStatus> {
        self.flash.range(self.page_addr(page), self.stride())?;
        Ok(EccStatus::Ok)
    }

    fn program(&mut self, page: u32, data: &[u8], scratch: &mut Scratch) -> Result<()> {
        self.flash.write(self.page_addr(page), data)?;
        self.write_marker(page, USED_MARKER_OFFSET)?;

        if self.verify_writes {
            let readback = &mut scratch.read[..data.len()];
            self.flash.read(self.page_addr(page), readback)?;
            if readback != data {
                return Err(Error::VerifyMismatch { page });
            }
        }
        Ok(())
    }

    fn erase_block(&mut self, block: u32) -> Result<()> {
        let addr = self.page_addr(self.geometry.first_page(block));
        let len = self.stride() * self.geometry.pages_per_block() as usize;
        self.flash.erase(addr, len)
    }

    fn is_free(&mut self, page: u32) -> Result<bool> {
        Ok(self.read_marker(page, USED_MARKER_OFFSET)? == MARKER_ERASED)
    }

    fn is_bad(&mut self, block: u32) -> Result<bool> {
        let page = self.geometry.first_page(block);
        Ok(self.read_marker(page, BAD_BLOCK_MARKER_OFFSET)? != MARKER_ERASED)
    }

    fn mark_bad(&mut self, block: u32) -> Result<()> {
        self.erase_block(block)?;
        self.write_marker(self.geometry.first_page(block), BAD_BLOCK_MARKER_OFFSET)
    }

    fn copy(&mut self, src: u32, dst: u32, scratch: &mut Scratch) -> Result<()> {
        let page_size = self.geometry.page_size();
        self.flash
            .read(self.page_addr(src), &mut scratch.work[..page_size])?;
        self.flash
            .write(self.page_addr(dst), &scratch.work[..page_size])?;
        self.write_marker(dst, USED_MARKER_OFFSET)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Layout;
    use proptest::prelude::*;

    const TEST_LAYOUT: Layout = Layout {
        blocks: 8,
        pages_per_block: 16,
        bytes_per_page: 512,
    };

    fn test_nand() -> EmulNand {
        EmulNand::open(&EmulConfig::with_layout(TEST_LAYOUT), &Config::default()).unwrap()
    }

    #[test]
    fn test_fresh_flash_is_erased() -> anyhow::Result<()> {
        let mut nand = test_nand();
        assert_eq!(nand.geometry().num_blocks, 8);

        let mut buf = vec![0; 512];
        nand.read(0, 0, &mut buf)?;
        assert!(buf.iter().all(|&b| b == 0xFF));
        assert!(nand.is_free(127)?);
        assert!(!nand.is_bad(7)?);
        Ok(())
    }

    #[test]
    fn test_bounds() {
        let mut nand = test_nand();
        let size = nand.flash().size();
        let mut buf = [0u8; 4];

        assert!(matches!(
            nand.flash_mut().read(size - 2, &mut buf),
            Err(Error::InvalidSize { .. })
        ));
        assert!(matches!(
            nand.flash_mut().write(usize::MAX, &buf),
            Err(Error::InvalidSize { .. })
        ));
        assert!(matches!(
            nand.read(128, 0, &mut buf),
            Err(Error::InvalidSize { .. })
        ));
    }

    #[test]
    fn test_erase_restores_ff() -> anyhow::Result<()> {
        let mut nand = test_nand();
        let mut scratch = Scratch::new(512)?;

        nand.program(20, &[0x00; 512], &mut scratch)?;
        assert!(!nand.is_free(20)?);
        nand.erase_block(1)?;
        assert!(nand.is_free(20)?);

        let mut buf = vec![0; 512];
        nand.read(20, 0, &mut buf)?;
        assert!(buf.iter().all(|&b| b == 0xFF));
        Ok(())
    }

    #[test]
    fn test_mark_bad() -> anyhow::Result<()> {
        let mut nand = test_nand();
        nand.mark_bad(5)?;
        assert!(nand.is_bad(5)?);
        assert!(!nand.is_bad(4)?);
        assert!(!nand.is_bad(6)?);
        Ok(())
    }

    #[test]
    fn test_stats() -> anyhow::Result<()> {
        let mut nand = test_nand();
        let mut scratch = Scratch::new(512)?;
        nand.flash_mut().clear_stats();

        nand.program(0, &[0xA5; 512], &mut scratch)?;
        let mut buf = vec![0; 512];
        nand.read(0, 0, &mut buf)?;
        nand.erase_block(0)?;

        let stats = nand.flash().stats();
        assert_eq!(stats.write_ops, 2);
        assert_eq!(stats.write_bytes, 514);
        assert_eq!(stats.read_ops, 1);
        assert_eq!(stats.read_bytes, 512);
        assert_eq!(stats.erase_ops, 1);

        nand.flash_mut().clear_stats();
        assert_eq!(nand.flash().stats(), EmulStats::default());
        Ok(())
    }

    #[test]
    fn test_backing_file_lifetime() -> anyhow::Result<()> {
        let nand = test_nand();
        let path = nand.flash().path().to_owned();
        assert!(path.exists());
        drop(nand);
        assert!(!path.exists());

        let cfg = EmulConfig {
            keep_dump: true,
            ..EmulConfig::with_layout(TEST_LAYOUT)
        };
        let mut nand = EmulNand::open(&cfg, &Config::default())?;
        let mut scratch = Scratch::new(512)?;
        nand.program(3, &[0x5A; 512], &mut scratch)?;
        let path = nand.flash().path().to_owned();
        drop(nand);
        assert!(path.exists());

        // Reopening with reuse keeps what was written
        let cfg = EmulConfig {
            path: Some(path.clone()),
            reuse_existing: true,
            ..cfg
        };
        let mut nand = EmulNand::open(&cfg, &Config::default())?;
        let mut buf = vec![0; 512];
        nand.read(3, 0, &mut buf)?;
        assert!(buf.iter().all(|&b| b == 0x5A));
        drop(nand);

        fs::remove_file(path)?;
        Ok(())
    }

    #[test]
    fn test_failed_open_removes_new_file() -> anyhow::Result<()> {
        let path = std::env::temp_dir().join(format!("nand-emul-unmappable-{}", process::id()));
        let cfg = EmulConfig {
            path: Some(path.clone()),
            size: usize::MAX,
            ..Default::default()
        };
        assert!(MmapFlash::open(&cfg).is_err());
        assert!(!path.exists());

        // A file that was already there is left alone
        fs::write(&path, b"keep")?;
        assert!(MmapFlash::open(&cfg).is_err());
        assert_eq!(fs::read(&path)?, b"keep");
        fs::remove_file(path)?;
        Ok(())
    }

    #[test]
    fn test_too_small() {
        let cfg = EmulConfig {
            size: 1000,
            ..Default::default()
        };
        assert!(matches!(
            EmulNand::open(&cfg, &Config::default()),
            Err(Error::InvalidArgument(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_and_write_law(
            a in proptest::collection::vec(any::<u8>(), 512),
            b in proptest::collection::vec(any::<u8>(), 512),
            page in 0u32..128,
        ) {
            let mut nand = test_nand();
            let mut scratch = Scratch::new(512).unwrap();

            nand.program(page, &a, &mut scratch).unwrap();
            nand.program(page, &b, &mut scratch).unwrap();

            let mut out = vec![0; 512];
            nand.read(page, 0, &mut out).unwrap();
            for i in 0..512 {
                prop_assert_eq!(out[i], a[i] & b[i]);
            }
        }
    }
}

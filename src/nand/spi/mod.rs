//! Page/block primitives for real SPI NAND chips, spoken over a [Transport]

use std::hint;
use std::thread;
use std::time::{Duration, Instant};

use deku::prelude::*;
use log::{debug, warn};

use crate::config::{Config, IoMode};
use crate::error::{Error, Result};
use crate::nand::{
    DeviceInfo, EccStatus, Geometry, Nand, Scratch, BAD_BLOCK_MARKER_OFFSET, MARKER_ERASED,
    MARKER_SET, USED_MARKER_OFFSET,
};

pub mod sim;
pub mod transport;
pub mod vendor;

use transport::{Transport, REG_STATUS};

/// Operations expected to finish sooner than this are waited out with a busy-spin; longer
/// ones give up the CPU between status polls.
pub const ROM_WAIT_THRESHOLD_US: u32 = 1000;

/// The feature register at 0xC0, most significant bit first
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
pub struct StatusRegister {
    #[deku(bits = "1")]
    pub reserved: u8,
    /// ECC result; 2-bit chips leave the top bit zero
    #[deku(bits = "3")]
    pub ecc: u8,
    #[deku(bits = "1")]
    pub program_failed: u8,
    #[deku(bits = "1")]
    pub erase_failed: u8,
    #[deku(bits = "1")]
    pub write_enabled: u8,
    #[deku(bits = "1")]
    pub busy: u8,
}

impl StatusRegister {
    pub fn decode(raw: u8) -> Result<Self> {
        let bytes = [raw];
        let (_, status) = Self::from_bytes((bytes.as_slice(), 0))
            .map_err(|e| Error::Transport(format!("bad status register: {e}")))?;
        Ok(status)
    }

    pub fn encode(&self) -> u8 {
        // Every field is only ever assigned values that fit its width.
        self.to_bytes()
            .ok()
            .and_then(|bytes| bytes.first().copied())
            .unwrap_or_default()
    }

    pub fn ecc_status(&self, width_bits: u8) -> EccStatus {
        EccStatus::decode(self.ecc, width_bits)
    }
}

/// A SPI NAND chip driven through `T`
#[derive(Debug)]
pub struct SpiNand<T: Transport> {
    transport: T,
    geometry: Geometry,
    info: DeviceInfo,
    io_mode: IoMode,
    verify_writes: bool,
}

impl<T: Transport> SpiNand<T> {
    /// Identify the chip, look it up in the vendor tables, and prepare it for use
    pub fn detect(mut transport: T, config: &Config) -> Result<Self> {
        let (geometry, info) = vendor::detect(&mut transport, config.io_mode)?;
        Ok(Self::with_geometry(transport, geometry, info, config))
    }

    /// Drive a chip whose geometry is already known
    pub fn with_geometry(
        transport: T,
        mut geometry: Geometry,
        info: DeviceInfo,
        config: &Config,
    ) -> Self {
        if let Some(threshold) = config.ecc_refresh_threshold {
            geometry.ecc.refresh_threshold = threshold;
        }

        Self {
            transport,
            geometry,
            info,
            io_mode: config.io_mode,
            verify_writes: config.verify_writes,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn read_status(&mut self) -> Result<StatusRegister> {
        StatusRegister::decode(transport::read_register(&mut self.transport, REG_STATUS)?)
    }

    /// Poll the status register until the chip stops reporting busy
    fn wait_for_ready(&mut self, expected_us: u32) -> Result<StatusRegister> {
        let short = expected_us < ROM_WAIT_THRESHOLD_US;
        if short {
            spin_delay(expected_us);
        }

        loop {
            let status = self.read_status()?;
            if status.busy == 0 {
                return Ok(status);
            }
            if !short {
                thread::yield_now();
            }
        }
    }

    /// Move a page into the cache register and return the resulting status
    fn load_page(&mut self, page: u32) -> Result<StatusRegister> {
        transport::page_read(&mut self.transport, page)?;
        self.wait_for_ready(self.geometry.read_page_delay_us)
    }

    fn read_cache(&mut self, page: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        let column = self.geometry.column(page, offset);
        transport::read_cache(&mut self.transport, self.io_mode, column, buf)
    }

    fn read_marker(&mut self, page: u32, offset: usize) -> Result<[u8; 2]> {
        let mut marker = [0u8; 2];
        self.load_page(page)?;
        self.read_cache(page, self.geometry.page_size() + offset, &mut marker)?;
        Ok(marker)
    }

    fn load(&mut self, page: u32, reset: bool, offset: usize, data: &[u8]) -> Result<()> {
        let column = self.geometry.column(page, offset);
        transport::program_load(&mut self.transport, self.io_mode, reset, column, data)
    }

    /// Commit the cache into `page` and check the chip accepted it
    fn execute_program(&mut self, page: u32) -> Result<()> {
        transport::program_execute(&mut self.transport, page)?;
        let status = self.wait_for_ready(self.geometry.program_page_delay_us)?;
        if status.program_failed != 0 {
            debug!("program of page {page} failed");
            return Err(Error::ProgramFailed { page });
        }
        Ok(())
    }

    fn verify(&mut self, page: u32, data: &[u8], scratch: &mut Scratch) -> Result<()> {
        let readback = &mut scratch.read[..data.len()];
        self.read(page, 0, readback)?;
        if readback != data {
            debug!("verify of page {page} failed");
            return Err(Error::VerifyMismatch { page });
        }
        Ok(())
    }
}

impl<T: Transport> Nand for SpiNand<T> {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn read(&mut self, page: u32, offset: usize, buf: &mut [u8]) -> Result<EccStatus> {
        let status = self.load_page(page)?;
        let ecc = status.ecc_status(self.geometry.ecc.status_width_bits);
        if ecc.is_uncorrectable() {
            debug!("uncorrectable ECC error reading page {page}");
            return Err(Error::EccUncorrectable { page });
        }

        self.read_cache(page, offset, buf)?;
        Ok(ecc)
    }

    fn ecc_status(&mut self, page: u32) -> Result<EccStatus> {
        let status = self.load_page(page)?;
        Ok(status.ecc_status(self.geometry.ecc.status_width_bits))
    }

    fn program(&mut self, page: u32, data: &[u8], scratch: &mut Scratch) -> Result<()> {
        self.wait_for_ready(0)?;
        transport::write_enable(&mut self.transport)?;

        self.load(page, true, 0, data)?;
        let marker = self.geometry.page_size() + USED_MARKER_OFFSET;
        self.load(page, false, marker, &MARKER_SET)?;
        self.execute_program(page)?;

        if self.verify_writes {
            self.verify(page, data, scratch)?;
        }
        Ok(())
    }

    fn erase_block(&mut self, block: u32) -> Result<()> {
        transport::write_enable(&mut self.transport)?;
        transport::erase_block(&mut self.transport, self.geometry.first_page(block))?;

        let status = self.wait_for_ready(self.geometry.erase_block_delay_us)?;
        if status.erase_failed != 0 {
            debug!("erase of block {block} failed");
            return Err(Error::EraseFailed { block });
        }
        Ok(())
    }

    fn is_free(&mut self, page: u32) -> Result<bool> {
        Ok(self.read_marker(page, USED_MARKER_OFFSET)? == MARKER_ERASED)
    }

    fn is_bad(&mut self, block: u32) -> Result<bool> {
        let page = self.geometry.first_page(block);
        Ok(self.read_marker(page, BAD_BLOCK_MARKER_OFFSET)? != MARKER_ERASED)
    }

    fn mark_bad(&mut self, block: u32) -> Result<()> {
        // Blocks are usually retired because they stopped erasing, so an erase failure here
        // must not stop the indicator from being written.
        if let Err(e) = self.erase_block(block) {
            warn!("marking block {block} bad after failed erase: {e}");
        }

        let page = self.geometry.first_page(block);
        transport::write_enable(&mut self.transport)?;
        let marker = self.geometry.page_size() + BAD_BLOCK_MARKER_OFFSET;
        self.load(page, true, marker, &MARKER_SET)?;
        self.execute_program(page)
    }

    fn copy(&mut self, src: u32, dst: u32, scratch: &mut Scratch) -> Result<()> {
        let status = self.load_page(src)?;
        if status
            .ecc_status(self.geometry.ecc.status_width_bits)
            .is_uncorrectable()
        {
            return Err(Error::EccUncorrectable { page: src });
        }

        transport::write_enable(&mut self.transport)?;

        // The cache can only be committed to the plane it was loaded from.
        if self.geometry.plane_of(src) != self.geometry.plane_of(dst) {
            let page_size = self.geometry.page_size();
            let data = &mut scratch.work[..page_size];
            let column = self.geometry.column(src, 0);
            transport::read_cache(&mut self.transport, self.io_mode, column, data)?;

            self.load(dst, true, 0, &scratch.work[..page_size])?;
            self.load(dst, false, page_size + USED_MARKER_OFFSET, &MARKER_SET)?;
        }

        self.execute_program(dst)
    }
}

fn spin_delay(us: u32) {
    let deadline = Instant::now() + Duration::from_micros(u64::from(us));
    while Instant::now() < deadline {
        hint::spin_loop();
    }
}

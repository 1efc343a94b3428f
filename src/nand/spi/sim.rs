//! A simulated SPI NAND chip that answers the command set over a [Transport], for testing
//! the hardware path on a host

use std::collections::{HashMap, HashSet};

use super::transport::*;
use super::StatusRegister;
use crate::error::{Error, Result};
use crate::nand::{EccStatus, Geometry};

/// Shape of the simulated array
#[derive(Debug, Copy, Clone)]
pub struct SimLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub page_size: usize,
    pub oob_size: usize,
}

impl SimLayout {
    /// A tiny chip that keeps tests fast
    pub const SMALL: SimLayout = SimLayout {
        blocks: 32,
        pages_per_block: 16,
        page_size: 512,
        oob_size: 16,
    };

    /// The geometry a driver should use for this layout
    pub fn geometry(&self) -> Geometry {
        Geometry::new(
            self.page_size.trailing_zeros() as u8,
            self.pages_per_block.trailing_zeros() as u8,
            self.blocks,
        )
    }
}

/// An in-memory chip with a cache register, a status register, and fault injection
#[derive(Debug)]
pub struct SimChip {
    layout: SimLayout,
    id: Vec<u8>,
    array: Vec<u8>,
    cache: Vec<u8>,

    protect: u8,
    config: u8,
    status: StatusRegister,

    /// How many status polls report busy after each array operation
    busy_polls: u32,
    busy_remaining: u32,

    ecc_codes: HashMap<u32, u8>,
    failing_pages: HashSet<u32>,
    failing_blocks: HashSet<u32>,

    /// Every opcode received, in order
    pub commands: Vec<u8>,
}

impl SimChip {
    pub fn new(layout: SimLayout) -> Self {
        let stride = layout.page_size + layout.oob_size;
        let pages = (layout.blocks * layout.pages_per_block) as usize;

        Self {
            layout,
            id: vec![super::vendor::MFR_WINBOND, 0xAA, 0x21],
            array: vec![0xFF; stride * pages],
            cache: vec![0xFF; stride],
            protect: 0x38,
            config: 0x10,
            status: StatusRegister::default(),
            busy_polls: 0,
            busy_remaining: 0,
            ecc_codes: HashMap::new(),
            failing_pages: HashSet::new(),
            failing_blocks: HashSet::new(),
            commands: Vec::new(),
        }
    }

    /// Answer READ ID with these bytes (manufacturer first)
    pub fn with_id(mut self, id: &[u8]) -> Self {
        self.id = id.to_vec();
        self
    }

    /// Report busy for `polls` status reads after every page read, program, or erase
    pub fn with_busy_polls(mut self, polls: u32) -> Self {
        self.busy_polls = polls;
        self
    }

    /// Ship the chip with `block` already marked bad
    pub fn with_factory_bad(mut self, block: u32) -> Self {
        let offset = self.offset(block * self.layout.pages_per_block) + self.layout.page_size;
        self.array[offset..offset + 2].fill(0x00);
        self
    }

    /// Make every read of `page` report this ECC result
    pub fn set_ecc(&mut self, page: u32, status: EccStatus) {
        self.ecc_codes.insert(page, status.code());
    }

    /// Make every program of `page` report failure
    pub fn fail_program(&mut self, page: u32) {
        self.failing_pages.insert(page);
    }

    /// Make every erase of `block` report failure
    pub fn fail_erase(&mut self, block: u32) {
        self.failing_blocks.insert(block);
    }

    /// Peek at a register without disturbing the busy countdown
    pub fn register(&self, register: u8) -> u8 {
        match register {
            REG_PROTECT => self.protect,
            REG_CONFIG => self.config,
            _ => self.status.encode(),
        }
    }

    /// Raw bytes (data then OOB) of a page, as stored in the array
    pub fn page(&self, page: u32) -> &[u8] {
        let offset = self.offset(page);
        &self.array[offset..offset + self.stride()]
    }

    fn stride(&self) -> usize {
        self.layout.page_size + self.layout.oob_size
    }

    fn offset(&self, page: u32) -> usize {
        page as usize * self.stride()
    }

    fn check_page(&self, page: u32) -> Result<()> {
        if page >= self.layout.blocks * self.layout.pages_per_block {
            return Err(Error::Transport(format!("page address {page} beyond array")));
        }
        Ok(())
    }

    /// Strip the plane-select bit and check the access fits the cache
    fn column(&self, address: u32, len: usize) -> Result<usize> {
        let column = (address as usize) & ((self.layout.page_size << 1) - 1);
        if column + len > self.stride() {
            return Err(Error::Transport(format!(
                "column {column} + {len} beyond cache"
            )));
        }
        Ok(column)
    }

    fn start_busy(&mut self) {
        self.busy_remaining = self.busy_polls;
    }
}

impl Transport for SimChip {
    fn transfer(&mut self, txn: &mut Transaction<'_>) -> Result<()> {
        self.commands.push(txn.command);

        match txn.command {
            CMD_READ_ID => {
                let start = txn.address as usize;
                for (i, b) in txn.miso.iter_mut().enumerate() {
                    *b = self.id.get(start + i).copied().unwrap_or(0);
                }
            }

            CMD_READ_REGISTER => {
                let value = match txn.address as u8 {
                    REG_STATUS => {
                        self.status.busy = u8::from(self.busy_remaining > 0);
                        self.busy_remaining = self.busy_remaining.saturating_sub(1);
                        self.status.encode()
                    }
                    other => self.register(other),
                };
                if let Some(b) = txn.miso.first_mut() {
                    *b = value;
                }
            }

            CMD_SET_REGISTER => {
                let value = txn.mosi.first().copied().unwrap_or(0);
                match txn.address as u8 {
                    REG_PROTECT => self.protect = value,
                    REG_CONFIG => self.config = value,
                    _ => (),
                }
            }

            CMD_WRITE_ENABLE => self.status.write_enabled = 1,

            CMD_PAGE_READ => {
                self.check_page(txn.address)?;
                let offset = self.offset(txn.address);
                let stride = self.stride();
                self.cache
                    .copy_from_slice(&self.array[offset..offset + stride]);
                self.status.ecc = self.ecc_codes.get(&txn.address).copied().unwrap_or(0);
                self.start_busy();
            }

            CMD_READ_FAST | CMD_READ_X2 | CMD_READ_X4 => {
                let column = self.column(txn.address, txn.miso.len())?;
                let len = txn.miso.len();
                txn.miso.copy_from_slice(&self.cache[column..column + len]);
            }

            CMD_PROGRAM_LOAD | CMD_PROGRAM_LOAD_X4 | CMD_RANDOM_PROGRAM_LOAD
            | CMD_RANDOM_PROGRAM_LOAD_X4 => {
                if matches!(txn.command, CMD_PROGRAM_LOAD | CMD_PROGRAM_LOAD_X4) {
                    self.cache.fill(0xFF);
                }
                let column = self.column(txn.address, txn.mosi.len())?;
                self.cache[column..column + txn.mosi.len()].copy_from_slice(txn.mosi);
            }

            CMD_PROGRAM_EXECUTE => {
                self.check_page(txn.address)?;
                let failed = self.status.write_enabled == 0
                    || self.failing_pages.contains(&txn.address);
                if !failed {
                    let offset = self.offset(txn.address);
                    for (cell, &bits) in self.array[offset..].iter_mut().zip(&self.cache) {
                        *cell &= bits;
                    }
                }
                self.status.program_failed = u8::from(failed);
                self.status.write_enabled = 0;
                self.start_busy();
            }

            CMD_ERASE_BLOCK => {
                self.check_page(txn.address)?;
                let block = txn.address / self.layout.pages_per_block;
                let failed =
                    self.status.write_enabled == 0 || self.failing_blocks.contains(&block);
                if !failed {
                    let start = self.offset(block * self.layout.pages_per_block);
                    let len = self.stride() * self.layout.pages_per_block as usize;
                    self.array[start..start + len].fill(0xFF);
                }
                self.status.erase_failed = u8::from(failed);
                self.status.write_enabled = 0;
                self.start_busy();
            }

            other => {
                return Err(Error::Transport(format!(
                    "unsupported command {other:#04x}"
                )))
            }
        }

        Ok(())
    }
}

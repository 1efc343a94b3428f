//! A small log-structured flash-translation engine
//!
//! Sectors are appended to one open block at a time. The last page of every block holds a
//! summary (the sector written to each data page, a sequence number, and a CRC), which is all
//! [LogMap::resume] needs to rebuild the map. Garbage collection greedily picks the full block
//! with the fewest live pages and copies them forward.
//!
//! Writes are durable once their block is closed, either by filling it or by [Ftl::sync].
//! Trims are not recorded on flash: after a resume a trimmed sector may read back as any
//! earlier content.

use std::collections::VecDeque;

use bytes::{Buf, BufMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use log::{debug, info, warn};

use super::{FlashTarget, Ftl, FtlError};
use crate::config::Config;
use crate::error::Error;

const SUMMARY_MAGIC: u32 = 0x314D_4C4E; // "NLM1"
const SUMMARY_HEADER_LEN: usize = 16;
const NONE: u32 = u32::MAX;
const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Free blocks held back from host writes so collection always has a destination
const GC_RESERVE: usize = 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum BlockState {
    Free { erased: bool },
    Open,
    Full,
    /// Collected, but its pages were copied into a block that is not closed yet
    Pending,
    Bad,
}

#[derive(Debug, Copy, Clone)]
struct Block {
    state: BlockState,
    valid: u32,
    seq: u64,
}

#[derive(Debug)]
struct OpenBlock {
    block: u32,
    /// The sector written to each data page so far
    entries: Vec<u32>,
}

/// Where the data for a placed sector comes from
#[derive(Copy, Clone)]
enum Source<'a> {
    Data(&'a [u8]),
    Page(u32),
}

#[derive(Debug)]
pub struct LogMap {
    gc_factor: u32,

    log2_ppb: u8,
    page_size: usize,
    num_blocks: u32,
    capacity: u32,

    /// sector -> physical page
    map: Vec<u32>,
    /// physical page -> sector, for pages holding live data
    owner: Vec<u32>,
    blocks: Vec<Block>,
    free: VecDeque<u32>,
    pending: Vec<u32>,
    open: Option<OpenBlock>,
    seq: u64,
    in_gc: bool,

    page_buf: Vec<u8>,
}

impl LogMap {
    /// An engine sized by the device configuration's `gc_factor`
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.gc_factor)
    }

    /// An engine that reserves roughly one block in `gc_factor` as spare
    pub fn new(gc_factor: u32) -> Self {
        Self {
            gc_factor: gc_factor.max(1),
            log2_ppb: 0,
            page_size: 0,
            num_blocks: 0,
            capacity: 0,
            map: Vec::new(),
            owner: Vec::new(),
            blocks: Vec::new(),
            free: VecDeque::new(),
            pending: Vec::new(),
            open: None,
            seq: 0,
            in_gc: false,
            page_buf: Vec::new(),
        }
    }

    fn pages_per_block(&self) -> u32 {
        1 << self.log2_ppb
    }

    /// Pages per block that carry sector data (the last one holds the summary)
    fn data_pages(&self) -> u32 {
        self.pages_per_block() - 1
    }

    fn block_of(&self, page: u32) -> u32 {
        page >> self.log2_ppb
    }

    fn first_page(&self, block: u32) -> u32 {
        block << self.log2_ppb
    }

    /// Learn the geometry and reset every table to "nothing known"
    fn setup(&mut self, nand: &dyn FlashTarget) -> Result<(), FtlError> {
        self.log2_ppb = nand.log2_pages_per_block();
        self.page_size = 1 << nand.log2_page_size();
        self.num_blocks = nand.num_blocks();

        if self.log2_ppb == 0
            || SUMMARY_HEADER_LEN + 4 * (self.data_pages() as usize + 1) > self.page_size
        {
            return Err(Error::invalid_arg("block summary does not fit in a page").into());
        }

        let spare = self.num_blocks.div_ceil(self.gc_factor) + 2;
        self.capacity = self.num_blocks.saturating_sub(spare) * self.data_pages();

        let num_pages = (self.num_blocks as usize) << self.log2_ppb;
        self.map = vec![NONE; self.capacity as usize];
        self.owner = vec![NONE; num_pages];
        self.blocks = vec![
            Block {
                state: BlockState::Bad,
                valid: 0,
                seq: 0,
            };
            self.num_blocks as usize
        ];
        self.free.clear();
        self.pending.clear();
        self.open = None;
        self.seq = 0;
        self.in_gc = false;
        self.page_buf = vec![0xFF; self.page_size];
        Ok(())
    }

    fn check_sector(&self, sector: u32, len: usize) -> Result<(), FtlError> {
        if sector >= self.capacity {
            return Err(Error::invalid_arg(format!(
                "sector {sector} beyond capacity {}",
                self.capacity
            ))
            .into());
        }
        if len != self.page_size {
            return Err(Error::invalid_arg(format!(
                "sector buffer of {len} bytes, expected {}",
                self.page_size
            ))
            .into());
        }
        Ok(())
    }

    fn unbind(&mut self, sector: u32) {
        let old = std::mem::replace(&mut self.map[sector as usize], NONE);
        if old != NONE {
            self.owner[old as usize] = NONE;
            let block = self.block_of(old) as usize;
            self.blocks[block].valid -= 1;
        }
    }

    fn bind(&mut self, sector: u32, page: u32) {
        self.unbind(sector);
        self.map[sector as usize] = page;
        self.owner[page as usize] = sector;
        let block = self.block_of(page) as usize;
        self.blocks[block].valid += 1;
    }

    /// Write one sector into the log, retiring blocks that fail on the way
    fn place(
        &mut self,
        nand: &mut dyn FlashTarget,
        sector: u32,
        source: Source<'_>,
    ) -> Result<(), FtlError> {
        loop {
            let page = self.next_page(nand)?;
            let result = match source {
                Source::Data(data) => nand.prog(page, data),
                Source::Page(from) => nand.copy(from, page),
            };

            match result {
                Ok(()) => {
                    self.bind(sector, page);
                    if let Some(open) = &mut self.open {
                        open.entries.push(sector);
                    }
                    return self.advance(nand);
                }
                Err(FtlError::BadBlock { .. }) => self.retire_open(nand)?,
                Err(e) => return Err(e),
            }
        }
    }

    fn next_page(&mut self, nand: &mut dyn FlashTarget) -> Result<u32, FtlError> {
        if self.open.is_none() && !self.in_gc {
            self.make_room(nand)?;
        }
        if self.open.is_none() {
            self.open_block(nand)?;
        }

        let open = self.open.as_ref().ok_or(FtlError::TooBad)?;
        Ok(self.first_page(open.block) + open.entries.len() as u32)
    }

    /// Collect until a host write can open a block without eating the reserve
    fn make_room(&mut self, nand: &mut dyn FlashTarget) -> Result<(), FtlError> {
        while self.open.is_none() && self.free.len() <= GC_RESERVE {
            if !self.collect(nand)? {
                return Err(FtlError::MapFull);
            }
        }
        Ok(())
    }

    fn open_block(&mut self, nand: &mut dyn FlashTarget) -> Result<(), FtlError> {
        loop {
            let block = self.free.pop_front().ok_or(FtlError::TooBad)?;
            let BlockState::Free { erased } = self.blocks[block as usize].state else {
                continue;
            };

            if !erased {
                match nand.erase(block) {
                    Ok(()) => (),
                    Err(FtlError::BadBlock { .. }) => {
                        self.blocks[block as usize].state = BlockState::Bad;
                        nand.mark_bad(block)?;
                        continue;
                    }
                    Err(e) => {
                        self.free.push_front(block);
                        return Err(e);
                    }
                }
            }

            self.seq += 1;
            self.blocks[block as usize] = Block {
                state: BlockState::Open,
                valid: 0,
                seq: self.seq,
            };
            self.open = Some(OpenBlock {
                block,
                entries: Vec::with_capacity(self.data_pages() as usize),
            });
            return Ok(());
        }
    }

    /// Close the open block once its data pages are used up
    fn advance(&mut self, nand: &mut dyn FlashTarget) -> Result<(), FtlError> {
        match &self.open {
            Some(open) if open.entries.len() as u32 == self.data_pages() => self.close_open(nand),
            _ => Ok(()),
        }
    }

    fn encode_summary(&mut self, seq: u64, entries: &[u32]) {
        let data_pages = self.data_pages() as usize;
        self.page_buf.fill(0xFF);

        let mut buf = &mut self.page_buf[..];
        buf.put_u32_le(SUMMARY_MAGIC);
        buf.put_u64_le(seq);
        buf.put_u32_le(data_pages as u32);
        for i in 0..data_pages {
            buf.put_u32_le(entries.get(i).copied().unwrap_or(NONE));
        }

        let len = SUMMARY_HEADER_LEN + 4 * data_pages;
        let crc = CRC.checksum(&self.page_buf[..len]);
        (&mut self.page_buf[len..]).put_u32_le(crc);
    }

    /// Parse the summary in `page_buf`: the block's sequence number and per-page sectors
    fn decode_summary(&self) -> Option<(u64, Vec<u32>)> {
        let data_pages = self.data_pages() as usize;
        let len = SUMMARY_HEADER_LEN + 4 * data_pages;

        let mut buf = &self.page_buf[..];
        if buf.get_u32_le() != SUMMARY_MAGIC {
            return None;
        }
        let seq = buf.get_u64_le();
        if buf.get_u32_le() as usize != data_pages {
            return None;
        }
        let entries = (0..data_pages).map(|_| buf.get_u32_le()).collect();
        if buf.get_u32_le() != CRC.checksum(&self.page_buf[..len]) {
            return None;
        }

        Some((seq, entries))
    }

    /// Write the summary of the open block into its last page
    fn close_open(&mut self, nand: &mut dyn FlashTarget) -> Result<(), FtlError> {
        let Some(open) = self.open.take() else {
            return Ok(());
        };

        let seq = self.blocks[open.block as usize].seq;
        self.encode_summary(seq, &open.entries);

        let summary_page = self.first_page(open.block) + self.data_pages();
        match nand.prog(summary_page, &self.page_buf) {
            Ok(()) => (),
            Err(FtlError::BadBlock { .. }) => {
                self.open = Some(open);
                return self.retire_open(nand);
            }
            Err(e) => {
                self.open = Some(open);
                return Err(e);
            }
        }

        self.blocks[open.block as usize].state = BlockState::Full;

        // Everything copied out of collected blocks is now on flash with a summary.
        for block in self.pending.drain(..) {
            self.blocks[block as usize].state = BlockState::Free { erased: false };
            self.free.push_back(block);
        }
        Ok(())
    }

    /// The open block failed a program: move its live pages elsewhere and mark it bad
    fn retire_open(&mut self, nand: &mut dyn FlashTarget) -> Result<(), FtlError> {
        let Some(open) = self.open.take() else {
            return Ok(());
        };
        warn!("retiring block {} after a failed program", open.block);
        self.blocks[open.block as usize].state = BlockState::Bad;

        let first = self.first_page(open.block);
        let live: Vec<(u32, u32)> = (first..first + open.entries.len() as u32)
            .filter(|&page| self.owner[page as usize] != NONE)
            .map(|page| (self.owner[page as usize], page))
            .collect();
        for (sector, page) in live {
            self.place(nand, sector, Source::Page(page))?;
        }

        nand.mark_bad(open.block)
    }

    /// One step of garbage collection. Returns false if no block is worth collecting.
    fn collect(&mut self, nand: &mut dyn FlashTarget) -> Result<bool, FtlError> {
        let data_pages = self.data_pages();
        let victim = (0..self.num_blocks)
            .filter(|&b| {
                let block = &self.blocks[b as usize];
                block.state == BlockState::Full && block.valid < data_pages
            })
            .min_by_key(|&b| (self.blocks[b as usize].valid, self.blocks[b as usize].seq));

        let Some(victim) = victim else {
            return Ok(false);
        };
        debug!(
            "collecting block {victim} ({} live pages)",
            self.blocks[victim as usize].valid
        );

        self.in_gc = true;
        let result = self.relocate(nand, victim);
        self.in_gc = false;
        result?;

        let unsynced = self.open.as_ref().is_some_and(|o| !o.entries.is_empty());
        if unsynced {
            self.blocks[victim as usize].state = BlockState::Pending;
            self.pending.push(victim);
        } else {
            self.blocks[victim as usize].state = BlockState::Free { erased: false };
            self.free.push_back(victim);
        }
        Ok(true)
    }

    fn relocate(&mut self, nand: &mut dyn FlashTarget, block: u32) -> Result<(), FtlError> {
        let first = self.first_page(block);
        for page in first..first + self.data_pages() {
            let sector = self.owner[page as usize];
            if sector != NONE {
                self.place(nand, sector, Source::Page(page))?;
            }
        }
        Ok(())
    }

    fn mapped_sectors(&self) -> usize {
        self.map.iter().filter(|&&p| p != NONE).count()
    }

    fn apply_summary(&mut self, block: u32, entries: &[u32]) {
        let first = self.first_page(block);
        for (page, &sector) in (first..).zip(entries) {
            if sector < self.capacity {
                self.bind(sector, page);
            }
        }
    }
}

impl Ftl for LogMap {
    fn resume(&mut self, nand: &mut dyn FlashTarget) -> Result<(), FtlError> {
        self.setup(nand)?;

        let rpt = howudoin::new()
            .label("Resuming wear-leveling map")
            .set_len(u64::from(self.num_blocks));

        let mut full = Vec::new();
        for block in 0..self.num_blocks {
            rpt.inc();
            if nand.is_bad(block)? {
                continue;
            }

            let first = self.first_page(block);
            let summary_page = first + self.data_pages();

            let summary = match nand.is_free(summary_page)? {
                true => None,
                false => {
                    let mut buf = std::mem::take(&mut self.page_buf);
                    let read = nand.read(summary_page, 0, &mut buf);
                    self.page_buf = buf;
                    match read {
                        Ok(()) => self.decode_summary(),
                        Err(FtlError::Ecc { .. }) => None,
                        Err(e) => return Err(e),
                    }
                }
            };

            match summary {
                Some((seq, entries)) => full.push((seq, block, entries)),
                None => {
                    // Never written, or written and never closed: either way reusable.
                    let erased = nand.is_free(first)?;
                    self.blocks[block as usize].state = BlockState::Free { erased };
                    self.free.push_back(block);
                }
            }
        }
        rpt.close();

        full.sort_unstable_by_key(|(seq, _, _)| *seq);
        for (seq, block, entries) in &full {
            self.blocks[*block as usize] = Block {
                state: BlockState::Full,
                valid: 0,
                seq: *seq,
            };
            self.apply_summary(*block, entries);
            self.seq = self.seq.max(*seq);
        }

        info!(
            "resumed map: {} sectors mapped, {} full blocks, {} free",
            self.mapped_sectors(),
            full.len(),
            self.free.len()
        );
        Ok(())
    }

    fn clear(&mut self, nand: &mut dyn FlashTarget) -> Result<(), FtlError> {
        self.setup(nand)?;
        for block in 0..self.num_blocks {
            if !nand.is_bad(block)? {
                self.blocks[block as usize].state = BlockState::Free { erased: false };
                self.free.push_back(block);
            }
        }
        Ok(())
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn read(
        &mut self,
        nand: &mut dyn FlashTarget,
        sector: u32,
        buf: &mut [u8],
    ) -> Result<(), FtlError> {
        self.check_sector(sector, buf.len())?;
        match self.map[sector as usize] {
            NONE => {
                buf.fill(0xFF);
                Ok(())
            }
            page => nand.read(page, 0, buf),
        }
    }

    fn write(
        &mut self,
        nand: &mut dyn FlashTarget,
        sector: u32,
        data: &[u8],
    ) -> Result<(), FtlError> {
        self.check_sector(sector, data.len())?;
        self.place(nand, sector, Source::Data(data))
    }

    fn trim(&mut self, _nand: &mut dyn FlashTarget, sector: u32) -> Result<(), FtlError> {
        self.check_sector(sector, self.page_size)?;
        self.unbind(sector);
        Ok(())
    }

    fn sync(&mut self, nand: &mut dyn FlashTarget) -> Result<(), FtlError> {
        match &self.open {
            Some(open) if !open.entries.is_empty() => self.close_open(nand),
            _ => Ok(()),
        }
    }

    fn gc(&mut self, nand: &mut dyn FlashTarget) -> Result<(), FtlError> {
        // Never dig into the reserve for an optional step.
        if self.free.len() <= GC_RESERVE {
            return Ok(());
        }
        self.collect(nand).map(|_| ())
    }
}

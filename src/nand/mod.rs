//! Abstractions and code to access SPI NAND flash

use crate::error::{Error, Result};

pub mod device;
pub mod emul;
pub mod spi;

/// Offset (past the end of page data) of the bad-block indicator in a block's first page
pub const BAD_BLOCK_MARKER_OFFSET: usize = 0;

/// Offset (past the end of page data) of the used marker in every page
pub const USED_MARKER_OFFSET: usize = 2;

/// What a marker reads as before anything narrowed it
pub const MARKER_ERASED: [u8; 2] = [0xFF, 0xFF];

/// What program/mark_bad write into a marker
pub const MARKER_SET: [u8; 2] = [0x00, 0x00];

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// How many bits the on-chip ECC had to correct during the last page read
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum EccStatus {
    #[default]
    Ok,
    Corrected1To3,
    Corrected4To6,
    Corrected7To8,
    Uncorrectable,
}

impl EccStatus {
    /// Decode the ECC field of the status register, already shifted down to bit 0.
    ///
    /// Both the 2-bit and 3-bit register flavors use the same numbering (the 3-bit one only
    /// adds code 5). Codes with no meaning are reported as uncorrectable.
    pub fn decode(raw: u8, width_bits: u8) -> Self {
        let mask = (1u8 << width_bits.min(3)) - 1;
        match raw & mask {
            0 => EccStatus::Ok,
            1 => EccStatus::Corrected1To3,
            2 => EccStatus::Uncorrectable,
            3 => EccStatus::Corrected4To6,
            5 => EccStatus::Corrected7To8,
            _ => EccStatus::Uncorrectable,
        }
    }

    /// The register code for this status (inverse of [EccStatus::decode])
    pub fn code(self) -> u8 {
        match self {
            EccStatus::Ok => 0,
            EccStatus::Corrected1To3 => 1,
            EccStatus::Uncorrectable => 2,
            EccStatus::Corrected4To6 => 3,
            EccStatus::Corrected7To8 => 5,
        }
    }

    /// Lower bound on the number of bits that were corrected
    pub fn min_corrected_bits(self) -> u8 {
        match self {
            EccStatus::Corrected1To3 => 1,
            EccStatus::Corrected4To6 => 4,
            EccStatus::Corrected7To8 => 7,
            EccStatus::Ok | EccStatus::Uncorrectable => 0,
        }
    }

    pub fn is_corrected(self) -> bool {
        self.min_corrected_bits() > 0
    }

    pub fn is_uncorrectable(self) -> bool {
        self == EccStatus::Uncorrectable
    }

    /// Should data read with this status be rewritten before it decays further?
    pub fn exceeds(self, refresh_threshold: u8) -> bool {
        self.is_corrected() && self.min_corrected_bits() >= refresh_threshold
    }
}

/// The ECC descriptor of a chip
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EccConfig {
    /// Width of the ECC field in the status register (2 or 3)
    pub status_width_bits: u8,

    /// Minimum corrected-bit count that triggers a data refresh
    pub refresh_threshold: u8,
}

impl Default for EccConfig {
    fn default() -> Self {
        Self {
            status_width_bits: 2,
            refresh_threshold: 4,
        }
    }
}

/// The physical layout and timing of a chip; fixed once detection is done
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub log2_page_size: u8,
    pub log2_pages_per_block: u8,
    pub num_blocks: u32,
    pub num_planes: u32,

    pub read_page_delay_us: u32,
    pub erase_block_delay_us: u32,
    pub program_page_delay_us: u32,

    pub ecc: EccConfig,

    /// Bit position of the quad-enable flag in the config register, if the chip has one
    pub quad_enable_bit: Option<u8>,
}

impl Geometry {
    /// A single-plane geometry with zero delays and default ECC settings
    pub fn new(log2_page_size: u8, log2_pages_per_block: u8, num_blocks: u32) -> Self {
        Self {
            log2_page_size,
            log2_pages_per_block,
            num_blocks,
            num_planes: 1,
            read_page_delay_us: 0,
            erase_block_delay_us: 0,
            program_page_delay_us: 0,
            ecc: EccConfig::default(),
            quad_enable_bit: None,
        }
    }

    pub fn page_size(&self) -> usize {
        1 << self.log2_page_size
    }

    pub fn pages_per_block(&self) -> u32 {
        1 << self.log2_pages_per_block
    }

    pub fn block_size(&self) -> usize {
        self.page_size() << self.log2_pages_per_block
    }

    pub fn num_pages(&self) -> u32 {
        self.num_blocks << self.log2_pages_per_block
    }

    /// Total bytes of page data (OOB excluded)
    pub fn total_size(&self) -> u64 {
        u64::from(self.num_blocks) * self.block_size() as u64
    }

    pub fn block_of(&self, page: u32) -> u32 {
        page >> self.log2_pages_per_block
    }

    pub fn first_page(&self, block: u32) -> u32 {
        block << self.log2_pages_per_block
    }

    /// Which plane holds the given page
    pub fn plane_of(&self, page: u32) -> u32 {
        self.block_of(page) & (self.num_planes.max(1) - 1)
    }

    /// The cache column address for `offset` within `page`, with the plane-select bit set on
    /// multi-plane chips
    pub fn column(&self, page: u32, offset: usize) -> u32 {
        let mut column = offset as u32;
        if self.num_planes > 1 {
            column |= self.plane_of(page) << (self.log2_page_size + 1);
        }
        column
    }

    pub fn check_page(&self, page: u32) -> Result<()> {
        if page >= self.num_pages() {
            return Err(Error::invalid_arg(format!(
                "page {page} out of range (device has {})",
                self.num_pages()
            )));
        }
        Ok(())
    }

    pub fn check_block(&self, block: u32) -> Result<()> {
        if block >= self.num_blocks {
            return Err(Error::invalid_arg(format!(
                "block {block} out of range (device has {})",
                self.num_blocks
            )));
        }
        Ok(())
    }
}

/// Identification read from the chip
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub manufacturer_id: u8,
    pub device_id: u16,
    pub chip_name: String,
}

/// Page-sized buffers owned by a device instance and only touched under its lock
#[derive(Debug)]
pub struct Scratch {
    pub work: Vec<u8>,
    pub read: Vec<u8>,
    pub temp: Vec<u8>,
}

impl Scratch {
    /// Allocate all three buffers, failing with [Error::NoMemory] instead of aborting
    pub fn new(page_size: usize) -> Result<Self> {
        let alloc = || -> Result<Vec<u8>> {
            let mut buf = Vec::new();
            buf.try_reserve_exact(page_size)
                .map_err(|_| Error::NoMemory)?;
            buf.resize(page_size, 0);
            Ok(buf)
        };

        Ok(Self {
            work: alloc()?,
            read: alloc()?,
            temp: alloc()?,
        })
    }
}

/// The physical page/block primitives of a NAND chip.
///
/// Implementations perform no locking and no argument validation beyond what they need to
/// stay memory-safe; [device::NandDevice] serializes calls and checks ranges first.
pub trait Nand: Send {
    fn geometry(&self) -> &Geometry;

    fn info(&self) -> &DeviceInfo;

    /// Read `buf.len()` bytes of `page` starting at byte `offset`.
    ///
    /// Fails with [Error::EccUncorrectable] when the chip could not correct the page; any
    /// correction it did make is reported in the returned status.
    fn read(&mut self, page: u32, offset: usize, buf: &mut [u8]) -> Result<EccStatus>;

    /// Load `page` and report its ECC status without failing on uncorrectable data
    fn ecc_status(&mut self, page: u32) -> Result<EccStatus>;

    /// Program a full page of data and set its used marker
    fn program(&mut self, page: u32, data: &[u8], scratch: &mut Scratch) -> Result<()>;

    fn erase_block(&mut self, block: u32) -> Result<()>;

    /// Is the used marker of `page` still erased?
    fn is_free(&mut self, page: u32) -> Result<bool>;

    /// Has the bad-block indicator of `block` been narrowed?
    fn is_bad(&mut self, block: u32) -> Result<bool>;

    /// Erase `block` and narrow its bad-block indicator
    fn mark_bad(&mut self, block: u32) -> Result<()>;

    /// Copy the data and OOB of page `src` into `dst`
    fn copy(&mut self, src: u32, dst: u32, scratch: &mut Scratch) -> Result<()>;
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ecc_decode() {
        assert_eq!(EccStatus::decode(0b00, 2), EccStatus::Ok);
        assert_eq!(EccStatus::decode(0b01, 2), EccStatus::Corrected1To3);
        assert_eq!(EccStatus::decode(0b10, 2), EccStatus::Uncorrectable);
        assert_eq!(EccStatus::decode(0b11, 2), EccStatus::Corrected4To6);

        // The upper bit is ignored on 2-bit chips
        assert_eq!(EccStatus::decode(0b101, 2), EccStatus::Corrected1To3);
        assert_eq!(EccStatus::decode(0b101, 3), EccStatus::Corrected7To8);
        assert_eq!(EccStatus::decode(0b100, 3), EccStatus::Uncorrectable);
        assert_eq!(EccStatus::decode(0b111, 3), EccStatus::Uncorrectable);
    }

    #[test]
    fn test_ecc_threshold() {
        assert!(!EccStatus::Ok.exceeds(0));
        assert!(!EccStatus::Uncorrectable.exceeds(0));
        assert!(EccStatus::Corrected1To3.exceeds(1));
        assert!(!EccStatus::Corrected1To3.exceeds(4));
        assert!(EccStatus::Corrected4To6.exceeds(4));
        assert!(EccStatus::Corrected7To8.exceeds(4));
        assert!(!EccStatus::Corrected4To6.exceeds(7));
    }

    #[test]
    fn test_geometry() {
        let mut geo = Geometry::new(11, 6, 1024);
        assert_eq!(geo.page_size(), 2048);
        assert_eq!(geo.block_size(), 2048 * 64);
        assert_eq!(geo.num_pages(), 65536);
        assert_eq!(geo.block_of(20 * 64 + 5), 20);
        assert_eq!(geo.first_page(20), 1280);
        assert_eq!(geo.column(65, 10), 10);

        geo.num_planes = 2;
        assert_eq!(geo.column(64, 10), 10 | (1 << 12));
        assert_eq!(geo.column(128, 10), 10);

        assert!(geo.check_page(65535).is_ok());
        assert!(matches!(
            geo.check_page(65536),
            Err(Error::InvalidArgument(_))
        ));
        assert!(geo.check_block(1024).is_err());
    }

    proptest! {
        #[test]
        fn test_ecc_code_roundtrip(raw in 0u8..8, width in 2u8..=3) {
            let status = EccStatus::decode(raw, width);
            if !status.is_uncorrectable() {
                prop_assert_eq!(status.code(), raw & ((1 << width) - 1));
            }
        }
    }
}

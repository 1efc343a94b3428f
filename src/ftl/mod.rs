//! The boundary to a flash-translation (wear-leveling) engine
//!
//! An engine maps logical sectors onto physical pages and does its own garbage collection and
//! bad-block retirement. It sees the flash only through [FlashTarget], which
//! [adapter::NandAdapter] implements on top of a device or a flash block device.

use thiserror::Error;

use crate::error::Error;

pub mod adapter;
pub mod logmap;

pub use logmap::LogMap;

/// What the flash callbacks can report back to an engine
#[derive(Error, Debug)]
pub enum FtlError {
    /// A program or erase did not finish; the engine should retire the block
    #[error("block {block} went bad")]
    BadBlock { block: u32 },

    /// The page could not be corrected
    #[error("uncorrectable ECC error in page {page}")]
    Ecc { page: u32 },

    #[error("map is full")]
    MapFull,

    #[error("too many bad blocks")]
    TooBad,

    #[error(transparent)]
    Device(#[from] Error),
}

impl From<FtlError> for Error {
    fn from(err: FtlError) -> Self {
        match err {
            FtlError::BadBlock { block } => Error::EraseFailed { block },
            FtlError::Ecc { page } => Error::EccUncorrectable { page },
            FtlError::MapFull => Error::MapFull,
            FtlError::TooBad => Error::TooBad,
            FtlError::Device(e) => e,
        }
    }
}

/// The physical flash as an engine sees it: the callback contract
pub trait FlashTarget {
    fn log2_page_size(&self) -> u8;

    fn log2_pages_per_block(&self) -> u8;

    fn num_blocks(&self) -> u32;

    fn is_bad(&mut self, block: u32) -> Result<bool, FtlError>;

    fn mark_bad(&mut self, block: u32) -> Result<(), FtlError>;

    fn erase(&mut self, block: u32) -> Result<(), FtlError>;

    /// Program a full page
    fn prog(&mut self, page: u32, data: &[u8]) -> Result<(), FtlError>;

    fn is_free(&mut self, page: u32) -> Result<bool, FtlError>;

    /// Read `buf.len()` bytes of `page` from `offset`
    fn read(&mut self, page: u32, offset: usize, buf: &mut [u8]) -> Result<(), FtlError>;

    fn copy(&mut self, src: u32, dst: u32) -> Result<(), FtlError>;
}

/// A flash-translation engine.
///
/// Engines are not reentrant; every call needs exclusive access, and the flash target is
/// handed in per call rather than stored.
pub trait Ftl: Send {
    /// Rebuild the map from what is on flash
    fn resume(&mut self, nand: &mut dyn FlashTarget) -> Result<(), FtlError>;

    /// Forget every mapping and start from an empty map
    fn clear(&mut self, nand: &mut dyn FlashTarget) -> Result<(), FtlError>;

    /// Number of logical sectors (one page each) the engine can hold
    fn capacity(&self) -> u32;

    /// Read a logical sector; sectors never written read as all 0xFF
    fn read(&mut self, nand: &mut dyn FlashTarget, sector: u32, buf: &mut [u8])
        -> Result<(), FtlError>;

    fn write(&mut self, nand: &mut dyn FlashTarget, sector: u32, data: &[u8])
        -> Result<(), FtlError>;

    /// Drop the content of a logical sector
    fn trim(&mut self, nand: &mut dyn FlashTarget, sector: u32) -> Result<(), FtlError>;

    /// Make everything written so far survive a restart
    fn sync(&mut self, nand: &mut dyn FlashTarget) -> Result<(), FtlError>;

    /// Do one step of garbage collection
    fn gc(&mut self, nand: &mut dyn FlashTarget) -> Result<(), FtlError>;
}

//! Driver stack for SPI NAND flash: chip detection and page primitives, an emulated chip for
//! host testing, a wear-leveling adapter, and block devices for a filesystem to sit on.

pub mod blockdev;
pub mod config;
pub mod diskio;
pub mod error;
pub mod ftl;
pub mod nand;
pub mod util;

pub use error::{Error, Result};

//! The error type shared by every layer of the stack

use std::io;

use thiserror::Error;

/// Everything that can go wrong between a block-device call and the flash chip.
///
/// Callers get exactly one of these per failed call; there are no partial successes.
#[derive(Error, Debug)]
pub enum Error {
    /// Misaligned, out-of-range, or otherwise malformed request
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A scratch buffer or handle could not be allocated
    #[error("out of memory")]
    NoMemory,

    /// The ID bytes read from the chip are not in any vendor table
    #[error("unrecognized device (manufacturer {manufacturer:#04x}, device {device:#06x})")]
    UnrecognizedDevice { manufacturer: u8, device: u16 },

    /// The chip reported a program failure
    #[error("program of page {page} did not finish")]
    ProgramFailed { page: u32 },

    /// The chip reported an erase failure
    #[error("erase of block {block} did not finish")]
    EraseFailed { block: u32 },

    #[error("uncorrectable ECC error in page {page}")]
    EccUncorrectable { page: u32 },

    #[error("readback of page {page} does not match the written data")]
    VerifyMismatch { page: u32 },

    /// The resource is uninitialized, released, or in the wrong mode
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("ioctl not supported")]
    NotSupported,

    /// An emulated access fell outside the backing region
    #[error("access of {len} bytes at {addr:#x} exceeds the {size}-byte region")]
    InvalidSize { addr: usize, len: usize, size: usize },

    /// The wear-leveling map has no room left for new data
    #[error("wear-leveling map is full")]
    MapFull,

    /// Too many blocks went bad for the wear-leveling map to keep working
    #[error("too many bad blocks")]
    TooBad,

    #[error("SPI transport: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Sys(#[from] nix::Error),
}

impl Error {
    /// Is this a hardware-reported program/erase failure?
    ///
    /// The wear-leveling shim reports these to the engine as a bad block.
    pub fn is_not_finished(&self) -> bool {
        matches!(self, Error::ProgramFailed { .. } | Error::EraseFailed { .. })
    }

    pub(crate) fn invalid_arg(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[test]
fn test_not_finished() {
    assert!(Error::ProgramFailed { page: 3 }.is_not_finished());
    assert!(Error::EraseFailed { block: 1 }.is_not_finished());
    assert!(!Error::EccUncorrectable { page: 3 }.is_not_finished());
    assert!(!Error::NotSupported.is_not_finished());
}

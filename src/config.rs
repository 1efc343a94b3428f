//! Construction-time configuration
//!
//! Nothing in this crate reads a process-wide default: every device is built from a [Config]
//! handed to it by the caller.

use std::path::PathBuf;
use std::str::FromStr;

/// Bus width used for page-data transfers
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum IoMode {
    /// Single line for data
    #[default]
    Sio,
    /// Dual output (reads on two lines)
    Dout,
    /// Quad output (reads and program loads on four lines); requires the quad-enable bit
    Qout,
}

impl IoMode {
    pub fn is_quad(self) -> bool {
        self == IoMode::Qout
    }
}

/// Options for a device instance and the wear-leveling engine layered on it
#[derive(Debug, Clone)]
pub struct Config {
    pub io_mode: IoMode,

    /// Roughly one spare block is reserved per `gc_factor` blocks (plus a fixed two) so garbage
    /// collection always has somewhere to move live data.
    pub gc_factor: u32,

    /// Minimum corrected-bit count that makes a read rewrite its data. `None` keeps the
    /// chip's default.
    pub ecc_refresh_threshold: Option<u8>,

    /// Read every programmed page back and compare it with what was written
    pub verify_writes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            io_mode: IoMode::Sio,
            gc_factor: 45,
            ecc_refresh_threshold: None,
            verify_writes: false,
        }
    }
}

/// A pub-fields struct describing the data layout of an emulated NAND
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Layout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
}

/// Parse strings like "BLOCKSxPAGESxBYTES"
impl FromStr for Layout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#"))?;
        let blocks = blocks.parse()?;
        let pages_per_block: u32 = pages_per_block.parse()?;
        let bytes_per_page: usize = bytes_per_page.parse()?;

        anyhow::ensure!(
            pages_per_block.is_power_of_two() && bytes_per_page.is_power_of_two(),
            "pages per block and bytes per page must be powers of two"
        );

        Ok(Layout {
            blocks,
            pages_per_block,
            bytes_per_page,
        })
    }
}

/// Options for the memory-mapped emulation backend
#[derive(Debug, Clone)]
pub struct EmulConfig {
    /// Backing file; a fresh temporary file is created when `None`
    pub path: Option<PathBuf>,

    /// Size of the flash (page data plus OOB) in bytes
    pub size: usize,

    /// Keep the backing file around after the device is released
    pub keep_dump: bool,

    /// Keep the content of an existing backing file of the right size instead of erasing it
    pub reuse_existing: bool,

    pub pages_per_block: u32,
    pub bytes_per_page: usize,
}

impl EmulConfig {
    pub const DEFAULT_SIZE: usize = 128 * 1024 * 1024;

    /// An emulated flash with exactly the given layout
    pub fn with_layout(layout: Layout) -> Self {
        let emulated_page = layout.bytes_per_page + crate::nand::emul::OOB_SIZE;
        Self {
            size: emulated_page * layout.pages_per_block as usize * layout.blocks as usize,
            pages_per_block: layout.pages_per_block,
            bytes_per_page: layout.bytes_per_page,
            ..Default::default()
        }
    }
}

impl Default for EmulConfig {
    fn default() -> Self {
        Self {
            path: None,
            size: Self::DEFAULT_SIZE,
            keep_dump: false,
            reuse_existing: false,
            pages_per_block: 64,
            bytes_per_page: 2048,
        }
    }
}

#[test]
fn test_layout_parse() -> anyhow::Result<()> {
    let layout: Layout = "1024x64x2048".parse()?;
    assert_eq!(
        layout,
        Layout {
            blocks: 1024,
            pages_per_block: 64,
            bytes_per_page: 2048
        }
    );

    assert!("1024x64".parse::<Layout>().is_err());
    assert!("1024x60x2048".parse::<Layout>().is_err());
    assert!("axbxc".parse::<Layout>().is_err());
    Ok(())
}

#[test]
fn test_emul_config_size() {
    let cfg = EmulConfig::with_layout(Layout {
        blocks: 8,
        pages_per_block: 16,
        bytes_per_page: 512,
    });
    assert_eq!(cfg.size, (512 + 64) * 16 * 8);
    assert!(cfg.path.is_none());
}

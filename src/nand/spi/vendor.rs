//! Manufacturer and part-number tables

use bytes::Buf;
use log::info;

use super::transport::{self, Transport, REG_CONFIG, REG_PROTECT};
use crate::config::IoMode;
use crate::error::{Error, Result};
use crate::nand::{DeviceInfo, EccConfig, Geometry};

pub const MFR_GIGADEVICE: u8 = 0xC8;
pub const MFR_ALLIANCE: u8 = 0x52;
pub const MFR_WINBOND: u8 = 0xEF;
pub const MFR_MICRON: u8 = 0x2C;
pub const MFR_ZETTA: u8 = 0xBA;
pub const MFR_XTX: u8 = 0x0B;

/// Per-part overrides of the vendor defaults
struct Part {
    device_id: u16,
    name: &'static str,
    num_blocks: u32,
    log2_page_size: u8,
    read_page_delay_us: Option<u32>,
    program_page_delay_us: Option<u32>,
}

const fn part(device_id: u16, name: &'static str, num_blocks: u32) -> Part {
    Part {
        device_id,
        name,
        num_blocks,
        log2_page_size: 11,
        read_page_delay_us: None,
        program_page_delay_us: None,
    }
}

struct Vendor {
    manufacturer_id: u8,
    name: &'static str,
    /// Winbond answers with a two-byte device ID, everyone else with one
    wide_device_id: bool,
    read_page_delay_us: u32,
    erase_block_delay_us: u32,
    program_page_delay_us: u32,
    ecc_status_width_bits: u8,
    quad_enable_bit: Option<u8>,
    parts: &'static [Part],
}

static VENDORS: &[Vendor] = &[
    Vendor {
        manufacturer_id: MFR_GIGADEVICE,
        name: "GigaDevice",
        wide_device_id: false,
        read_page_delay_us: 25,
        erase_block_delay_us: 3200,
        program_page_delay_us: 380,
        ecc_status_width_bits: 2,
        quad_enable_bit: Some(0),
        parts: &[
            part(0x51, "GD5F1GQ5", 1024),
            part(0x41, "GD5F1GQ5", 1024),
            part(0x31, "GD5F1GQ4", 1024),
            part(0x21, "GD5F1GQ4", 1024),
            part(0x52, "GD5F2GQ5", 2048),
            part(0x42, "GD5F2GQ5", 2048),
            part(0x32, "GD5F2GQ4", 2048),
            part(0x22, "GD5F2GQ4", 2048),
            part(0x55, "GD5F4GQ6", 4096),
            part(0x45, "GD5F4GQ6", 4096),
            part(0x35, "GD5F4GQ4", 4096),
            part(0x25, "GD5F4GQ4", 4096),
        ],
    },
    Vendor {
        manufacturer_id: MFR_ALLIANCE,
        name: "Alliance",
        wide_device_id: false,
        read_page_delay_us: 60,
        erase_block_delay_us: 3000,
        program_page_delay_us: 630,
        ecc_status_width_bits: 2,
        quad_enable_bit: Some(0),
        parts: &[
            part(0x25, "AS5F31G04SND", 1024),
            part(0x2E, "AS5F32G04SND", 2048),
            part(0x8E, "AS5F12G04SND", 2048),
            part(0x2F, "AS5F34G04SND", 4096),
            part(0x8F, "AS5F14G04SND", 4096),
            Part {
                log2_page_size: 12,
                read_page_delay_us: Some(130),
                ..part(0x2D, "AS5F38G04SND", 4096)
            },
            Part {
                log2_page_size: 12,
                read_page_delay_us: Some(130),
                ..part(0x8D, "AS5F18G04SND", 4096)
            },
        ],
    },
    Vendor {
        manufacturer_id: MFR_WINBOND,
        name: "Winbond",
        wide_device_id: true,
        read_page_delay_us: 10,
        erase_block_delay_us: 2500,
        program_page_delay_us: 320,
        ecc_status_width_bits: 2,
        quad_enable_bit: None,
        parts: &[
            part(0xAA20, "W25N512GV", 512),
            part(0xBA20, "W25N512GW", 512),
            part(0xAA21, "W25N01GV", 1024),
            part(0xBA21, "W25N01GW", 1024),
            part(0xBC21, "W25N01JW", 1024),
            part(0xAA22, "W25N02KV", 2048),
            part(0xAA23, "W25N04KV", 4096),
        ],
    },
    Vendor {
        manufacturer_id: MFR_MICRON,
        name: "Micron",
        wide_device_id: false,
        read_page_delay_us: 115,
        erase_block_delay_us: 2000,
        program_page_delay_us: 240,
        ecc_status_width_bits: 3,
        quad_enable_bit: Some(0),
        parts: &[
            Part {
                log2_page_size: 12,
                ..part(0x34, "MT29F4G01ABAFD", 2048)
            },
            Part {
                read_page_delay_us: Some(46),
                program_page_delay_us: Some(220),
                ..part(0x14, "MT29F1G01ABAFD", 1024)
            },
            Part {
                read_page_delay_us: Some(46),
                program_page_delay_us: Some(220),
                ..part(0x15, "MT29F1G01ABBFD", 1024)
            },
        ],
    },
    Vendor {
        manufacturer_id: MFR_ZETTA,
        name: "Zetta",
        wide_device_id: false,
        read_page_delay_us: 250,
        erase_block_delay_us: 2000,
        program_page_delay_us: 400,
        ecc_status_width_bits: 2,
        quad_enable_bit: Some(0),
        parts: &[part(0x71, "ZD35Q1GA", 1024)],
    },
    Vendor {
        manufacturer_id: MFR_XTX,
        name: "XTX",
        wide_device_id: false,
        read_page_delay_us: 50,
        erase_block_delay_us: 3500,
        program_page_delay_us: 650,
        ecc_status_width_bits: 2,
        quad_enable_bit: Some(0),
        parts: &[Part {
            log2_page_size: 12,
            ..part(0x37, "XT26G04D", 4096)
        }],
    },
];

/// Identify the chip behind `transport`, clear its write protection, and enable quad mode if
/// requested
pub fn detect<T: Transport + ?Sized>(
    transport: &mut T,
    io_mode: IoMode,
) -> Result<(Geometry, DeviceInfo)> {
    let mut id = [0u8; 3];
    transport::read_id(transport, &mut id)?;

    let mut id = &id[..];
    let manufacturer_id = id.get_u8();

    let Some(vendor) = VENDORS
        .iter()
        .find(|v| v.manufacturer_id == manufacturer_id)
    else {
        return Err(Error::UnrecognizedDevice {
            manufacturer: manufacturer_id,
            device: id.get_u16(),
        });
    };

    let device_id = match vendor.wide_device_id {
        true => id.get_u16(),
        false => id.get_u8().into(),
    };

    let Some(part) = vendor.parts.iter().find(|p| p.device_id == device_id) else {
        return Err(Error::UnrecognizedDevice {
            manufacturer: manufacturer_id,
            device: device_id,
        });
    };

    let geometry = Geometry {
        log2_page_size: part.log2_page_size,
        log2_pages_per_block: 6,
        num_blocks: part.num_blocks,
        num_planes: 1,
        read_page_delay_us: part.read_page_delay_us.unwrap_or(vendor.read_page_delay_us),
        erase_block_delay_us: vendor.erase_block_delay_us,
        program_page_delay_us: part
            .program_page_delay_us
            .unwrap_or(vendor.program_page_delay_us),
        ecc: EccConfig {
            status_width_bits: vendor.ecc_status_width_bits,
            ..Default::default()
        },
        quad_enable_bit: vendor.quad_enable_bit,
    };

    let info = DeviceInfo {
        manufacturer_id,
        device_id,
        chip_name: format!("{} {}", vendor.name, part.name),
    };

    unprotect(transport)?;
    if io_mode.is_quad() {
        if let Some(bit) = geometry.quad_enable_bit {
            let config = transport::read_register(transport, REG_CONFIG)?;
            transport::write_register(transport, REG_CONFIG, config | (1 << bit))?;
        }
    }

    info!(
        "detected {} ({manufacturer_id:#04x}/{device_id:#06x}): {} blocks of {} x {} bytes",
        info.chip_name,
        geometry.num_blocks,
        geometry.pages_per_block(),
        geometry.page_size()
    );

    Ok((geometry, info))
}

/// The name of the vendor with this manufacturer ID
pub fn vendor_name(manufacturer_id: u8) -> Option<&'static str> {
    VENDORS
        .iter()
        .find(|v| v.manufacturer_id == manufacturer_id)
        .map(|v| v.name)
}

/// Clear any block-protection bits left set at the factory
pub fn unprotect<T: Transport + ?Sized>(transport: &mut T) -> Result<()> {
    let protect = transport::read_register(transport, REG_PROTECT)?;
    if protect != 0 {
        transport::write_register(transport, REG_PROTECT, 0)?;
    }
    Ok(())
}

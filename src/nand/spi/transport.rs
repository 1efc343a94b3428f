//! The SPI transaction boundary and the command set spoken over it

use crate::config::IoMode;
use crate::error::Result;

pub const CMD_SET_REGISTER: u8 = 0x1F;
pub const CMD_READ_REGISTER: u8 = 0x0F;
pub const CMD_WRITE_ENABLE: u8 = 0x06;
pub const CMD_READ_ID: u8 = 0x9F;
pub const CMD_PAGE_READ: u8 = 0x13;
pub const CMD_PROGRAM_EXECUTE: u8 = 0x10;
pub const CMD_PROGRAM_LOAD: u8 = 0x02;
pub const CMD_PROGRAM_LOAD_X4: u8 = 0x32;
pub const CMD_RANDOM_PROGRAM_LOAD: u8 = 0x84;
pub const CMD_RANDOM_PROGRAM_LOAD_X4: u8 = 0x34;
pub const CMD_READ_FAST: u8 = 0x0B;
pub const CMD_READ_X2: u8 = 0x3B;
pub const CMD_READ_X4: u8 = 0x6B;
pub const CMD_ERASE_BLOCK: u8 = 0xD8;

pub const REG_PROTECT: u8 = 0xA0;
pub const REG_CONFIG: u8 = 0xB0;
pub const REG_STATUS: u8 = 0xC0;

/// One command on the bus: opcode, optional address phase, dummy cycles, then data.
///
/// `mosi` is sent after the address; `miso` is filled with what the chip answers.
#[derive(Debug)]
pub struct Transaction<'a> {
    pub command: u8,
    pub address: u32,
    pub address_bytes: u8,
    pub dummy_bits: u8,
    pub mosi: &'a [u8],
    pub miso: &'a mut [u8],
}

impl<'a> Transaction<'a> {
    pub fn new(command: u8) -> Self {
        Self {
            command,
            address: 0,
            address_bytes: 0,
            dummy_bits: 0,
            mosi: &[],
            miso: &mut [],
        }
    }

    pub fn address(mut self, address: u32, bytes: u8) -> Self {
        self.address = address;
        self.address_bytes = bytes;
        self
    }

    pub fn dummy_bits(mut self, bits: u8) -> Self {
        self.dummy_bits = bits;
        self
    }

    pub fn mosi(mut self, data: &'a [u8]) -> Self {
        self.mosi = data;
        self
    }

    pub fn miso(mut self, data: &'a mut [u8]) -> Self {
        self.miso = data;
        self
    }
}

/// Something that can put a [Transaction] on the wire (a SPI master driver, or a simulator)
pub trait Transport: Send {
    fn transfer(&mut self, txn: &mut Transaction<'_>) -> Result<()>;

    /// Does the bus clock data in both directions at once?
    ///
    /// Full-duplex transports see MOSI and MISO of equal length; [execute] pads them.
    fn is_full_duplex(&self) -> bool {
        false
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn transfer(&mut self, txn: &mut Transaction<'_>) -> Result<()> {
        (**self).transfer(txn)
    }

    fn is_full_duplex(&self) -> bool {
        (**self).is_full_duplex()
    }
}

/// Run a transaction, normalizing the data phase for full-duplex transports
pub fn execute<T: Transport + ?Sized>(transport: &mut T, txn: Transaction<'_>) -> Result<()> {
    let mut txn = txn;
    if !transport.is_full_duplex() || txn.mosi.len() == txn.miso.len() {
        return transport.transfer(&mut txn);
    }

    let len = txn.mosi.len().max(txn.miso.len());
    let mut mosi = vec![0xFF; len];
    mosi[..txn.mosi.len()].copy_from_slice(txn.mosi);
    let mut miso = vec![0; len];

    let mut padded = Transaction {
        command: txn.command,
        address: txn.address,
        address_bytes: txn.address_bytes,
        dummy_bits: txn.dummy_bits,
        mosi: &mosi,
        miso: &mut miso,
    };
    transport.transfer(&mut padded)?;

    let want = txn.miso.len();
    txn.miso.copy_from_slice(&miso[..want]);
    Ok(())
}

pub fn read_register<T: Transport + ?Sized>(t: &mut T, register: u8) -> Result<u8> {
    let mut value = [0u8];
    execute(
        t,
        Transaction::new(CMD_READ_REGISTER)
            .address(register.into(), 1)
            .miso(&mut value),
    )?;
    Ok(value[0])
}

pub fn write_register<T: Transport + ?Sized>(t: &mut T, register: u8, value: u8) -> Result<()> {
    execute(
        t,
        Transaction::new(CMD_SET_REGISTER)
            .address(register.into(), 1)
            .mosi(&[value]),
    )
}

pub fn write_enable<T: Transport + ?Sized>(t: &mut T) -> Result<()> {
    execute(t, Transaction::new(CMD_WRITE_ENABLE))
}

/// Read the ID bytes (manufacturer first) into `buf`
pub fn read_id<T: Transport + ?Sized>(t: &mut T, buf: &mut [u8]) -> Result<()> {
    execute(t, Transaction::new(CMD_READ_ID).address(0, 1).miso(buf))
}

/// Move `page` from the array into the chip's cache register
pub fn page_read<T: Transport + ?Sized>(t: &mut T, page: u32) -> Result<()> {
    execute(t, Transaction::new(CMD_PAGE_READ).address(page, 3))
}

/// Transfer bytes out of the cache register, starting at `column`
pub fn read_cache<T: Transport + ?Sized>(
    t: &mut T,
    mode: IoMode,
    column: u32,
    buf: &mut [u8],
) -> Result<()> {
    let command = match mode {
        IoMode::Sio => CMD_READ_FAST,
        IoMode::Dout => CMD_READ_X2,
        IoMode::Qout => CMD_READ_X4,
    };
    execute(
        t,
        Transaction::new(command)
            .address(column, 2)
            .dummy_bits(8)
            .miso(buf),
    )
}

/// Load bytes into the cache register at `column`.
///
/// With `reset` the rest of the cache is set to 0xFF first; otherwise it is left alone.
pub fn program_load<T: Transport + ?Sized>(
    t: &mut T,
    mode: IoMode,
    reset: bool,
    column: u32,
    data: &[u8],
) -> Result<()> {
    let command = match (reset, mode.is_quad()) {
        (true, false) => CMD_PROGRAM_LOAD,
        (true, true) => CMD_PROGRAM_LOAD_X4,
        (false, false) => CMD_RANDOM_PROGRAM_LOAD,
        (false, true) => CMD_RANDOM_PROGRAM_LOAD_X4,
    };
    execute(t, Transaction::new(command).address(column, 2).mosi(data))
}

/// Commit the cache register into `page`
pub fn program_execute<T: Transport + ?Sized>(t: &mut T, page: u32) -> Result<()> {
    execute(t, Transaction::new(CMD_PROGRAM_EXECUTE).address(page, 3))
}

/// Erase the block containing `page`
pub fn erase_block<T: Transport + ?Sized>(t: &mut T, page: u32) -> Result<()> {
    execute(t, Transaction::new(CMD_ERASE_BLOCK).address(page, 3))
}

#[cfg(test)]
mod test {
    use super::*;

    /// Records the last transaction and answers with an incrementing byte pattern
    #[derive(Default)]
    struct Recorder {
        full_duplex: bool,
        seen: Vec<(u8, u32, u8, u8, Vec<u8>, usize)>,
    }

    impl Transport for Recorder {
        fn transfer(&mut self, txn: &mut Transaction<'_>) -> Result<()> {
            self.seen.push((
                txn.command,
                txn.address,
                txn.address_bytes,
                txn.dummy_bits,
                txn.mosi.to_vec(),
                txn.miso.len(),
            ));
            for (i, b) in txn.miso.iter_mut().enumerate() {
                *b = i as u8;
            }
            Ok(())
        }

        fn is_full_duplex(&self) -> bool {
            self.full_duplex
        }
    }

    #[test]
    fn test_half_duplex_shapes() -> anyhow::Result<()> {
        let mut t = Recorder::default();

        let mut buf = [0u8; 4];
        read_cache(&mut t, IoMode::Dout, 0x810, &mut buf)?;
        page_read(&mut t, 1280)?;
        program_load(&mut t, IoMode::Qout, false, 0x802, &[0, 0])?;
        write_register(&mut t, REG_PROTECT, 0)?;

        assert_eq!(t.seen[0], (CMD_READ_X2, 0x810, 2, 8, vec![], 4));
        assert_eq!(t.seen[1], (CMD_PAGE_READ, 1280, 3, 0, vec![], 0));
        assert_eq!(
            t.seen[2],
            (CMD_RANDOM_PROGRAM_LOAD_X4, 0x802, 2, 0, vec![0, 0], 0)
        );
        assert_eq!(t.seen[3], (CMD_SET_REGISTER, 0xA0, 1, 0, vec![0], 0));
        assert_eq!(buf, [0, 1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_full_duplex_padding() -> anyhow::Result<()> {
        let mut t = Recorder {
            full_duplex: true,
            ..Default::default()
        };

        let mut buf = [0u8; 3];
        read_cache(&mut t, IoMode::Sio, 0, &mut buf)?;
        program_load(&mut t, IoMode::Sio, true, 0, &[0xAA, 0xBB])?;

        // The wire saw equal-length phases
        assert_eq!(t.seen[0].4, vec![0xFF; 3]);
        assert_eq!(t.seen[0].5, 3);
        assert_eq!(t.seen[1].4, vec![0xAA, 0xBB]);
        assert_eq!(t.seen[1].5, 2);

        // ...but the caller only got what it asked for
        assert_eq!(buf, [0, 1, 2]);
        Ok(())
    }
}

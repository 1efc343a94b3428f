//! Seeded test patterns and the padded reads image loading needs

use std::io::{self, Read};

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

/// Fill `buf` with a deterministic pseudo-random sequence derived from `seed`.
///
/// The same seed always produces the same bytes, which lets a reader check data it did not
/// keep a copy of.
pub fn fill_pattern(seed: u64, buf: &mut [u8]) {
    SmallRng::seed_from_u64(seed).fill_bytes(buf);
}

/// Does `buf` hold exactly the sequence [fill_pattern] produces for `seed`?
pub fn check_pattern(seed: u64, buf: &[u8]) -> bool {
    let mut expected = vec![0u8; buf.len()];
    fill_pattern(seed, &mut expected);
    expected == buf
}

pub trait ReadExt {
    /// Fill `unit` from the reader, padding whatever EOF leaves unfilled with the erased byte
    /// 0xFF.
    ///
    /// Returns how many bytes came from the reader: `unit.len()` unless EOF was hit first.
    fn read_unit(&mut self, unit: &mut [u8]) -> io::Result<usize>;
}

impl<T: Read> ReadExt for T {
    fn read_unit(&mut self, unit: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < unit.len() {
            match self.read(&mut unit[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        unit[filled..].fill(0xFF);
        Ok(filled)
    }
}

#[test]
fn test_read_unit() -> io::Result<()> {
    let mut unit = [0u8; 4];
    assert_eq!(io::repeat(0xAA).read_unit(&mut unit)?, 4);
    assert_eq!(unit, [0xAA; 4]);

    // Short reads are stitched together
    let mut chained = (&[1u8][..]).chain(&[2u8, 3][..]);
    assert_eq!(chained.read_unit(&mut unit)?, 3);
    assert_eq!(unit, [1, 2, 3, 0xFF]);

    assert_eq!(io::empty().read_unit(&mut unit)?, 0);
    assert_eq!(unit, [0xFF; 4]);
    Ok(())
}

#[test]
fn test_pattern() {
    let mut a = [0u8; 64];
    let mut b = [0u8; 64];
    fill_pattern(0x12345678, &mut a);
    fill_pattern(0x12345678, &mut b);
    assert_eq!(a, b);
    assert!(check_pattern(0x12345678, &a));
    assert!(!check_pattern(0x12345679, &a));
    assert!(!a.iter().all(|&x| x == a[0]));
}

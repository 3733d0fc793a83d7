//! The backing store mapped values are read from and written to.
//!
//! The VM only ever sees a `Device`; what is behind it
//! (a file, a process's memory, a buffer) is up to the embedder.
//! Offsets here are in bytes.

use std::{cell::RefCell, rc::Rc};

use thiserror::Error;

use crate::common::{
    config::{ByteOrder, Config, NegEncoding},
    data::Int,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IoError {
    #[error("end of file")]
    Eof,
    #[error("invalid offset {0}")]
    InvalidOffset(u64),
    #[error("{0}")]
    Other(String),
}

/// What the VM needs from a backing store.
pub trait Device {
    /// Fills `buf` with the bytes starting at `offset`.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), IoError>;
    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<(), IoError>;
    /// Size in bytes.
    fn size(&self) -> u64;
    /// Persists whatever is buffered up to `offset`. Advisory.
    fn flush(&mut self, offset: u64) -> Result<(), IoError>;
}

/// Lets a caller keep a handle on a device the VM is using.
impl<D: Device> Device for Rc<RefCell<D>> {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), IoError> {
        self.borrow_mut().read(offset, buf)
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<(), IoError> {
        self.borrow_mut().write(offset, bytes)
    }

    fn size(&self) -> u64 {
        self.borrow().size()
    }

    fn flush(&mut self, offset: u64) -> Result<(), IoError> {
        self.borrow_mut().flush(offset)
    }
}

/// A fixed-size buffer of bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryDevice {
    bytes: Vec<u8>,
    flushed: u64,
}

impl MemoryDevice {
    pub fn new(bytes: Vec<u8>) -> MemoryDevice {
        MemoryDevice { bytes, flushed: 0 }
    }

    pub fn zeroed(len: usize) -> MemoryDevice {
        MemoryDevice::new(vec![0; len])
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// How far the device has been flushed.
    pub fn flushed(&self) -> u64 {
        self.flushed
    }

    fn range(&self, offset: u64, len: usize) -> Result<std::ops::Range<usize>, IoError> {
        let start = usize::try_from(offset).map_err(|_| IoError::InvalidOffset(offset))?;
        let end = start.checked_add(len).ok_or(IoError::InvalidOffset(offset))?;
        if end > self.bytes.len() {
            return Err(IoError::Eof);
        }
        Ok(start..end)
    }
}

impl Device for MemoryDevice {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), IoError> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<(), IoError> {
        let range = self.range(offset, bytes.len())?;
        self.bytes[range].copy_from_slice(bytes);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn flush(&mut self, offset: u64) -> Result<(), IoError> {
        self.flushed = self.flushed.max(offset.min(self.size()));
        Ok(())
    }
}

/// Decodes an integer of `bytes.len() * 8` bits.
///
/// In ones' complement the all-ones pattern, -0, decodes to 0,
/// and `encode_int` writes 0 back as all zeros.
pub fn decode_int(bytes: &[u8], signed: bool, config: &Config) -> Int {
    let size = (bytes.len() * 8) as u8;
    let mut bits: u64 = 0;
    let ordered: Box<dyn Iterator<Item = &u8>> = match config.endian.resolve() {
        ByteOrder::Msb => Box::new(bytes.iter()),
        ByteOrder::Lsb => Box::new(bytes.iter().rev()),
    };
    for byte in ordered {
        bits = (bits << 8) | *byte as u64;
    }

    let int = Int::from_bits(bits, size, signed);
    match config.nenc {
        NegEncoding::OnesComplement if int.value() < 0 => Int::new(int.value() + 1, size, signed),
        _ => int,
    }
}

/// Encodes an integer in `int.size() / 8` bytes.
pub fn encode_int(int: Int, config: &Config) -> Vec<u8> {
    let size = int.size();
    let bits = match config.nenc {
        NegEncoding::OnesComplement if int.value() < 0 => Int::new(int.value() - 1, size, int.signed()).bits(),
        _ => int.bits(),
    };

    let count = (size / 8) as usize;
    let mut bytes: Vec<u8> = (0..count).map(|i| (bits >> (8 * i)) as u8).collect();
    if config.endian.resolve() == ByteOrder::Msb {
        bytes.reverse();
    }
    bytes
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::config::{Endian, Obase};
    use proptest::prelude::*;

    #[test]
    fn bounds() {
        let mut device = MemoryDevice::new(vec![1, 2, 3, 4]);
        let mut buf = [0; 2];
        device.read(2, &mut buf).unwrap();
        assert_eq!(buf, [3, 4]);
        assert_eq!(device.read(3, &mut buf), Err(IoError::Eof));
        assert_eq!(device.write(4, &[0]), Err(IoError::Eof));
        device.write(0, &[9]).unwrap();
        assert_eq!(device.bytes(), &[9, 2, 3, 4]);
    }

    #[test]
    fn shared_handle() {
        let device = Rc::new(RefCell::new(MemoryDevice::zeroed(2)));
        let mut handle = Rc::clone(&device);
        handle.write(1, &[7]).unwrap();
        handle.flush(1).unwrap();
        assert_eq!(device.borrow().bytes(), &[0, 7]);
        assert_eq!(device.borrow().flushed(), 1);
        assert_eq!(handle.size(), 2);
    }

    #[test]
    fn byte_orders() {
        let mut config = Config::default();
        let int = Int::new(0x0102, 16, false);
        assert_eq!(encode_int(int, &config), vec![1, 2]);
        config.endian = Endian::Little;
        assert_eq!(encode_int(int, &config), vec![2, 1]);
        assert_eq!(decode_int(&[2, 1], false, &config), int);
    }

    #[test]
    fn ones_complement() {
        let config = Config { nenc: NegEncoding::OnesComplement, ..Config::default() };
        assert_eq!(encode_int(Int::new(-1, 8, true), &config), vec![0xfe]);
        assert_eq!(decode_int(&[0xfe], true, &config).value(), -1);
        assert_eq!(decode_int(&[0xff], true, &config).value(), 0);
        // unsigned values ignore the negative encoding
        assert_eq!(decode_int(&[0xfe], false, &config).value(), 0xfe);
    }

    proptest! {
        #[test]
        fn every_configuration(
            value: i64,
            bytes in 1usize..=8,
            signed: bool,
            endian: Endian,
            nenc: NegEncoding,
        ) {
            let config = Config { endian, nenc, obase: Obase::default() };
            let size = (bytes * 8) as u8;
            let int = Int::new(value as i128, size, signed);
            // -0 has no encoding of its own in ones' complement
            let expected = match (nenc, signed) {
                (NegEncoding::OnesComplement, true) if int.value() == Int::new(i128::MIN, size, true).value() => {
                    return Ok(());
                },
                _ => int,
            };

            let encoded = encode_int(int, &config);
            prop_assert_eq!(encoded.len(), bytes);
            prop_assert_eq!(decode_int(&encoded, signed, &config), expected);
        }
    }
}

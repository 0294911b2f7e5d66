use crate::crypto::{Address, Hash, ADDRESS_SIZE};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("Not enough bytes available in the reader")]
    NotEnoughBytes,

    #[error("Invalid size")]
    InvalidSize,

    #[error("Invalid value")]
    InvalidValue,

    #[error("Invalid hex string")]
    InvalidHex,

    #[error("Invalid UTF-8 string")]
    InvalidString,

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

// Cursor over a byte slice with checked, big-endian reads.
pub struct Reader<'a> {
    bytes: &'a [u8],
    total: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, total: 0 }
    }

    pub fn total_size(&self) -> usize {
        self.bytes.len() + self.total
    }

    pub fn total_read(&self) -> usize {
        self.total
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    fn advance(&mut self, n: usize) -> Result<&'a [u8], ReaderError> {
        if n > self.bytes.len() {
            return Err(ReaderError::NotEnoughBytes);
        }
        let (taken, rest) = self.bytes.split_at(n);
        self.bytes = rest;
        self.total += n;
        Ok(taken)
    }

    pub fn read_bool(&mut self) -> Result<bool, ReaderError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(ReaderError::InvalidValue),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, ReaderError> {
        Ok(self.advance(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, ReaderError> {
        let bytes = self.advance(2)?;
        Ok(u16::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, ReaderError> {
        let bytes = self.advance(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, ReaderError> {
        let bytes = self.advance(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_u128(&mut self) -> Result<u128, ReaderError> {
        let bytes = self.advance(16)?;
        Ok(u128::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> Result<i64, ReaderError> {
        let bytes = self.advance(8)?;
        Ok(i64::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, ReaderError> {
        Ok(self.advance(n)?.to_vec())
    }

    pub fn read_bytes_32(&mut self) -> Result<[u8; 32], ReaderError> {
        let bytes = self.advance(32)?;
        Ok(bytes.try_into().unwrap())
    }

    pub fn read_bytes_64(&mut self) -> Result<[u8; 64], ReaderError> {
        let bytes = self.advance(64)?;
        Ok(bytes.try_into().unwrap())
    }

    pub fn read_hash(&mut self) -> Result<Hash, ReaderError> {
        Ok(Hash::new(self.read_bytes_32()?))
    }

    pub fn read_address(&mut self) -> Result<Address, ReaderError> {
        let bytes = self.advance(ADDRESS_SIZE)?;
        Ok(Address::new(bytes.try_into().unwrap()))
    }

    // Variable-length bytes, u32 length prefix.
    // The length is checked against the remaining input before allocating.
    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, ReaderError> {
        let len = self.read_u32()? as usize;
        if len > self.bytes.len() {
            return Err(ReaderError::NotEnoughBytes);
        }
        self.read_bytes(len)
    }

    // Short string, u8 length prefix
    pub fn read_string(&mut self) -> Result<String, ReaderError> {
        let len = self.read_u8()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes).map_err(|_| ReaderError::InvalidString)
    }
}

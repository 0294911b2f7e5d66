use crate::crypto::{Address, Hash};

// Append-only byte buffer with big-endian writes, mirror of Reader.
pub struct Writer {
    bytes: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer { bytes: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Writer {
            bytes: Vec::with_capacity(capacity),
        }
    }

    pub fn total_write(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn write_bool(&mut self, value: bool) {
        self.bytes.push(value as u8);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: &u32) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: &u64) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u128(&mut self, value: &u128) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: &i64) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn write_hash(&mut self, hash: &Hash) {
        self.bytes.extend_from_slice(hash.as_bytes());
    }

    pub fn write_address(&mut self, address: &Address) {
        self.bytes.extend_from_slice(address.as_bytes());
    }

    // Variable-length bytes, u32 length prefix
    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_u32(&(bytes.len() as u32));
        self.bytes.extend_from_slice(bytes);
    }

    // Short string, u8 length prefix
    pub fn write_string(&mut self, value: &str) {
        debug_assert!(value.len() <= u8::MAX as usize, "string too long");
        self.write_u8(value.len() as u8);
        self.bytes.extend_from_slice(value.as_bytes());
    }
}

impl Default for Writer {
    fn default() -> Self {
        Writer::new()
    }
}

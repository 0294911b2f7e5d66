use super::DposContext;
use crate::{
    crypto::{Address, Hash},
    serializer::{Reader, ReaderError, Serializer, Writer},
    time::TimestampSeconds,
};
use serde::Serialize;
use sha3::{Digest, Sha3_256};
use std::fmt::{Display, Error, Formatter};

#[derive(Serialize, Clone, Debug)]
pub struct BlockHeader {
    pub hash: Hash,
    pub parent_hash: Hash,

    // world state
    pub state_root: Hash,
    pub txs_root: Hash,
    pub events_root: Hash,
    pub dpos_context: DposContext,

    pub coinbase: Address,
    pub nonce: u64,
    // Timestamp in seconds
    pub timestamp: TimestampSeconds,
    pub chain_id: u32,

    // sign
    pub alg: u8,
    #[serde(skip)]
    pub sign: Vec<u8>,
}

impl BlockHeader {
    pub fn new(chain_id: u32, coinbase: Address, parent_hash: Hash, timestamp: TimestampSeconds) -> Self {
        BlockHeader {
            hash: Hash::zero(),
            parent_hash,
            state_root: Hash::zero(),
            txs_root: Hash::zero(),
            events_root: Hash::zero(),
            dpos_context: DposContext::default(),
            coinbase,
            nonce: 0,
            timestamp,
            chain_id,
            alg: 0,
            sign: Vec::new(),
        }
    }

    // Digest binding the DPoS sub-roots, one of the block hash inputs
    pub fn dpos_context_hash(&self) -> Hash {
        self.dpos_context.context_hash()
    }
}

// Compute the hash of a block: the header commitments, the fixed-width
// encoded scalar fields, then every transaction hash in block order.
pub fn hash_block<'a, I: IntoIterator<Item = &'a Hash>>(
    header: &BlockHeader,
    tx_hashes: I,
) -> Hash {
    let mut hasher = Sha3_256::new();

    hasher.update(header.parent_hash.as_bytes());
    hasher.update(header.state_root.as_bytes());
    hasher.update(header.txs_root.as_bytes());
    hasher.update(header.events_root.as_bytes());
    hasher.update(header.dpos_context_hash().as_bytes());
    hasher.update(header.nonce.to_be_bytes());
    hasher.update(header.coinbase.as_bytes());
    hasher.update(header.timestamp.to_be_bytes());
    hasher.update(header.chain_id.to_be_bytes());

    for tx_hash in tx_hashes {
        hasher.update(tx_hash.as_bytes());
    }

    Hash::new(hasher.finalize().into())
}

impl Serializer for BlockHeader {
    fn write(&self, writer: &mut Writer) {
        writer.write_hash(&self.hash);
        writer.write_hash(&self.parent_hash);
        writer.write_hash(&self.state_root);
        writer.write_hash(&self.txs_root);
        writer.write_hash(&self.events_root);
        self.dpos_context.write(writer);
        writer.write_address(&self.coinbase);
        writer.write_u64(&self.nonce);
        writer.write_i64(&self.timestamp);
        writer.write_u32(&self.chain_id);
        writer.write_u8(self.alg);
        writer.write_var_bytes(&self.sign);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(BlockHeader {
            hash: reader.read_hash()?,
            parent_hash: reader.read_hash()?,
            state_root: reader.read_hash()?,
            txs_root: reader.read_hash()?,
            events_root: reader.read_hash()?,
            dpos_context: DposContext::read(reader)?,
            coinbase: reader.read_address()?,
            nonce: reader.read_u64()?,
            timestamp: reader.read_i64()?,
            chain_id: reader.read_u32()?,
            alg: reader.read_u8()?,
            sign: reader.read_var_bytes()?,
        })
    }
}

impl Display for BlockHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(
            f,
            "BlockHeader[hash: {}, parent: {}, coinbase: {}, nonce: {}, timestamp: {}]",
            self.hash, self.parent_hash, self.coinbase, self.nonce, self.timestamp
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash;

    fn header() -> BlockHeader {
        BlockHeader::new(1, Address::zero(), Hash::zero(), 1_522_540_800)
    }

    #[test]
    fn test_hash_block_is_deterministic() {
        let tx_hashes = [hash(b"t1"), hash(b"t2")];
        let a = hash_block(&header(), tx_hashes.iter());
        let b = hash_block(&header(), tx_hashes.iter());
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_block_covers_tx_order() {
        let t1 = hash(b"t1");
        let t2 = hash(b"t2");
        let forward = hash_block(&header(), [&t1, &t2]);
        let reversed = hash_block(&header(), [&t2, &t1]);
        assert_ne!(forward, reversed);
    }

    #[test]
    fn test_hash_block_ignores_signature() {
        let unsigned = header();
        let mut signed = header();
        signed.alg = 1;
        signed.sign = vec![0xAB; 96];
        assert_eq!(
            hash_block(&unsigned, []),
            hash_block(&signed, []),
        );
    }

    #[test]
    fn test_header_wire_roundtrip() {
        let mut h = header();
        h.nonce = 42;
        h.sign = vec![1, 2, 3];
        let decoded = BlockHeader::from_bytes(&h.to_bytes()).unwrap();
        assert_eq!(decoded.nonce, 42);
        assert_eq!(decoded.sign, vec![1, 2, 3]);
        assert_eq!(decoded.timestamp, h.timestamp);
    }
}

use crate::{
    crypto::{hash, Hash, HASH_SIZE},
    serializer::{Reader, ReaderError, Serializer, Writer},
};
use serde::{Deserialize, Serialize};

// Merkle commitments to the DPoS world state at a block height:
// dynasty membership, the upcoming dynasty, delegations, votes,
// candidates and the per-dynasty mint tally.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DposContext {
    pub dynasty_root: Hash,
    pub next_dynasty_root: Hash,
    pub delegate_root: Hash,
    pub vote_root: Hash,
    pub candidate_root: Hash,
    pub mint_cnt_root: Hash,
}

impl DposContext {
    // Digest binding the six sub-roots together, carried in the block hash
    pub fn context_hash(&self) -> Hash {
        let mut bytes = Vec::with_capacity(6 * HASH_SIZE);
        bytes.extend_from_slice(self.dynasty_root.as_bytes());
        bytes.extend_from_slice(self.next_dynasty_root.as_bytes());
        bytes.extend_from_slice(self.delegate_root.as_bytes());
        bytes.extend_from_slice(self.vote_root.as_bytes());
        bytes.extend_from_slice(self.candidate_root.as_bytes());
        bytes.extend_from_slice(self.mint_cnt_root.as_bytes());
        hash(&bytes)
    }
}

impl Default for DposContext {
    fn default() -> Self {
        DposContext {
            dynasty_root: Hash::zero(),
            next_dynasty_root: Hash::zero(),
            delegate_root: Hash::zero(),
            vote_root: Hash::zero(),
            candidate_root: Hash::zero(),
            mint_cnt_root: Hash::zero(),
        }
    }
}

impl Serializer for DposContext {
    fn write(&self, writer: &mut Writer) {
        writer.write_hash(&self.dynasty_root);
        writer.write_hash(&self.next_dynasty_root);
        writer.write_hash(&self.delegate_root);
        writer.write_hash(&self.vote_root);
        writer.write_hash(&self.candidate_root);
        writer.write_hash(&self.mint_cnt_root);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(DposContext {
            dynasty_root: reader.read_hash()?,
            next_dynasty_root: reader.read_hash()?,
            delegate_root: reader.read_hash()?,
            vote_root: reader.read_hash()?,
            candidate_root: reader.read_hash()?,
            mint_cnt_root: reader.read_hash()?,
        })
    }

    fn size(&self) -> usize {
        6 * HASH_SIZE
    }
}

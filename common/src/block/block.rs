use super::BlockHeader;
use crate::{
    serializer::{Reader, ReaderError, Serializer, Writer},
    transaction::Transaction,
};
use serde::Serialize;
use std::fmt::{Display, Error, Formatter};

// Hard cap on transactions per decoded block, bounds allocation when
// reading untrusted bytes
pub const MAX_TXS_PER_BLOCK: u16 = 8192;

// Wire and storage form of a block: the sealed header, the ordered
// transactions and the chain height it was linked at.
#[derive(Serialize, Clone, Debug)]
pub struct Block {
    header: BlockHeader,
    transactions: Vec<Transaction>,
    height: u64,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>, height: u64) -> Self {
        Block {
            header,
            transactions,
            height,
        }
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn split(self) -> (BlockHeader, Vec<Transaction>, u64) {
        (self.header, self.transactions, self.height)
    }
}

impl Serializer for Block {
    fn write(&self, writer: &mut Writer) {
        self.header.write(writer);
        writer.write_u16(self.transactions.len() as u16);
        for tx in &self.transactions {
            tx.write(writer);
        }
        writer.write_u64(&self.height);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let header = BlockHeader::read(reader)?;
        let count = reader.read_u16()?;
        if count > MAX_TXS_PER_BLOCK {
            return Err(ReaderError::InvalidValue);
        }
        let mut transactions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            transactions.push(Transaction::read(reader)?);
        }
        let height = reader.read_u64()?;
        Ok(Block {
            header,
            transactions,
            height,
        })
    }
}

impl Display for Block {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(
            f,
            "Block[height: {}, hash: {}, parent: {}, txs: {}]",
            self.height,
            self.header.hash,
            self.header.parent_hash,
            self.transactions.len()
        )
    }
}

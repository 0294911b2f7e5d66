use neb_common::{
    account::InsufficientBalance,
    crypto::{CryptoError, Hash},
    serializer::ReaderError,
    transaction::TransactionError,
};
use thiserror::Error;

use super::{storage::StorageError, trie::TrieError};

#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Block is already sealed")]
    DoubleSealBlock,

    #[error("Block's parent hash doesn't match the parent block")]
    LinkToWrongParentBlock,

    #[error("Missing parent block")]
    MissingParentBlock,

    #[error("Block {0} not found in storage")]
    BlockNotFound(Hash),

    #[error("Invalid chain id: expected {expected}, got {got}")]
    InvalidChainId { expected: u32, got: u32 },

    #[error("Invalid block hash")]
    InvalidBlockHash,

    #[error("Invalid block state root")]
    InvalidBlockStateRoot,

    #[error("Invalid block txs root")]
    InvalidBlockTxsRoot,

    #[error("Invalid block events root")]
    InvalidBlockEventsRoot,

    #[error("Invalid block dpos context root")]
    InvalidBlockDposContextRoot,

    #[error("Duplicated transaction")]
    DuplicatedTransaction,

    #[error("Transaction nonce is too small")]
    SmallTransactionNonce,

    #[error("Transaction nonce is too large")]
    LargeTransactionNonce,

    #[error("Failed to clone account state")]
    CloneAccountState,

    #[error("Failed to clone txs state")]
    CloneTxsState,

    #[error("Failed to clone events state")]
    CloneEventsState,

    #[error("Failed to generate the next dynasty context")]
    GenerateNextDynastyContext,

    #[error("Failed to load the next dynasty context")]
    LoadNextDynastyContext,

    #[error("Invalid block signature")]
    InvalidBlockSignature,

    #[error("Block timestamp is too far in the future")]
    InvalidBlockTimestamp,

    #[error("Invalid delegatee address")]
    InvalidDelegatee,

    #[error(transparent)]
    Balance(#[from] InsufficientBalance),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Trie(#[from] TrieError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BlockchainError {
    fn from(e: serde_json::Error) -> Self {
        BlockchainError::Serialization(e.to_string())
    }
}

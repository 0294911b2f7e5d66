use super::{
    block::Block,
    error::BlockchainError,
    events,
    state::AccountState,
    trie::OverlayTrie,
};
use neb_common::{
    crypto::{Hash, Verifier},
    event::Event,
    time::get_current_time_in_seconds,
    transaction::Transaction,
};
use std::sync::Arc;

// Result of running one transaction through the contract executor
#[derive(Debug, Default)]
pub struct Receipt {
    pub output: Vec<u8>,
}

// View handed to the contract executor for one transaction. It can
// mutate account state and record events; both stay inside the block's
// open batch, so a failing transaction leaves no trace.
pub struct ExecutionContext<'a> {
    pub state: &'a mut AccountState,
    events_trie: &'a mut OverlayTrie,
    tx_hash: &'a Hash,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        state: &'a mut AccountState,
        events_trie: &'a mut OverlayTrie,
        tx_hash: &'a Hash,
    ) -> Self {
        ExecutionContext {
            state,
            events_trie,
            tx_hash,
        }
    }

    pub fn tx_hash(&self) -> &Hash {
        self.tx_hash
    }

    // Record an event against the transaction being executed
    pub fn record_event(&mut self, topic: &str, data: &str) -> Result<(), BlockchainError> {
        events::record_event(self.events_trie, self.tx_hash, &Event::new(topic, data))
    }
}

// Opaque smart-contract runtime. Deploy and call payloads are handed
// to it; everything else is handled by the engine itself.
pub trait Executor: Send + Sync {
    fn verify_execution(
        &self,
        tx: &Transaction,
        context: &mut ExecutionContext<'_>,
    ) -> Result<Receipt, BlockchainError>;
}

// Executor for nodes running without an embedded VM: deploys and calls
// are accepted as value transfers and leave no contract state behind.
pub struct NoopExecutor;

impl Executor for NoopExecutor {
    fn verify_execution(
        &self,
        _tx: &Transaction,
        _context: &mut ExecutionContext<'_>,
    ) -> Result<Receipt, BlockchainError> {
        Ok(Receipt::default())
    }
}

// Consensus policy collaborator. The engine asks it whether a block is
// acceptable; leader selection and dynasty scheduling live behind it.
pub trait Consensus: Send + Sync {
    // Cheap pre-execution acceptance: block signature and timestamp
    fn fast_verify_block(&self, block: &Block) -> Result<(), BlockchainError>;

    // Full acceptance against the parent the block links to
    fn verify_block(&self, block: &Block, parent: &Block) -> Result<(), BlockchainError>;
}

// Default DPoS policy: the block must carry a valid signature over its
// hash and a timestamp that is not from the future.
pub struct DposConsensus {
    verifier: Arc<dyn Verifier>,
    // tolerated clock drift in seconds when accepting timestamps
    timestamp_window: i64,
}

impl DposConsensus {
    pub fn new(verifier: Arc<dyn Verifier>) -> Self {
        DposConsensus {
            verifier,
            timestamp_window: 60,
        }
    }

    pub fn with_timestamp_window(verifier: Arc<dyn Verifier>, timestamp_window: i64) -> Self {
        DposConsensus {
            verifier,
            timestamp_window,
        }
    }
}

impl Consensus for DposConsensus {
    fn fast_verify_block(&self, block: &Block) -> Result<(), BlockchainError> {
        if block.timestamp() > get_current_time_in_seconds() + self.timestamp_window {
            return Err(BlockchainError::InvalidBlockTimestamp);
        }
        let signer = self
            .verifier
            .recover(block.alg(), block.hash(), block.signature())
            .map_err(|_| BlockchainError::InvalidBlockSignature)?;
        // without delegation the block is signed by its coinbase
        let expected = block.miner().unwrap_or(block.coinbase());
        if signer != *expected {
            return Err(BlockchainError::InvalidBlockSignature);
        }
        Ok(())
    }

    fn verify_block(&self, block: &Block, parent: &Block) -> Result<(), BlockchainError> {
        self.fast_verify_block(block)?;
        if block.timestamp() < parent.timestamp() {
            return Err(BlockchainError::InvalidBlockTimestamp);
        }
        Ok(())
    }
}

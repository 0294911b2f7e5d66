use super::{
    dpos::DposState,
    error::BlockchainError,
    events::{self, EventEmitter},
    executor::{Consensus, ExecutionContext, Executor},
    mempool::TransactionPool,
    state::AccountState,
    storage::Storage,
    trie::{OverlayTrie, TrieError},
};
use log::{debug, error, info, trace, warn};
use metrics::counter;
use neb_common::{
    block::{hash_block, Block as BlockData, BlockHeader},
    config::BLOCK_REWARD,
    crypto::{Address, Hash, Signer, Verifier},
    event::{Event, TOPIC_LINK_BLOCK},
    serializer::Serializer,
    time::{get_current_time_in_seconds, TimestampSeconds},
    transaction::{Payload, Transaction},
};
use serde_json::json;
use std::{
    fmt::{Display, Error as FmtError, Formatter},
    sync::Arc,
};

// Outcome of running one transaction during block construction.
// `giveback` asks the caller to return the transaction to the pool
// because it may become valid later.
#[derive(Debug)]
struct TxFailure {
    giveback: bool,
    error: BlockchainError,
}

impl TxFailure {
    fn drop(error: BlockchainError) -> Self {
        TxFailure {
            giveback: false,
            error,
        }
    }
}

impl From<BlockchainError> for TxFailure {
    fn from(error: BlockchainError) -> Self {
        TxFailure::drop(error)
    }
}

impl From<TrieError> for TxFailure {
    fn from(error: TrieError) -> Self {
        TxFailure::drop(error.into())
    }
}

// A block under construction or verification. On top of the header and
// transactions it owns private overlays of the four world-state tries,
// cloned from its parent, and shares the pool, storage, emitter and
// executor collaborators with every other block of the node.
pub struct Block {
    header: BlockHeader,
    transactions: Vec<Transaction>,

    sealed: bool,
    height: u64,
    acc_state: AccountState,
    txs_trie: OverlayTrie,
    events_trie: OverlayTrie,
    dpos_context: DposState,
    miner: Option<Address>,

    tx_pool: Arc<TransactionPool>,
    storage: Arc<dyn Storage>,
    event_emitter: Arc<EventEmitter>,
    executor: Arc<dyn Executor>,
}

impl Block {
    // The genesis block anchors a fresh chain: empty world state,
    // zero parent hash, already sealed.
    pub fn new_genesis(
        chain_id: u32,
        coinbase: Address,
        storage: Arc<dyn Storage>,
        tx_pool: Arc<TransactionPool>,
        event_emitter: Arc<EventEmitter>,
        executor: Arc<dyn Executor>,
    ) -> Result<Self, BlockchainError> {
        let mut block = Block {
            header: BlockHeader::new(chain_id, coinbase, Hash::zero(), 0),
            transactions: Vec::new(),
            sealed: false,
            height: 1,
            acc_state: AccountState::new(Arc::clone(&storage)),
            txs_trie: OverlayTrie::new(Arc::clone(&storage)),
            events_trie: OverlayTrie::new(Arc::clone(&storage)),
            dpos_context: DposState::new(Arc::clone(&storage)),
            miner: None,
            tx_pool,
            storage,
            event_emitter,
            executor,
        };
        block.header.state_root = block.acc_state.root_hash()?;
        block.header.txs_root = block.txs_trie.root_hash();
        block.header.events_root = block.events_trie.root_hash();
        block.header.dpos_context = block.dpos_context.to_context();
        block.header.hash = hash_block(&block.header, []);
        block.sealed = true;
        Ok(block)
    }

    // Create a new open block on top of a parent: clone the parent's
    // four overlays, credit the block reward, inherit the shared
    // collaborators.
    pub fn new_block(
        chain_id: u32,
        coinbase: Address,
        parent: &Block,
    ) -> Result<Self, BlockchainError> {
        let acc_state = parent
            .acc_state
            .try_clone()
            .map_err(|_| BlockchainError::CloneAccountState)?;
        let txs_trie = parent
            .txs_trie
            .try_clone()
            .map_err(|_| BlockchainError::CloneTxsState)?;
        let events_trie = parent
            .events_trie
            .try_clone()
            .map_err(|_| BlockchainError::CloneEventsState)?;
        let dpos_context = parent.dpos_context.try_clone()?;

        let mut block = Block {
            header: BlockHeader::new(
                chain_id,
                coinbase,
                parent.header.hash.clone(),
                get_current_time_in_seconds(),
            ),
            transactions: Vec::new(),
            sealed: false,
            height: parent.height + 1,
            acc_state,
            txs_trie,
            events_trie,
            dpos_context,
            miner: None,
            tx_pool: Arc::clone(&parent.tx_pool),
            storage: Arc::clone(&parent.storage),
            event_emitter: Arc::clone(&parent.event_emitter),
            executor: Arc::clone(&parent.executor),
        };

        block.begin()?;
        block.reward_coinbase()?;
        block.commit()?;

        Ok(block)
    }

    pub fn chain_id(&self) -> u32 {
        self.header.chain_id
    }

    pub fn coinbase(&self) -> &Address {
        &self.header.coinbase
    }

    pub fn alg(&self) -> u8 {
        self.header.alg
    }

    pub fn signature(&self) -> &[u8] {
        &self.header.sign
    }

    pub fn nonce(&self) -> u64 {
        self.header.nonce
    }

    // Sealed blocks are immutable; late setters degrade to a logged no-op
    pub fn set_nonce(&mut self, nonce: u64) {
        if self.sealed {
            warn!("Sealed block can't be changed: {}", self);
            return;
        }
        self.header.nonce = nonce;
    }

    pub fn timestamp(&self) -> TimestampSeconds {
        self.header.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: TimestampSeconds) {
        if self.sealed {
            warn!("Sealed block can't be changed: {}", self);
            return;
        }
        self.header.timestamp = timestamp;
    }

    pub fn hash(&self) -> &Hash {
        &self.header.hash
    }

    pub fn parent_hash(&self) -> &Hash {
        &self.header.parent_hash
    }

    pub fn state_root(&self) -> &Hash {
        &self.header.state_root
    }

    pub fn txs_root(&self) -> &Hash {
        &self.header.txs_root
    }

    pub fn events_root(&self) -> &Hash {
        &self.header.events_root
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn sealed(&self) -> bool {
        self.sealed
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn miner(&self) -> Option<&Address> {
        self.miner.as_ref()
    }

    // Read-only view of the block's account state, the reference point
    // for pool admission checks
    pub fn account_state(&self) -> &AccountState {
        &self.acc_state
    }

    pub fn set_miner(&mut self, miner: Address) {
        self.miner = Some(miner);
    }

    // The address credited in the mint-count tally: the configured
    // miner, or the coinbase when production is not delegated
    fn mint_address(&self) -> Address {
        self.miner
            .clone()
            .unwrap_or_else(|| self.header.coinbase.clone())
    }

    // Sign the sealed block hash with the miner's signer capability
    pub fn sign(&mut self, signer: &dyn Signer) -> Result<(), BlockchainError> {
        let sign = signer.sign(&self.header.hash)?;
        self.header.alg = signer.algorithm().as_u8();
        self.header.sign = sign;
        Ok(())
    }

    // Load the parent block from the content-addressed store. Blocks
    // hold no in-memory parent reference, the store is the only link.
    pub fn parent_block(&self) -> Result<Block, BlockchainError> {
        Block::load_block_from_storage(
            &self.header.parent_hash,
            Arc::clone(&self.storage),
            Arc::clone(&self.tx_pool),
            Arc::clone(&self.event_emitter),
            Arc::clone(&self.executor),
        )
        .map_err(|_| BlockchainError::MissingParentBlock)
    }

    fn begin(&mut self) -> Result<(), BlockchainError> {
        trace!("block begin");
        self.acc_state.begin_batch()?;
        self.txs_trie.begin_batch()?;
        self.events_trie.begin_batch()?;
        self.dpos_context.begin_batch()?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), BlockchainError> {
        self.acc_state.commit()?;
        self.txs_trie.commit()?;
        self.events_trie.commit()?;
        self.dpos_context.commit()?;
        trace!("block commit: {}", self);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), BlockchainError> {
        self.acc_state.rollback()?;
        self.txs_trie.rollback()?;
        self.events_trie.rollback()?;
        self.dpos_context.rollback()?;
        trace!("block rollback: {}", self);
        Ok(())
    }

    // Give all packed transactions back to the pool, used when a
    // locally built block is abandoned.
    pub fn return_transactions(&mut self) {
        for tx in self.transactions.drain(..) {
            let hash = tx.hash().clone();
            if let Err(e) = self.tx_pool.return_tx(tx) {
                error!("Failed to giveback tx {}: {}", hash, e);
            }
        }
    }

    // Fill up to n valid transactions from the pool into the block.
    // Each transaction runs inside its own batch: inclusion is atomic
    // across all four overlays.
    pub fn collect_transactions(&mut self, mut n: usize) {
        if self.sealed {
            warn!("Sealed block can't be changed: {}", self);
            return;
        }

        let pool = Arc::clone(&self.tx_pool);
        let mut givebacks = Vec::new();
        while n > 0 {
            let Some(tx) = pool.pop(&self.acc_state) else {
                break;
            };
            if let Err(e) = self.begin() {
                error!("Failed to begin tx batch: {}", e);
                givebacks.push(tx);
                break;
            }
            match self.execute_transaction(&tx) {
                Ok(()) => {
                    if let Err(e) = self.commit() {
                        error!("Failed to commit tx batch: {}", e);
                        break;
                    }
                    debug!("tx {} is packed", tx.hash());
                    self.transactions.push(tx);
                    n -= 1;
                }
                Err(failure) => {
                    if log::log_enabled!(log::Level::Warn) {
                        warn!(
                            "invalid tx {} (giveback: {}): {}",
                            tx.hash(),
                            failure.giveback,
                            failure.error
                        );
                    }
                    if let Err(e) = self.rollback() {
                        error!("Failed to rollback tx batch: {}", e);
                        break;
                    }
                    if failure.giveback {
                        givebacks.push(tx);
                    }
                }
            }
        }

        for tx in givebacks {
            let hash = tx.hash().clone();
            if let Err(e) = pool.push(tx, &self.acc_state) {
                error!("Failed to giveback tx {}: {}", hash, e);
            }
        }
    }

    // Seal the block: tally the mint count, freeze the four roots into
    // the header and compute the block hash. Sealing twice is an error.
    pub fn seal(&mut self) -> Result<(), BlockchainError> {
        if self.sealed {
            return Err(BlockchainError::DoubleSealBlock);
        }

        let miner = self.mint_address();
        self.begin()?;
        if let Err(e) = self.dpos_context.record_mint_cnt(self.header.timestamp, &miner) {
            self.rollback()?;
            return Err(e);
        }
        self.commit()?;

        self.header.state_root = self.acc_state.root_hash()?;
        self.header.txs_root = self.txs_trie.root_hash();
        self.header.events_root = self.events_trie.root_hash();
        self.header.dpos_context = self.dpos_context.to_context();
        self.header.hash = hash_block(&self.header, self.transactions.iter().map(|tx| tx.hash()));
        self.sealed = true;

        info!("Sealed block: {}", self);
        Ok(())
    }

    // Rebind a block decoded from the wire or storage to a local
    // parent: re-clone the parent's overlays and regenerate the
    // dynasty context for the elapsed time.
    pub fn link_parent_block(&mut self, parent: &Block) -> Result<(), BlockchainError> {
        if self.header.parent_hash != parent.header.hash {
            return Err(BlockchainError::LinkToWrongParentBlock);
        }

        self.acc_state = parent
            .acc_state
            .try_clone()
            .map_err(|_| BlockchainError::CloneAccountState)?;
        self.txs_trie = parent
            .txs_trie
            .try_clone()
            .map_err(|_| BlockchainError::CloneTxsState)?;
        self.events_trie = parent
            .events_trie
            .try_clone()
            .map_err(|_| BlockchainError::CloneEventsState)?;

        let elapsed = self.header.timestamp - parent.header.timestamp;
        self.dpos_context = parent
            .dpos_context
            .next_dynasty_context(elapsed)
            .map_err(|_| BlockchainError::GenerateNextDynastyContext)?;

        self.tx_pool = Arc::clone(&parent.tx_pool);
        self.storage = Arc::clone(&parent.storage);
        self.event_emitter = Arc::clone(&parent.event_emitter);
        self.executor = Arc::clone(&parent.executor);
        self.height = parent.height + 1;

        info!("Linked the parent block: {} -> {}", parent, self);
        Ok(())
    }

    // Cheap pre-execution verification: chain id, block hash, the
    // integrity of every transaction, and consensus acceptance.
    pub fn verify_integrity(
        &self,
        chain_id: u32,
        consensus: &dyn Consensus,
        verifier: &dyn Verifier,
    ) -> Result<(), BlockchainError> {
        if self.header.chain_id != chain_id {
            return Err(BlockchainError::InvalidChainId {
                expected: chain_id,
                got: self.header.chain_id,
            });
        }

        let wanted = hash_block(&self.header, self.transactions.iter().map(|tx| tx.hash()));
        if wanted != self.header.hash {
            if log::log_enabled!(log::Level::Debug) {
                debug!(
                    "invalid block hash: expected {}, got {}",
                    wanted, self.header.hash
                );
            }
            return Err(BlockchainError::InvalidBlockHash);
        }

        for tx in &self.transactions {
            tx.verify_integrity(self.header.chain_id, verifier)?;
        }

        if let Err(e) = consensus.fast_verify_block(self) {
            counter!("neb_invalid_block").increment(1);
            return Err(e);
        }

        Ok(())
    }

    // Authoritative verification: re-execute every transaction under a
    // single outer batch and compare the resulting roots against the
    // header. Any failure rolls the whole overlay back.
    pub fn verify_execution(
        &mut self,
        parent: &Block,
        consensus: &dyn Consensus,
    ) -> Result<(), BlockchainError> {
        consensus.verify_block(self, parent)?;

        self.begin()?;

        if let Err(e) = self.execute() {
            self.rollback()?;
            return Err(e);
        }
        if let Err(e) = self.verify_state() {
            self.rollback()?;
            return Err(e);
        }

        self.commit()?;

        // release all events now that the state is committed
        self.trigger_event();
        Ok(())
    }

    // Re-apply the block contents: coinbase reward, every transaction
    // in order, then the mint-count tally. Unlike collection, a failing
    // transaction aborts the whole block.
    fn execute(&mut self) -> Result<(), BlockchainError> {
        self.reward_coinbase()?;

        let transactions = std::mem::take(&mut self.transactions);
        let result: Result<(), BlockchainError> = (|| {
            for tx in &transactions {
                self.execute_transaction(tx).map_err(|failure| failure.error)?;
            }
            Ok(())
        })();
        self.transactions = transactions;
        result?;

        let miner = self.mint_address();
        self.dpos_context
            .record_mint_cnt(self.header.timestamp, &miner)?;
        Ok(())
    }

    fn verify_state(&mut self) -> Result<(), BlockchainError> {
        if self.acc_state.root_hash()? != self.header.state_root {
            return Err(BlockchainError::InvalidBlockStateRoot);
        }
        if self.txs_trie.root_hash() != self.header.txs_root {
            return Err(BlockchainError::InvalidBlockTxsRoot);
        }
        if self.events_trie.root_hash() != self.header.events_root {
            return Err(BlockchainError::InvalidBlockEventsRoot);
        }
        if self.dpos_context.root_hash() != self.header.dpos_context_hash() {
            return Err(BlockchainError::InvalidBlockDposContextRoot);
        }
        Ok(())
    }

    // Publish the block's events to in-memory subscribers. Only called
    // after commit, so subscribers never see rolled-back execution.
    fn trigger_event(&self) {
        for tx in &self.transactions {
            let topic = tx.payload().topic();
            match serde_json::to_string(tx) {
                Ok(data) => self.event_emitter.trigger(Event::new(topic, data)),
                Err(e) => warn!("Failed to serialize tx {}: {}", tx.hash(), e),
            }

            match self.fetch_events(tx.hash()) {
                Ok(tx_events) => {
                    for event in tx_events {
                        self.event_emitter.trigger(event);
                    }
                }
                Err(e) => warn!("Failed to fetch events of tx {}: {}", tx.hash(), e),
            }
        }

        let data = json!({
            "height": self.height,
            "hash": self.header.hash,
            "parentHash": self.header.parent_hash,
            "nonce": self.header.nonce,
            "timestamp": self.header.timestamp,
            "coinbase": self.header.coinbase,
        });
        self.event_emitter
            .trigger(Event::new(TOPIC_LINK_BLOCK, data.to_string()));
    }

    pub fn get_balance(&self, address: &Address) -> Result<u128, BlockchainError> {
        self.acc_state.balance_of(address)
    }

    pub fn get_nonce(&self, address: &Address) -> Result<u64, BlockchainError> {
        self.acc_state.nonce_of(address)
    }

    // Record an event against a transaction of this block, exposed to
    // the VM collaborator
    pub fn record_event(&mut self, tx_hash: &Hash, event: &Event) -> Result<(), BlockchainError> {
        events::record_event(&mut self.events_trie, tx_hash, event)
    }

    pub fn fetch_events(&self, tx_hash: &Hash) -> Result<Vec<Event>, BlockchainError> {
        events::fetch_events(&self.events_trie, tx_hash)
    }

    // Decode a transaction back out of the txs trie
    pub fn get_transaction(&self, hash: &Hash) -> Result<Transaction, BlockchainError> {
        let bytes = self
            .txs_trie
            .get(hash.as_bytes())?
            .ok_or(BlockchainError::Trie(TrieError::KeyNotFound))?;
        Ok(Transaction::from_bytes(&bytes)?)
    }

    fn reward_coinbase(&mut self) -> Result<(), BlockchainError> {
        let coinbase = self.header.coinbase.clone();
        let account = self.acc_state.get_or_create_user_account(&coinbase)?;
        account.add_balance(BLOCK_REWARD);
        if log::log_enabled!(log::Level::Debug) {
            debug!(
                "Rewarded the coinbase {}: balance {}",
                coinbase,
                account.balance()
            );
        }
        Ok(())
    }

    // Run one transaction against the open batch: duplication and
    // nonce admission, payload execution, then acceptance into the
    // txs trie.
    fn execute_transaction(&mut self, tx: &Transaction) -> Result<(), TxFailure> {
        self.check_transaction(tx)?;
        self.apply_transaction(tx).map_err(TxFailure::drop)?;
        self.accept_transaction(tx).map_err(TxFailure::drop)?;
        Ok(())
    }

    fn check_transaction(&mut self, tx: &Transaction) -> Result<(), TxFailure> {
        // check duplication: the txs trie must not hold a proof for it
        match self.txs_trie.prove(tx.hash().as_bytes()) {
            Ok(_) => {
                return Err(TxFailure::drop(BlockchainError::DuplicatedTransaction));
            }
            Err(TrieError::KeyNotFound) => {}
            Err(e) => return Err(e.into()),
        }

        // check nonce against the sender account
        let nonce = self
            .acc_state
            .nonce_of(tx.from())
            .map_err(TxFailure::drop)?;
        if tx.nonce() < nonce + 1 {
            return Err(TxFailure::drop(BlockchainError::SmallTransactionNonce));
        } else if tx.nonce() > nonce + 1 {
            return Err(TxFailure {
                giveback: true,
                error: BlockchainError::LargeTransactionNonce,
            });
        }
        Ok(())
    }

    // Value transfer plus the payload-specific semantics. Deploys and
    // calls go through the opaque executor; delegate and candidate
    // payloads mutate the DPoS tries directly.
    fn apply_transaction(&mut self, tx: &Transaction) -> Result<(), BlockchainError> {
        {
            let from = self.acc_state.get_or_create_user_account(tx.from())?;
            from.sub_balance(tx.value())?;
        }
        {
            let to = self.acc_state.get_or_create_user_account(tx.to())?;
            to.add_balance(tx.value());
        }

        match tx.payload() {
            Payload::Binary { .. } => {}
            Payload::Deploy { .. } | Payload::Call { .. } => {
                let executor = Arc::clone(&self.executor);
                let mut context = ExecutionContext::new(
                    &mut self.acc_state,
                    &mut self.events_trie,
                    tx.hash(),
                );
                executor.verify_execution(tx, &mut context)?;
            }
            Payload::Delegate { action, delegatee } => {
                let delegatee: Address = delegatee
                    .parse()
                    .map_err(|_| BlockchainError::InvalidDelegatee)?;
                self.dpos_context
                    .apply_delegate(tx.from(), &delegatee, *action)?;
            }
            Payload::Candidate { action } => {
                self.dpos_context.apply_candidate(tx.from(), *action)?;
            }
        }
        Ok(())
    }

    fn accept_transaction(&mut self, tx: &Transaction) -> Result<(), BlockchainError> {
        // record tx
        self.txs_trie.put(tx.hash().as_bytes(), &tx.to_bytes())?;
        // increment the sender nonce
        let from = self.acc_state.get_or_create_user_account(tx.from())?;
        from.incr_nonce();
        Ok(())
    }

    // Wire and storage form of this block
    pub fn to_block_data(&self) -> BlockData {
        BlockData::new(self.header.clone(), self.transactions.clone(), self.height)
    }

    // Persist the sealed block under its hash
    pub fn persist(&self) -> Result<(), BlockchainError> {
        self.storage
            .put(self.header.hash.as_bytes(), &self.to_block_data().to_bytes())?;
        Ok(())
    }

    // Rebuild a block from storage: decode the stored form and reopen
    // the four overlays at the recorded roots. Loaded blocks are sealed.
    pub fn load_block_from_storage(
        hash: &Hash,
        storage: Arc<dyn Storage>,
        tx_pool: Arc<TransactionPool>,
        event_emitter: Arc<EventEmitter>,
        executor: Arc<dyn Executor>,
    ) -> Result<Block, BlockchainError> {
        let bytes = storage
            .get(hash.as_bytes())?
            .ok_or_else(|| BlockchainError::BlockNotFound(hash.clone()))?;
        let (header, transactions, height) = BlockData::from_bytes(&bytes)?.split();

        let acc_state = AccountState::open(Arc::clone(&storage), header.state_root.clone())?;
        let txs_trie = OverlayTrie::open(Arc::clone(&storage), header.txs_root.clone())?;
        let events_trie = OverlayTrie::open(Arc::clone(&storage), header.events_root.clone())?;
        let dpos_context = DposState::open(Arc::clone(&storage), &header.dpos_context)
            .map_err(|_| BlockchainError::LoadNextDynastyContext)?;

        Ok(Block {
            header,
            transactions,
            sealed: true,
            height,
            acc_state,
            txs_trie,
            events_trie,
            dpos_context,
            miner: None,
            tx_pool,
            storage,
            event_emitter,
            executor,
        })
    }

    // Rebuild a block received from the wire. The caller still has to
    // link it to a parent before verification.
    pub fn from_block_data(
        data: BlockData,
        storage: Arc<dyn Storage>,
        tx_pool: Arc<TransactionPool>,
        event_emitter: Arc<EventEmitter>,
        executor: Arc<dyn Executor>,
    ) -> Block {
        let (header, transactions, height) = data.split();
        Block {
            header,
            transactions,
            sealed: true,
            height,
            acc_state: AccountState::new(Arc::clone(&storage)),
            txs_trie: OverlayTrie::new(Arc::clone(&storage)),
            events_trie: OverlayTrie::new(Arc::clone(&storage)),
            dpos_context: DposState::new(Arc::clone(&storage)),
            miner: None,
            tx_pool,
            storage,
            event_emitter,
            executor,
        }
    }
}

impl Display for Block {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(
            f,
            "Block[height: {}, hash: {}, parent: {}, nonce: {}, timestamp: {}, coinbase: {}, txs: {}]",
            self.height,
            self.header.hash,
            self.header.parent_hash,
            self.header.nonce,
            self.header.timestamp,
            self.header.coinbase,
            self.transactions.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        executor::{DposConsensus, NoopExecutor, Receipt},
        storage::MemoryStorage,
    };
    use neb_common::{
        crypto::{Ed25519KeyPair, Ed25519Verifier},
        event::TOPIC_CALL_CONTRACT,
    };

    struct Chain {
        storage: Arc<dyn Storage>,
        pool: Arc<TransactionPool>,
        emitter: Arc<EventEmitter>,
        executor: Arc<dyn Executor>,
    }

    impl Chain {
        fn new() -> Self {
            Chain::with_executor(Arc::new(NoopExecutor))
        }

        fn with_executor(executor: Arc<dyn Executor>) -> Self {
            Chain {
                storage: Arc::new(MemoryStorage::new()),
                pool: Arc::new(TransactionPool::new()),
                emitter: Arc::new(EventEmitter::new()),
                executor,
            }
        }

        fn genesis(&self, coinbase: Address) -> Block {
            Block::new_genesis(
                1,
                coinbase,
                Arc::clone(&self.storage),
                Arc::clone(&self.pool),
                Arc::clone(&self.emitter),
                Arc::clone(&self.executor),
            )
            .unwrap()
        }
    }

    fn transfer(keypair: &Ed25519KeyPair, to: Address, value: u128, nonce: u64) -> Transaction {
        let mut tx = Transaction::new(
            1,
            keypair.address(),
            to,
            value,
            nonce,
            1_522_540_800,
            Payload::Binary { data: vec![] },
            1,
            20_000,
        );
        tx.sign(keypair).unwrap();
        tx
    }

    #[test]
    fn test_empty_block_roundtrip_is_deterministic() {
        let chain = Chain::new();
        let coinbase = Ed25519KeyPair::generate().address();
        let genesis = chain.genesis(Address::zero());
        assert_eq!(genesis.get_balance(&coinbase).unwrap(), 0);

        let mut a = Block::new_block(1, coinbase.clone(), &genesis).unwrap();
        a.set_timestamp(5_000);
        a.seal().unwrap();

        let mut b = Block::new_block(1, coinbase.clone(), &genesis).unwrap();
        b.set_timestamp(5_000);
        b.seal().unwrap();

        // both blocks applied exactly apply_reward(R0, coinbase)
        assert_eq!(a.state_root(), b.state_root());
        assert_eq!(a.hash(), b.hash());
        // no transactions, no events: both roots stay at the empty root
        assert!(a.txs_root().is_zero());
        assert!(a.events_root().is_zero());
        assert_eq!(a.get_balance(&coinbase).unwrap(), BLOCK_REWARD);
    }

    #[test]
    fn test_seal_is_idempotent_error() {
        let chain = Chain::new();
        let genesis = chain.genesis(Address::zero());
        let mut block = Block::new_block(1, Address::zero(), &genesis).unwrap();
        block.seal().unwrap();

        let hash = block.hash().clone();
        let nonce = block.nonce();
        assert!(matches!(block.seal(), Err(BlockchainError::DoubleSealBlock)));
        assert_eq!(block.hash(), &hash);
        assert_eq!(block.nonce(), nonce);
    }

    #[test]
    fn test_sealed_block_setters_are_noops() {
        let chain = Chain::new();
        let genesis = chain.genesis(Address::zero());
        let mut block = Block::new_block(1, Address::zero(), &genesis).unwrap();
        block.set_nonce(7);
        assert_eq!(block.nonce(), 7);
        block.seal().unwrap();

        block.set_nonce(8);
        block.set_timestamp(1);
        assert_eq!(block.nonce(), 7);
        assert_ne!(block.timestamp(), 1);
    }

    #[test]
    fn test_duplicated_transaction_is_rejected() {
        let chain = Chain::new();
        let miner = Ed25519KeyPair::generate();
        let genesis = chain.genesis(miner.address());
        let mut block = Block::new_block(1, miner.address(), &genesis).unwrap();

        let tx = transfer(&miner, Address::zero(), 10, 1);
        block.begin().unwrap();
        block.execute_transaction(&tx).unwrap();
        block.commit().unwrap();
        block.transactions.push(tx.clone());
        let state_root = block.acc_state.root_hash().unwrap();

        // attempting to include the same transaction again fails and
        // leaves the block state unchanged
        block.begin().unwrap();
        let failure = block.execute_transaction(&tx).unwrap_err();
        assert!(matches!(
            failure.error,
            BlockchainError::DuplicatedTransaction
        ));
        assert!(!failure.giveback);
        block.rollback().unwrap();
        assert_eq!(block.acc_state.root_hash().unwrap(), state_root);
    }

    #[test]
    fn test_nonce_gap_giveback() {
        let chain = Chain::new();
        let sender = Ed25519KeyPair::generate();
        let genesis = chain.genesis(sender.address());
        // coinbase reward funds the sender
        let mut block = Block::new_block(1, sender.address(), &genesis).unwrap();

        // sender account is already at nonce 5
        for _ in 0..5 {
            block
                .acc_state
                .get_or_create_user_account(&sender.address())
                .unwrap()
                .incr_nonce();
        }
        block.acc_state.flush().unwrap();

        chain
            .pool
            .push(transfer(&sender, Address::zero(), 1, 6), &block.acc_state)
            .unwrap();
        chain
            .pool
            .push(transfer(&sender, Address::zero(), 1, 8), &block.acc_state)
            .unwrap();

        block.collect_transactions(5);

        let nonces: Vec<_> = block.transactions().iter().map(|tx| tx.nonce()).collect();
        assert_eq!(nonces, vec![6]);
        // nonce 8 was given back to the pool
        assert_eq!(chain.pool.len(), 1);
    }

    #[test]
    fn test_collect_orders_same_sender_by_nonce() {
        let chain = Chain::new();
        let sender = Ed25519KeyPair::generate();
        let genesis = chain.genesis(sender.address());
        let mut block = Block::new_block(1, sender.address(), &genesis).unwrap();

        chain
            .pool
            .push(transfer(&sender, Address::zero(), 1, 2), &block.acc_state)
            .unwrap();
        chain
            .pool
            .push(transfer(&sender, Address::zero(), 1, 1), &block.acc_state)
            .unwrap();

        block.collect_transactions(5);
        let nonces: Vec<_> = block.transactions().iter().map(|tx| tx.nonce()).collect();
        assert_eq!(nonces, vec![1, 2]);
        assert!(chain.pool.is_empty());
    }

    #[test]
    fn test_link_to_wrong_parent_is_rejected() {
        let chain = Chain::new();
        let g1 = chain.genesis(Address::zero());
        let g2 = chain.genesis(Address::new([9; 20]));
        assert_ne!(g1.hash(), g2.hash());

        let mut block = Block::new_block(1, Address::zero(), &g1).unwrap();
        block.seal().unwrap();
        let mut wire = Block::from_block_data(
            block.to_block_data(),
            Arc::clone(&chain.storage),
            Arc::clone(&chain.pool),
            Arc::clone(&chain.emitter),
            Arc::clone(&chain.executor),
        );
        assert!(matches!(
            wire.link_parent_block(&g2),
            Err(BlockchainError::LinkToWrongParentBlock)
        ));
        wire.link_parent_block(&g1).unwrap();
        assert_eq!(wire.height(), g1.height() + 1);
    }

    struct EventfulExecutor;

    impl Executor for EventfulExecutor {
        fn verify_execution(
            &self,
            _tx: &Transaction,
            context: &mut ExecutionContext<'_>,
        ) -> Result<Receipt, BlockchainError> {
            context.record_event(TOPIC_CALL_CONTRACT, "{\"status\":\"ok\"}")?;
            Ok(Receipt::default())
        }
    }

    #[test]
    fn test_verify_execution_roundtrip_releases_events() {
        let chain = Chain::with_executor(Arc::new(EventfulExecutor));
        let miner = Ed25519KeyPair::generate();
        let genesis = chain.genesis(miner.address());

        let mut block = Block::new_block(1, miner.address(), &genesis).unwrap();
        let mut call = Transaction::new(
            1,
            miner.address(),
            Address::new([2; 20]),
            5,
            1,
            1_522_540_800,
            Payload::Call {
                function: "save".to_string(),
                args: "[]".to_string(),
            },
            1,
            20_000,
        );
        call.sign(&miner).unwrap();
        chain.pool.push(call, &block.acc_state).unwrap();

        block.collect_transactions(5);
        assert_eq!(block.transactions().len(), 1);
        block.seal().unwrap();
        block.sign(&miner).unwrap();

        // ship it over the wire and verify on a fresh view
        let decoded = BlockData::from_bytes(&block.to_block_data().to_bytes()).unwrap();
        let mut received = Block::from_block_data(
            decoded,
            Arc::clone(&chain.storage),
            Arc::clone(&chain.pool),
            Arc::clone(&chain.emitter),
            Arc::clone(&chain.executor),
        );

        let consensus = DposConsensus::new(Arc::new(Ed25519Verifier));
        received
            .verify_integrity(1, &consensus, &Ed25519Verifier)
            .unwrap();
        received.link_parent_block(&genesis).unwrap();

        let (_id, mut events) = chain.emitter.subscribe(&[TOPIC_CALL_CONTRACT, TOPIC_LINK_BLOCK]);
        received.verify_execution(&genesis, &consensus).unwrap();

        // the tx topic event, the recorded contract event, then linkBlock
        let first = events.try_recv().unwrap();
        assert_eq!(first.topic, TOPIC_CALL_CONTRACT);
        let second = events.try_recv().unwrap();
        assert_eq!(second.data, "{\"status\":\"ok\"}");
        let third = events.try_recv().unwrap();
        assert_eq!(third.topic, TOPIC_LINK_BLOCK);

        // verified state matches the sealed commitments
        assert_eq!(received.get_balance(&Address::new([2; 20])).unwrap(), 5);
        assert_eq!(received.get_nonce(&miner.address()).unwrap(), 1);
    }

    #[test]
    fn test_verify_execution_rejects_tampered_state_root() {
        let chain = Chain::new();
        let miner = Ed25519KeyPair::generate();
        let genesis = chain.genesis(miner.address());

        let mut block = Block::new_block(1, miner.address(), &genesis).unwrap();
        block.seal().unwrap();
        block.sign(&miner).unwrap();

        let mut received = Block::from_block_data(
            block.to_block_data(),
            Arc::clone(&chain.storage),
            Arc::clone(&chain.pool),
            Arc::clone(&chain.emitter),
            Arc::clone(&chain.executor),
        );
        received.link_parent_block(&genesis).unwrap();
        // tamper with the claimed state root after linking
        received.header.state_root = Hash::max();

        let consensus = DposConsensus::new(Arc::new(Ed25519Verifier));
        assert!(matches!(
            received.verify_execution(&genesis, &consensus),
            Err(BlockchainError::InvalidBlockStateRoot)
        ));
    }

    #[test]
    fn test_verify_integrity_catches_tampering() {
        let chain = Chain::new();
        let miner = Ed25519KeyPair::generate();
        let genesis = chain.genesis(miner.address());
        let consensus = DposConsensus::new(Arc::new(Ed25519Verifier));

        let mut block = Block::new_block(1, miner.address(), &genesis).unwrap();
        block.seal().unwrap();
        block.sign(&miner).unwrap();
        block
            .verify_integrity(1, &consensus, &Ed25519Verifier)
            .unwrap();

        // wrong local chain id
        assert!(matches!(
            block.verify_integrity(2, &consensus, &Ed25519Verifier),
            Err(BlockchainError::InvalidChainId { .. })
        ));

        // mutated header no longer matches the sealed hash
        block.header.nonce += 1;
        assert!(matches!(
            block.verify_integrity(1, &consensus, &Ed25519Verifier),
            Err(BlockchainError::InvalidBlockHash)
        ));
    }

    #[test]
    fn test_persist_and_load_roundtrip() {
        let chain = Chain::new();
        let miner = Ed25519KeyPair::generate();
        let genesis = chain.genesis(miner.address());

        let mut block = Block::new_block(1, miner.address(), &genesis).unwrap();
        let tx = transfer(&miner, Address::new([3; 20]), 7, 1);
        chain.pool.push(tx.clone(), &block.acc_state).unwrap();
        block.collect_transactions(1);
        block.seal().unwrap();
        block.persist().unwrap();

        let loaded = Block::load_block_from_storage(
            block.hash(),
            Arc::clone(&chain.storage),
            Arc::clone(&chain.pool),
            Arc::clone(&chain.emitter),
            Arc::clone(&chain.executor),
        )
        .unwrap();

        assert!(loaded.sealed());
        assert_eq!(loaded.height(), block.height());
        assert_eq!(loaded.state_root(), block.state_root());
        assert_eq!(loaded.get_balance(&Address::new([3; 20])).unwrap(), 7);
        // the tx is decodable straight out of the txs trie
        let stored = loaded.get_transaction(tx.hash()).unwrap();
        assert_eq!(stored.hash(), tx.hash());

        assert!(matches!(
            Block::load_block_from_storage(
                &Hash::max(),
                Arc::clone(&chain.storage),
                Arc::clone(&chain.pool),
                Arc::clone(&chain.emitter),
                Arc::clone(&chain.executor),
            ),
            Err(BlockchainError::BlockNotFound(_))
        ));
    }

    #[test]
    fn test_return_transactions_refills_pool() {
        let chain = Chain::new();
        let sender = Ed25519KeyPair::generate();
        let genesis = chain.genesis(sender.address());
        let mut block = Block::new_block(1, sender.address(), &genesis).unwrap();

        chain
            .pool
            .push(transfer(&sender, Address::zero(), 1, 1), &block.acc_state)
            .unwrap();
        block.collect_transactions(1);
        assert!(chain.pool.is_empty());

        // abandoning the block returns its transactions to the pool
        block.return_transactions();
        assert!(block.transactions().is_empty());
        assert_eq!(chain.pool.len(), 1);
    }
}

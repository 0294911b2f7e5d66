// End-to-end lifecycle: build a chain on persistent storage, restart
// from disk, relink and re-verify the blocks.

use neb_common::{
    config::BLOCK_REWARD,
    crypto::{Address, Ed25519KeyPair, Ed25519Verifier, Signer},
    event::TOPIC_LINK_BLOCK,
    transaction::{Payload, Transaction},
};
use neb_daemon::core::{
    block::Block,
    events::EventEmitter,
    executor::{DposConsensus, NoopExecutor},
    mempool::TransactionPool,
    storage::{SledStorage, Storage},
};
use std::sync::Arc;
use tempdir::TempDir;

struct Node {
    storage: Arc<dyn Storage>,
    pool: Arc<TransactionPool>,
    emitter: Arc<EventEmitter>,
}

impl Node {
    fn open(dir: &TempDir) -> Self {
        Node {
            storage: Arc::new(SledStorage::open(dir.path()).unwrap()),
            pool: Arc::new(TransactionPool::new()),
            emitter: Arc::new(EventEmitter::new()),
        }
    }

    fn genesis(&self, coinbase: Address) -> Block {
        Block::new_genesis(
            1,
            coinbase,
            Arc::clone(&self.storage),
            Arc::clone(&self.pool),
            Arc::clone(&self.emitter),
            Arc::new(NoopExecutor),
        )
        .unwrap()
    }

    fn load(&self, hash: &neb_common::crypto::Hash) -> Block {
        Block::load_block_from_storage(
            hash,
            Arc::clone(&self.storage),
            Arc::clone(&self.pool),
            Arc::clone(&self.emitter),
            Arc::new(NoopExecutor),
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
fn test_chain_survives_restart_and_reverification() {
    let dir = TempDir::new("neb-chain").unwrap();
    let miner = Ed25519KeyPair::generate();
    let receiver = Address::new([7; 20]);

    // first run: build and persist two blocks
    let (genesis_hash, block_hash) = {
        let sled = Arc::new(SledStorage::open(dir.path()).unwrap());
        let node = Node {
            storage: Arc::clone(&sled) as Arc<dyn Storage>,
            pool: Arc::new(TransactionPool::new()),
            emitter: Arc::new(EventEmitter::new()),
        };
        let genesis = node.genesis(miner.address());
        genesis.persist().unwrap();

        let mut block = Block::new_block(1, miner.address(), &genesis).unwrap();
        node.pool
            .push(transfer(&miner, receiver.clone(), 40, 1), block.account_state())
            .unwrap();
        node.pool
            .push(transfer(&miner, receiver.clone(), 2, 2), block.account_state())
            .unwrap();
        block.collect_transactions(10);
        assert_eq!(block.transactions().len(), 2);
        block.seal().unwrap();
        block.sign(&miner).unwrap();
        block.persist().unwrap();

        assert_eq!(block.get_balance(&receiver).unwrap(), 42);
        assert_eq!(
            block.get_balance(&miner.address()).unwrap(),
            BLOCK_REWARD - 42
        );
        // make sure everything reached the disk before "restarting"
        sled.flush().unwrap();
        (genesis.hash().clone(), block.hash().clone())
    };

    // second run: reload from disk and re-verify execution
    let node = Node::open(&dir);
    let genesis = node.load(&genesis_hash);
    let mut block = node.load(&block_hash);
    assert!(block.sealed());
    assert_eq!(block.height(), 2);
    assert_eq!(block.get_balance(&receiver).unwrap(), 42);

    let consensus = DposConsensus::new(Arc::new(Ed25519Verifier));
    block
        .verify_integrity(1, &consensus, &Ed25519Verifier)
        .unwrap();

    let (_id, mut links) = node.emitter.subscribe(&[TOPIC_LINK_BLOCK]);
    block.link_parent_block(&genesis).unwrap();
    block.verify_execution(&genesis, &consensus).unwrap();

    let event = links.try_recv().unwrap();
    assert_eq!(event.topic, TOPIC_LINK_BLOCK);
    assert!(event.data.contains(&block.hash().to_hex()));
}

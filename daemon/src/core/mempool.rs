use super::{error::BlockchainError, state::AccountState};
use indexmap::IndexMap;
use log::{debug, trace};
use neb_common::{
    account::Nonce,
    crypto::{Address, Hash},
    transaction::Transaction,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

// Pending transactions waiting for block inclusion. Unbounded but
// deduplicated by hash; per sender, transactions are ordered by nonce.
// Shared between the block engine (pop on collect, push on giveback)
// and inbound peer handlers (push on broadcast).
pub struct TransactionPool {
    inner: Mutex<Inner>,
}

struct Inner {
    // every pooled tx by hash, for deduplication
    hashes: HashMap<Hash, Address>,
    // per-sender queues ordered by nonce; IndexMap keeps sender
    // insertion order stable for deterministic tie-breaks
    senders: IndexMap<Address, BTreeMap<Nonce, Pooled>>,
    // monotonic arrival counter
    seq: u64,
}

struct Pooled {
    tx: Transaction,
    seq: u64,
}

impl TransactionPool {
    pub fn new() -> Self {
        TransactionPool {
            inner: Mutex::new(Inner {
                hashes: HashMap::new(),
                senders: IndexMap::new(),
                seq: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("mempool poisoned").hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.inner
            .lock()
            .expect("mempool poisoned")
            .hashes
            .contains_key(hash)
    }

    // Admit a transaction. Duplicates are rejected, as are nonces the
    // sender account has already moved past.
    pub fn push(&self, tx: Transaction, state: &AccountState) -> Result<(), BlockchainError> {
        let expected = state.nonce_of(tx.from())? + 1;
        if tx.nonce() < expected {
            debug!("rejecting stale tx {} (nonce {})", tx.hash(), tx.nonce());
            return Err(BlockchainError::SmallTransactionNonce);
        }

        let mut inner = self.inner.lock().expect("mempool poisoned");
        if inner.hashes.contains_key(tx.hash()) {
            return Err(BlockchainError::DuplicatedTransaction);
        }

        trace!("pooling tx {}", tx.hash());
        inner.seq += 1;
        let seq = inner.seq;
        inner.hashes.insert(tx.hash().clone(), tx.from().clone());
        inner
            .senders
            .entry(tx.from().clone())
            .or_default()
            .insert(tx.nonce(), Pooled { tx, seq });
        Ok(())
    }

    // Return a previously popped transaction without the staleness
    // check: the abandoned block view that popped it has already moved
    // its sender nonce forward.
    pub fn return_tx(&self, tx: Transaction) -> Result<(), BlockchainError> {
        let mut inner = self.inner.lock().expect("mempool poisoned");
        if inner.hashes.contains_key(tx.hash()) {
            return Err(BlockchainError::DuplicatedTransaction);
        }
        inner.seq += 1;
        let seq = inner.seq;
        inner.hashes.insert(tx.hash().clone(), tx.from().clone());
        inner
            .senders
            .entry(tx.from().clone())
            .or_default()
            .insert(tx.nonce(), Pooled { tx, seq });
        Ok(())
    }

    // Remove and return the transaction whose sender-nonce is the
    // closest to its account's next expected nonce; ties go to the
    // earliest arrival.
    pub fn pop(&self, state: &AccountState) -> Option<Transaction> {
        let mut inner = self.inner.lock().expect("mempool poisoned");

        let mut best: Option<(u64, u64, Address, Nonce)> = None;
        for (sender, queue) in inner.senders.iter() {
            let Some((nonce, pooled)) = queue.iter().next() else {
                continue;
            };
            let expected = state.nonce_of(sender).ok()? + 1;
            let gap = nonce.saturating_sub(expected);
            let candidate = (gap, pooled.seq, sender.clone(), *nonce);
            match &best {
                Some((best_gap, best_seq, _, _))
                    if (gap, pooled.seq) >= (*best_gap, *best_seq) => {}
                _ => best = Some(candidate),
            }
        }

        let (_, _, sender, nonce) = best?;
        let queue = inner.senders.get_mut(&sender)?;
        let pooled = queue.remove(&nonce)?;
        if queue.is_empty() {
            inner.senders.shift_remove(&sender);
        }
        inner.hashes.remove(pooled.tx.hash());
        Some(pooled.tx)
    }
}

impl Default for TransactionPool {
    fn default() -> Self {
        TransactionPool::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::MemoryStorage;
    use neb_common::{
        crypto::{Ed25519KeyPair, Signer},
        transaction::Payload,
    };
    use std::sync::Arc;

    fn state() -> AccountState {
        AccountState::new(Arc::new(MemoryStorage::new()))
    }

    fn tx(keypair: &Ed25519KeyPair, nonce: Nonce) -> Transaction {
        let mut tx = Transaction::new(
            1,
            keypair.address(),
            Address::zero(),
            1,
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
    fn test_push_rejects_duplicates() {
        let pool = TransactionPool::new();
        let state = state();
        let keypair = Ed25519KeyPair::generate();

        pool.push(tx(&keypair, 1), &state).unwrap();
        assert!(matches!(
            pool.push(tx(&keypair, 1), &state),
            Err(BlockchainError::DuplicatedTransaction)
        ));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_push_rejects_stale_nonce() {
        let pool = TransactionPool::new();
        let mut state = state();
        let keypair = Ed25519KeyPair::generate();
        // account already at nonce 5
        for _ in 0..5 {
            state
                .get_or_create_user_account(&keypair.address())
                .unwrap()
                .incr_nonce();
        }

        assert!(matches!(
            pool.push(tx(&keypair, 5), &state),
            Err(BlockchainError::SmallTransactionNonce)
        ));
        pool.push(tx(&keypair, 6), &state).unwrap();
    }

    #[test]
    fn test_pop_prefers_next_expected_nonce() {
        let pool = TransactionPool::new();
        let state = state();
        let a = Ed25519KeyPair::generate();
        let b = Ed25519KeyPair::generate();

        // b's tx arrives first but has a nonce gap; a's tx is ready
        pool.push(tx(&b, 3), &state).unwrap();
        pool.push(tx(&a, 1), &state).unwrap();

        let first = pool.pop(&state).unwrap();
        assert_eq!(first.from(), &a.address());
        let second = pool.pop(&state).unwrap();
        assert_eq!(second.from(), &b.address());
        assert!(pool.pop(&state).is_none());
    }

    #[test]
    fn test_pop_ties_break_by_arrival() {
        let pool = TransactionPool::new();
        let state = state();
        let a = Ed25519KeyPair::generate();
        let b = Ed25519KeyPair::generate();

        pool.push(tx(&b, 1), &state).unwrap();
        pool.push(tx(&a, 1), &state).unwrap();

        assert_eq!(pool.pop(&state).unwrap().from(), &b.address());
        assert_eq!(pool.pop(&state).unwrap().from(), &a.address());
    }

    #[test]
    fn test_same_sender_pops_in_nonce_order() {
        let pool = TransactionPool::new();
        let state = state();
        let a = Ed25519KeyPair::generate();

        pool.push(tx(&a, 2), &state).unwrap();
        pool.push(tx(&a, 1), &state).unwrap();
        pool.push(tx(&a, 3), &state).unwrap();

        let nonces: Vec<_> = std::iter::from_fn(|| pool.pop(&state))
            .map(|t| t.nonce())
            .collect();
        assert_eq!(nonces, vec![1, 2, 3]);
    }
}

use super::{error::BlockchainError, storage::Storage, trie::OverlayTrie};
use log::debug;
use neb_common::{
    block::DposContext,
    config::DYNASTY_INTERVAL,
    crypto::{Address, Hash},
    time::TimestampSeconds,
    transaction::{CandidateAction, DelegateAction},
};
use std::sync::Arc;

// Runtime view of the DPoS world state: six overlay tries whose roots
// are committed into the block header. Dynasty scheduling itself lives
// at the consensus layer; this core keeps the tries, the mint-count
// tally and the payload-driven mutations deterministic.
pub struct DposState {
    dynasty: OverlayTrie,
    next_dynasty: OverlayTrie,
    delegate: OverlayTrie,
    vote: OverlayTrie,
    candidate: OverlayTrie,
    mint_cnt: OverlayTrie,
}

impl DposState {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        DposState {
            dynasty: OverlayTrie::new(Arc::clone(&storage)),
            next_dynasty: OverlayTrie::new(Arc::clone(&storage)),
            delegate: OverlayTrie::new(Arc::clone(&storage)),
            vote: OverlayTrie::new(Arc::clone(&storage)),
            candidate: OverlayTrie::new(Arc::clone(&storage)),
            mint_cnt: OverlayTrie::new(storage),
        }
    }

    // Reopen the six tries at the roots recorded in a block header
    pub fn open(storage: Arc<dyn Storage>, context: &DposContext) -> Result<Self, BlockchainError> {
        Ok(DposState {
            dynasty: OverlayTrie::open(Arc::clone(&storage), context.dynasty_root.clone())?,
            next_dynasty: OverlayTrie::open(
                Arc::clone(&storage),
                context.next_dynasty_root.clone(),
            )?,
            delegate: OverlayTrie::open(Arc::clone(&storage), context.delegate_root.clone())?,
            vote: OverlayTrie::open(Arc::clone(&storage), context.vote_root.clone())?,
            candidate: OverlayTrie::open(Arc::clone(&storage), context.candidate_root.clone())?,
            mint_cnt: OverlayTrie::open(storage, context.mint_cnt_root.clone())?,
        })
    }

    pub fn try_clone(&self) -> Result<Self, BlockchainError> {
        Ok(DposState {
            dynasty: self.dynasty.try_clone()?,
            next_dynasty: self.next_dynasty.try_clone()?,
            delegate: self.delegate.try_clone()?,
            vote: self.vote.try_clone()?,
            candidate: self.candidate.try_clone()?,
            mint_cnt: self.mint_cnt.try_clone()?,
        })
    }

    // Serialise the current roots into the wire context
    pub fn to_context(&self) -> DposContext {
        DposContext {
            dynasty_root: self.dynasty.root_hash(),
            next_dynasty_root: self.next_dynasty.root_hash(),
            delegate_root: self.delegate.root_hash(),
            vote_root: self.vote.root_hash(),
            candidate_root: self.candidate.root_hash(),
            mint_cnt_root: self.mint_cnt.root_hash(),
        }
    }

    // Digest over the six roots, compared against the header commitment
    pub fn root_hash(&self) -> Hash {
        self.to_context().context_hash()
    }

    pub fn begin_batch(&mut self) -> Result<(), BlockchainError> {
        self.dynasty.begin_batch()?;
        self.next_dynasty.begin_batch()?;
        self.delegate.begin_batch()?;
        self.vote.begin_batch()?;
        self.candidate.begin_batch()?;
        self.mint_cnt.begin_batch()?;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), BlockchainError> {
        self.dynasty.commit()?;
        self.next_dynasty.commit()?;
        self.delegate.commit()?;
        self.vote.commit()?;
        self.candidate.commit()?;
        self.mint_cnt.commit()?;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<(), BlockchainError> {
        self.dynasty.rollback()?;
        self.next_dynasty.rollback()?;
        self.delegate.rollback()?;
        self.vote.rollback()?;
        self.candidate.rollback()?;
        self.mint_cnt.rollback()?;
        Ok(())
    }

    // Generate the context a child block linked after `elapsed` seconds
    // starts from. Crossing a dynasty window promotes the next dynasty;
    // electing the following one is the consensus layer's job.
    pub fn next_dynasty_context(&self, elapsed: TimestampSeconds) -> Result<Self, BlockchainError> {
        let mut context = self
            .try_clone()
            .map_err(|_| BlockchainError::GenerateNextDynastyContext)?;
        if elapsed >= DYNASTY_INTERVAL {
            debug!("dynasty window elapsed ({}s), promoting next dynasty", elapsed);
            context.dynasty = context
                .next_dynasty
                .try_clone()
                .map_err(|_| BlockchainError::GenerateNextDynastyContext)?;
        }
        Ok(context)
    }

    // Tally one block minted by `miner` inside its dynasty window.
    // Key schema: be_i64(timestamp / DYNASTY_INTERVAL) || miner bytes.
    pub fn record_mint_cnt(
        &mut self,
        timestamp: TimestampSeconds,
        miner: &Address,
    ) -> Result<i64, BlockchainError> {
        let dynasty = timestamp / DYNASTY_INTERVAL;
        let mut key = dynasty.to_be_bytes().to_vec();
        key.extend_from_slice(miner.as_bytes());

        let mut cnt: i64 = match self.mint_cnt.get(&key)? {
            Some(bytes) => i64::from_be_bytes(
                bytes
                    .try_into()
                    .map_err(|_| BlockchainError::Serialization("corrupted mint count".into()))?,
            ),
            None => 0,
        };
        cnt += 1;
        self.mint_cnt.put(&key, &cnt.to_be_bytes())?;
        debug!("recorded mint by {} in dynasty {}: {}", miner, dynasty, cnt);
        Ok(cnt)
    }

    pub fn mint_cnt(
        &self,
        timestamp: TimestampSeconds,
        miner: &Address,
    ) -> Result<i64, BlockchainError> {
        let mut key = (timestamp / DYNASTY_INTERVAL).to_be_bytes().to_vec();
        key.extend_from_slice(miner.as_bytes());
        Ok(match self.mint_cnt.get(&key)? {
            Some(bytes) => i64::from_be_bytes(
                bytes
                    .try_into()
                    .map_err(|_| BlockchainError::Serialization("corrupted mint count".into()))?,
            ),
            None => 0,
        })
    }

    // Apply a delegate payload: the vote trie maps delegator to
    // delegatee, the delegate trie indexes (delegatee, delegator) pairs.
    pub fn apply_delegate(
        &mut self,
        from: &Address,
        delegatee: &Address,
        action: DelegateAction,
    ) -> Result<(), BlockchainError> {
        let mut pair = delegatee.as_bytes().to_vec();
        pair.extend_from_slice(from.as_bytes());
        match action {
            DelegateAction::Delegate => {
                self.vote.put(from.as_bytes(), delegatee.as_bytes())?;
                self.delegate.put(&pair, &[1])?;
            }
            DelegateAction::Undelegate => {
                self.vote.put(from.as_bytes(), &[])?;
                self.delegate.put(&pair, &[0])?;
            }
        }
        Ok(())
    }

    // Apply a candidate payload
    pub fn apply_candidate(
        &mut self,
        from: &Address,
        action: CandidateAction,
    ) -> Result<(), BlockchainError> {
        let flag = match action {
            CandidateAction::Register => 1u8,
            CandidateAction::Withdraw => 0u8,
        };
        self.candidate.put(from.as_bytes(), &[flag])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::MemoryStorage;

    fn dpos() -> DposState {
        DposState::new(Arc::new(MemoryStorage::new()))
    }

    fn addr(byte: u8) -> Address {
        Address::new([byte; 20])
    }

    #[test]
    fn test_mint_cnt_increments_per_window() {
        let mut d = dpos();
        let miner = addr(1);
        assert_eq!(d.record_mint_cnt(10, &miner).unwrap(), 1);
        assert_eq!(d.record_mint_cnt(20, &miner).unwrap(), 2);
        // next dynasty window starts a fresh tally
        assert_eq!(d.record_mint_cnt(DYNASTY_INTERVAL + 5, &miner).unwrap(), 1);
        assert_eq!(d.mint_cnt(15, &miner).unwrap(), 2);
    }

    #[test]
    fn test_context_hash_tracks_mutations() {
        let mut d = dpos();
        let before = d.root_hash();
        d.apply_candidate(&addr(2), CandidateAction::Register).unwrap();
        assert_ne!(d.root_hash(), before);
    }

    #[test]
    fn test_next_dynasty_promotion() {
        let mut d = dpos();
        d.next_dynasty.put(b"delegate-slot", b"n1").unwrap();
        let promoted = d.next_dynasty_context(DYNASTY_INTERVAL).unwrap();
        assert_eq!(
            promoted.dynasty.root_hash(),
            d.next_dynasty.root_hash()
        );

        let unchanged = d.next_dynasty_context(1).unwrap();
        assert_eq!(unchanged.dynasty.root_hash(), d.dynasty.root_hash());
    }

    #[test]
    fn test_delegate_updates_vote_and_delegate_tries() {
        let mut d = dpos();
        d.apply_delegate(&addr(1), &addr(2), DelegateAction::Delegate)
            .unwrap();
        assert_eq!(
            d.vote.get(addr(1).as_bytes()).unwrap(),
            Some(addr(2).as_bytes().to_vec())
        );

        d.apply_delegate(&addr(1), &addr(2), DelegateAction::Undelegate)
            .unwrap();
        assert_eq!(d.vote.get(addr(1).as_bytes()).unwrap(), Some(vec![]));
    }
}

use super::{
    error::BlockchainError,
    storage::Storage,
    trie::{OverlayTrie, TrieError},
};
use neb_common::{
    account::{Account, Nonce},
    crypto::{Address, Hash},
    serializer::Serializer,
};
use std::{collections::HashMap, sync::Arc};

// Materialised view over the state trie. Accounts read through
// get_or_create_user_account are cached and may be mutated in place;
// flush writes every loaded account back into the trie. The block
// engine guarantees a flush before any root hash is read.
pub struct AccountState {
    trie: OverlayTrie,
    dirty: HashMap<Address, Account>,
}

impl AccountState {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        AccountState {
            trie: OverlayTrie::new(storage),
            dirty: HashMap::new(),
        }
    }

    // Reopen the state at a known root
    pub fn open(storage: Arc<dyn Storage>, root: Hash) -> Result<Self, BlockchainError> {
        Ok(AccountState {
            trie: OverlayTrie::open(storage, root)?,
            dirty: HashMap::new(),
        })
    }

    // Independent overlay at the same root. Only valid on a quiescent
    // state: no open batch, no unflushed accounts.
    pub fn try_clone(&self) -> Result<Self, BlockchainError> {
        if !self.dirty.is_empty() {
            return Err(BlockchainError::CloneAccountState);
        }
        Ok(AccountState {
            trie: self
                .trie
                .try_clone()
                .map_err(|_| BlockchainError::CloneAccountState)?,
            dirty: HashMap::new(),
        })
    }

    // Mutable handle on the account, created empty when unknown
    pub fn get_or_create_user_account(
        &mut self,
        address: &Address,
    ) -> Result<&mut Account, BlockchainError> {
        if !self.dirty.contains_key(address) {
            let account = match self.trie.get(address.as_bytes())? {
                Some(bytes) => Account::from_bytes(&bytes)?,
                None => Account::default(),
            };
            self.dirty.insert(address.clone(), account);
        }
        Ok(self.dirty.get_mut(address).expect("account just inserted"))
    }

    // Read-only balance lookup bypassing the dirty cache miss path
    pub fn balance_of(&self, address: &Address) -> Result<u128, BlockchainError> {
        if let Some(account) = self.dirty.get(address) {
            return Ok(account.balance());
        }
        Ok(match self.trie.get(address.as_bytes())? {
            Some(bytes) => Account::from_bytes(&bytes)?.balance(),
            None => 0,
        })
    }

    // Read-only nonce lookup
    pub fn nonce_of(&self, address: &Address) -> Result<Nonce, BlockchainError> {
        if let Some(account) = self.dirty.get(address) {
            return Ok(account.nonce());
        }
        Ok(match self.trie.get(address.as_bytes())? {
            Some(bytes) => Account::from_bytes(&bytes)?.nonce(),
            None => 0,
        })
    }

    // Write every loaded account back into the trie
    pub fn flush(&mut self) -> Result<(), BlockchainError> {
        let mut accounts: Vec<_> = self.dirty.drain().collect();
        // deterministic write order
        accounts.sort_by(|(a, _), (b, _)| a.cmp(b));
        for (address, account) in accounts {
            self.trie.put(address.as_bytes(), &account.to_bytes())?;
        }
        Ok(())
    }

    pub fn root_hash(&mut self) -> Result<Hash, BlockchainError> {
        self.flush()?;
        Ok(self.trie.root_hash())
    }

    // Mutations made before the batch belong to the pre-batch state:
    // flush them first so rollback cannot discard them.
    pub fn begin_batch(&mut self) -> Result<(), BlockchainError> {
        self.flush()?;
        self.trie.begin_batch()?;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), BlockchainError> {
        self.flush()?;
        self.trie.commit()?;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<(), TrieError> {
        self.dirty.clear();
        self.trie.rollback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::MemoryStorage;

    fn state() -> AccountState {
        AccountState::new(Arc::new(MemoryStorage::new()))
    }

    fn addr(byte: u8) -> Address {
        Address::new([byte; 20])
    }

    #[test]
    fn test_unknown_account_is_empty() {
        let mut s = state();
        assert_eq!(s.balance_of(&addr(1)).unwrap(), 0);
        let account = s.get_or_create_user_account(&addr(1)).unwrap();
        assert_eq!(account.balance(), 0);
        assert_eq!(account.nonce(), 0);
    }

    #[test]
    fn test_mutations_survive_flush() {
        let mut s = state();
        {
            let account = s.get_or_create_user_account(&addr(1)).unwrap();
            account.add_balance(100);
            account.incr_nonce();
        }
        let root = s.root_hash().unwrap();
        assert!(!root.is_zero());
        assert_eq!(s.balance_of(&addr(1)).unwrap(), 100);
        assert_eq!(s.nonce_of(&addr(1)).unwrap(), 1);
    }

    #[test]
    fn test_root_is_deterministic_across_views() {
        let storage: Arc<MemoryStorage> = Arc::new(MemoryStorage::new());
        let mut a = AccountState::new(storage.clone());
        let mut b = AccountState::new(storage);

        for s in [&mut a, &mut b] {
            for byte in [3u8, 1, 2] {
                let account = s.get_or_create_user_account(&addr(byte)).unwrap();
                account.add_balance(byte as u128 * 10);
            }
        }
        assert_eq!(a.root_hash().unwrap(), b.root_hash().unwrap());
    }

    #[test]
    fn test_rollback_discards_dirty_accounts() {
        let mut s = state();
        s.get_or_create_user_account(&addr(1))
            .unwrap()
            .add_balance(50);
        let base = s.root_hash().unwrap();

        s.begin_batch().unwrap();
        s.get_or_create_user_account(&addr(9))
            .unwrap()
            .add_balance(1);
        s.rollback().unwrap();

        assert_eq!(s.root_hash().unwrap(), base);
        assert_eq!(s.balance_of(&addr(9)).unwrap(), 0);
        // committed data is still visible
        assert_eq!(s.balance_of(&addr(1)).unwrap(), 50);
    }
}

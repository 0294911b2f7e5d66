use crate::serializer::{Reader, ReaderError, Serializer, Writer};
use serde::{Deserialize, Serialize};

// Nonce of an account, incremented once per accepted transaction
pub type Nonce = u64;

// Persisted account record, stored in the state trie keyed by address
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Account {
    balance: u128,
    nonce: Nonce,
}

impl Account {
    pub fn new(balance: u128, nonce: Nonce) -> Self {
        Account { balance, nonce }
    }

    pub fn balance(&self) -> u128 {
        self.balance
    }

    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    // Credit the account, saturating at the maximum representable value
    pub fn add_balance(&mut self, amount: u128) {
        self.balance = self.balance.saturating_add(amount);
    }

    // Debit the account, error carries the missing context
    pub fn sub_balance(&mut self, amount: u128) -> Result<(), InsufficientBalance> {
        match self.balance.checked_sub(amount) {
            Some(balance) => {
                self.balance = balance;
                Ok(())
            }
            None => Err(InsufficientBalance {
                need: amount,
                have: self.balance,
            }),
        }
    }

    pub fn incr_nonce(&mut self) {
        self.nonce += 1;
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Insufficient balance: need {need}, have {have}")]
pub struct InsufficientBalance {
    pub need: u128,
    pub have: u128,
}

impl Serializer for Account {
    fn write(&self, writer: &mut Writer) {
        writer.write_u128(&self.balance);
        writer.write_u64(&self.nonce);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let balance = reader.read_u128()?;
        let nonce = reader.read_u64()?;
        Ok(Account { balance, nonce })
    }

    fn size(&self) -> usize {
        16 + 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sub_balance_checked() {
        let mut account = Account::new(100, 0);
        account.sub_balance(40).unwrap();
        assert_eq!(account.balance(), 60);

        let err = account.sub_balance(61).unwrap_err();
        assert_eq!(err.need, 61);
        assert_eq!(err.have, 60);
        // failed debit leaves the balance untouched
        assert_eq!(account.balance(), 60);
    }
}

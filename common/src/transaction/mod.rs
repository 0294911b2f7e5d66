mod payload;

pub use payload::{CandidateAction, DelegateAction, Payload};

use crate::{
    account::Nonce,
    crypto::{hash, Address, CryptoError, Hash, Signer, Verifier},
    serializer::{Reader, ReaderError, Serializer, Writer},
    time::TimestampSeconds,
};
use log::debug;
use serde::Serialize;
use std::fmt::{Display, Error, Formatter};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Invalid chain id: expected {expected}, got {got}")]
    InvalidChainId { expected: u32, got: u32 },

    #[error("Invalid transaction hash")]
    InvalidHash,

    #[error("Invalid transaction signer")]
    InvalidSigner,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

// Transaction to be sent over the network
#[derive(Serialize, Clone, Debug)]
pub struct Transaction {
    hash: Hash,
    from: Address,
    to: Address,
    value: u128,
    /// nonce must be equal to the one on chain account plus one,
    /// used to prevent replay attacks and have ordered transactions
    nonce: Nonce,
    timestamp: TimestampSeconds,
    payload: Payload,
    gas_price: u128,
    gas_limit: u128,
    /// Chain ID for cross-network replay protection
    chain_id: u32,
    // sign
    alg: u8,
    #[serde(with = "sign_hex")]
    sign: Vec<u8>,
}

impl Transaction {
    pub fn new(
        chain_id: u32,
        from: Address,
        to: Address,
        value: u128,
        nonce: Nonce,
        timestamp: TimestampSeconds,
        payload: Payload,
        gas_price: u128,
        gas_limit: u128,
    ) -> Self {
        let mut tx = Transaction {
            hash: Hash::zero(),
            from,
            to,
            value,
            nonce,
            timestamp,
            payload,
            gas_price,
            gas_limit,
            chain_id,
            alg: 0,
            sign: Vec::new(),
        };
        tx.hash = tx.compute_hash();
        tx
    }

    // Digest covering every field that identifies the transaction.
    // The signature is over this digest and is not part of it.
    fn compute_hash(&self) -> Hash {
        let mut writer = Writer::new();
        writer.write_address(&self.from);
        writer.write_address(&self.to);
        writer.write_u128(&self.value);
        writer.write_u64(&self.nonce);
        writer.write_i64(&self.timestamp);
        self.payload.write(&mut writer);
        writer.write_u128(&self.gas_price);
        writer.write_u128(&self.gas_limit);
        writer.write_u32(&self.chain_id);
        hash(&writer.bytes())
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn from(&self) -> &Address {
        &self.from
    }

    pub fn to(&self) -> &Address {
        &self.to
    }

    pub fn value(&self) -> u128 {
        self.value
    }

    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    pub fn timestamp(&self) -> TimestampSeconds {
        self.timestamp
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn gas_price(&self) -> u128 {
        self.gas_price
    }

    pub fn gas_limit(&self) -> u128 {
        self.gas_limit
    }

    pub fn chain_id(&self) -> u32 {
        self.chain_id
    }

    pub fn alg(&self) -> u8 {
        self.alg
    }

    pub fn sign_bytes(&self) -> &[u8] {
        &self.sign
    }

    // Sign the transaction digest with the given signer capability.
    // The signer must own the sender address.
    pub fn sign(&mut self, signer: &dyn Signer) -> Result<(), TransactionError> {
        if signer.address() != self.from {
            return Err(TransactionError::InvalidSigner);
        }
        self.alg = signer.algorithm().as_u8();
        self.sign = signer.sign(&self.hash)?;
        Ok(())
    }

    // Verify the transaction is internally consistent: right chain,
    // untampered digest, signature recovering to the sender.
    pub fn verify_integrity(
        &self,
        chain_id: u32,
        verifier: &dyn Verifier,
    ) -> Result<(), TransactionError> {
        if self.chain_id != chain_id {
            return Err(TransactionError::InvalidChainId {
                expected: chain_id,
                got: self.chain_id,
            });
        }

        if self.compute_hash() != self.hash {
            return Err(TransactionError::InvalidHash);
        }

        let signer = verifier.recover(self.alg, &self.hash, &self.sign)?;
        if signer != self.from {
            debug!("tx {} signed by {}, expected {}", self.hash, signer, self.from);
            return Err(TransactionError::InvalidSigner);
        }
        Ok(())
    }
}

impl Serializer for Transaction {
    fn write(&self, writer: &mut Writer) {
        writer.write_hash(&self.hash);
        writer.write_address(&self.from);
        writer.write_address(&self.to);
        writer.write_u128(&self.value);
        writer.write_u64(&self.nonce);
        writer.write_i64(&self.timestamp);
        self.payload.write(writer);
        writer.write_u128(&self.gas_price);
        writer.write_u128(&self.gas_limit);
        writer.write_u32(&self.chain_id);
        writer.write_u8(self.alg);
        writer.write_var_bytes(&self.sign);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Transaction {
            hash: reader.read_hash()?,
            from: reader.read_address()?,
            to: reader.read_address()?,
            value: reader.read_u128()?,
            nonce: reader.read_u64()?,
            timestamp: reader.read_i64()?,
            payload: Payload::read(reader)?,
            gas_price: reader.read_u128()?,
            gas_limit: reader.read_u128()?,
            chain_id: reader.read_u32()?,
            alg: reader.read_u8()?,
            sign: reader.read_var_bytes()?,
        })
    }
}

impl Display for Transaction {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(
            f,
            "Transaction[hash: {}, from: {}, to: {}, value: {}, nonce: {}, topic: {}]",
            self.hash,
            self.from,
            self.to,
            self.value,
            self.nonce,
            self.payload.topic()
        )
    }
}

mod sign_hex {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Ed25519KeyPair, Ed25519Verifier, Signer};

    fn signed_tx(keypair: &Ed25519KeyPair, chain_id: u32, nonce: Nonce) -> Transaction {
        let mut tx = Transaction::new(
            chain_id,
            keypair.address(),
            Address::zero(),
            10,
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
    fn test_verify_integrity_accepts_signed_tx() {
        let keypair = Ed25519KeyPair::generate();
        let tx = signed_tx(&keypair, 1, 1);
        tx.verify_integrity(1, &Ed25519Verifier).unwrap();
    }

    #[test]
    fn test_verify_integrity_rejects_wrong_chain() {
        let keypair = Ed25519KeyPair::generate();
        let tx = signed_tx(&keypair, 1, 1);
        assert!(matches!(
            tx.verify_integrity(2, &Ed25519Verifier),
            Err(TransactionError::InvalidChainId { .. })
        ));
    }

    #[test]
    fn test_verify_integrity_rejects_foreign_signature() {
        let keypair = Ed25519KeyPair::generate();
        let other = Ed25519KeyPair::generate();
        let mut tx = signed_tx(&keypair, 1, 1);
        // re-sign the same digest with a key that does not own `from`
        tx.alg = other.algorithm().as_u8();
        tx.sign = other.sign(tx.hash()).unwrap();
        assert!(matches!(
            tx.verify_integrity(1, &Ed25519Verifier),
            Err(TransactionError::InvalidSigner)
        ));
    }

    #[test]
    fn test_wire_roundtrip_preserves_hash() {
        let keypair = Ed25519KeyPair::generate();
        let tx = signed_tx(&keypair, 1, 3);
        let decoded = Transaction::from_bytes(&tx.to_bytes()).unwrap();
        assert_eq!(decoded.hash(), tx.hash());
        decoded.verify_integrity(1, &Ed25519Verifier).unwrap();
    }
}

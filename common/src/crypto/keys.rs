use ed25519_dalek::{Signature, Signer as DalekSigner, SigningKey, Verifier as DalekVerifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

use super::{Address, Hash};

pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;
pub const ED25519_SIGNATURE_SIZE: usize = 64;

// An ed25519 signature blob embeds the public key so the signer
// address can be recovered from the blob alone.
const ED25519_BLOB_SIZE: usize = ED25519_PUBLIC_KEY_SIZE + ED25519_SIGNATURE_SIZE;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(u8),

    #[error("Invalid signature length: expected {expected}, got {got}")]
    InvalidSignatureLength { expected: usize, got: usize },

    #[error("Failed to parse public key")]
    InvalidPublicKey,

    #[error("Signature verification failed")]
    VerificationFailed,
}

// Signature algorithm tag carried in block and transaction headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Ed25519,
}

impl Algorithm {
    pub fn as_u8(self) -> u8 {
        match self {
            Algorithm::Ed25519 => 1,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, CryptoError> {
        match value {
            1 => Ok(Algorithm::Ed25519),
            other => Err(CryptoError::UnsupportedAlgorithm(other)),
        }
    }
}

// Capability object able to sign digests on behalf of one address
pub trait Signer: Send + Sync {
    fn algorithm(&self) -> Algorithm;

    fn address(&self) -> Address;

    fn sign(&self, digest: &Hash) -> Result<Vec<u8>, CryptoError>;
}

// Capability object able to check a signature blob and recover the
// signer address from it
pub trait Verifier: Send + Sync {
    fn recover(&self, alg: u8, digest: &Hash, sign: &[u8]) -> Result<Address, CryptoError>;
}

pub struct Ed25519KeyPair {
    signing_key: SigningKey,
    address: Address,
}

impl Ed25519KeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing_key)
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(bytes))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = Address::from_public_key(signing_key.verifying_key().as_bytes());
        Ed25519KeyPair {
            signing_key,
            address,
        }
    }

    pub fn public_key(&self) -> [u8; ED25519_PUBLIC_KEY_SIZE] {
        self.signing_key.verifying_key().to_bytes()
    }
}

impl Signer for Ed25519KeyPair {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Ed25519
    }

    fn address(&self) -> Address {
        self.address.clone()
    }

    fn sign(&self, digest: &Hash) -> Result<Vec<u8>, CryptoError> {
        let signature = self.signing_key.sign(digest.as_bytes());
        let mut blob = Vec::with_capacity(ED25519_BLOB_SIZE);
        blob.extend_from_slice(self.signing_key.verifying_key().as_bytes());
        blob.extend_from_slice(&signature.to_bytes());
        Ok(blob)
    }
}

// Default verifier covering the ed25519 algorithm tag
pub struct Ed25519Verifier;

impl Verifier for Ed25519Verifier {
    fn recover(&self, alg: u8, digest: &Hash, sign: &[u8]) -> Result<Address, CryptoError> {
        match Algorithm::from_u8(alg)? {
            Algorithm::Ed25519 => {
                if sign.len() != ED25519_BLOB_SIZE {
                    return Err(CryptoError::InvalidSignatureLength {
                        expected: ED25519_BLOB_SIZE,
                        got: sign.len(),
                    });
                }
                let (public_bytes, signature_bytes) = sign.split_at(ED25519_PUBLIC_KEY_SIZE);
                let public_key: [u8; ED25519_PUBLIC_KEY_SIZE] =
                    public_bytes.try_into().unwrap();
                let verifying_key = VerifyingKey::from_bytes(&public_key)
                    .map_err(|_| CryptoError::InvalidPublicKey)?;
                let signature = Signature::from_slice(signature_bytes)
                    .map_err(|_| CryptoError::VerificationFailed)?;
                verifying_key
                    .verify(digest.as_bytes(), &signature)
                    .map_err(|_| CryptoError::VerificationFailed)?;
                Ok(Address::from_public_key(&public_key))
            }
        }
    }
}

mod address;
mod hash;
mod keys;

pub use address::{Address, ADDRESS_SIZE};
pub use hash::{hash, Hash, Hashable, HASH_SIZE};
pub use keys::{Algorithm, CryptoError, Ed25519KeyPair, Ed25519Verifier, Signer, Verifier};

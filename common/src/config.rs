use crate::crypto::HASH_SIZE;

// Version reported during the wire handshake
// Peers running a different client version are rejected
pub const CLIENT_VERSION: &str = "0.2.0";

// Protocol identifier used for stream negotiation
pub const PROTOCOL_ID: &str = "/neb/1.0.0";

// Length of a block hash in bytes
pub const BLOCK_HASH_LENGTH: usize = HASH_SIZE;

// Reward credited to the coinbase of every block
// rule: 3% per year on a 10^8 supply, 1 block per 5 seconds
// value: 10^8 * 3% / (365*24*3600/5) * 10^18 ~= 48 * 10^16
pub const BLOCK_REWARD: u128 = 48 * 10u128.pow(16);

// Width of the dynasty window used to group mint counts,
// in seconds. The consensus layer configures the effective value;
// the mint-count key schema divides the block timestamp by it.
pub const DYNASTY_INTERVAL: i64 = 3600;

// 8 decimals numbers
pub const COIN_DECIMALS: u8 = 18;
// 10^18 to represent 1 coin
pub const COIN_VALUE: u128 = 10u128.pow(COIN_DECIMALS as u32);

const _: () = assert!(
    BLOCK_REWARD < COIN_VALUE,
    "block reward must stay below one full coin"
);
const _: () = assert!(DYNASTY_INTERVAL > 0, "dynasty interval must be positive");

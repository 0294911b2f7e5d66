// Node-level constants for the wire protocol and the p2p session layer.

// The protocol magic number, identifies a neb frame on the wire
pub const MAGIC_NUMBER: [u8; 4] = [0x4E, 0x45, 0x42, 0x31];

// Version byte carried at offset 11 of every frame header
pub const NET_VERSION: u8 = 0;

// Fixed frame header: magic(4) + chain id(4) + reserved(3) + version(1)
// + message name(12) + data length(4) + data checksum(4) + header checksum(4)
pub const FRAME_HEADER_SIZE: usize = 36;

// Message name field width, NUL-padded ASCII
pub const MESSAGE_NAME_SIZE: usize = 12;

// Reserved bytes at offsets 8..11, emitted as zero and ignored on parse
pub const FRAME_RESERVED: [u8; 3] = [0, 0, 0];

// Hard cap on a frame payload, bounds allocation from untrusted peers
pub const MAX_FRAME_DATA_SIZE: u32 = 16 * 1024 * 1024;

// Handshake and control message names
pub const MSG_HELLO: &str = "hello";
pub const MSG_OK: &str = "ok";
pub const MSG_BYE: &str = "bye";
pub const MSG_SYNC_ROUTE: &str = "syncroute";
pub const MSG_SYNC_ROUTE_REPLY: &str = "resyncroute";
pub const MSG_NEW_HASH: &str = "newhashmsg";
pub const MSG_NETWORK_ID: &str = "networkid";
pub const MSG_NETWORK_ID_REPLY: &str = "renetworkid";

// Maximum number of streams kept in the stream cache; the maintenance
// tick evicts the oldest entries above this size
pub const STREAM_STORE_SIZE: usize = 200;

// Maintenance tick period for stream cache eviction and address cleanup
pub const STREAM_STORE_TICK_SECS: u64 = 30;

// How many peer records a syncroute reply may carry
pub const MAX_SYNC_NODES: usize = 16;

// Entries kept in the relay deduplication cache (payload checksum ->
// peers that already forwarded it)
pub const RELAY_CACHE_SIZE: usize = 1024;

// Entries kept in the per-peer network id cache
pub const NETWORK_ID_CACHE_SIZE: usize = 1024;

// Per-read deadline on a peer stream; must exceed a handshake round-trip
pub const STREAM_READ_TIMEOUT_SECS: u64 = 60;

// Bound of the per-stream outbound queue before senders are backpressured
pub const STREAM_WRITE_CHANNEL_SIZE: usize = 256;

// Address TTLs in the peer store
pub const PERMANENT_ADDR_TTL_SECS: i64 = i64::MAX;
pub const PROVIDER_ADDR_TTL_SECS: i64 = 10 * 60;

const _: () = assert!(
    MESSAGE_NAME_SIZE + 24 == FRAME_HEADER_SIZE,
    "frame layout drifted"
);

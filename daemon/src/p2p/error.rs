use super::peer::PeerId;
use neb_common::serializer::ReaderError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum P2pError {
    #[error("Invalid magic number")]
    InvalidMagicNumber,

    #[error("Invalid chain id: expected {expected}, got {got}")]
    InvalidChainId { expected: u32, got: u32 },

    #[error("Invalid protocol version: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },

    #[error("Header checksum mismatch")]
    InvalidHeaderChecksum,

    #[error("Data checksum mismatch")]
    InvalidDataChecksum,

    #[error("Invalid message name")]
    InvalidMessageName,

    #[error("Frame data too large: {0} bytes")]
    FrameTooLarge(u32),

    #[error("No open stream to peer {0}")]
    StreamNotFound(PeerId),

    #[error("Peer {0} is not in the same network")]
    NotInSameNetwork(PeerId),

    #[error("Peer {0} has no known address")]
    NoKnownAddress(PeerId),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Read timed out")]
    ReadTimeout,

    #[error("Failed to queue outbound bytes: {0}")]
    SendError(String),

    #[error("Invalid boot node entry: {0}")]
    InvalidBootNode(String),

    #[error("Could not reach any boot node")]
    BootstrapFailed,

    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

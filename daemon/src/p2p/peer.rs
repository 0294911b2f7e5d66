use super::error::P2pError;
use crate::config::STREAM_WRITE_CHANNEL_SIZE;
use bytes::Bytes;
use std::{
    fmt::{Display, Error, Formatter},
    net::SocketAddr,
    sync::{
        atomic::{AtomicI8, Ordering},
        RwLock,
    },
};
use tokio::sync::{broadcast, mpsc};

// Peers are identified by their textual node id
pub type PeerId = String;

pub type Tx = mpsc::Sender<Bytes>;
pub type Rx = mpsc::Receiver<Bytes>;

// Per-stream session state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    // not connected
    Nc,
    // handshaking, hello sent or received
    Handshaking,
    // handshake complete
    Ok,
}

impl StreamState {
    fn to_i8(self) -> i8 {
        match self {
            StreamState::Nc => -1,
            StreamState::Handshaking => 0,
            StreamState::Ok => 1,
        }
    }

    fn from_i8(value: i8) -> StreamState {
        match value {
            0 => StreamState::Handshaking,
            1 => StreamState::Ok,
            _ => StreamState::Nc,
        }
    }
}

// One open stream to a remote peer. The read loop lives in the net
// service; writes are serialised through the channel consumed by a
// dedicated writer task, so there is exactly one writer per stream.
pub struct PeerStream {
    // remote id: the dialed id for outbound streams, the claimed
    // hello id for inbound ones
    id: RwLock<Option<PeerId>>,
    addr: SocketAddr,
    outbound: bool,
    state: AtomicI8,
    // priority in the stream cache, assigned at insertion
    cache_seq: u64,
    tx: Tx,
    exit: broadcast::Sender<()>,
}

impl PeerStream {
    pub fn new(
        id: Option<PeerId>,
        addr: SocketAddr,
        outbound: bool,
        cache_seq: u64,
    ) -> (Self, Rx) {
        let (tx, rx) = mpsc::channel(STREAM_WRITE_CHANNEL_SIZE);
        let (exit, _) = broadcast::channel(1);
        (
            PeerStream {
                id: RwLock::new(id),
                addr,
                outbound,
                state: AtomicI8::new(StreamState::Nc.to_i8()),
                cache_seq,
                tx,
                exit,
            },
            rx,
        )
    }

    pub fn id(&self) -> Option<PeerId> {
        self.id.read().expect("peer id poisoned").clone()
    }

    pub fn set_id(&self, id: PeerId) {
        *self.id.write().expect("peer id poisoned") = Some(id);
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_out(&self) -> bool {
        self.outbound
    }

    pub fn cache_seq(&self) -> u64 {
        self.cache_seq
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_i8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: StreamState) {
        self.state.store(state.to_i8(), Ordering::SeqCst);
    }

    // Queue framed bytes for the writer task
    pub async fn send_bytes(&self, bytes: Bytes) -> Result<(), P2pError> {
        self.tx
            .send(bytes)
            .await
            .map_err(|e| P2pError::SendError(e.to_string()))
    }

    pub fn get_exit_receiver(&self) -> broadcast::Receiver<()> {
        self.exit.subscribe()
    }

    // Tell the writer task (and anyone else listening) to shut down
    pub fn signal_exit(&self) {
        let _ = self.exit.send(());
    }
}

impl Display for PeerStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(
            f,
            "PeerStream[id: {}, addr: {}, out: {}, state: {:?}]",
            self.id().unwrap_or_else(|| "?".to_string()),
            self.addr,
            self.outbound,
            self.state()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let (stream, _rx) = PeerStream::new(None, "127.0.0.1:0".parse().unwrap(), false, 1);
        assert_eq!(stream.state(), StreamState::Nc);
        stream.set_state(StreamState::Handshaking);
        assert_eq!(stream.state(), StreamState::Handshaking);
        stream.set_state(StreamState::Ok);
        assert_eq!(stream.state(), StreamState::Ok);
    }

    #[test]
    fn test_inbound_stream_adopts_claimed_id() {
        let (stream, _rx) = PeerStream::new(None, "127.0.0.1:0".parse().unwrap(), false, 1);
        assert!(stream.id().is_none());
        stream.set_id("QmRemote".to_string());
        assert_eq!(stream.id().as_deref(), Some("QmRemote"));
    }
}

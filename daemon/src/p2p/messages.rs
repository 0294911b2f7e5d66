use neb_common::serializer::{Reader, ReaderError, Serializer, Writer};

// Handshake payload: the sender's claimed identity and client version.
// Carried by both `hello` and `ok` frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloMessage {
    pub node_id: String,
    pub client_version: String,
}

impl HelloMessage {
    pub fn new(node_id: impl Into<String>, client_version: impl Into<String>) -> Self {
        HelloMessage {
            node_id: node_id.into(),
            client_version: client_version.into(),
        }
    }
}

impl Serializer for HelloMessage {
    fn write(&self, writer: &mut Writer) {
        writer.write_string(&self.node_id);
        writer.write_string(&self.client_version);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(HelloMessage {
            node_id: reader.read_string()?,
            client_version: reader.read_string()?,
        })
    }
}

// One routing record: a peer id and its dial addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfoMessage {
    pub id: String,
    pub addrs: Vec<String>,
}

impl PeerInfoMessage {
    pub fn new(id: impl Into<String>, addrs: Vec<String>) -> Self {
        PeerInfoMessage {
            id: id.into(),
            addrs,
        }
    }
}

impl Serializer for PeerInfoMessage {
    fn write(&self, writer: &mut Writer) {
        writer.write_string(&self.id);
        writer.write_u8(self.addrs.len() as u8);
        for addr in &self.addrs {
            writer.write_string(addr);
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let id = reader.read_string()?;
        let count = reader.read_u8()?;
        let mut addrs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            addrs.push(reader.read_string()?);
        }
        Ok(PeerInfoMessage { id, addrs })
    }
}

// Payload of a `resyncroute` frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeersMessage {
    pub peers: Vec<PeerInfoMessage>,
}

impl PeersMessage {
    pub fn new(peers: Vec<PeerInfoMessage>) -> Self {
        PeersMessage { peers }
    }
}

impl Serializer for PeersMessage {
    fn write(&self, writer: &mut Writer) {
        writer.write_u16(self.peers.len() as u16);
        for peer in &self.peers {
            peer.write(writer);
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let count = reader.read_u16()?;
        let mut peers = Vec::with_capacity(count.min(256) as usize);
        for _ in 0..count {
            peers.push(PeerInfoMessage::read(reader)?);
        }
        Ok(PeersMessage { peers })
    }
}

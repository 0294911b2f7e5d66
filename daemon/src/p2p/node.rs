use super::{error::P2pError, peer::PeerId};
use crate::config::{MAX_SYNC_NODES, STREAM_STORE_SIZE};
use neb_common::{
    config::CLIENT_VERSION,
    crypto::hash,
    time::get_current_time_in_seconds,
};
use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    str::FromStr,
    sync::Mutex,
};

// A trusted entry point into the network: "id@host:port"
#[derive(Debug, Clone)]
pub struct BootNode {
    pub id: PeerId,
    pub addr: SocketAddr,
}

impl FromStr for BootNode {
    type Err = P2pError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, addr) = s
            .split_once('@')
            .ok_or_else(|| P2pError::InvalidBootNode(s.to_string()))?;
        if id.is_empty() {
            return Err(P2pError::InvalidBootNode(s.to_string()));
        }
        let addr = addr
            .parse()
            .map_err(|_| P2pError::InvalidBootNode(s.to_string()))?;
        Ok(BootNode {
            id: id.to_string(),
            addr,
        })
    }
}

// Static configuration of the p2p node
#[derive(Debug, Clone)]
pub struct P2pConfig {
    pub chain_id: u32,
    // network membership mask; peers must share at least one bit
    pub network_id: u32,
    pub version: u8,
    pub client_version: String,
    pub node_id: PeerId,
    pub listen: SocketAddr,
    pub boot_nodes: Vec<BootNode>,
    pub max_sync_nodes: usize,
    pub stream_store_size: usize,
}

impl P2pConfig {
    pub fn new(chain_id: u32, network_id: u32, node_id: PeerId, listen: SocketAddr) -> Self {
        P2pConfig {
            chain_id,
            network_id,
            version: crate::config::NET_VERSION,
            client_version: CLIENT_VERSION.to_string(),
            node_id,
            listen,
            boot_nodes: Vec::new(),
            max_sync_nodes: MAX_SYNC_NODES,
            stream_store_size: STREAM_STORE_SIZE,
        }
    }
}

// Address book collaborator: peer id to dial addresses with TTLs.
// A TTL of zero clears the entry.
pub trait PeerStore: Send + Sync {
    fn add_addr(&self, id: &PeerId, addr: SocketAddr, ttl_secs: i64);

    fn addrs(&self, id: &PeerId) -> Vec<SocketAddr>;

    fn clear_addrs(&self, id: &PeerId);

    fn peers(&self) -> Vec<PeerId>;
}

#[derive(Default)]
pub struct MemoryPeerStore {
    // addr -> expiry timestamp in seconds
    inner: Mutex<HashMap<PeerId, HashMap<SocketAddr, i64>>>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PeerStore for MemoryPeerStore {
    fn add_addr(&self, id: &PeerId, addr: SocketAddr, ttl_secs: i64) {
        let mut inner = self.inner.lock().expect("peer store poisoned");
        if ttl_secs <= 0 {
            if let Some(addrs) = inner.get_mut(id) {
                addrs.remove(&addr);
            }
            return;
        }
        let expiry = get_current_time_in_seconds().saturating_add(ttl_secs);
        inner.entry(id.clone()).or_default().insert(addr, expiry);
    }

    fn addrs(&self, id: &PeerId) -> Vec<SocketAddr> {
        let now = get_current_time_in_seconds();
        let mut inner = self.inner.lock().expect("peer store poisoned");
        match inner.get_mut(id) {
            Some(addrs) => {
                addrs.retain(|_, expiry| *expiry > now);
                addrs.keys().copied().collect()
            }
            None => Vec::new(),
        }
    }

    fn clear_addrs(&self, id: &PeerId) {
        let mut inner = self.inner.lock().expect("peer store poisoned");
        inner.remove(id);
    }

    fn peers(&self) -> Vec<PeerId> {
        let inner = self.inner.lock().expect("peer store poisoned");
        inner.keys().cloned().collect()
    }
}

// Routing collaborator: tracks known peers and answers nearest-peer
// queries for route synchronisation.
pub trait RouteTable: Send + Sync {
    fn update(&self, id: &PeerId);

    fn remove(&self, id: &PeerId);

    fn find(&self, id: &PeerId) -> bool;

    fn nearest(&self, target: &PeerId, n: usize) -> Vec<PeerId>;
}

#[derive(Default)]
pub struct MemoryRouteTable {
    peers: Mutex<HashSet<PeerId>>,
}

impl MemoryRouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().expect("route table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// XOR distance over the id digests, kbucket-style
fn distance(a: &PeerId, b: &PeerId) -> [u8; 32] {
    let ha = hash(a.as_bytes());
    let hb = hash(b.as_bytes());
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = ha.as_bytes()[i] ^ hb.as_bytes()[i];
    }
    out
}

impl RouteTable for MemoryRouteTable {
    fn update(&self, id: &PeerId) {
        self.peers
            .lock()
            .expect("route table poisoned")
            .insert(id.clone());
    }

    fn remove(&self, id: &PeerId) {
        self.peers.lock().expect("route table poisoned").remove(id);
    }

    fn find(&self, id: &PeerId) -> bool {
        self.peers.lock().expect("route table poisoned").contains(id)
    }

    fn nearest(&self, target: &PeerId, n: usize) -> Vec<PeerId> {
        let peers = self.peers.lock().expect("route table poisoned");
        let mut sorted: Vec<_> = peers.iter().cloned().collect();
        sorted.sort_by_key(|id| distance(id, target));
        sorted.truncate(n);
        sorted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_node_parsing() {
        let boot: BootNode = "QmSeed@127.0.0.1:7000".parse().unwrap();
        assert_eq!(boot.id, "QmSeed");
        assert_eq!(boot.addr.port(), 7000);

        assert!("127.0.0.1:7000".parse::<BootNode>().is_err());
        assert!("@127.0.0.1:7000".parse::<BootNode>().is_err());
        assert!("QmSeed@nonsense".parse::<BootNode>().is_err());
    }

    #[test]
    fn test_peer_store_ttl_zero_clears() {
        let store = MemoryPeerStore::new();
        let id = "peer".to_string();
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();

        store.add_addr(&id, addr, 600);
        assert_eq!(store.addrs(&id), vec![addr]);

        store.add_addr(&id, addr, 0);
        assert!(store.addrs(&id).is_empty());
    }

    #[test]
    fn test_route_table_nearest_is_bounded_and_stable() {
        let table = MemoryRouteTable::new();
        for i in 0..10 {
            table.update(&format!("peer-{i}"));
        }
        let target = "peer-0".to_string();
        let nearest = table.nearest(&target, 3);
        assert_eq!(nearest.len(), 3);
        // querying twice yields the same ordering
        assert_eq!(nearest, table.nearest(&target, 3));
        // the target itself is at distance zero
        assert_eq!(nearest[0], target);
    }
}

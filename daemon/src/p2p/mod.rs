pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod messages;
pub mod node;
pub mod peer;

pub use dispatcher::{Dispatcher, Message, MessageReceiver};
pub use error::P2pError;
pub use frame::{build_frame, read_frame, Frame};
pub use messages::{HelloMessage, PeerInfoMessage, PeersMessage};
pub use node::{BootNode, MemoryPeerStore, MemoryRouteTable, P2pConfig, PeerStore, RouteTable};
pub use peer::{PeerId, PeerStream, StreamState};

use crate::config::{
    MSG_BYE, MSG_HELLO, MSG_NETWORK_ID, MSG_NETWORK_ID_REPLY, MSG_NEW_HASH, MSG_OK,
    MSG_SYNC_ROUTE, MSG_SYNC_ROUTE_REPLY, NETWORK_ID_CACHE_SIZE, PERMANENT_ADDR_TTL_SECS,
    PROVIDER_ADDR_TTL_SECS, RELAY_CACHE_SIZE, STREAM_READ_TIMEOUT_SECS, STREAM_STORE_TICK_SECS,
};
use bytes::Bytes;
use log::{debug, error, info, warn};
use lru::LruCache;
use metrics::counter;
use neb_common::serializer::Serializer;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    net::SocketAddr,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex, RwLock as StdRwLock,
    },
    time::Duration,
};
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    select,
    sync::{broadcast, mpsc, RwLock},
    time::{interval, timeout},
};

// Compile-time validation that cache sizes are non-zero
const _: () = assert!(RELAY_CACHE_SIZE > 0, "RELAY_CACHE_SIZE must be non-zero");
const _: () = assert!(
    NETWORK_ID_CACHE_SIZE > 0,
    "NETWORK_ID_CACHE_SIZE must be non-zero"
);

// The p2p service of the node: owns the listener, one read loop and
// one writer task per peer stream, the handshake state machine, the
// relay deduplication cache and the periodic stream maintenance.
pub struct NetService {
    config: P2pConfig,
    // streams that completed the handshake, keyed by peer id
    streams: RwLock<HashMap<PeerId, Arc<PeerStream>>>,
    // streams ordered by insertion, evicted oldest-first
    stream_cache: StdMutex<BTreeSet<(u64, PeerId)>>,
    // payload checksum -> peers that already forwarded it
    relayness: StdMutex<LruCache<u32, Vec<PeerId>>>,
    // network membership mask reported by each peer
    network_ids: StdMutex<LruCache<PeerId, u32>>,
    peer_store: Arc<dyn PeerStore>,
    route_table: Arc<dyn RouteTable>,
    dispatcher: Arc<Dispatcher>,
    boot_ids: StdRwLock<HashSet<PeerId>>,
    listen_addr: StdMutex<Option<SocketAddr>>,
    stream_seq: AtomicU64,
    quit: broadcast::Sender<()>,
}

impl NetService {
    pub fn new(
        config: P2pConfig,
        peer_store: Arc<dyn PeerStore>,
        route_table: Arc<dyn RouteTable>,
    ) -> Arc<Self> {
        let (quit, _) = broadcast::channel(1);
        Arc::new(NetService {
            config,
            streams: RwLock::new(HashMap::new()),
            stream_cache: StdMutex::new(BTreeSet::new()),
            // SAFETY: compile-time assertions above guarantee the sizes are non-zero
            relayness: StdMutex::new(LruCache::new(unsafe {
                NonZeroUsize::new_unchecked(RELAY_CACHE_SIZE)
            })),
            network_ids: StdMutex::new(LruCache::new(unsafe {
                NonZeroUsize::new_unchecked(NETWORK_ID_CACHE_SIZE)
            })),
            peer_store,
            route_table,
            dispatcher: Arc::new(Dispatcher::new()),
            boot_ids: StdRwLock::new(HashSet::new()),
            listen_addr: StdMutex::new(None),
            stream_seq: AtomicU64::new(0),
            quit,
        })
    }

    pub fn config(&self) -> &P2pConfig {
        &self.config
    }

    pub fn node_id(&self) -> &PeerId {
        &self.config.node_id
    }

    // Actual bound address, available after start
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock().expect("listen addr poisoned")
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.streams.read().await.keys().cloned().collect()
    }

    pub async fn peer_state(&self, pid: &PeerId) -> Option<StreamState> {
        self.streams.read().await.get(pid).map(|s| s.state())
    }

    pub fn network_id_of(&self, pid: &PeerId) -> Option<u32> {
        self.network_ids
            .lock()
            .expect("network id cache poisoned")
            .get(pid)
            .copied()
    }

    // Register subscribers for application-level message names
    pub fn register(&self, topics: &[&str]) -> (u64, MessageReceiver) {
        self.dispatcher.register(topics)
    }

    pub fn deregister(&self, id: u64) {
        self.dispatcher.deregister(id);
    }

    pub fn put_message(&self, message: Message) {
        self.dispatcher.put_message(message);
    }

    // Start the service: bind, accept, greet boot nodes, begin the
    // maintenance tick. Fails if no configured boot node answered.
    pub async fn start(self: &Arc<Self>) -> Result<(), P2pError> {
        let listener = TcpListener::bind(self.config.listen).await?;
        let local_addr = listener.local_addr()?;
        *self.listen_addr.lock().expect("listen addr poisoned") = Some(local_addr);
        info!(
            "node {} listening for connections on {}",
            self.config.node_id, local_addr
        );

        self.dispatcher.start(self.quit.subscribe());

        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut quit = service.quit.subscribe();
            loop {
                select! {
                    _ = quit.recv() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((socket, addr)) => {
                            debug!("inbound stream from {}", addr);
                            service.spawn_stream_tasks(socket, addr, None, false);
                        }
                        Err(e) => warn!("accept failed: {}", e),
                    }
                }
            }
        });

        let mut success = false;
        let boot_nodes = self.config.boot_nodes.clone();
        for boot in &boot_nodes {
            match self.say_hello(boot).await {
                Ok(()) => success = true,
                Err(e) => error!("can not say hello to trusted node {}: {}", boot.id, e),
            }
        }
        if !success && !boot_nodes.is_empty() {
            return Err(P2pError::BootstrapFailed);
        }

        let service = Arc::clone(self);
        tokio::spawn(async move { service.manage_stream_store().await });

        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.quit.send(());
    }

    // Greet a trusted node: provider TTL first, promoted to permanent
    // once the hello went out.
    pub async fn say_hello(self: &Arc<Self>, boot: &BootNode) -> Result<(), P2pError> {
        self.boot_ids
            .write()
            .expect("boot ids poisoned")
            .insert(boot.id.clone());
        if boot.id == self.config.node_id {
            return Ok(());
        }
        self.peer_store
            .add_addr(&boot.id, boot.addr, PROVIDER_ADDR_TTL_SECS);
        self.hello(&boot.id).await?;
        self.peer_store
            .add_addr(&boot.id, boot.addr, PERMANENT_ADDR_TTL_SECS);
        self.route_table.update(&boot.id);
        Ok(())
    }

    // Dial a peer from its stored addresses and open the handshake
    pub async fn hello(self: &Arc<Self>, pid: &PeerId) -> Result<(), P2pError> {
        let addrs = self.peer_store.addrs(pid);
        let addr = addrs
            .first()
            .copied()
            .ok_or_else(|| P2pError::NoKnownAddress(pid.clone()))?;
        let socket = TcpStream::connect(addr).await?;
        let stream = self.spawn_stream_tasks(socket, addr, Some(pid.clone()), true);

        // enter the handshake before the hello leaves, the reply can
        // arrive arbitrarily fast
        stream.set_state(StreamState::Handshaking);
        let hello = HelloMessage::new(
            self.config.node_id.clone(),
            self.config.client_version.clone(),
        );
        self.send_frame(&stream, MSG_HELLO, &hello.to_bytes())
            .await?;
        Ok(())
    }

    // Ask a peer for its nearest routing records
    pub async fn sync_routes(&self, pid: &PeerId) {
        if self.peer_store.addrs(pid).is_empty() {
            error!("sync routes: peer {} has no address", pid);
            self.clear_peer_store(pid);
            return;
        }
        if let Err(e) = self.send_msg(MSG_SYNC_ROUTE, &[], pid).await {
            error!("sync routes to {} failed: {}", pid, e);
            self.clear_peer_store(pid);
        }
    }

    // Send an application or control message to an established peer.
    // Everything except the network id exchange is gated on a shared
    // network membership bit.
    pub async fn send_msg(&self, name: &str, data: &[u8], target: &PeerId) -> Result<(), P2pError> {
        if name != MSG_NETWORK_ID && !self.check_network_id(target) {
            warn!(
                "can not send {}, target node {} is not in the same network",
                name, target
            );
            return Err(P2pError::NotInSameNetwork(target.clone()));
        }
        let stream = self
            .streams
            .read()
            .await
            .get(target)
            .cloned()
            .ok_or_else(|| P2pError::StreamNotFound(target.clone()))?;
        self.send_frame(&stream, name, data).await
    }

    // Relay a payload to every established peer that has not already
    // forwarded it to us. Returns how many peers were reached.
    pub async fn broadcast(&self, name: &str, data: &[u8]) -> usize {
        let checksum = crc32fast::hash(data);
        let skip: Vec<PeerId> = self
            .relayness
            .lock()
            .expect("relayness poisoned")
            .get(&checksum)
            .cloned()
            .unwrap_or_default();

        let streams: Vec<(PeerId, Arc<PeerStream>)> = self
            .streams
            .read()
            .await
            .iter()
            .map(|(pid, stream)| (pid.clone(), Arc::clone(stream)))
            .collect();

        let mut sent = 0;
        for (pid, stream) in streams {
            if stream.state() != StreamState::Ok || skip.contains(&pid) {
                continue;
            }
            if !self.check_network_id(&pid) {
                continue;
            }
            if self.send_frame(&stream, name, data).await.is_ok() {
                sent += 1;
            }
        }
        sent
    }

    fn check_network_id(&self, target: &PeerId) -> bool {
        match self.network_id_of(target) {
            Some(target_network_id) => self.config.network_id & target_network_id > 0,
            None => false,
        }
    }

    async fn send_frame(
        &self,
        stream: &PeerStream,
        name: &str,
        data: &[u8],
    ) -> Result<(), P2pError> {
        let bytes = build_frame(self.config.chain_id, self.config.version, name, data)?;
        stream.send_bytes(bytes).await?;
        counter!("neb_packet_out").increment(1);
        Ok(())
    }

    // Split the socket, spawn the writer task and the read loop
    fn spawn_stream_tasks(
        self: &Arc<Self>,
        socket: TcpStream,
        addr: SocketAddr,
        id: Option<PeerId>,
        outbound: bool,
    ) -> Arc<PeerStream> {
        let (read_half, write_half) = socket.into_split();
        let seq = self.stream_seq.fetch_add(1, Ordering::SeqCst);
        let (stream, rx) = PeerStream::new(id, addr, outbound, seq);
        let stream = Arc::new(stream);

        spawn_writer(Arc::clone(&stream), write_half, rx);

        let service = Arc::clone(self);
        let reader_stream = Arc::clone(&stream);
        tokio::spawn(async move { service.handle_stream(read_half, reader_stream).await });

        stream
    }

    // Per-stream read loop: parse frames, drive the session FSM,
    // route payloads to the dispatcher. Any failure says bye.
    async fn handle_stream(self: Arc<Self>, mut read_half: OwnedReadHalf, stream: Arc<PeerStream>) {
        let mut quit = self.quit.subscribe();
        loop {
            let frame = select! {
                _ = quit.recv() => {
                    stream.signal_exit();
                    return;
                }
                result = timeout(
                    Duration::from_secs(STREAM_READ_TIMEOUT_SECS),
                    read_frame(&mut read_half, self.config.chain_id, self.config.version),
                ) => match result {
                    Ok(Ok(frame)) => frame,
                    Ok(Err(e)) => {
                        debug!("parse protocol from {} failed: {}", stream, e);
                        self.bye(&stream).await;
                        return;
                    }
                    Err(_) => {
                        debug!("read from {} timed out", stream);
                        self.bye(&stream).await;
                        return;
                    }
                }
            };

            let accepted = match frame.name.as_str() {
                MSG_HELLO => self.handle_hello(&frame.data, &stream).await,
                MSG_OK => self.handle_ok(&frame.data, &stream).await,
                MSG_BYE => false,
                MSG_SYNC_ROUTE => self.handle_sync_route(&stream).await,
                MSG_SYNC_ROUTE_REPLY => self.handle_sync_route_reply(&frame.data).await,
                MSG_NEW_HASH => self.handle_new_hash(&frame.data, &stream),
                MSG_NETWORK_ID => self.handle_network_id(&frame.data, &stream, true).await,
                MSG_NETWORK_ID_REPLY => self.handle_network_id(&frame.data, &stream, false).await,
                _ => self.handle_data(&frame, &stream).await,
            };

            if !accepted {
                self.bye(&stream).await;
                return;
            }
        }
    }

    // Inbound HELLO: adopt (or check) the claimed identity, reply OK
    // and immediately announce our network id.
    async fn handle_hello(&self, data: &[u8], stream: &Arc<PeerStream>) -> bool {
        let Ok(hello) = HelloMessage::from_bytes(data) else {
            warn!("handle hello msg occurs error: bad payload");
            return false;
        };
        info!(
            "receive hello message from {} ({})",
            hello.node_id, hello.client_version
        );

        if let Some(expected) = stream.id() {
            if expected != hello.node_id {
                warn!(
                    "hello identity mismatch: expected {}, got {}",
                    expected, hello.node_id
                );
                return false;
            }
        }
        if hello.client_version != self.config.client_version {
            warn!("client version mismatch: {}", hello.client_version);
            return false;
        }
        stream.set_id(hello.node_id.clone());

        let ok = HelloMessage::new(
            self.config.node_id.clone(),
            self.config.client_version.clone(),
        );
        if self.send_frame(stream, MSG_OK, &ok.to_bytes()).await.is_err() {
            return false;
        }
        let network_id = self.config.network_id.to_be_bytes();
        if self
            .send_frame(stream, MSG_NETWORK_ID, &network_id)
            .await
            .is_err()
        {
            return false;
        }

        self.peer_store
            .add_addr(&hello.node_id, stream.addr(), PERMANENT_ADDR_TTL_SECS);
        stream.set_state(StreamState::Ok);
        self.store_stream(&hello.node_id, stream).await;
        self.route_table.update(&hello.node_id);
        true
    }

    // OK is only meaningful while we are handshaking on an outbound
    // stream, and only from the identity we dialed.
    async fn handle_ok(&self, data: &[u8], stream: &Arc<PeerStream>) -> bool {
        if stream.state() != StreamState::Handshaking {
            warn!("ok received on {} outside of handshake", stream);
            return false;
        }
        let Ok(ok) = HelloMessage::from_bytes(data) else {
            warn!("handle ok msg occurs error: bad payload");
            return false;
        };
        let Some(expected) = stream.id() else {
            return false;
        };
        if ok.node_id != expected || ok.client_version != self.config.client_version {
            warn!("handle ok msg got incorrect response");
            return false;
        }

        self.peer_store
            .add_addr(&expected, stream.addr(), PERMANENT_ADDR_TTL_SECS);
        stream.set_state(StreamState::Ok);
        self.store_stream(&expected, stream).await;
        self.route_table.update(&expected);
        true
    }

    // Cache the peer's network id; a non-reply deserves our id back
    async fn handle_network_id(
        &self,
        data: &[u8],
        stream: &Arc<PeerStream>,
        should_reply: bool,
    ) -> bool {
        let Some(pid) = stream.id() else {
            return false;
        };
        let Ok(bytes) = <[u8; 4]>::try_from(data) else {
            return false;
        };
        let network_id = u32::from_be_bytes(bytes);
        self.network_ids
            .lock()
            .expect("network id cache poisoned")
            .put(pid, network_id);

        if should_reply {
            let reply = self.config.network_id.to_be_bytes();
            if self
                .send_frame(stream, MSG_NETWORK_ID_REPLY, &reply)
                .await
                .is_err()
            {
                return false;
            }
        }
        true
    }

    // A peer pre-announced a payload by checksum
    fn handle_new_hash(&self, data: &[u8], stream: &Arc<PeerStream>) -> bool {
        let Some(pid) = stream.id() else {
            return false;
        };
        let Ok(bytes) = <[u8; 4]>::try_from(data) else {
            return false;
        };
        self.record_relay(u32::from_be_bytes(bytes), &pid);
        true
    }

    // Reply with up to max_sync_nodes nearest routing records, each
    // carrying at least one address.
    async fn handle_sync_route(&self, stream: &Arc<PeerStream>) -> bool {
        let Some(pid) = stream.id() else {
            return false;
        };
        let mut records = Vec::new();
        for id in self.route_table.nearest(&pid, self.config.max_sync_nodes) {
            let addrs = self.peer_store.addrs(&id);
            if addrs.is_empty() {
                warn!("node {} addrs is nil", id);
                continue;
            }
            records.push(PeerInfoMessage::new(
                id,
                addrs.iter().map(ToString::to_string).collect(),
            ));
        }
        debug!("reply sync route to {}: {} records", pid, records.len());

        let reply = PeersMessage::new(records);
        if self
            .send_msg(MSG_SYNC_ROUTE_REPLY, &reply.to_bytes(), &pid)
            .await
            .is_err()
        {
            return false;
        }
        self.route_table.update(&pid);
        true
    }

    // Greet every advertised peer we do not know yet
    async fn handle_sync_route_reply(self: &Arc<Self>, data: &[u8]) -> bool {
        let Ok(peers) = PeersMessage::from_bytes(data) else {
            warn!("handle sync route reply occurs error: bad payload");
            return false;
        };
        for record in peers.peers {
            if record.id == self.config.node_id {
                continue;
            }
            if self.route_table.find(&record.id) || record.addrs.is_empty() {
                debug!("node {} is already known", record.id);
                continue;
            }
            let mut stored = false;
            for addr in &record.addrs {
                match addr.parse() {
                    Ok(addr) => {
                        self.peer_store
                            .add_addr(&record.id, addr, PROVIDER_ADDR_TTL_SECS);
                        stored = true;
                    }
                    Err(_) => debug!("discarding unparsable addr {} of {}", addr, record.id),
                }
            }
            if !stored {
                continue;
            }
            debug!("discover new node {}", record.id);
            if let Err(e) = self.hello(&record.id).await {
                error!("say hello to the peer {} fail: {}", record.id, e);
                continue;
            }
            self.route_table.update(&record.id);
        }
        true
    }

    // Application payload: only established peers may talk; remember
    // who relayed it and hand it to the dispatcher.
    async fn handle_data(&self, frame: &Frame, stream: &Arc<PeerStream>) -> bool {
        let Some(pid) = stream.id() else {
            warn!("data message on an anonymous stream");
            return false;
        };
        if stream.state() != StreamState::Ok || !self.streams.read().await.contains_key(&pid) {
            warn!("peer {} did not shake hands before sending data", pid);
            return false;
        }

        counter!("neb_packet_in_from_net").increment(1);
        self.record_relay(frame.data_checksum, &pid);
        self.dispatcher.put_message(Message::new(
            frame.name.clone(),
            pid,
            frame.data.clone(),
        ));
        true
    }

    fn record_relay(&self, checksum: u32, pid: &PeerId) {
        let mut relayness = self.relayness.lock().expect("relayness poisoned");
        let mut peers = relayness.get(&checksum).cloned().unwrap_or_default();
        if !peers.contains(pid) {
            peers.push(pid.clone());
        }
        relayness.put(checksum, peers);
    }

    // Peers that already forwarded the payload with this checksum
    pub fn relayed_by(&self, checksum: u32) -> Vec<PeerId> {
        self.relayness
            .lock()
            .expect("relayness poisoned")
            .get(&checksum)
            .cloned()
            .unwrap_or_default()
    }

    async fn store_stream(&self, pid: &PeerId, stream: &Arc<PeerStream>) {
        let prior = self
            .streams
            .write()
            .await
            .insert(pid.clone(), Arc::clone(stream));
        if let Some(prior) = prior {
            if !Arc::ptr_eq(&prior, stream) {
                debug!("replacing stale stream to {}", pid);
                self.stream_cache
                    .lock()
                    .expect("stream cache poisoned")
                    .remove(&(prior.cache_seq(), pid.clone()));
                prior.signal_exit();
            }
        }
        self.stream_cache
            .lock()
            .expect("stream cache poisoned")
            .insert((stream.cache_seq(), pid.clone()));
    }

    // Close a stream and forget the peer: drop it from the stream map
    // and cache, reset its addresses, unroute it unless it is a boot
    // node.
    pub async fn bye(&self, stream: &Arc<PeerStream>) {
        debug!("bye {}", stream);
        if let Some(pid) = stream.id() {
            self.clear_peer_store(&pid);
            let removed = {
                let mut streams = self.streams.write().await;
                match streams.get(&pid) {
                    Some(existing) if Arc::ptr_eq(existing, stream) => {
                        streams.remove(&pid);
                        true
                    }
                    _ => false,
                }
            };
            if removed {
                self.stream_cache
                    .lock()
                    .expect("stream cache poisoned")
                    .remove(&(stream.cache_seq(), pid));
            }
        }
        stream.set_state(StreamState::Nc);
        stream.signal_exit();
    }

    fn clear_peer_store(&self, pid: &PeerId) {
        self.peer_store.clear_addrs(pid);
        if !self
            .boot_ids
            .read()
            .expect("boot ids poisoned")
            .contains(pid)
        {
            self.route_table.remove(pid);
        }
    }

    // Periodic maintenance: evict the oldest streams above the cache
    // bound and clear addresses of streamless non-boot peers.
    async fn manage_stream_store(self: Arc<Self>) {
        let mut quit = self.quit.subscribe();
        let mut tick = interval(Duration::from_secs(STREAM_STORE_TICK_SECS));
        // the first tick fires immediately
        tick.tick().await;
        loop {
            select! {
                _ = quit.recv() => return,
                _ = tick.tick() => {
                    self.clear_stream_store().await;
                    self.clean_peer_store().await;
                }
            }
        }
    }

    async fn clear_stream_store(&self) {
        loop {
            let evicted = {
                let mut cache = self.stream_cache.lock().expect("stream cache poisoned");
                if cache.len() <= self.config.stream_store_size {
                    None
                } else {
                    let min = cache.iter().next().cloned();
                    if let Some(entry) = &min {
                        cache.remove(entry);
                    }
                    min
                }
            };
            let Some((_, pid)) = evicted else { break };
            let stream = self.streams.read().await.get(&pid).cloned();
            if let Some(stream) = stream {
                debug!("evicting stream to {} from the cache", pid);
                self.bye(&stream).await;
            }
        }
    }

    async fn clean_peer_store(&self) {
        let connected: HashSet<PeerId> = self.streams.read().await.keys().cloned().collect();
        let boot_ids = self.boot_ids.read().expect("boot ids poisoned").clone();
        for pid in self.peer_store.peers() {
            if !connected.contains(&pid) && !boot_ids.contains(&pid) {
                self.peer_store.clear_addrs(&pid);
            }
        }
    }
}

// Exclusive writer task for one stream: everything sent to the peer
// funnels through its queue.
fn spawn_writer(stream: Arc<PeerStream>, mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
    tokio::spawn(async move {
        let mut exit = stream.get_exit_receiver();
        loop {
            select! {
                _ = exit.recv() => break,
                maybe = rx.recv() => match maybe {
                    Some(bytes) => {
                        if let Err(e) = write_half.write_all(&bytes).await {
                            warn!("write to {} failed: {}", stream, e);
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
        let _ = write_half.shutdown().await;
    });
}

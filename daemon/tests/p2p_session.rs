// Peer session scenarios over real sockets: handshake, identity
// mismatch, network-id gating, payload dispatch and route sync.

use neb_daemon::{
    config::{MSG_HELLO, MSG_SYNC_ROUTE},
    p2p::{
        build_frame, BootNode, HelloMessage, MemoryPeerStore, MemoryRouteTable, NetService,
        P2pConfig, P2pError, PeerId, StreamState,
    },
};
use neb_common::serializer::Serializer;
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{sleep, timeout},
};

fn service(chain_id: u32, network_id: u32, id: &str, boot_nodes: Vec<BootNode>) -> Arc<NetService> {
    let mut config = P2pConfig::new(
        chain_id,
        network_id,
        id.to_string(),
        "127.0.0.1:0".parse().unwrap(),
    );
    config.boot_nodes = boot_nodes;
    NetService::new(
        config,
        Arc::new(MemoryPeerStore::new()),
        Arc::new(MemoryRouteTable::new()),
    )
}

fn boot_of(target: &NetService) -> BootNode {
    BootNode {
        id: target.node_id().clone(),
        addr: target.local_addr().expect("service not started"),
    }
}

async fn wait_for_state(service: &NetService, pid: &PeerId, state: StreamState) -> bool {
    for _ in 0..250 {
        if service.peer_state(pid).await == Some(state) {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn wait_for_network_id(service: &NetService, pid: &PeerId) -> Option<u32> {
    for _ in 0..250 {
        if let Some(id) = service.network_id_of(pid) {
            return Some(id);
        }
        sleep(Duration::from_millis(20)).await;
    }
    None
}

#[tokio::test]
async fn test_handshake_ends_ok_on_both_sides() {
    let a = service(1, 1, "node-a", vec![]);
    a.start().await.unwrap();

    let b = service(1, 1, "node-b", vec![boot_of(&a)]);
    b.start().await.unwrap();

    assert!(wait_for_state(&b, a.node_id(), StreamState::Ok).await);
    assert!(wait_for_state(&a, b.node_id(), StreamState::Ok).await);

    // both cached the other's network id from the post-OK exchange
    assert_eq!(wait_for_network_id(&b, a.node_id()).await, Some(1));
    assert_eq!(wait_for_network_id(&a, b.node_id()).await, Some(1));

    a.stop();
    b.stop();
}

#[tokio::test]
async fn test_ok_with_wrong_identity_never_reaches_ok() {
    let a = service(1, 1, "node-a", vec![]);
    a.start().await.unwrap();

    // b dials a but expects a different identity on the other end
    let wrong = BootNode {
        id: "node-imposter".to_string(),
        addr: a.local_addr().unwrap(),
    };
    let b = service(1, 1, "node-b", vec![wrong]);
    b.start().await.unwrap();

    sleep(Duration::from_millis(300)).await;
    assert!(b.connected_peers().await.is_empty());
    assert_eq!(b.peer_state(&"node-imposter".to_string()).await, None);

    a.stop();
    b.stop();
}

#[tokio::test]
async fn test_disjoint_network_ids_refuse_messages() {
    let a = service(1, 0b0011, "node-a", vec![]);
    a.start().await.unwrap();
    let b = service(1, 0b0100, "node-b", vec![boot_of(&a)]);
    b.start().await.unwrap();

    // the handshake itself is not gated
    assert!(wait_for_state(&b, a.node_id(), StreamState::Ok).await);
    assert_eq!(wait_for_network_id(&b, a.node_id()).await, Some(0b0011));

    // intersection of the masks is empty: refuse before writing bytes
    let err = b.send_msg(MSG_SYNC_ROUTE, &[], a.node_id()).await.unwrap_err();
    assert!(matches!(err, P2pError::NotInSameNetwork(_)));

    a.stop();
    b.stop();
}

#[tokio::test]
async fn test_data_message_reaches_subscriber_and_relay_cache() {
    let a = service(1, 0b0011, "node-a", vec![]);
    a.start().await.unwrap();
    let b = service(1, 0b0001, "node-b", vec![boot_of(&a)]);
    b.start().await.unwrap();

    assert!(wait_for_state(&b, a.node_id(), StreamState::Ok).await);
    assert!(wait_for_network_id(&b, a.node_id()).await.is_some());
    assert!(wait_for_network_id(&a, b.node_id()).await.is_some());

    let (_id, mut blocks) = a.register(&["newblock"]);
    let payload = b"serialized block bytes";
    b.send_msg("newblock", payload, a.node_id()).await.unwrap();

    let message = timeout(Duration::from_secs(5), blocks.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.name, "newblock");
    assert_eq!(&message.sender, b.node_id());
    assert_eq!(&message.data[..], payload);

    // the sender is remembered for broadcast echo suppression
    let checksum = crc32fast::hash(payload);
    assert_eq!(a.relayed_by(checksum), vec![b.node_id().clone()]);
    // broadcasting the same payload from a skips the peer that sent it
    assert_eq!(a.broadcast("newblock", payload).await, 0);

    a.stop();
    b.stop();
}

#[tokio::test]
async fn test_tampered_frame_closes_the_stream() {
    let a = service(1, 1, "node-a", vec![]);
    a.start().await.unwrap();

    let mut socket = TcpStream::connect(a.local_addr().unwrap()).await.unwrap();
    let hello = HelloMessage::new("node-raw", "0.2.0");
    let frame = build_frame(1, 0, MSG_HELLO, &hello.to_bytes()).unwrap();

    // flip one payload bit: the parser must reject it and say bye
    let mut tampered = frame.to_vec();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    socket.write_all(&tampered).await.unwrap();

    let mut buf = [0u8; 64];
    let read = timeout(Duration::from_secs(5), socket.read(&mut buf))
        .await
        .expect("remote should close the stream")
        .unwrap();
    assert_eq!(read, 0, "expected EOF after checksum mismatch");
    assert!(a.connected_peers().await.is_empty());

    a.stop();
}

#[tokio::test]
async fn test_version_mismatch_closes_the_stream() {
    let a = service(1, 1, "node-a", vec![]);
    a.start().await.unwrap();

    let mut socket = TcpStream::connect(a.local_addr().unwrap()).await.unwrap();
    let hello = HelloMessage::new("node-raw", "0.2.0");
    // version byte 9 while the node runs version 0
    let frame = build_frame(1, 9, MSG_HELLO, &hello.to_bytes()).unwrap();
    socket.write_all(&frame).await.unwrap();

    let mut buf = [0u8; 64];
    let read = timeout(Duration::from_secs(5), socket.read(&mut buf))
        .await
        .expect("remote should close the stream")
        .unwrap();
    assert_eq!(read, 0);

    a.stop();
}

#[tokio::test]
async fn test_sync_route_discovers_peers_transitively() {
    // c is a boot node of a; b joins via a and discovers c
    let c = service(1, 1, "node-c", vec![]);
    c.start().await.unwrap();

    let a = service(1, 1, "node-a", vec![boot_of(&c)]);
    a.start().await.unwrap();
    assert!(wait_for_state(&a, c.node_id(), StreamState::Ok).await);

    let b = service(1, 1, "node-b", vec![boot_of(&a)]);
    b.start().await.unwrap();
    assert!(wait_for_state(&b, a.node_id(), StreamState::Ok).await);
    assert!(wait_for_network_id(&b, a.node_id()).await.is_some());
    assert!(wait_for_network_id(&a, b.node_id()).await.is_some());

    b.sync_routes(a.node_id()).await;

    // b learns about c from the syncroute reply and greets it
    assert!(wait_for_state(&b, c.node_id(), StreamState::Ok).await);

    a.stop();
    b.stop();
    c.stop();
}

#[tokio::test]
async fn test_send_msg_to_unknown_peer_fails() {
    let a = service(1, 1, "node-a", vec![]);
    a.start().await.unwrap();

    let err = a
        .send_msg("newblock", b"data", &"node-ghost".to_string())
        .await
        .unwrap_err();
    // no handshake happened: the peer has no cached network id
    assert!(matches!(err, P2pError::NotInSameNetwork(_)));

    a.stop();
}

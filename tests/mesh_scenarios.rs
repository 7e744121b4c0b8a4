//! Multi-node meshes over the in-process radio

use std::sync::Arc;
use std::time::Duration;

use meshlink::bluetooth::protocol::{Frame, FrameKind, MessageId, HEADER_LEN, MIN_WRITE_SIZE};
use meshlink::bluetooth::{AlwaysUsable, LinkAdapter, LinkAddress, LinkHandle, MemoryMedium};
use meshlink::message::{InMemoryMessageStore, ReceivedMessage};
use meshlink::{MeshConfig, MeshEvent, MeshSession, PeerId};
use tokio::sync::mpsc::UnboundedReceiver;

const SETTLE: Duration = Duration::from_secs(5);

struct Node {
    address: LinkAddress,
    session: MeshSession,
    events: UnboundedReceiver<MeshEvent>,
}

fn node(medium: &Arc<MemoryMedium>, name: &str, peer: u16, write_size: usize) -> Node {
    node_with(medium, name, peer, write_size, false)
}

fn text_node(medium: &Arc<MemoryMedium>, name: &str, peer: u16) -> Node {
    node_with(medium, name, peer, 182, true)
}

fn node_with(
    medium: &Arc<MemoryMedium>,
    name: &str,
    peer: u16,
    write_size: usize,
    legacy_text_framing: bool,
) -> Node {
    let address = LinkAddress::from(name);
    let adapter = medium.attach_with_write_size(address.clone(), write_size);
    let config = MeshConfig {
        nickname: name.to_string(),
        peer_id: Some(PeerId(peer)),
        legacy_text_framing,
        ..MeshConfig::default()
    };
    let session = MeshSession::new(
        config,
        adapter,
        Arc::new(InMemoryMessageStore::default()),
        Arc::new(AlwaysUsable),
    )
    .unwrap();
    let events = session.take_events().unwrap();
    Node {
        address,
        session,
        events,
    }
}

async fn start_all(nodes: &[&Node]) {
    for node in nodes {
        node.session.start().await.unwrap();
    }
    tokio::time::sleep(SETTLE).await;
}

async fn stop_all(nodes: &[&Node]) {
    for node in nodes {
        node.session.stop().await;
    }
}

/// Messages delivered since the last call, after letting the mesh run for `wait`
async fn received(node: &mut Node, wait: Duration) -> Vec<ReceivedMessage> {
    tokio::time::sleep(wait).await;
    let mut messages = Vec::new();
    while let Ok(event) = node.events.try_recv() {
        if let MeshEvent::MessageReceived(message) = event {
            messages.push(message);
        }
    }
    messages
}

fn app_frames(medium: &MemoryMedium, from: &LinkAddress, to: &LinkAddress) -> Vec<Frame> {
    medium
        .sent_between(from, to)
        .iter()
        .filter_map(|bytes| Frame::decode(bytes).ok())
        .filter(|frame| frame.is_app_traffic())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn two_nodes_converge_and_go_quiet() {
    let medium = MemoryMedium::new();
    let a = node(&medium, "a", 0xa, 182);
    let b = node(&medium, "b", 0xb, 182);
    start_all(&[&a, &b]).await;

    assert_eq!(a.session.known_peer_ids(), vec![PeerId(0xa), PeerId(0xb)]);
    assert_eq!(b.session.known_peer_ids(), vec![PeerId(0xa), PeerId(0xb)]);
    assert!(medium.is_connected(&a.address, &b.address));

    // Nothing new to learn: no further announcements
    medium.clear_sent();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(medium.sent_frames().is_empty());

    stop_all(&[&a, &b]).await;
}

#[tokio::test(start_paused = true)]
async fn learned_peers_are_announced_once_per_debounce() {
    let medium = MemoryMedium::new();
    let a = node(&medium, "a", 0xa, 182);
    let b = node(&medium, "b", 0xb, 182);
    let c = node(&medium, "c", 0xc, 182);
    medium.set_in_range(&a.address, &c.address, false);
    start_all(&[&a, &b]).await;

    medium.clear_sent();
    start_all(&[&c]).await;

    // b learned c and told a in one debounced announcement
    let infos: Vec<Frame> = medium
        .sent_between(&b.address, &a.address)
        .iter()
        .filter_map(|bytes| Frame::decode(bytes).ok())
        .filter(|frame| frame.kind() == FrameKind::Info)
        .collect();
    assert_eq!(infos.len(), 1);
    assert_eq!(
        infos[0].announced_peers(),
        vec![PeerId(0xa), PeerId(0xb), PeerId(0xc)]
    );
    assert!(a.session.known_peer_ids().contains(&PeerId(0xc)));
    assert!(c.session.known_peer_ids().contains(&PeerId(0xa)));

    stop_all(&[&a, &b, &c]).await;
}

#[tokio::test(start_paused = true)]
async fn direct_message_crosses_a_relay() {
    let medium = MemoryMedium::new();
    let a = node(&medium, "a", 0xa, 182);
    let mut b = node(&medium, "b", 0xb, 182);
    let mut c = node(&medium, "c", 0xc, 182);
    medium.set_in_range(&a.address, &c.address, false);
    start_all(&[&a, &b, &c]).await;
    assert!(!medium.is_connected(&a.address, &c.address));
    received(&mut c, Duration::ZERO).await;

    medium.clear_sent();
    let id = a.session.send_message(PeerId(0xc), "hello c").await.unwrap();

    let at_c = received(&mut c, Duration::from_secs(1)).await;
    assert_eq!(at_c.len(), 1);
    assert_eq!(at_c[0].message_id, id);
    assert_eq!(at_c[0].sender, PeerId(0xa));
    assert_eq!(at_c[0].content, "hello c");
    assert_eq!(at_c[0].via, Some(b.address.clone()));

    // b forwards without delivering; c is the recipient and stops the flood
    assert!(received(&mut b, Duration::ZERO).await.is_empty());
    assert_eq!(app_frames(&medium, &b.address, &c.address).len(), 1);
    assert!(app_frames(&medium, &c.address, &b.address).is_empty());
    assert!(app_frames(&medium, &b.address, &a.address).is_empty());

    stop_all(&[&a, &b, &c]).await;
}

#[tokio::test(start_paused = true)]
async fn broadcast_is_delivered_once_per_node() {
    let medium = MemoryMedium::new();
    let a = node(&medium, "a", 0xa, 182);
    let mut b = node(&medium, "b", 0xb, 182);
    let mut c = node(&medium, "c", 0xc, 182);
    start_all(&[&a, &b, &c]).await;
    received(&mut b, Duration::ZERO).await;
    received(&mut c, Duration::ZERO).await;

    // Full triangle: b and c each hear it from a and again from each other
    a.session
        .send_message(PeerId::BROADCAST, "everyone")
        .await
        .unwrap();

    let at_b = received(&mut b, Duration::from_secs(2)).await;
    let at_c = received(&mut c, Duration::ZERO).await;
    assert_eq!(at_b.len(), 1);
    assert_eq!(at_c.len(), 1);
    assert_eq!(at_b[0].content, "everyone");
    // each relay forwards once and never back along the arrival link
    assert_eq!(app_frames(&medium, &b.address, &c.address).len(), 1);
    assert_eq!(app_frames(&medium, &c.address, &b.address).len(), 1);
    assert!(app_frames(&medium, &b.address, &a.address).is_empty());
    assert!(app_frames(&medium, &c.address, &a.address).is_empty());

    stop_all(&[&a, &b, &c]).await;
}

#[tokio::test(start_paused = true)]
async fn chunked_message_is_relayed_and_reassembled() {
    let write_size = HEADER_LEN + 8;
    let medium = MemoryMedium::new();
    let a = node(&medium, "a", 0xa, write_size);
    let b = node(&medium, "b", 0xb, write_size);
    let mut c = node(&medium, "c", 0xc, write_size);
    medium.set_in_range(&a.address, &c.address, false);
    start_all(&[&a, &b, &c]).await;
    received(&mut c, Duration::ZERO).await;

    medium.clear_sent();
    let text = "forty bytes of text split into chunks!!!";
    assert_eq!(text.len(), 40);
    a.session.send_message(PeerId::BROADCAST, text).await.unwrap();

    let at_c = received(&mut c, Duration::from_secs(2)).await;
    assert_eq!(at_c.len(), 1);
    assert_eq!(at_c[0].content, text);

    let relayed = app_frames(&medium, &b.address, &c.address);
    assert_eq!(relayed.len(), 5);
    assert!(relayed.iter().all(|f| f.kind() == FrameKind::ChunkedPart));
    assert!(medium
        .sent_frames()
        .iter()
        .all(|f| f.bytes.len() <= write_size));

    stop_all(&[&a, &b, &c]).await;
}

#[tokio::test(start_paused = true)]
async fn smallest_write_size_still_converges() {
    let medium = MemoryMedium::new();
    let a = node(&medium, "a", 0xa, MIN_WRITE_SIZE);
    let b = node(&medium, "b", 0xb, MIN_WRITE_SIZE);
    start_all(&[&a, &b]).await;

    assert_eq!(a.session.known_peer_ids(), vec![PeerId(0xa), PeerId(0xb)]);
    assert_eq!(b.session.known_peer_ids(), vec![PeerId(0xa), PeerId(0xb)]);
    assert!(medium
        .sent_frames()
        .iter()
        .all(|f| f.bytes.len() <= MIN_WRITE_SIZE));

    stop_all(&[&a, &b]).await;
}

#[tokio::test(start_paused = true)]
async fn text_framed_message_crosses_a_relay() {
    let medium = MemoryMedium::new();
    let a = text_node(&medium, "a", 0xa);
    let mut b = text_node(&medium, "b", 0xb);
    let mut c = text_node(&medium, "c", 0xc);
    medium.set_in_range(&a.address, &c.address, false);
    start_all(&[&a, &b, &c]).await;
    assert!(c.session.known_peer_ids().contains(&PeerId(0xa)));
    assert!(medium
        .sent_frames()
        .iter()
        .all(|f| f.bytes.starts_with("INFO§".as_bytes())));
    received(&mut b, Duration::ZERO).await;
    received(&mut c, Duration::ZERO).await;

    medium.clear_sent();
    let id = a.session.send_message(PeerId(0xc), "hello c").await.unwrap();

    let at_c = received(&mut c, Duration::from_secs(1)).await;
    assert_eq!(at_c.len(), 1);
    assert_eq!(at_c[0].message_id, id);
    assert_eq!(at_c[0].sender, PeerId(0xa));
    assert_eq!(at_c[0].content, "hello c");
    assert!(received(&mut b, Duration::ZERO).await.is_empty());

    let first_hop = medium.sent_between(&a.address, &b.address);
    assert_eq!(first_hop, vec!["APP§000c|000a|hello c".as_bytes().to_vec()]);
    let relayed = medium.sent_between(&b.address, &c.address);
    assert_eq!(relayed, first_hop);
    assert!(app_frames(&medium, &c.address, &b.address).is_empty());
    assert!(app_frames(&medium, &b.address, &a.address).is_empty());

    stop_all(&[&a, &b, &c]).await;
}

#[tokio::test(start_paused = true)]
async fn replayed_frame_is_delivered_once_per_dedup_window() {
    let medium = MemoryMedium::new();
    let mut b = node(&medium, "b", 0xb, 182);
    start_all(&[&b]).await;

    // A bare adapter with no session behind it, replaying raw frames
    let raw = medium.attach(LinkAddress::from("x"));
    raw.connect(&b.address).await.unwrap();
    raw.subscribe_notifications(&b.address).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(b.session.status().ready_links, 1);

    let link = LinkHandle::client(b.address.clone());
    let bytes =
        Frame::app_message(PeerId(0x77), PeerId(0xb), MessageId(42), b"replay".to_vec()).encode();
    raw.send_frame(&link, &bytes).await.unwrap();
    raw.send_frame(&link, &bytes).await.unwrap();
    let first = received(&mut b, Duration::from_secs(1)).await;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].content, "replay");

    // Past the dedup window the same frame counts as new
    tokio::time::sleep(Duration::from_secs(5)).await;
    raw.send_frame(&link, &bytes).await.unwrap();
    assert_eq!(received(&mut b, Duration::from_secs(1)).await.len(), 1);

    b.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn lost_link_is_reestablished_on_rediscovery() {
    let medium = MemoryMedium::new();
    let a = node(&medium, "a", 0xa, 182);
    let b = node(&medium, "b", 0xb, 182);
    start_all(&[&a, &b]).await;
    assert_eq!(a.session.status().ready_links, 1);

    medium.set_available(&b.address, false);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(a.session.status().ready_links, 0);
    assert_eq!(b.session.status().ready_links, 0);

    medium.set_available(&b.address, true);
    tokio::time::sleep(SETTLE).await;
    assert_eq!(a.session.status().ready_links, 1);
    assert_eq!(b.session.status().ready_links, 1);

    stop_all(&[&a, &b]).await;
}

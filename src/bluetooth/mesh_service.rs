//! Mesh Session
//!
//! One explicit object per mesh membership. Everything mutable (links,
//! dedup cache, topology, pending reassemblies, proximity windows) lives
//! here, is created when the session is built and cleared when it stops, so
//! nothing leaks from one session to the next.
//!
//! A stopped session cannot be restarted: the adapter's event stream is
//! consumed by the first `start`. Build a new session instead.

use dashmap::DashMap;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::adapter::{AdapterEvent, DiscoveryFilter, LinkAdapter, LinkAddress, LinkHandle};
use super::advertisement::{Advertisement, LocationRecord, PresenceRecord, PresenceState};
use super::gate::TransportGate;
use super::protocol::{Frame, FrameKind, MessageCodec, MessageId, PeerId};
use super::registry::{ConnectionRegistry, LinkState, LinkStateChange, RetryDecision};
use super::topology::{PeerInfo, TopologyDirectory};
use crate::config::MeshConfig;
use crate::error::{CodecError, LinkError, MeshError, MeshResult};
use crate::message::dedup::DedupCache;
use crate::message::message_types::{MeshEvent, ReceivedMessage, StoredMessage};
use crate::message::reassembly::{ChunkOutcome, Reassembler};
use crate::message::router::{RelayEngine, RouteDecision};
use crate::message::storage::MessageStore;
use crate::proximity::{Coordinates, DistanceEstimate, ProximityEstimator};

/// Snapshot for status displays
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub running: bool,
    pub peer_id: PeerId,
    pub nickname: String,
    pub links: usize,
    pub ready_links: usize,
    pub known_peers: usize,
    pub pending_reassemblies: usize,
    pub dedup_entries: usize,
}

/// State shared by the session's background tasks
struct SessionCore {
    local: PeerId,
    config: MeshConfig,
    codec: MessageCodec,
    adapter: Arc<dyn LinkAdapter>,
    registry: Arc<ConnectionRegistry>,
    dedup: Arc<DedupCache>,
    reassembler: Reassembler,
    topology: Arc<TopologyDirectory>,
    relay: RelayEngine,
    proximity: ProximityEstimator,
    store: Arc<dyn MessageStore>,
    presence: RwLock<PresenceState>,
    connecting: DashMap<LinkAddress, ()>,
    running: AtomicBool,
    ui_tx: mpsc::UnboundedSender<MeshEvent>,
}

pub struct MeshSession {
    core: Arc<SessionCore>,
    gate: Arc<dyn TransportGate>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    ui_rx: Mutex<Option<mpsc::UnboundedReceiver<MeshEvent>>>,
    link_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkStateChange>>>,
    announce_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<PeerId>>>>,
}

impl MeshSession {
    pub fn new(
        config: MeshConfig,
        adapter: Arc<dyn LinkAdapter>,
        store: Arc<dyn MessageStore>,
        gate: Arc<dyn TransportGate>,
    ) -> MeshResult<Self> {
        config.validate()?;
        let local = config.peer_id.unwrap_or_else(PeerId::random);
        let write_size = config.max_write_size.min(adapter.max_write_size());
        let codec = MessageCodec::new(write_size)?.with_text_framing(config.legacy_text_framing);

        let (ui_tx, ui_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (announce_tx, announce_rx) = mpsc::unbounded_channel();

        let registry = Arc::new(ConnectionRegistry::new(
            adapter.clone(),
            config.registry_config(),
            link_tx,
        ));
        let dedup = Arc::new(DedupCache::new(config.dedup_ttl(), config.dedup_capacity));
        let topology = TopologyDirectory::new(
            local,
            config.announce_debounce(),
            config.max_known_peers,
            announce_tx,
        );
        let relay = RelayEngine::new(local, dedup.clone(), registry.clone());
        let proximity = ProximityEstimator::new(config.proximity.clone());

        info!("Mesh session created as {} ({})", config.nickname, local);
        Ok(Self {
            core: Arc::new(SessionCore {
                local,
                config,
                codec,
                adapter,
                registry,
                dedup,
                reassembler: Reassembler::new(),
                topology,
                relay,
                proximity,
                store,
                presence: RwLock::new(PresenceState::Available),
                connecting: DashMap::new(),
                running: AtomicBool::new(false),
                ui_tx,
            }),
            gate,
            tasks: Mutex::new(Vec::new()),
            ui_rx: Mutex::new(Some(ui_rx)),
            link_rx: Mutex::new(Some(link_rx)),
            announce_rx: Mutex::new(Some(announce_rx)),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.core.local
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    /// UI event stream; can be taken once
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<MeshEvent>> {
        self.ui_rx.lock().take()
    }

    /// Join the mesh: open the server role, advertise, discover, and spawn
    /// the event loops.
    pub async fn start(&self) -> MeshResult<()> {
        if self.is_running() {
            return Ok(());
        }
        if !self.gate.is_usable() {
            return Err(MeshError::TransportUnusable);
        }

        let events = self
            .core
            .adapter
            .take_events()
            .ok_or(MeshError::Link(LinkError::AdapterUnavailable))?;
        let link_rx = self.link_rx.lock().take().ok_or(MeshError::NotRunning)?;
        let announce_rx = self.announce_rx.lock().take().ok_or(MeshError::NotRunning)?;

        info!("Starting mesh session {}", self.core.local);
        self.core.running.store(true, Ordering::SeqCst);

        {
            let mut tasks = self.tasks.lock();
            tasks.push(tokio::spawn(run_adapter_events(self.core.clone(), events)));
            tasks.push(tokio::spawn(run_link_changes(self.core.clone(), link_rx)));
            tasks.push(tokio::spawn(run_announcements(self.core.clone(), announce_rx)));
            tasks.push(tokio::spawn(run_housekeeping(self.core.clone())));
        }

        match self.core.open_radio().await {
            Ok(()) => info!("Mesh session {} started", self.core.local),
            Err(LinkError::AdapterUnavailable) => {
                // The radio is reopened when the adapter reports it is back
                warn!("Mesh session {} started without a radio", self.core.local);
                self.core.registry.set_available(false);
                self.core.emit(MeshEvent::AdapterAvailability(false));
            }
            Err(e) => {
                error!("Failed to start radio: {}", e);
                self.stop().await;
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Leave the mesh. Every link is torn down independently and all
    /// session state is cleared. In-flight sends are not cancelled.
    pub async fn stop(&self) {
        if !self.core.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping mesh session {}", self.core.local);
        let core = &self.core;
        core.registry.set_available(false);

        if let Err(e) = core.adapter.stop_discovery().await {
            warn!("Failed to stop discovery: {}", e);
        }
        if let Err(e) = core.adapter.stop_advertise().await {
            warn!("Failed to stop advertising: {}", e);
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        core.registry.teardown_all().await;

        core.registry.clear();
        core.dedup.clear();
        core.topology.reset();
        core.reassembler.clear();
        core.proximity.clear();
        core.connecting.clear();
        info!("Mesh session {} stopped", core.local);
    }

    /// Send `text` to `recipient` (or [`PeerId::BROADCAST`]). Returns the id
    /// the message travels under. Delivery is best-effort and unacknowledged.
    pub async fn send_message(&self, recipient: PeerId, text: &str) -> MeshResult<MessageId> {
        if !self.is_running() {
            return Err(MeshError::NotRunning);
        }
        let core = &self.core;
        let frames = core
            .codec
            .encode_message(core.local, recipient, MessageId::random(), text.as_bytes())?;
        let Some(message_id) = frames.first().map(|f| f.header.message_id) else {
            return Err(CodecError::malformed("nothing to send").into());
        };

        core.save(&StoredMessage::outgoing(message_id, core.local, recipient, text))
            .await;

        if recipient == core.local {
            debug!("Self-addressed message {} delivered locally", message_id);
            core.deliver(ReceivedMessage::new(
                message_id,
                core.local,
                recipient,
                text.as_bytes(),
                None,
            ))
            .await;
            return Ok(message_id);
        }
        if !self.gate.is_usable() {
            return Err(MeshError::TransportUnusable);
        }

        for frame in &frames {
            core.relay.record_local(frame);
            let report = core.relay.fan_out(&core.codec.to_wire(frame), None).await;
            if report.attempted == 0 {
                debug!("No links for {}; message stays local", message_id);
                break;
            }
        }
        info!(
            "Sent {} to {} in {} frame(s)",
            message_id,
            recipient,
            frames.len()
        );
        Ok(message_id)
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.core.topology.peers()
    }

    pub fn known_peer_ids(&self) -> Vec<PeerId> {
        self.core.topology.snapshot()
    }

    pub fn proximity(&self, peer: PeerId) -> Option<DistanceEstimate> {
        self.core.proximity.estimate(peer)
    }

    pub fn is_call_available(&self, peer: PeerId) -> bool {
        self.core.proximity.is_call_available(peer)
    }

    pub async fn history(&self, peer: Option<PeerId>, limit: usize) -> MeshResult<Vec<StoredMessage>> {
        Ok(self.core.store.query(peer, limit).await?)
    }

    /// Change the advertised presence state
    pub async fn set_presence(&self, state: PresenceState) {
        *self.core.presence.write() = state;
        self.core.readvertise().await;
    }

    /// Set or clear the local position; advertised as a location record
    pub async fn set_location(&self, coordinates: Option<Coordinates>) {
        self.core.proximity.set_local_coordinates(coordinates);
        self.core.readvertise().await;
    }

    pub fn status(&self) -> SessionStatus {
        let core = &self.core;
        SessionStatus {
            running: self.is_running(),
            peer_id: core.local,
            nickname: core.config.nickname.clone(),
            links: core.registry.link_count(),
            ready_links: core.registry.ready_links().len(),
            known_peers: core.topology.len(),
            pending_reassemblies: core.reassembler.pending_count(),
            dedup_entries: core.dedup.len(),
        }
    }
}

impl SessionCore {
    fn emit(&self, event: MeshEvent) {
        let _ = self.ui_tx.send(event);
    }

    fn advertisement(&self) -> Advertisement {
        let presence = PresenceRecord {
            nickname: self.config.nickname.clone(),
            peer_id: self.local,
            state: *self.presence.read(),
        };
        let location = self
            .proximity
            .local_coordinates()
            .map(|coordinates| LocationRecord { coordinates });
        Advertisement::new(&presence, location.as_ref())
    }

    /// Server role, advertising and discovery. A backend without the server
    /// role still joins the mesh as a client.
    async fn open_radio(&self) -> Result<(), LinkError> {
        match self.adapter.accept_incoming().await {
            Ok(()) => {}
            Err(LinkError::RoleUnsupported(role)) => info!("{:?} role unavailable on this adapter", role),
            Err(e) => return Err(e),
        }
        match self.adapter.start_advertise(&self.advertisement()).await {
            Ok(()) => {}
            Err(LinkError::RoleUnsupported(_)) => info!("Advertising unavailable; discovery only"),
            Err(e) => return Err(e),
        }
        self.adapter.start_discovery(&DiscoveryFilter::default()).await
    }

    async fn readvertise(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        match self.adapter.start_advertise(&self.advertisement()).await {
            Ok(()) | Err(LinkError::RoleUnsupported(_)) => {}
            Err(e) => warn!("Re-advertise failed: {}", e),
        }
    }

    async fn save(&self, message: &StoredMessage) {
        if let Err(e) = self.store.save(message).await {
            warn!("Failed to store message {}: {}", message.message_id, e);
        }
    }

    async fn deliver(&self, message: ReceivedMessage) {
        info!(
            "Message {} from {} ({} bytes)",
            message.message_id,
            message.sender,
            message.content.len()
        );
        self.save(&StoredMessage::from(&message)).await;
        self.emit(MeshEvent::MessageReceived(message));
    }

    async fn handle_adapter_event(self: &Arc<Self>, event: AdapterEvent) {
        match event {
            AdapterEvent::Discovered {
                address,
                rssi,
                manufacturer_data,
            } => self.handle_discovered(address, rssi, &manufacturer_data),
            AdapterEvent::IncomingConnected { address } => {
                let core = self.clone();
                tokio::spawn(async move {
                    match core.registry.accept(&address).await {
                        Ok(_) => {}
                        Err(LinkError::AlreadyLinked(_)) => {
                            debug!("Keeping existing link to {}; inbound connection not registered", address)
                        }
                        Err(e) => warn!("Inbound link from {} failed: {}", address, e),
                    }
                });
            }
            AdapterEvent::Disconnected { link } => self.registry.handle_disconnected(&link).await,
            AdapterEvent::FrameReceived { link, bytes } => self.handle_frame(&link, &bytes).await,
            AdapterEvent::AvailabilityChanged { available } => {
                self.handle_availability(available).await
            }
        }
    }

    fn handle_discovered(
        self: &Arc<Self>,
        address: LinkAddress,
        rssi: Option<i16>,
        manufacturer_data: &std::collections::HashMap<u16, Vec<u8>>,
    ) {
        let (presence, location) = Advertisement::parse(manufacturer_data);
        if let Some(presence) = &presence {
            if presence.peer_id == self.local {
                return;
            }
            self.registry.bind_peer(&address, presence.peer_id);
            self.topology.note_presence(presence, rssi);
            if let Some(location) = location {
                self.proximity
                    .record_coordinates(presence.peer_id, location.coordinates);
            }
            if let Some(rssi) = rssi {
                if let Some(bucket) = self.proximity.record_rssi(presence.peer_id, rssi) {
                    self.emit(MeshEvent::ProximityChanged {
                        peer: presence.peer_id,
                        bucket,
                        call_available: self.proximity.is_call_available(presence.peer_id),
                    });
                }
            }
        }

        if !self.registry.is_connect_candidate(&address) {
            return;
        }
        if self.connecting.insert(address.clone(), ()).is_some() {
            return;
        }
        tokio::spawn(connect_with_retry(self.clone(), address));
    }

    async fn handle_frame(self: &Arc<Self>, link: &LinkHandle, bytes: &[u8]) {
        let from = &link.address;
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping frame from {}: {}", from, e);
                debug!("Undecodable bytes: {}", hex::encode(&bytes[..bytes.len().min(32)]));
                return;
            }
        };

        match self.relay.route(&frame, from) {
            RouteDecision::Duplicate => {}
            RouteDecision::Topology => {
                // Info frames are never forwarded, so the sender is the neighbour
                self.registry.bind_peer(from, frame.header.sender);
                let mut announced = frame.announced_peers();
                announced.push(frame.header.sender);
                if !self.topology.merge(&announced).is_empty() {
                    self.emit(MeshEvent::PeerListChanged(self.topology.peers()));
                }
            }
            decision => {
                if decision.relays() {
                    self.relay.fan_out(bytes, Some(from)).await;
                }
                if decision.delivers() {
                    self.deliver_frame(&frame, from).await;
                }
            }
        }
    }

    async fn deliver_frame(&self, frame: &Frame, from: &LinkAddress) {
        let h = &frame.header;
        let message = match frame.kind() {
            FrameKind::AppMessage => {
                ReceivedMessage::new(h.message_id, h.sender, h.recipient, &frame.payload, Some(from.clone()))
            }
            FrameKind::ChunkedPart => match self.reassembler.accept(frame) {
                ChunkOutcome::Complete(done) => ReceivedMessage::new(
                    done.message_id,
                    done.sender,
                    done.recipient,
                    &done.payload,
                    Some(from.clone()),
                ),
                _ => return,
            },
            FrameKind::Info => return,
        };
        self.deliver(message).await;
    }

    async fn handle_availability(&self, available: bool) {
        if self.registry.is_available() == available {
            return;
        }
        self.registry.set_available(available);
        self.emit(MeshEvent::AdapterAvailability(available));
        if available {
            info!("Bluetooth adapter available again");
            if let Err(e) = self.open_radio().await {
                warn!("Failed to reopen radio: {}", e);
            }
        } else {
            warn!("Bluetooth adapter unavailable; dropping links");
            self.registry.teardown_all().await;
        }
    }

    /// Initial exchange on a fresh link: our whole known set, not debounced
    async fn send_full_set(&self, link: &LinkHandle) {
        let frames = self
            .codec
            .encode_announcement(self.local, &self.topology.snapshot());
        for frame in frames {
            if let Err(e) = self.adapter.send_frame(link, &self.codec.to_wire(&frame)).await {
                warn!("Initial announcement to {} failed: {}", link.address, e);
                return;
            }
        }
    }
}

async fn connect_with_retry(core: Arc<SessionCore>, address: LinkAddress) {
    while core.running.load(Ordering::SeqCst) {
        match core.registry.connect(&address).await {
            Ok(_) => break,
            Err(e) if e.is_retryable() => match core.registry.retry_decision(&address) {
                RetryDecision::RetryAfter(delay) => {
                    debug!("Retrying {} in {:?} after: {}", address, delay, e);
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Abandon => {
                    warn!("Giving up on {} for now: {}", address, e);
                    break;
                }
            },
            Err(e) => {
                warn!("Connect to {} failed: {}", address, e);
                break;
            }
        }
    }
    core.connecting.remove(&address);
}

async fn run_adapter_events(core: Arc<SessionCore>, mut events: mpsc::UnboundedReceiver<AdapterEvent>) {
    while let Some(event) = events.recv().await {
        core.handle_adapter_event(event).await;
    }
    debug!("Adapter event stream closed");
}

async fn run_link_changes(core: Arc<SessionCore>, mut changes: mpsc::UnboundedReceiver<LinkStateChange>) {
    while let Some(change) = changes.recv().await {
        let address = change.handle.address.clone();
        core.emit(MeshEvent::ConnectionStateChanged {
            peer: core.registry.peer_for(&address),
            address,
            state: change.state,
        });
        if change.state == LinkState::Ready {
            core.send_full_set(&change.handle).await;
        }
    }
}

async fn run_announcements(core: Arc<SessionCore>, mut requests: mpsc::UnboundedReceiver<Vec<PeerId>>) {
    while let Some(peers) = requests.recv().await {
        for frame in core.codec.encode_announcement(core.local, &peers) {
            core.relay.record_local(&frame);
            let report = core.relay.fan_out(&core.codec.to_wire(&frame), None).await;
            debug!(
                "Announced {} peers on {}/{} links",
                peers.len(),
                report.delivered,
                report.attempted
            );
        }
    }
}

async fn run_housekeeping(core: Arc<SessionCore>) {
    let mut interval = tokio::time::interval(core.config.housekeeping_interval());
    interval.tick().await;
    loop {
        interval.tick().await;
        let swept = core.dedup.sweep_expired();
        if swept > 0 {
            debug!("Swept {} expired dedup entries", swept);
        }
        if let Some(timeout) = core.config.reassembly_timeout() {
            let dropped = core.reassembler.prune_older_than(timeout);
            if dropped > 0 {
                warn!("Dropped {} incomplete message(s)", dropped);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::gate::AlwaysUsable;
    use crate::bluetooth::memory::MemoryMedium;
    use crate::message::storage::InMemoryMessageStore;
    use std::time::Duration;

    fn config(peer: u16) -> MeshConfig {
        MeshConfig {
            nickname: format!("node{peer}"),
            peer_id: Some(PeerId(peer)),
            ..MeshConfig::default()
        }
    }

    fn session(medium: &Arc<MemoryMedium>, name: &str, peer: u16) -> MeshSession {
        let adapter = medium.attach(LinkAddress::from(name));
        MeshSession::new(
            config(peer),
            adapter,
            Arc::new(InMemoryMessageStore::default()),
            Arc::new(AlwaysUsable),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn send_requires_running_session() {
        let medium = MemoryMedium::new();
        let node = session(&medium, "a", 1);
        assert!(matches!(
            node.send_message(PeerId(2), "hi").await,
            Err(MeshError::NotRunning)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unusable_transport_refuses_start() {
        let medium = MemoryMedium::new();
        let adapter = medium.attach(LinkAddress::from("a"));
        let node = MeshSession::new(
            config(1),
            adapter,
            Arc::new(InMemoryMessageStore::default()),
            Arc::new(|| false),
        )
        .unwrap();
        assert!(matches!(node.start().await, Err(MeshError::TransportUnusable)));
        assert!(!node.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn start_without_radio_waits_for_adapter() {
        let medium = MemoryMedium::new();
        let a = session(&medium, "a", 1);
        let b = session(&medium, "b", 2);
        b.start().await.unwrap();
        medium.set_available(&LinkAddress::from("a"), false);

        a.start().await.unwrap();
        assert!(a.is_running());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(a.status().ready_links, 0);

        medium.set_available(&LinkAddress::from("a"), true);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(a.status().ready_links, 1);
        assert!(a.known_peer_ids().contains(&PeerId(2)));
        a.stop().await;
        b.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn self_addressed_message_stays_off_the_radio() {
        let medium = MemoryMedium::new();
        let node = session(&medium, "a", 1);
        let mut events = node.take_events().unwrap();
        node.start().await.unwrap();

        let id = node.send_message(PeerId(1), "note to self").await.unwrap();
        loop {
            match events.recv().await.unwrap() {
                MeshEvent::MessageReceived(message) => {
                    assert_eq!(message.message_id, id);
                    assert_eq!(message.content, "note to self");
                    assert_eq!(message.via, None);
                    break;
                }
                _ => continue,
            }
        }
        assert!(medium.sent_frames().is_empty());
        assert_eq!(node.history(None, 10).await.unwrap().len(), 2);
        node.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_clears_session_state() {
        let medium = MemoryMedium::new();
        let a = session(&medium, "a", 1);
        let b = session(&medium, "b", 2);
        a.start().await.unwrap();
        b.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(a.status().ready_links, 1);
        assert!(a.known_peer_ids().contains(&PeerId(2)));

        a.stop().await;
        let status = a.status();
        assert!(!status.running);
        assert_eq!(status.links, 0);
        assert_eq!(status.known_peers, 1);
        assert_eq!(status.dedup_entries, 0);
        assert!(matches!(
            a.send_message(PeerId(2), "late").await,
            Err(MeshError::NotRunning)
        ));
        b.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn proximity_from_advertised_rssi() {
        let medium = MemoryMedium::new();
        medium.set_rssi(&LinkAddress::from("a"), &LinkAddress::from("b"), -59);
        let a = session(&medium, "a", 1);
        let b = session(&medium, "b", 2);
        let mut events = a.take_events().unwrap();
        b.start().await.unwrap();
        a.start().await.unwrap();

        let bucket = loop {
            if let MeshEvent::ProximityChanged { peer, bucket, call_available } =
                events.recv().await.unwrap()
            {
                assert_eq!(peer, PeerId(2));
                assert!(call_available);
                break bucket;
            }
        };
        assert_eq!(bucket, crate::proximity::DistanceBucket::Within10m);
        assert!(a.is_call_available(PeerId(2)));
        a.stop().await;
        b.stop().await;
    }
}

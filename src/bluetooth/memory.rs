//! In-process radio
//!
//! A shared medium that any number of [`MemoryAdapter`]s attach to. It plays
//! both link roles, so whole meshes can run inside one process: range,
//! signal strength, write failures and adapter availability are all under
//! the caller's control, and every frame sent is logged.

use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use super::adapter::{AdapterEvent, DiscoveryFilter, LinkAdapter, LinkAddress, LinkHandle, Role};
use super::advertisement::Advertisement;
use super::protocol::DEFAULT_MAX_WRITE_SIZE;
use crate::error::LinkError;

/// Signal strength reported when none was configured for a pair
pub const DEFAULT_RSSI: i16 = -60;

/// One frame written to the medium
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub from: LinkAddress,
    pub to: LinkAddress,
    pub bytes: Vec<u8>,
}

type Pair = (LinkAddress, LinkAddress);

fn unordered(a: &LinkAddress, b: &LinkAddress) -> Pair {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

fn opposite(role: Role) -> Role {
    match role {
        Role::OutgoingClient => Role::IncomingServer,
        Role::IncomingServer => Role::OutgoingClient,
    }
}

#[derive(Default)]
pub struct MemoryMedium {
    nodes: DashMap<LinkAddress, Arc<MemoryAdapter>>,
    /// Keyed (client, server); value is whether the client has subscribed
    connections: DashMap<Pair, bool>,
    out_of_range: DashMap<Pair, ()>,
    rssi: DashMap<Pair, i16>,
    failing_writes: DashMap<LinkAddress, ()>,
    connect_delays: DashMap<LinkAddress, Duration>,
    connect_log: Mutex<Vec<Pair>>,
    sent: Mutex<Vec<SentFrame>>,
}

impl MemoryMedium {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node with the default write size
    pub fn attach(self: &Arc<Self>, address: LinkAddress) -> Arc<MemoryAdapter> {
        self.attach_with_write_size(address, DEFAULT_MAX_WRITE_SIZE)
    }

    pub fn attach_with_write_size(
        self: &Arc<Self>,
        address: LinkAddress,
        max_write_size: usize,
    ) -> Arc<MemoryAdapter> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let adapter = Arc::new(MemoryAdapter {
            address: address.clone(),
            medium: Arc::downgrade(self),
            state: Mutex::new(NodeState {
                available: true,
                ..NodeState::default()
            }),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            subscribed: Notify::new(),
            max_write_size,
        });
        self.nodes.insert(address, adapter.clone());
        adapter
    }

    /// Remove a node; its peers see their connections drop
    pub fn detach(&self, address: &LinkAddress) {
        self.nodes.remove(address);
        self.drop_connections(address);
    }

    fn drop_connections(&self, address: &LinkAddress) {
        let dropped: Vec<Pair> = self
            .connections
            .iter()
            .filter(|c| &c.key().0 == address || &c.key().1 == address)
            .map(|c| c.key().clone())
            .collect();
        for (client, server) in dropped {
            self.connections.remove(&(client.clone(), server.clone()));
            if &client == address {
                self.emit(&server, AdapterEvent::Disconnected { link: LinkHandle::server(client) });
            } else {
                self.emit(&client, AdapterEvent::Disconnected { link: LinkHandle::client(server) });
            }
        }
    }

    pub fn set_in_range(&self, a: &LinkAddress, b: &LinkAddress, in_range: bool) {
        if in_range {
            self.out_of_range.remove(&unordered(a, b));
        } else {
            self.out_of_range.insert(unordered(a, b), ());
        }
    }

    pub fn in_range(&self, a: &LinkAddress, b: &LinkAddress) -> bool {
        !self.out_of_range.contains_key(&unordered(a, b))
    }

    pub fn set_rssi(&self, a: &LinkAddress, b: &LinkAddress, rssi: i16) {
        self.rssi.insert(unordered(a, b), rssi);
    }

    fn rssi_between(&self, a: &LinkAddress, b: &LinkAddress) -> i16 {
        self.rssi.get(&unordered(a, b)).map(|r| *r).unwrap_or(DEFAULT_RSSI)
    }

    /// Make every write addressed to `address` fail
    pub fn fail_writes_to(&self, address: &LinkAddress, failing: bool) {
        if failing {
            self.failing_writes.insert(address.clone(), ());
        } else {
            self.failing_writes.remove(address);
        }
    }

    /// Switch a node's radio off or on. Switching off drops its connections.
    pub fn set_available(&self, address: &LinkAddress, available: bool) {
        if let Some(node) = self.node(address) {
            node.state.lock().available = available;
            if !available {
                self.drop_connections(address);
            }
            let _ = node.events_tx.send(AdapterEvent::AvailabilityChanged { available });
        }
    }

    /// Hold every connect to `address` for `delay` before it completes
    pub fn set_connect_delay(&self, address: &LinkAddress, delay: Duration) {
        self.connect_delays.insert(address.clone(), delay);
    }

    pub fn connect_attempts(&self, from: &LinkAddress, to: &LinkAddress) -> usize {
        self.connect_log
            .lock()
            .iter()
            .filter(|(a, b)| a == from && b == to)
            .count()
    }

    pub fn sent_frames(&self) -> Vec<SentFrame> {
        self.sent.lock().clone()
    }

    pub fn sent_between(&self, from: &LinkAddress, to: &LinkAddress) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .iter()
            .filter(|f| &f.from == from && &f.to == to)
            .map(|f| f.bytes.clone())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    pub fn is_connected(&self, a: &LinkAddress, b: &LinkAddress) -> bool {
        self.connections.contains_key(&(a.clone(), b.clone()))
            || self.connections.contains_key(&(b.clone(), a.clone()))
    }

    fn node(&self, address: &LinkAddress) -> Option<Arc<MemoryAdapter>> {
        self.nodes.get(address).map(|n| n.clone())
    }

    fn emit(&self, address: &LinkAddress, event: AdapterEvent) {
        if let Some(node) = self.node(address) {
            let _ = node.events_tx.send(event);
        }
    }

    fn discovered(&self, observer: &LinkAddress, advertiser: &LinkAddress, advertisement: &Advertisement) {
        self.emit(
            observer,
            AdapterEvent::Discovered {
                address: advertiser.clone(),
                rssi: Some(self.rssi_between(observer, advertiser)),
                manufacturer_data: advertisement.records.clone(),
            },
        );
    }
}

#[derive(Default)]
struct NodeState {
    advertisement: Option<Advertisement>,
    discovering: bool,
    accepting: bool,
    available: bool,
}

/// One node's view of the [`MemoryMedium`]
pub struct MemoryAdapter {
    address: LinkAddress,
    medium: Weak<MemoryMedium>,
    state: Mutex<NodeState>,
    events_tx: mpsc::UnboundedSender<AdapterEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<AdapterEvent>>>,
    subscribed: Notify,
    max_write_size: usize,
}

impl MemoryAdapter {
    pub fn address(&self) -> &LinkAddress {
        &self.address
    }

    fn medium(&self) -> Result<Arc<MemoryMedium>, LinkError> {
        if !self.state.lock().available {
            return Err(LinkError::AdapterUnavailable);
        }
        self.medium.upgrade().ok_or(LinkError::AdapterUnavailable)
    }

    /// Physical connection key for our side of `link`
    fn connection_key(&self, link: &LinkHandle) -> Pair {
        match link.role {
            Role::OutgoingClient => (self.address.clone(), link.address.clone()),
            Role::IncomingServer => (link.address.clone(), self.address.clone()),
        }
    }
}

#[async_trait]
impl LinkAdapter for MemoryAdapter {
    fn max_write_size(&self) -> usize {
        self.max_write_size
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<AdapterEvent>> {
        self.events_rx.lock().take()
    }

    async fn start_advertise(&self, advertisement: &Advertisement) -> Result<(), LinkError> {
        let medium = self.medium()?;
        self.state.lock().advertisement = Some(advertisement.clone());
        let observers: Vec<Arc<MemoryAdapter>> = medium
            .nodes
            .iter()
            .filter(|n| n.key() != &self.address)
            .map(|n| n.value().clone())
            .collect();
        for observer in observers {
            let discovering = {
                let state = observer.state.lock();
                state.discovering && state.available
            };
            if discovering && medium.in_range(&self.address, &observer.address) {
                medium.discovered(&observer.address, &self.address, advertisement);
            }
        }
        Ok(())
    }

    async fn stop_advertise(&self) -> Result<(), LinkError> {
        self.state.lock().advertisement = None;
        Ok(())
    }

    async fn start_discovery(&self, _filter: &DiscoveryFilter) -> Result<(), LinkError> {
        let medium = self.medium()?;
        self.state.lock().discovering = true;
        let advertisers: Vec<(LinkAddress, Advertisement)> = medium
            .nodes
            .iter()
            .filter(|n| n.key() != &self.address)
            .filter_map(|n| {
                let state = n.state.lock();
                match (&state.advertisement, state.available) {
                    (Some(adv), true) => Some((n.key().clone(), adv.clone())),
                    _ => None,
                }
            })
            .collect();
        for (address, advertisement) in advertisers {
            if medium.in_range(&self.address, &address) {
                medium.discovered(&self.address, &address, &advertisement);
            }
        }
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), LinkError> {
        self.state.lock().discovering = false;
        Ok(())
    }

    async fn accept_incoming(&self) -> Result<(), LinkError> {
        self.medium()?;
        self.state.lock().accepting = true;
        Ok(())
    }

    async fn connect(&self, address: &LinkAddress) -> Result<(), LinkError> {
        let medium = self.medium()?;
        medium
            .connect_log
            .lock()
            .push((self.address.clone(), address.clone()));
        let delay = medium.connect_delays.get(address).map(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let target = medium
            .node(address)
            .ok_or_else(|| LinkError::connect_failed(address, "no such device"))?;
        let reachable = {
            let state = target.state.lock();
            state.accepting && state.available
        };
        if !reachable || !medium.in_range(&self.address, address) {
            return Err(LinkError::connect_failed(address, "device not reachable"));
        }

        medium
            .connections
            .insert((self.address.clone(), address.clone()), false);
        medium.emit(
            address,
            AdapterEvent::IncomingConnected {
                address: self.address.clone(),
            },
        );
        debug!("memory: {} connected to {}", self.address, address);
        Ok(())
    }

    async fn wait_connection_stable(
        &self,
        _address: &LinkAddress,
        _fallback: Duration,
    ) -> Result<(), LinkError> {
        Ok(())
    }

    async fn discover_services(&self, address: &LinkAddress) -> Result<(), LinkError> {
        let medium = self.medium()?;
        if medium
            .connections
            .contains_key(&(self.address.clone(), address.clone()))
        {
            Ok(())
        } else {
            Err(LinkError::connect_failed(address, "not connected"))
        }
    }

    async fn subscribe_notifications(&self, address: &LinkAddress) -> Result<(), LinkError> {
        let medium = self.medium()?;
        match medium
            .connections
            .get_mut(&(self.address.clone(), address.clone()))
        {
            Some(mut subscribed) => *subscribed = true,
            None => return Err(LinkError::subscription_failed(address, "not connected")),
        }
        if let Some(server) = medium.node(address) {
            server.subscribed.notify_waiters();
        }
        Ok(())
    }

    async fn wait_subscribed(&self, address: &LinkAddress, settle: Duration) -> Result<(), LinkError> {
        let deadline = Instant::now() + settle;
        let key = (address.clone(), self.address.clone());
        loop {
            let notified = self.subscribed.notified();
            {
                let medium = self.medium()?;
                match medium.connections.get(&key).map(|s| *s) {
                    Some(true) => return Ok(()),
                    Some(false) => {}
                    None => return Err(LinkError::subscription_failed(address, "client went away")),
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(());
            }
        }
    }

    async fn send_frame(&self, link: &LinkHandle, bytes: &[u8]) -> Result<(), LinkError> {
        let medium = self.medium()?;
        if bytes.len() > self.max_write_size {
            return Err(LinkError::write_failed(
                &link.address,
                format!("{} bytes exceeds max write {}", bytes.len(), self.max_write_size),
            ));
        }
        if !medium.connections.contains_key(&self.connection_key(link)) {
            return Err(LinkError::write_failed(&link.address, "not connected"));
        }
        if medium.failing_writes.contains_key(&link.address) {
            return Err(LinkError::write_failed(&link.address, "injected failure"));
        }

        medium.sent.lock().push(SentFrame {
            from: self.address.clone(),
            to: link.address.clone(),
            bytes: bytes.to_vec(),
        });
        medium.emit(
            &link.address,
            AdapterEvent::FrameReceived {
                link: LinkHandle {
                    address: self.address.clone(),
                    role: opposite(link.role),
                },
                bytes: bytes.to_vec(),
            },
        );
        Ok(())
    }

    async fn disconnect(&self, link: &LinkHandle) -> Result<(), LinkError> {
        let medium = self
            .medium
            .upgrade()
            .ok_or(LinkError::AdapterUnavailable)?;
        if medium.connections.remove(&self.connection_key(link)).is_none() {
            return Err(LinkError::NotLinked(link.address.clone()));
        }
        medium.emit(
            &link.address,
            AdapterEvent::Disconnected {
                link: LinkHandle {
                    address: self.address.clone(),
                    role: opposite(link.role),
                },
            },
        );
        Ok(())
    }

    async fn close(&self, _link: &LinkHandle) -> Result<(), LinkError> {
        Ok(())
    }
}

//! Connection Registry
//!
//! Owns the authoritative address -> Link map. A `Connecting` entry doubles
//! as the in-flight marker, so the map itself guarantees at most one live
//! Link per address. Link states only move forward and a Link is never
//! reused; a reconnect creates a new Link with a new id.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::adapter::{LinkAdapter, LinkAddress, LinkHandle, Role};
use super::protocol::PeerId;
use crate::error::LinkError;

/// Link lifecycle. Ordering is the only permitted direction of travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LinkState {
    Connecting,
    Connected,
    Ready,
    Disconnecting,
    Closed,
}

impl LinkState {
    pub fn can_advance_to(self, next: LinkState) -> bool {
        next > self
    }
}

/// Association between the local node and one remote address
#[derive(Debug, Clone, Serialize)]
pub struct Link {
    pub id: u64,
    pub handle: LinkHandle,
    state: LinkState,
    #[serde(skip)]
    created_at: Instant,
}

impl Link {
    fn new(id: u64, handle: LinkHandle, state: LinkState) -> Self {
        Self {
            id,
            handle,
            state,
            created_at: Instant::now(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn advance(&mut self, next: LinkState) -> Result<(), LinkError> {
        if !self.state.can_advance_to(next) {
            return Err(LinkError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

/// Notification of a link state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStateChange {
    pub handle: LinkHandle,
    pub link_id: u64,
    pub state: LinkState,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Wait before service discovery when the adapter has no stable signal
    pub stable_fallback: Duration,
    /// Wait for an inbound peer to subscribe when the adapter has no signal
    pub settle_delay: Duration,
    pub max_connect_attempts: u32,
    pub retry_backoff: Duration,
    pub abandon_cooldown: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stable_fallback: Duration::from_millis(600),
            settle_delay: Duration::from_millis(300),
            max_connect_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            abandon_cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default)]
struct FailureRecord {
    attempts: u32,
    abandoned_until: Option<Instant>,
}

/// What to do after a failed connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Abandon,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Ready(LinkHandle),
    /// Already linked, already connecting, or cooling down after failures
    Skipped,
}

pub struct ConnectionRegistry {
    adapter: Arc<dyn LinkAdapter>,
    config: RegistryConfig,
    links: DashMap<LinkAddress, Link>,
    failures: DashMap<LinkAddress, FailureRecord>,
    peers: DashMap<LinkAddress, PeerId>,
    next_link_id: AtomicU64,
    available: AtomicBool,
    changes: mpsc::UnboundedSender<LinkStateChange>,
}

impl ConnectionRegistry {
    pub fn new(
        adapter: Arc<dyn LinkAdapter>,
        config: RegistryConfig,
        changes: mpsc::UnboundedSender<LinkStateChange>,
    ) -> Self {
        Self {
            adapter,
            config,
            links: DashMap::new(),
            failures: DashMap::new(),
            peers: DashMap::new(),
            next_link_id: AtomicU64::new(1),
            available: AtomicBool::new(true),
            changes,
        }
    }

    pub fn adapter(&self) -> &Arc<dyn LinkAdapter> {
        &self.adapter
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn notify(&self, handle: &LinkHandle, link_id: u64, state: LinkState) {
        let _ = self.changes.send(LinkStateChange {
            handle: handle.clone(),
            link_id,
            state,
        });
    }

    fn cooling_down(&self, address: &LinkAddress) -> bool {
        let Some(mut record) = self.failures.get_mut(address) else {
            return false;
        };
        match record.abandoned_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                record.abandoned_until = None;
                false
            }
            None => false,
        }
    }

    /// Whether a discovery event for this address should trigger a connect
    pub fn is_connect_candidate(&self, address: &LinkAddress) -> bool {
        self.is_available() && !self.links.contains_key(address) && !self.cooling_down(address)
    }

    /// Test-and-set the in-flight marker. Returns the new link id, or `None`
    /// if the address already has a link or a connect in flight.
    fn try_begin_connect(&self, address: &LinkAddress) -> Option<u64> {
        match self.links.entry(address.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let id = self.next_link_id.fetch_add(1, Ordering::SeqCst);
                slot.insert(Link::new(
                    id,
                    LinkHandle::client(address.clone()),
                    LinkState::Connecting,
                ));
                Some(id)
            }
        }
    }

    /// Move a link forward if it is still the one we started with
    fn advance(&self, address: &LinkAddress, link_id: u64, next: LinkState) -> Result<LinkHandle, LinkError> {
        let handle = {
            let mut link = self
                .links
                .get_mut(address)
                .filter(|l| l.id == link_id)
                .ok_or_else(|| LinkError::NotLinked(address.clone()))?;
            link.advance(next)?;
            link.handle.clone()
        };
        self.notify(&handle, link_id, next);
        Ok(handle)
    }

    /// `advance` for a step that follows a successful radio call. If the link
    /// was torn down meanwhile, the connection behind `handle` belongs to
    /// nobody and is released here.
    async fn advance_or_release(
        &self,
        address: &LinkAddress,
        link_id: u64,
        next: LinkState,
        handle: &LinkHandle,
    ) -> Result<LinkHandle, LinkError> {
        match self.advance(address, link_id, next) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                warn!("Link {} went away during setup; releasing connection", address);
                if let Err(err) = self.adapter.disconnect(handle).await {
                    debug!("Release of {} found nothing to disconnect: {}", address, err);
                }
                if let Err(err) = self.adapter.close(handle).await {
                    warn!("Close of {} failed: {}", address, err);
                }
                Err(e)
            }
        }
    }

    /// Clear the in-flight marker after a failed connect
    fn clear_marker(&self, address: &LinkAddress, link_id: u64) {
        let removed = self
            .links
            .remove_if(address, |_, l| l.id == link_id && l.state == LinkState::Connecting);
        if let Some((_, link)) = removed {
            self.notify(&link.handle, link_id, LinkState::Closed);
        }
    }

    /// Outgoing connect: Connecting -> Connected -> (stable) -> service
    /// discovery -> subscribe -> Ready.
    pub async fn connect(&self, address: &LinkAddress) -> Result<ConnectOutcome, LinkError> {
        if !self.is_available() {
            return Err(LinkError::AdapterUnavailable);
        }
        if self.cooling_down(address) {
            return Ok(ConnectOutcome::Skipped);
        }
        let Some(link_id) = self.try_begin_connect(address) else {
            return Ok(ConnectOutcome::Skipped);
        };
        self.notify(&LinkHandle::client(address.clone()), link_id, LinkState::Connecting);

        debug!("Connecting to {} (link {})", address, link_id);
        if let Err(e) = self.adapter.connect(address).await {
            self.clear_marker(address, link_id);
            self.record_failure(address);
            return Err(e);
        }
        let client = LinkHandle::client(address.clone());
        self.advance_or_release(address, link_id, LinkState::Connected, &client)
            .await?;

        let setup = async {
            self.adapter
                .wait_connection_stable(address, self.config.stable_fallback)
                .await?;
            self.adapter.discover_services(address).await?;
            self.adapter.subscribe_notifications(address).await
        };
        if let Err(e) = setup.await {
            warn!("Link setup with {} failed: {}", address, e);
            self.teardown(address).await;
            self.record_failure(address);
            return Err(e);
        }

        let handle = self
            .advance_or_release(address, link_id, LinkState::Ready, &client)
            .await?;
        self.failures.remove(address);
        info!("Link {} ready as client", address);
        Ok(ConnectOutcome::Ready(handle))
    }

    /// Inbound connection on the server role. Refused (but not torn down)
    /// when the address already has a link or a connect in flight.
    pub async fn accept(&self, address: &LinkAddress) -> Result<LinkHandle, LinkError> {
        let link_id = match self.links.entry(address.clone()) {
            Entry::Occupied(_) => return Err(LinkError::AlreadyLinked(address.clone())),
            Entry::Vacant(slot) => {
                let id = self.next_link_id.fetch_add(1, Ordering::SeqCst);
                slot.insert(Link::new(
                    id,
                    LinkHandle::server(address.clone()),
                    LinkState::Connected,
                ));
                id
            }
        };
        self.notify(&LinkHandle::server(address.clone()), link_id, LinkState::Connected);

        if let Err(e) = self
            .adapter
            .wait_subscribed(address, self.config.settle_delay)
            .await
        {
            self.teardown(address).await;
            return Err(e);
        }
        let handle = self
            .advance_or_release(address, link_id, LinkState::Ready, &LinkHandle::server(address.clone()))
            .await?;
        info!("Link {} ready as server", address);
        Ok(handle)
    }

    /// Disconnect, close and remove. The entry is removed even when the
    /// adapter calls fail.
    pub async fn teardown(&self, address: &LinkAddress) {
        let (handle, link_id) = {
            let Some(mut link) = self.links.get_mut(address) else {
                return;
            };
            if link.state >= LinkState::Disconnecting {
                return;
            }
            // always valid from any earlier state
            let _ = link.advance(LinkState::Disconnecting);
            (link.handle.clone(), link.id)
        };
        self.notify(&handle, link_id, LinkState::Disconnecting);

        if let Err(e) = self.adapter.disconnect(&handle).await {
            warn!("Disconnect from {} failed: {}", address, e);
        }
        if let Err(e) = self.adapter.close(&handle).await {
            warn!("Close of {} failed: {}", address, e);
        }

        if let Some((_, mut link)) = self.links.remove_if(address, |_, l| l.id == link_id) {
            let _ = link.advance(LinkState::Closed);
        }
        self.notify(&handle, link_id, LinkState::Closed);
        info!("Link {} closed", address);
    }

    /// Remote side went away. Only tears down the registered link when the
    /// event is for the same role; duplicate connections are ignored.
    pub async fn handle_disconnected(&self, link: &LinkHandle) {
        let matches = self
            .links
            .get(&link.address)
            .map(|l| l.handle.role == link.role)
            .unwrap_or(false);
        if matches {
            self.teardown(&link.address).await;
        } else {
            debug!("Ignoring disconnect of unregistered {:?} connection to {}", link.role, link.address);
        }
    }

    /// Tear down every link independently, continuing past failures
    pub async fn teardown_all(&self) {
        let addresses: Vec<LinkAddress> = self.links.iter().map(|e| e.key().clone()).collect();
        join_all(addresses.iter().map(|address| self.teardown(address))).await;
    }

    /// Drop all state after a session ends
    pub fn clear(&self) {
        self.links.clear();
        self.failures.clear();
        self.peers.clear();
    }

    fn record_failure(&self, address: &LinkAddress) {
        self.failures.entry(address.clone()).or_default().attempts += 1;
    }

    /// Retry policy after a failed connect: linear backoff, then abandon
    /// the address for the cooldown period.
    pub fn retry_decision(&self, address: &LinkAddress) -> RetryDecision {
        let mut record = self.failures.entry(address.clone()).or_default();
        if record.attempts < self.config.max_connect_attempts {
            RetryDecision::RetryAfter(self.config.retry_backoff * record.attempts.max(1))
        } else {
            record.attempts = 0;
            record.abandoned_until = Some(Instant::now() + self.config.abandon_cooldown);
            RetryDecision::Abandon
        }
    }

    pub fn state_of(&self, address: &LinkAddress) -> Option<LinkState> {
        self.links.get(address).map(|l| l.state)
    }

    pub fn link(&self, address: &LinkAddress) -> Option<Link> {
        self.links.get(address).map(|l| l.clone())
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Links that can carry frames, optionally excluding one address
    pub fn ready_links_except(&self, exclude: Option<&LinkAddress>) -> Vec<LinkHandle> {
        self.links
            .iter()
            .filter(|l| l.state == LinkState::Ready)
            .filter(|l| Some(l.key()) != exclude)
            .map(|l| l.handle.clone())
            .collect()
    }

    pub fn ready_links(&self) -> Vec<LinkHandle> {
        self.ready_links_except(None)
    }

    pub fn bind_peer(&self, address: &LinkAddress, peer: PeerId) {
        let previous = self.peers.insert(address.clone(), peer);
        if previous != Some(peer) {
            debug!("{} is peer {}", address, peer);
        }
    }

    pub fn peer_for(&self, address: &LinkAddress) -> Option<PeerId> {
        self.peers.get(address).map(|p| *p)
    }

    /// Role of the registered link for an address, if any
    pub fn role_of(&self, address: &LinkAddress) -> Option<Role> {
        self.links.get(address).map(|l| l.handle.role)
    }
}

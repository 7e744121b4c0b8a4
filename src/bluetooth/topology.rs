//! Topology Directory
//!
//! The set of peer ids this node knows to be in the mesh, seeded with the
//! local id. Remote announcements are merged as unions; any merge that adds
//! a member (re)arms a debounce timer, and only a timer that fires without
//! being re-armed publishes the full set for re-announcement. Members are
//! never removed within a session.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::advertisement::{PresenceRecord, PresenceState};
use super::protocol::PeerId;

/// What is known about one mesh member beyond its id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub nickname: Option<String>,
    pub state: Option<PresenceState>,
    pub rssi: Option<i16>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl PeerInfo {
    fn new(peer_id: PeerId) -> Self {
        let now = Utc::now();
        Self {
            peer_id,
            nickname: None,
            state: None,
            rssi: None,
            first_seen: now,
            last_seen: now,
        }
    }

    pub fn display_name(&self) -> String {
        match &self.nickname {
            Some(nickname) => format!("{nickname} ({})", self.peer_id),
            None => self.peer_id.to_string(),
        }
    }
}

pub struct TopologyDirectory {
    local: PeerId,
    members: Mutex<BTreeSet<PeerId>>,
    details: Mutex<BTreeMap<PeerId, PeerInfo>>,
    capacity: usize,
    debounce: Duration,
    generation: AtomicU64,
    announce_tx: mpsc::UnboundedSender<Vec<PeerId>>,
}

impl TopologyDirectory {
    /// `announce_tx` receives the full set each time a debounced
    /// re-announcement is due.
    pub fn new(
        local: PeerId,
        debounce: Duration,
        capacity: usize,
        announce_tx: mpsc::UnboundedSender<Vec<PeerId>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            members: Mutex::new(BTreeSet::from([local])),
            details: Mutex::new(BTreeMap::new()),
            capacity: capacity.max(1),
            debounce,
            generation: AtomicU64::new(0),
            announce_tx,
        })
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    /// Union `remote` into the known set. Returns the newly learned ids;
    /// an empty result is a no-op that leaves any pending timer alone.
    pub fn merge(self: &Arc<Self>, remote: &[PeerId]) -> Vec<PeerId> {
        let added: Vec<PeerId> = {
            let mut members = self.members.lock();
            let mut added = Vec::new();
            for peer in remote.iter().filter(|p| !p.is_broadcast()) {
                if members.contains(peer) {
                    continue;
                }
                if members.len() >= self.capacity {
                    warn!("Topology full ({} peers), ignoring {}", self.capacity, peer);
                    continue;
                }
                members.insert(*peer);
                added.push(*peer);
            }
            added
        };

        if !added.is_empty() {
            info!("Learned {} new peer(s): {:?}", added.len(), added);
            self.arm_announcement();
        }
        added
    }

    fn arm_announcement(self: &Arc<Self>) {
        let armed = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let directory = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(directory.debounce).await;
            if directory.generation.load(Ordering::SeqCst) != armed {
                return;
            }
            let snapshot = directory.snapshot();
            debug!("Announcing {} known peers", snapshot.len());
            let _ = directory.announce_tx.send(snapshot);
        });
    }

    /// Full known set, local id included, in ascending order
    pub fn snapshot(&self) -> Vec<PeerId> {
        self.members.lock().iter().copied().collect()
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.members.lock().contains(&peer)
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    /// Record details from a presence record; membership is unaffected
    pub fn note_presence(&self, presence: &PresenceRecord, rssi: Option<i16>) {
        if presence.peer_id == self.local {
            return;
        }
        let mut details = self.details.lock();
        let info = details
            .entry(presence.peer_id)
            .or_insert_with(|| PeerInfo::new(presence.peer_id));
        info.nickname = Some(presence.nickname.clone());
        info.state = Some(presence.state);
        if rssi.is_some() {
            info.rssi = rssi;
        }
        info.last_seen = Utc::now();
    }

    /// Known remote members with whatever details have been seen
    pub fn peers(&self) -> Vec<PeerInfo> {
        let members = self.snapshot();
        let details = self.details.lock();
        members
            .into_iter()
            .filter(|p| *p != self.local)
            .map(|p| details.get(&p).cloned().unwrap_or_else(|| PeerInfo::new(p)))
            .collect()
    }

    /// Back to just the local id; cancels any pending announcement
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut members = self.members.lock();
        members.clear();
        members.insert(self.local);
        self.details.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory(local: u16) -> (Arc<TopologyDirectory>, mpsc::UnboundedReceiver<Vec<PeerId>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            TopologyDirectory::new(PeerId(local), Duration::from_millis(500), 64, tx),
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn seeded_with_local_id() {
        let (dir, _rx) = directory(0xa);
        assert_eq!(dir.snapshot(), vec![PeerId(0xa)]);
        assert!(dir.peers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn known_set_merge_never_announces() {
        let (dir, mut rx) = directory(0xa);
        assert!(dir.merge(&[PeerId(0xa)]).is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_merges_coalesce_into_one_announcement() {
        let (dir, mut rx) = directory(0xa);
        dir.merge(&[PeerId(0xb)]);
        tokio::time::sleep(Duration::from_millis(300)).await;
        dir.merge(&[PeerId(0xc)]);
        tokio::time::sleep(Duration::from_millis(300)).await;
        // known-only merge does not re-arm
        dir.merge(&[PeerId(0xb), PeerId(0xc)]);
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(rx.try_recv().unwrap(), vec![PeerId(0xa), PeerId(0xb), PeerId(0xc)]);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn membership_is_capped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let dir = TopologyDirectory::new(PeerId(0), Duration::from_millis(500), 3, tx);
        let added = dir.merge(&[PeerId(1), PeerId(2), PeerId(3)]);
        assert_eq!(added, vec![PeerId(1), PeerId(2)]);
        assert_eq!(dir.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_cancels_pending_announcement() {
        let (dir, mut rx) = directory(0xa);
        dir.merge(&[PeerId(0xb)]);
        dir.reset();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(dir.snapshot(), vec![PeerId(0xa)]);
    }

    #[tokio::test(start_paused = true)]
    async fn presence_details_show_in_peer_list() {
        let (dir, _rx) = directory(0xa);
        dir.merge(&[PeerId(0xb)]);
        dir.note_presence(
            &PresenceRecord {
                nickname: "bea".into(),
                peer_id: PeerId(0xb),
                state: PresenceState::Away,
            },
            Some(-55),
        );
        let peers = dir.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].nickname.as_deref(), Some("bea"));
        assert_eq!(peers[0].rssi, Some(-55));
        assert_eq!(peers[0].display_name(), "bea (000b)");
    }
}

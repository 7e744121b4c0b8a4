//! Relay Engine
//!
//! Flood relay for application traffic. A frame is classified once, against
//! the dedup cache, then either delivered, relayed to every Ready link except
//! the one it arrived on, or both. Send failures are logged per link and
//! never stop the rest of a fan-out.

use futures::future::join_all;
use log::{debug, warn};
use serde::Serialize;
use std::sync::Arc;

use super::dedup::{DedupCache, SeenFrameKey};
use crate::bluetooth::adapter::LinkAddress;
use crate::bluetooth::protocol::{Frame, FrameKind, PeerId};
use crate::bluetooth::registry::ConnectionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Seen within the TTL window, or our own frame echoed back
    Duplicate,
    /// Info frame for the topology directory; never forwarded verbatim
    Topology,
    /// Addressed to us; delivered and not relayed further
    DeliverLocally,
    /// Broadcast; delivered here and flooded onward
    DeliverAndRelay,
    /// Someone else's message; flooded onward only
    Relay,
}

impl RouteDecision {
    pub fn delivers(&self) -> bool {
        matches!(self, RouteDecision::DeliverLocally | RouteDecision::DeliverAndRelay)
    }

    pub fn relays(&self) -> bool {
        matches!(self, RouteDecision::DeliverAndRelay | RouteDecision::Relay)
    }
}

/// Outcome of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FanOutReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

pub struct RelayEngine {
    local: PeerId,
    dedup: Arc<DedupCache>,
    registry: Arc<ConnectionRegistry>,
}

impl RelayEngine {
    pub fn new(local: PeerId, dedup: Arc<DedupCache>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            local,
            dedup,
            registry,
        }
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    /// Classify an inbound frame, recording it as seen
    pub fn route(&self, frame: &Frame, from: &LinkAddress) -> RouteDecision {
        if frame.header.sender == self.local {
            debug!("Dropping echo of our own {} from {}", frame.header.message_id, from);
            return RouteDecision::Duplicate;
        }
        if !self
            .dedup
            .check_and_insert(SeenFrameKey::for_frame(frame, Some(from)))
        {
            debug!(
                "Duplicate {:?} {} part {} from {}",
                frame.kind(),
                frame.header.message_id,
                frame.header.chunk_index,
                from
            );
            return RouteDecision::Duplicate;
        }

        match frame.kind() {
            FrameKind::Info => RouteDecision::Topology,
            FrameKind::AppMessage | FrameKind::ChunkedPart => {
                let recipient = frame.header.recipient;
                if recipient == self.local {
                    RouteDecision::DeliverLocally
                } else if recipient.is_broadcast() {
                    RouteDecision::DeliverAndRelay
                } else {
                    RouteDecision::Relay
                }
            }
        }
    }

    /// Mark a locally originated frame as seen so echoes are suppressed
    pub fn record_local(&self, frame: &Frame) {
        self.dedup.check_and_insert(SeenFrameKey::for_frame(frame, None));
    }

    /// Send `bytes` on every Ready link except `exclude`, one task per link
    pub async fn fan_out(&self, bytes: &[u8], exclude: Option<&LinkAddress>) -> FanOutReport {
        let targets = self.registry.ready_links_except(exclude);
        if targets.is_empty() {
            return FanOutReport::default();
        }

        let bytes: Arc<[u8]> = Arc::from(bytes);
        let sends = targets.into_iter().map(|link| {
            let adapter = self.registry.adapter().clone();
            let bytes = bytes.clone();
            tokio::spawn(async move {
                match adapter.send_frame(&link, &bytes).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Relay to {} failed: {}", link.address, e);
                        false
                    }
                }
            })
        });

        let results = join_all(sends).await;
        let mut report = FanOutReport {
            attempted: results.len(),
            ..FanOutReport::default()
        };
        for result in results {
            match result {
                Ok(true) => report.delivered += 1,
                _ => report.failed += 1,
            }
        }
        debug!(
            "Fan-out: {}/{} delivered, {} failed",
            report.delivered, report.attempted, report.failed
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::adapter::LinkAdapter;
    use crate::bluetooth::memory::MemoryMedium;
    use crate::bluetooth::protocol::MessageId;
    use crate::bluetooth::registry::RegistryConfig;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn engine(local: u16) -> RelayEngine {
        let medium = MemoryMedium::new();
        let adapter = medium.attach(LinkAddress::from("self"));
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ConnectionRegistry::new(adapter, RegistryConfig::default(), tx));
        RelayEngine::new(
            PeerId(local),
            Arc::new(DedupCache::new(Duration::from_secs(5), 1000)),
            registry,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn classification() {
        let relay = engine(0xa);
        let from = LinkAddress::from("x");

        let to_us = Frame::app_message(PeerId(0xb), PeerId(0xa), MessageId(1), vec![]);
        assert_eq!(relay.route(&to_us, &from), RouteDecision::DeliverLocally);
        assert_eq!(relay.route(&to_us, &from), RouteDecision::Duplicate);

        let everyone = Frame::app_message(PeerId(0xb), PeerId::BROADCAST, MessageId(2), vec![]);
        assert_eq!(relay.route(&everyone, &from), RouteDecision::DeliverAndRelay);

        let other = Frame::app_message(PeerId(0xb), PeerId(0xc), MessageId(3), vec![]);
        assert_eq!(relay.route(&other, &from), RouteDecision::Relay);

        let info = Frame::info(PeerId(0xb), MessageId(4), &[PeerId(0xb)]);
        assert_eq!(relay.route(&info, &from), RouteDecision::Topology);

        let echo = Frame::app_message(PeerId(0xa), PeerId(0xc), MessageId(5), vec![]);
        assert_eq!(relay.route(&echo, &from), RouteDecision::Duplicate);
    }

    #[tokio::test(start_paused = true)]
    async fn locally_recorded_frames_are_duplicates() {
        let relay = engine(0xa);
        let frame = Frame::app_message(PeerId(0xb), PeerId(0xc), MessageId(6), vec![]);
        relay.record_local(&frame);
        assert_eq!(relay.route(&frame, &LinkAddress::from("x")), RouteDecision::Duplicate);
    }

    #[tokio::test(start_paused = true)]
    async fn fan_out_skips_arrival_link_and_survives_failures() {
        let medium = MemoryMedium::new();
        let hub = medium.attach(LinkAddress::from("hub"));
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ConnectionRegistry::new(hub, RegistryConfig::default(), tx));
        for name in ["p", "q", "r"] {
            let node = medium.attach(LinkAddress::from(name));
            node.accept_incoming().await.unwrap();
            registry.connect(&LinkAddress::from(name)).await.unwrap();
        }
        let relay = RelayEngine::new(
            PeerId(1),
            Arc::new(DedupCache::new(Duration::from_secs(5), 100)),
            registry,
        );
        medium.fail_writes_to(&LinkAddress::from("r"), true);

        let report = relay.fan_out(b"frame", Some(&LinkAddress::from("p"))).await;
        assert_eq!(
            report,
            FanOutReport {
                attempted: 2,
                delivered: 1,
                failed: 1
            }
        );
        let hub = LinkAddress::from("hub");
        assert!(medium.sent_between(&hub, &LinkAddress::from("p")).is_empty());
        assert_eq!(medium.sent_between(&hub, &LinkAddress::from("q")).len(), 1);
    }
}

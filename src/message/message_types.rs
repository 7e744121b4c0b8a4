//! Message Type Definitions
//!
//! Application-level messages and the events the session reports upward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bluetooth::adapter::LinkAddress;
use crate::bluetooth::protocol::{MessageId, PeerId};
use crate::bluetooth::registry::LinkState;
use crate::bluetooth::topology::PeerInfo;
use crate::proximity::DistanceBucket;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Broadcast, // Addressed to 0xFFFF
    Direct,    // Addressed to one peer
}

impl MessageKind {
    pub fn for_recipient(recipient: PeerId) -> Self {
        if recipient.is_broadcast() {
            MessageKind::Broadcast
        } else {
            MessageKind::Direct
        }
    }
}

/// A message delivered to this node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub sender: PeerId,
    pub recipient: PeerId,
    pub kind: MessageKind,
    pub content: String,
    pub received_at: DateTime<Utc>,
    /// Link the last frame arrived on; `None` for self-addressed sends
    pub via: Option<LinkAddress>,
}

impl ReceivedMessage {
    pub fn new(
        message_id: MessageId,
        sender: PeerId,
        recipient: PeerId,
        payload: &[u8],
        via: Option<LinkAddress>,
    ) -> Self {
        Self {
            message_id,
            sender,
            recipient,
            kind: MessageKind::for_recipient(recipient),
            content: String::from_utf8_lossy(payload).into_owned(),
            received_at: Utc::now(),
            via,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Record handed to the message store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub sender: PeerId,
    pub recipient: PeerId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
}

impl StoredMessage {
    pub fn outgoing(message_id: MessageId, sender: PeerId, recipient: PeerId, content: &str) -> Self {
        Self {
            message_id,
            sender,
            recipient,
            content: content.to_string(),
            timestamp: Utc::now(),
            direction: Direction::Outgoing,
        }
    }

    /// Whether `peer` took part in this message, either end
    pub fn involves(&self, peer: PeerId) -> bool {
        self.sender == peer || self.recipient == peer
    }
}

impl From<&ReceivedMessage> for StoredMessage {
    fn from(message: &ReceivedMessage) -> Self {
        Self {
            message_id: message.message_id,
            sender: message.sender,
            recipient: message.recipient,
            content: message.content.clone(),
            timestamp: message.received_at,
            direction: Direction::Incoming,
        }
    }
}

/// Events delivered to the UI sink
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MeshEvent {
    PeerListChanged(Vec<PeerInfo>),
    MessageReceived(ReceivedMessage),
    ConnectionStateChanged {
        address: LinkAddress,
        peer: Option<PeerId>,
        state: LinkState,
    },
    AdapterAvailability(bool),
    ProximityChanged {
        peer: PeerId,
        bucket: DistanceBucket,
        call_available: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_and_direct_kinds() {
        let message = ReceivedMessage::new(MessageId(1), PeerId(2), PeerId::BROADCAST, b"hey", None);
        assert_eq!(message.kind, MessageKind::Broadcast);
        assert_eq!(message.content, "hey");

        let message = ReceivedMessage::new(MessageId(1), PeerId(2), PeerId(3), &[0xff, b'a'], None);
        assert_eq!(message.kind, MessageKind::Direct);
        assert_eq!(message.content, "\u{fffd}a");
    }

    #[test]
    fn stored_record_keeps_both_ends() {
        let received = ReceivedMessage::new(MessageId(9), PeerId(2), PeerId(3), b"x", None);
        let stored = StoredMessage::from(&received);
        assert_eq!(stored.direction, Direction::Incoming);
        assert!(stored.involves(PeerId(2)));
        assert!(stored.involves(PeerId(3)));
        assert!(!stored.involves(PeerId(4)));
    }
}

//! Mesh Wire Protocol
//!
//! Binary frame format for Bluetooth LE links. Every frame starts with a
//! fixed 15-byte header:
//!
//! ```text
//! type(1) | recipient(2) | sender(2) | chunkIndex(1) | totalChunks(1) | messageId(8, BE)
//! ```
//!
//! followed by the payload. Messages that do not fit in one write are split
//! into `ChunkedPart` frames by [`MessageCodec`].

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::delimited;
use crate::error::CodecError;

/// Primary GATT service for the mesh
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xF47B5E2D_4A9E_4C5A_9B3F_8E1D2C3A4B5C);

/// Read/write/notify characteristic carrying frame bytes
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xA1B2C3D4_E5F6_4A5B_8C9D_0E1F2A3B4C5D);

/// Standard Client Characteristic Configuration descriptor (0x2902)
pub const CLIENT_CONFIG_DESCRIPTOR_UUID: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805F9B34FB);

/// Size of the binary frame header in bytes
pub const HEADER_LEN: usize = 15;

/// Smallest usable write: a header plus one announced peer id
pub const MIN_WRITE_SIZE: usize = HEADER_LEN + 2;

/// A message may be split into at most this many chunks
pub const MAX_CHUNKS: usize = u8::MAX as usize;

/// Default max write size (185-byte ATT MTU minus the 3-byte ATT header)
pub const DEFAULT_MAX_WRITE_SIZE: usize = 182;

/// Logical identifier of a mesh participant.
///
/// This is the short id carried in presence records and in the 2-byte
/// sender/recipient fields of the header. `0xFFFF` addresses everyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u16);

impl PeerId {
    pub const BROADCAST: PeerId = PeerId(0xFFFF);

    /// Random id for a new session; never the broadcast id
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        PeerId(rng.gen_range(0..0xFFFF))
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; 2]) -> Self {
        PeerId(u16::from_be_bytes(bytes))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.len() > 4 {
            return Err(CodecError::malformed(format!("invalid peer id: {s:?}")));
        }
        u16::from_str_radix(s, 16)
            .map(PeerId)
            .map_err(|_| CodecError::malformed(format!("invalid peer id: {s:?}")))
    }
}

/// Identifier shared by every chunk of one message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl MessageId {
    pub fn random() -> Self {
        MessageId(rand::random())
    }

    /// Deterministic id derived from content, for frames that carry none
    pub fn from_content(content: &[u8]) -> Self {
        let digest = Sha256::digest(content);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        MessageId(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Frame kind, first byte of every binary frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    Info = 0x01,        // Topology announcement
    AppMessage = 0x02,  // Whole application message
    ChunkedPart = 0x03, // One part of a split application message
}

impl TryFrom<u8> for FrameKind {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Info),
            0x02 => Ok(FrameKind::AppMessage),
            0x03 => Ok(FrameKind::ChunkedPart),
            other => Err(CodecError::malformed(format!(
                "unknown frame type 0x{other:02x}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub recipient: PeerId,
    pub sender: PeerId,
    pub chunk_index: u8,
    pub total_chunks: u8,
    pub message_id: MessageId,
}

/// Unit of protocol data exchanged over a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Topology announcement carrying a set of known peers
    pub fn info(sender: PeerId, message_id: MessageId, peers: &[PeerId]) -> Self {
        let payload = peers.iter().flat_map(|p| p.to_bytes()).collect();
        Self {
            header: FrameHeader {
                kind: FrameKind::Info,
                recipient: PeerId::BROADCAST,
                sender,
                chunk_index: 0,
                total_chunks: 1,
                message_id,
            },
            payload,
        }
    }

    /// Application message that fits in a single frame
    pub fn app_message(
        sender: PeerId,
        recipient: PeerId,
        message_id: MessageId,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            header: FrameHeader {
                kind: FrameKind::AppMessage,
                recipient,
                sender,
                chunk_index: 0,
                total_chunks: 1,
                message_id,
            },
            payload,
        }
    }

    pub fn kind(&self) -> FrameKind {
        self.header.kind
    }

    /// AppMessage and ChunkedPart frames are application traffic and get flooded
    pub fn is_app_traffic(&self) -> bool {
        matches!(self.header.kind, FrameKind::AppMessage | FrameKind::ChunkedPart)
    }

    /// Encode to the binary wire format
    pub fn encode(&self) -> Vec<u8> {
        let h = &self.header;
        let mut buffer = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buffer.push(h.kind as u8);
        buffer.extend_from_slice(&h.recipient.to_bytes());
        buffer.extend_from_slice(&h.sender.to_bytes());
        buffer.push(h.chunk_index);
        buffer.push(h.total_chunks);
        buffer.extend_from_slice(&h.message_id.0.to_be_bytes());
        buffer.extend_from_slice(&self.payload);
        buffer
    }

    /// Decode from wire bytes. Delimited text frames are recognised by their
    /// ASCII type prefix; everything else must be a binary frame.
    pub fn decode(data: &[u8]) -> Result<Frame, CodecError> {
        if delimited::is_delimited(data) {
            return delimited::decode(data);
        }

        if data.len() < HEADER_LEN {
            return Err(CodecError::malformed(format!(
                "frame too short: {} bytes",
                data.len()
            )));
        }

        let kind = FrameKind::try_from(data[0])?;
        let recipient = PeerId::from_bytes([data[1], data[2]]);
        let sender = PeerId::from_bytes([data[3], data[4]]);
        let chunk_index = data[5];
        let total_chunks = data[6];
        let mut id = [0u8; 8];
        id.copy_from_slice(&data[7..HEADER_LEN]);
        let message_id = MessageId(u64::from_be_bytes(id));

        if total_chunks == 0 || chunk_index >= total_chunks {
            return Err(CodecError::malformed(format!(
                "chunk index {chunk_index} out of range for {total_chunks} chunks"
            )));
        }
        if kind != FrameKind::ChunkedPart && total_chunks != 1 {
            return Err(CodecError::malformed(format!(
                "{kind:?} frame claims {total_chunks} chunks"
            )));
        }

        let payload = data[HEADER_LEN..].to_vec();
        if kind == FrameKind::Info && payload.len() % 2 != 0 {
            return Err(CodecError::malformed("odd-length peer list"));
        }

        Ok(Frame {
            header: FrameHeader {
                kind,
                recipient,
                sender,
                chunk_index,
                total_chunks,
                message_id,
            },
            payload,
        })
    }

    /// Peer ids carried by an Info frame
    pub fn announced_peers(&self) -> Vec<PeerId> {
        if self.header.kind != FrameKind::Info {
            return Vec::new();
        }
        self.payload
            .chunks_exact(2)
            .map(|pair| PeerId::from_bytes([pair[0], pair[1]]))
            .collect()
    }
}

/// Splits outgoing messages into frames bounded by the transport's max write size
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_write_size: usize,
    text_framing: bool,
}

impl MessageCodec {
    pub fn new(max_write_size: usize) -> Result<Self, CodecError> {
        if max_write_size < MIN_WRITE_SIZE {
            return Err(CodecError::MessageTooLarge {
                size: MIN_WRITE_SIZE,
                max: max_write_size,
            });
        }
        Ok(Self {
            max_write_size,
            text_framing: false,
        })
    }

    /// Emit Info and single-frame AppMessage frames in delimited text form
    pub fn with_text_framing(mut self, enabled: bool) -> Self {
        self.text_framing = enabled;
        self
    }

    pub fn max_write_size(&self) -> usize {
        self.max_write_size
    }

    /// Payload bytes that fit in one frame after the header
    pub fn chunk_payload_size(&self) -> usize {
        self.max_write_size - HEADER_LEN
    }

    /// Largest payload that can be sent at all
    pub fn max_message_size(&self) -> usize {
        self.chunk_payload_size() * MAX_CHUNKS
    }

    /// Split an application payload into one AppMessage frame or a run of
    /// ChunkedPart frames sharing `message_id`.
    pub fn encode_message(
        &self,
        sender: PeerId,
        recipient: PeerId,
        message_id: MessageId,
        payload: &[u8],
    ) -> Result<Vec<Frame>, CodecError> {
        if self.text_framing {
            let id = delimited::app_message_id(recipient, sender, payload);
            let frame = Frame::app_message(sender, recipient, id, payload.to_vec());
            if let Ok(text) = delimited::encode(&frame) {
                if text.len() <= self.max_write_size {
                    return Ok(vec![frame]);
                }
            }
        }

        let chunk_size = self.chunk_payload_size();
        if payload.len() <= chunk_size {
            return Ok(vec![Frame::app_message(
                sender,
                recipient,
                message_id,
                payload.to_vec(),
            )]);
        }

        let total = payload.len().div_ceil(chunk_size);
        if total > MAX_CHUNKS {
            return Err(CodecError::MessageTooLarge {
                size: payload.len(),
                max: self.max_message_size(),
            });
        }

        let frames = payload
            .chunks(chunk_size)
            .enumerate()
            .map(|(index, part)| Frame {
                header: FrameHeader {
                    kind: FrameKind::ChunkedPart,
                    recipient,
                    sender,
                    chunk_index: index as u8,
                    total_chunks: total as u8,
                    message_id,
                },
                payload: part.to_vec(),
            })
            .collect();
        Ok(frames)
    }

    /// Full-state announcement, split over several Info frames when the set
    /// is larger than one write. Each part is a valid announcement on its own.
    pub fn encode_announcement(&self, sender: PeerId, peers: &[PeerId]) -> Vec<Frame> {
        let per_frame = self.chunk_payload_size() / 2;
        if peers.is_empty() {
            return vec![Frame::info(sender, MessageId::random(), &[sender])];
        }
        peers
            .chunks(per_frame)
            .map(|part| Frame::info(sender, MessageId::random(), part))
            .collect()
    }

    /// Wire bytes for a frame, honouring the text framing switch when the
    /// frame has a text form that fits in one write.
    pub fn to_wire(&self, frame: &Frame) -> Vec<u8> {
        if self.text_framing && frame.kind() != FrameKind::ChunkedPart {
            if let Ok(text) = delimited::encode(frame) {
                if text.len() <= self.max_write_size {
                    return text;
                }
            }
        }
        frame.encode()
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self {
            max_write_size: DEFAULT_MAX_WRITE_SIZE,
            text_framing: false,
        }
    }
}

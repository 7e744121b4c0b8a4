//! Delimited text framing
//!
//! Human-readable frames kept for interoperability with older nodes:
//!
//! ```text
//! INFO§SRC|PEER1,PEER2,...
//! APP§DEST|SRC|PAYLOAD
//! ```
//!
//! Text frames carry no message id, so APP frames get one derived from their
//! content. Chunked parts have no text form.

use super::protocol::{Frame, FrameKind, MessageId, PeerId};
use crate::error::CodecError;

const INFO_PREFIX: &[u8] = "INFO§".as_bytes();
const APP_PREFIX: &[u8] = "APP§".as_bytes();
const FIELD: u8 = b'|';

pub fn is_delimited(data: &[u8]) -> bool {
    data.starts_with(INFO_PREFIX) || data.starts_with(APP_PREFIX)
}

/// Id for a text APP frame, stable across every node that sees it
pub fn app_message_id(recipient: PeerId, sender: PeerId, payload: &[u8]) -> MessageId {
    MessageId::from_content(&app_content(recipient, sender, payload))
}

fn app_content(recipient: PeerId, sender: PeerId, payload: &[u8]) -> Vec<u8> {
    let mut content = format!("{recipient}|{sender}|").into_bytes();
    content.extend_from_slice(payload);
    content
}

pub fn encode(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    match frame.kind() {
        FrameKind::Info => {
            let peers: Vec<String> = frame
                .announced_peers()
                .iter()
                .map(PeerId::to_string)
                .collect();
            let mut out = INFO_PREFIX.to_vec();
            out.extend_from_slice(format!("{}|{}", frame.header.sender, peers.join(",")).as_bytes());
            Ok(out)
        }
        FrameKind::AppMessage => {
            let mut out = APP_PREFIX.to_vec();
            out.extend(app_content(
                frame.header.recipient,
                frame.header.sender,
                &frame.payload,
            ));
            Ok(out)
        }
        FrameKind::ChunkedPart => Err(CodecError::malformed(
            "chunked parts have no delimited form",
        )),
    }
}

pub fn decode(data: &[u8]) -> Result<Frame, CodecError> {
    if let Some(content) = data.strip_prefix(INFO_PREFIX) {
        let content = std::str::from_utf8(content)
            .map_err(|_| CodecError::malformed("INFO frame is not UTF-8"))?;
        let (sender, list) = content
            .split_once('|')
            .ok_or_else(|| CodecError::malformed("INFO frame missing peer list"))?;
        let sender: PeerId = sender.parse()?;
        let peers = list
            .split(',')
            .filter(|p| !p.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<PeerId>, _>>()?;
        return Ok(Frame::info(sender, MessageId::from_content(data), &peers));
    }

    if let Some(content) = data.strip_prefix(APP_PREFIX) {
        let mut fields = content.splitn(3, |b| *b == FIELD);
        let recipient = parse_field(fields.next())?;
        let sender = parse_field(fields.next())?;
        let payload = fields
            .next()
            .ok_or_else(|| CodecError::malformed("APP frame missing payload"))?
            .to_vec();
        let id = app_message_id(recipient, sender, &payload);
        return Ok(Frame::app_message(sender, recipient, id, payload));
    }

    Err(CodecError::malformed("unknown delimited frame type"))
}

fn parse_field(field: Option<&[u8]>) -> Result<PeerId, CodecError> {
    let field = field.ok_or_else(|| CodecError::malformed("APP frame missing field"))?;
    std::str::from_utf8(field)
        .map_err(|_| CodecError::malformed("peer id is not UTF-8"))?
        .parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_frame_text_form() {
        let frame = Frame::app_message(PeerId(0x00a1), PeerId(0x00b2), MessageId(0), b"hi|there".to_vec());
        let text = encode(&frame).unwrap();
        assert_eq!(String::from_utf8(text.clone()).unwrap(), "APP§00b2|00a1|hi|there");

        let decoded = Frame::decode(&text).unwrap();
        assert_eq!(decoded.kind(), FrameKind::AppMessage);
        assert_eq!(decoded.header.sender, PeerId(0x00a1));
        assert_eq!(decoded.header.recipient, PeerId(0x00b2));
        assert_eq!(decoded.payload, b"hi|there");
        assert_eq!(
            decoded.header.message_id,
            app_message_id(PeerId(0x00b2), PeerId(0x00a1), b"hi|there")
        );
    }

    #[test]
    fn info_frame_text_form() {
        let frame = Frame::info(PeerId(1), MessageId(7), &[PeerId(1), PeerId(0xbeef)]);
        let text = encode(&frame).unwrap();
        assert_eq!(String::from_utf8(text.clone()).unwrap(), "INFO§0001|0001,beef");
        let decoded = decode(&text).unwrap();
        assert_eq!(decoded.announced_peers(), vec![PeerId(1), PeerId(0xbeef)]);
    }

    #[test]
    fn malformed_text_frames() {
        assert!(decode("APP§00b2".as_bytes()).is_err());
        assert!(decode("INFO§0001".as_bytes()).is_err());
        assert!(decode("INFO§0001|nothex".as_bytes()).is_err());
    }

    #[test]
    fn chunked_part_has_no_text_form() {
        let mut frame = Frame::app_message(PeerId(1), PeerId(2), MessageId(3), vec![]);
        frame.header.kind = FrameKind::ChunkedPart;
        assert!(encode(&frame).is_err());
    }
}

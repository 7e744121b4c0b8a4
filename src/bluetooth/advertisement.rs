//! Advertisement payloads
//!
//! Vendor records in the manufacturer-data field of the BLE advertisement,
//! one manufacturer id per logical stream.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::protocol::PeerId;
use crate::error::CodecError;
use crate::proximity::Coordinates;

/// Manufacturer id for presence records
pub const PRESENCE_MANUFACTURER_ID: u16 = 0xFFF0;

/// Manufacturer id for location records
pub const LOCATION_MANUFACTURER_ID: u16 = 0xFFF1;

/// Longest nickname placed in a presence record, in bytes
pub const MAX_ADVERTISED_NICKNAME: usize = 16;

/// Location values are fixed-point with this many units per degree
const LOCATION_SCALE: f64 = 1_000.0;

/// Manufacturer records to advertise
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    pub records: HashMap<u16, Vec<u8>>,
}

impl Advertisement {
    pub fn new(presence: &PresenceRecord, location: Option<&LocationRecord>) -> Self {
        let mut records = HashMap::new();
        records.insert(PRESENCE_MANUFACTURER_ID, presence.encode());
        if let Some(location) = location {
            records.insert(LOCATION_MANUFACTURER_ID, location.encode().to_vec());
        }
        Self { records }
    }

    /// Parse the records we understand out of discovered manufacturer data.
    /// Unparseable records are ignored.
    pub fn parse(manufacturer_data: &HashMap<u16, Vec<u8>>) -> (Option<PresenceRecord>, Option<LocationRecord>) {
        let presence = manufacturer_data
            .get(&PRESENCE_MANUFACTURER_ID)
            .and_then(|bytes| PresenceRecord::decode(bytes).ok());
        let location = manufacturer_data
            .get(&LOCATION_MANUFACTURER_ID)
            .and_then(|bytes| LocationRecord::decode(bytes).ok());
        (presence, location)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Available,
    Busy,
    Away,
}

impl PresenceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceState::Available => "available",
            PresenceState::Busy => "busy",
            PresenceState::Away => "away",
        }
    }
}

impl fmt::Display for PresenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresenceState {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(PresenceState::Available),
            "busy" => Ok(PresenceState::Busy),
            "away" => Ok(PresenceState::Away),
            other => Err(CodecError::malformed(format!("unknown presence state {other:?}"))),
        }
    }
}

/// `nickname#shortId,state`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub nickname: String,
    pub peer_id: PeerId,
    pub state: PresenceState,
}

impl PresenceRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut nickname = self.nickname.as_str();
        if nickname.len() > MAX_ADVERTISED_NICKNAME {
            let mut end = MAX_ADVERTISED_NICKNAME;
            while !nickname.is_char_boundary(end) {
                end -= 1;
            }
            nickname = &nickname[..end];
        }
        format!("{}#{},{}", nickname, self.peer_id, self.state).into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| CodecError::malformed("presence record is not UTF-8"))?;
        let (identity, state) = text
            .rsplit_once(',')
            .ok_or_else(|| CodecError::malformed("presence record missing state"))?;
        let (nickname, peer_id) = identity
            .rsplit_once('#')
            .ok_or_else(|| CodecError::malformed("presence record missing short id"))?;
        Ok(Self {
            nickname: nickname.to_string(),
            peer_id: peer_id.parse()?,
            state: state.parse()?,
        })
    }
}

/// Two big-endian i32 milli-degree values: latitude then longitude
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationRecord {
    pub coordinates: Coordinates,
}

impl LocationRecord {
    pub fn encode(&self) -> [u8; 8] {
        let lat = (self.coordinates.latitude * LOCATION_SCALE).round() as i32;
        let lon = (self.coordinates.longitude * LOCATION_SCALE).round() as i32;
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&lat.to_be_bytes());
        out[4..].copy_from_slice(&lon.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() != 8 {
            return Err(CodecError::malformed(format!(
                "location record must be 8 bytes, got {}",
                bytes.len()
            )));
        }
        let lat = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let lon = i32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(Self {
            coordinates: Coordinates {
                latitude: lat as f64 / LOCATION_SCALE,
                longitude: lon as f64 / LOCATION_SCALE,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_record_text() {
        let record = PresenceRecord {
            nickname: "alice#2".to_string(),
            peer_id: PeerId(0x1a2b),
            state: PresenceState::Busy,
        };
        let bytes = record.encode();
        assert_eq!(bytes, b"alice#2#1a2b,busy");
        assert_eq!(PresenceRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn long_nicknames_are_truncated() {
        let record = PresenceRecord {
            nickname: "ééééééééééé".to_string(), // 22 bytes
            peer_id: PeerId(1),
            state: PresenceState::Available,
        };
        let decoded = PresenceRecord::decode(&record.encode()).unwrap();
        assert!(decoded.nickname.len() <= MAX_ADVERTISED_NICKNAME);
        assert_eq!(decoded.peer_id, PeerId(1));
    }

    #[test]
    fn location_record_is_milli_degree_fixed_point() {
        let record = LocationRecord {
            coordinates: Coordinates {
                latitude: 52.52,
                longitude: -13.405,
            },
        };
        let bytes = record.encode();
        assert_eq!(&bytes[..4], &52_520i32.to_be_bytes());
        assert_eq!(&bytes[4..], &(-13_405i32).to_be_bytes());
        let decoded = LocationRecord::decode(&bytes).unwrap();
        assert!((decoded.coordinates.latitude - 52.52).abs() < 1e-9);
        assert!(LocationRecord::decode(&bytes[..7]).is_err());
    }

    #[test]
    fn parse_ignores_garbage() {
        let mut data = HashMap::new();
        data.insert(PRESENCE_MANUFACTURER_ID, b"no-separators".to_vec());
        data.insert(LOCATION_MANUFACTURER_ID, vec![1, 2, 3]);
        assert_eq!(Advertisement::parse(&data), (None, None));
    }
}

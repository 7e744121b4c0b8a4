//! Error Types
//!
//! Typed failures for the link, codec and configuration layers. Per-link and
//! per-frame errors are recoverable; only `AdapterUnavailable` stops new
//! radio operations until the adapter comes back.

use thiserror::Error;

use crate::bluetooth::adapter::{LinkAddress, Role};
use crate::bluetooth::registry::LinkState;

/// Failures raised by the link layer and the connection registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("Bluetooth adapter unavailable")]
    AdapterUnavailable,

    #[error("Connect to {address} failed: {reason}")]
    ConnectFailed { address: LinkAddress, reason: String },

    #[error("Write to {address} failed: {reason}")]
    WriteFailed { address: LinkAddress, reason: String },

    #[error("Subscription on {address} failed: {reason}")]
    SubscriptionFailed { address: LinkAddress, reason: String },

    #[error("{0:?} role is not supported by this adapter")]
    RoleUnsupported(Role),

    #[error("{0} already has a link")]
    AlreadyLinked(LinkAddress),

    #[error("{0} has no link")]
    NotLinked(LinkAddress),

    #[error("Invalid link transition {from:?} -> {to:?}")]
    InvalidTransition { from: LinkState, to: LinkState },
}

impl LinkError {
    pub fn connect_failed(address: &LinkAddress, reason: impl ToString) -> Self {
        LinkError::ConnectFailed {
            address: address.clone(),
            reason: reason.to_string(),
        }
    }

    pub fn write_failed(address: &LinkAddress, reason: impl ToString) -> Self {
        LinkError::WriteFailed {
            address: address.clone(),
            reason: reason.to_string(),
        }
    }

    pub fn subscription_failed(address: &LinkAddress, reason: impl ToString) -> Self {
        LinkError::SubscriptionFailed {
            address: address.clone(),
            reason: reason.to_string(),
        }
    }

    /// Whether the registry may retry the operation that produced this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LinkError::ConnectFailed { .. } | LinkError::SubscriptionFailed { .. }
        )
    }
}

/// Failures raised while encoding or decoding frames
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

impl CodecError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        CodecError::MalformedFrame(reason.into())
    }
}

/// Failures while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Failures reported by a message store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Message store unavailable: {0}")]
    Unavailable(String),

    #[error("Message store rejected record: {0}")]
    Rejected(String),
}

/// Errors surfaced to callers of the mesh session
#[derive(Debug, Error)]
pub enum MeshError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Mesh session is not running")]
    NotRunning,

    #[error("Mesh transport is not usable right now")]
    TransportUnusable,
}

pub type MeshResult<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        let addr = LinkAddress::from("aa");
        assert!(LinkError::connect_failed(&addr, "timeout").is_retryable());
        assert!(LinkError::subscription_failed(&addr, "gatt").is_retryable());
        assert!(!LinkError::write_failed(&addr, "gone").is_retryable());
        assert!(!LinkError::AdapterUnavailable.is_retryable());
    }

    #[test]
    fn messages_name_the_address() {
        let err = LinkError::connect_failed(&LinkAddress::from("AA:BB"), "refused");
        assert_eq!(err.to_string(), "Connect to AA:BB failed: refused");
    }
}

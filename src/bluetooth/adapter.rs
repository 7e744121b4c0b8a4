//! Link Layer Adapter
//!
//! Uniform surface over the two roles every node plays at once: the client
//! role (scan, connect, write, subscribe) and the server role (advertise,
//! accept, notify). Completion of asynchronous radio work is reported either
//! by the returned future or as an [`AdapterEvent`]. The adapter never
//! retries; that policy lives in the connection registry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::advertisement::Advertisement;
use crate::error::LinkError;

/// Transient physical radio address of a discovered peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkAddress(String);

impl LinkAddress {
    pub fn new(address: impl Into<String>) -> Self {
        LinkAddress(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LinkAddress {
    fn from(value: &str) -> Self {
        LinkAddress(value.to_string())
    }
}

impl From<String> for LinkAddress {
    fn from(value: String) -> Self {
        LinkAddress(value)
    }
}

impl fmt::Display for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of the physical connection the local node is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    OutgoingClient,
    IncomingServer,
}

/// One physical connection: remote address plus the local role on it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkHandle {
    pub address: LinkAddress,
    pub role: Role,
}

impl LinkHandle {
    pub fn client(address: LinkAddress) -> Self {
        Self {
            address,
            role: Role::OutgoingClient,
        }
    }

    pub fn server(address: LinkAddress) -> Self {
        Self {
            address,
            role: Role::IncomingServer,
        }
    }
}

/// Scan filter: only peers advertising this service are reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFilter {
    pub service_uuid: Uuid,
}

impl Default for DiscoveryFilter {
    fn default() -> Self {
        Self {
            service_uuid: super::protocol::SERVICE_UUID,
        }
    }
}

/// Events emitted by an adapter
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// A peer advertising the mesh service was seen
    Discovered {
        address: LinkAddress,
        rssi: Option<i16>,
        manufacturer_data: HashMap<u16, Vec<u8>>,
    },
    /// A remote client connected to our server role
    IncomingConnected { address: LinkAddress },
    /// A physical connection went away
    Disconnected { link: LinkHandle },
    /// Frame bytes arrived on a connection
    FrameReceived { link: LinkHandle, bytes: Vec<u8> },
    /// The radio was switched off or came back
    AvailabilityChanged { available: bool },
}

#[async_trait]
pub trait LinkAdapter: Send + Sync {
    /// Largest single write the transport accepts
    fn max_write_size(&self) -> usize;

    /// Event stream; can be taken once per adapter
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<AdapterEvent>>;

    async fn start_advertise(&self, advertisement: &Advertisement) -> Result<(), LinkError>;

    async fn stop_advertise(&self) -> Result<(), LinkError>;

    async fn start_discovery(&self, filter: &DiscoveryFilter) -> Result<(), LinkError>;

    async fn stop_discovery(&self) -> Result<(), LinkError>;

    /// Open the server role so remote clients can connect
    async fn accept_incoming(&self) -> Result<(), LinkError>;

    /// Resolves once the client connection is up
    async fn connect(&self, address: &LinkAddress) -> Result<(), LinkError>;

    /// Resolves when the platform reports the new connection as stable.
    /// Adapters without such a signal wait `fallback`.
    async fn wait_connection_stable(
        &self,
        _address: &LinkAddress,
        fallback: Duration,
    ) -> Result<(), LinkError> {
        tokio::time::sleep(fallback).await;
        Ok(())
    }

    async fn discover_services(&self, address: &LinkAddress) -> Result<(), LinkError>;

    async fn subscribe_notifications(&self, address: &LinkAddress) -> Result<(), LinkError>;

    /// Server role: resolves when the remote client has subscribed to
    /// notifications. Adapters without such a signal wait `settle`.
    async fn wait_subscribed(
        &self,
        _address: &LinkAddress,
        settle: Duration,
    ) -> Result<(), LinkError> {
        tokio::time::sleep(settle).await;
        Ok(())
    }

    async fn send_frame(&self, link: &LinkHandle, bytes: &[u8]) -> Result<(), LinkError>;

    async fn disconnect(&self, link: &LinkHandle) -> Result<(), LinkError>;

    /// Release any per-connection resources after disconnect
    async fn close(&self, link: &LinkHandle) -> Result<(), LinkError>;
}

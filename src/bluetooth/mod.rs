//! Bluetooth LE Mesh Networking Module
//!
//! Link layer, connection registry, wire protocol and topology for the
//! mesh, plus the session object that runs them together.

pub mod adapter;
pub mod advertisement;
pub mod btle;
pub mod delimited;
pub mod gate;
pub mod memory;
pub mod mesh_service;
pub mod protocol;
pub mod registry;
pub mod topology;

pub use adapter::{AdapterEvent, LinkAdapter, LinkAddress, LinkHandle, Role};
pub use btle::BtleplugAdapter;
pub use gate::{AlwaysUsable, TransportGate};
pub use memory::{MemoryAdapter, MemoryMedium};
pub use mesh_service::{MeshSession, SessionStatus};
pub use protocol::{Frame, FrameKind, MessageCodec, MessageId, PeerId};
pub use registry::{ConnectionRegistry, LinkState};
pub use topology::{PeerInfo, TopologyDirectory};

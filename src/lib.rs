//! MeshLink - peer-to-peer messaging over Bluetooth LE mesh links
//!
//! Nearby devices exchange text messages without infrastructure; messages
//! are flooded across multiple hops when sender and recipient are not
//! directly linked.

pub mod bluetooth;
pub mod config;
pub mod error;
pub mod message;
pub mod proximity;

pub use bluetooth::{MeshSession, PeerId};
pub use config::MeshConfig;
pub use error::{MeshError, MeshResult};
pub use message::MeshEvent;

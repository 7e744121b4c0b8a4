//! Message Handling Module
//!
//! Duplicate suppression, chunk reassembly, flood relay and the message
//! types and store contract the session delivers into.

pub mod dedup;
pub mod message_types;
pub mod reassembly;
pub mod router;
pub mod storage;

pub use dedup::DedupCache;
pub use message_types::{MeshEvent, ReceivedMessage, StoredMessage};
pub use reassembly::Reassembler;
pub use router::{FanOutReport, RelayEngine, RouteDecision};
pub use storage::{InMemoryMessageStore, MessageStore};

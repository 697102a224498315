//! P2P networking module
//!
//! Keeps track of peers and keeps the local chain in step with theirs.
//!
//! # Components
//! - Peer registry with unresolved, resolved and blacklisted pools
//! - Lifecycle scheduler that handshakes, discovers and unblacklists peers
//! - Chain sync coordinator with segmented downloads and fork confirmation
//! - Framed TCP transport and the server answering it

pub mod codec;
pub mod message;
pub mod node;
pub mod peer;
pub mod priority;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod sync;
#[cfg(test)]
pub mod testing;
pub mod transport;

pub use message::{ChainWeight, Receipt, Request, Response, MAGIC, MAX_MESSAGE_SIZE};
pub use node::{Node, NodeStatus};
pub use peer::{
    NodeInfo, Peer, PeerError, PeerPool, PeerState, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
pub use priority::{NoPriority, PriorityStrategy, StaticPriority};
pub use registry::{PeerRegistry, RegistryStats};
pub use scheduler::{PeerLifecycleScheduler, ResolveReport};
pub use server::{ChainResponder, Server};
pub use sync::{
    plan_segments, ChainSyncCoordinator, IngestReport, RoundOutcome, Segment, SyncError,
    SyncStage, SyncSummary,
};
pub use transport::{Exchange, PeerTransport, TcpTransport, TransportError};

//! Stake-Sync-Node: peer management and chain synchronization for a
//! proof-of-stake network node
//!
//! This crate provides:
//! - A peer registry with capacity limits, priority peers and blacklisting
//! - A background scheduler resolving, discovering and unblacklisting peers
//! - A chain sync engine finding common blocks, downloading missing blocks
//!   in parallel segments and switching to heavier forks
//! - A framed TCP protocol, server and transport between nodes
//!
//! # Example
//!
//! ```rust,no_run
//! use stake_sync_node::config::NodeConfig;
//! use stake_sync_node::network::Node;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let config = NodeConfig {
//!     seed_peers: vec!["10.0.0.2:8001".to_string()],
//!     ..NodeConfig::default()
//! };
//! let node = Node::new(config)?;
//! node.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod network;

// Re-export commonly used types
pub use config::{ConfigError, NodeConfig, PeerConfig, SyncConfig};
pub use crate::core::{Block, BlockService, Blockchain, ChainType};
pub use network::{ChainSyncCoordinator, Node, NodeStatus, PeerLifecycleScheduler, PeerRegistry};

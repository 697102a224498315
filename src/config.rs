//! Node configuration
//!
//! Every knob has a production default; a JSON file only needs to name the
//! fields it overrides.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Peer registry and lifecycle scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Interval of the resolve and discover tasks
    pub resolve_peers_gap_secs: u64,
    /// Interval of the unblacklist task
    pub unblacklist_interval_secs: u64,
    /// How long a blacklisted peer stays blacklisted
    pub blacklisting_period_secs: u64,
    pub max_unresolved_peers: usize,
    pub max_resolved_peers: usize,
    /// Resolved peers older than this are handshaken again
    pub seconds_to_update_peers_connection: i64,
    /// Upper bound on concurrent handshakes / exchanges per tick
    pub max_concurrent_peer_tasks: usize,
    /// Deadline attached to every remote call
    pub request_timeout_secs: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            resolve_peers_gap_secs: 10,
            unblacklist_interval_secs: 60,
            blacklisting_period_secs: 300,
            max_unresolved_peers: 250,
            max_resolved_peers: 100,
            seconds_to_update_peers_connection: 3600,
            max_concurrent_peer_tasks: 32,
            request_timeout_secs: 90,
        }
    }
}

impl PeerConfig {
    pub fn resolve_peers_gap(&self) -> Duration {
        Duration::from_secs(self.resolve_peers_gap_secs)
    }

    pub fn unblacklist_interval(&self) -> Duration {
        Duration::from_secs(self.unblacklist_interval_secs)
    }

    pub fn blacklisting_period(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.blacklisting_period_secs as i64)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Chain synchronization settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Number of block ids per download segment
    pub block_download_seg_size: u32,
    /// Segment responses slower than this flag the peer
    pub max_response_time_ms: u64,
    /// Peers asked to confirm the chain after ingestion
    pub default_number_of_fork_confirmations: usize,
    /// Cap on block ids requested after the common block
    pub peer_get_blocks_limit: u32,
    /// Cap on milestone ids a peer may return per request
    pub common_milestone_block_ids_limit: u32,
    /// Cap on milestone request rounds while searching the common block
    pub max_milestone_rounds: u32,
    /// Deepest reorg a competing branch may force
    pub min_rollback_blocks: u32,
    /// Delay between two synchronization rounds
    pub round_delay_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            block_download_seg_size: 36,
            max_response_time_ms: 30_000,
            default_number_of_fork_confirmations: 1,
            peer_get_blocks_limit: 1440,
            common_milestone_block_ids_limit: 10,
            max_milestone_rounds: 20,
            min_rollback_blocks: 720,
            round_delay_secs: 10,
        }
    }
}

impl SyncConfig {
    pub fn max_response_time(&self) -> Duration {
        Duration::from_millis(self.max_response_time_ms)
    }

    pub fn round_delay(&self) -> Duration {
        Duration::from_secs(self.round_delay_secs)
    }
}

/// Node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Port to listen on
    pub port: u16,
    /// Address other peers reach this node at
    pub my_address: String,
    /// Publicly shared address, when different from `my_address`
    pub shared_address: Option<String>,
    /// Seed peers ("host:port") queued as unresolved on start
    pub seed_peers: Vec<String>,
    /// Peers ("host:port") preferentially kept in the resolved pool
    pub priority_peers: Vec<String>,
    pub peers: PeerConfig,
    pub sync: SyncConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: 8001,
            my_address: "127.0.0.1".to_string(),
            shared_address: None,
            seed_peers: Vec::new(),
            priority_peers: Vec::new(),
            peers: PeerConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the registry or the sync engine cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peers.max_resolved_peers == 0 || self.peers.max_unresolved_peers == 0 {
            return Err(ConfigError::Invalid(
                "peer pool capacities must be positive".to_string(),
            ));
        }
        if self.peers.resolve_peers_gap_secs == 0 || self.peers.unblacklist_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler intervals must be positive".to_string(),
            ));
        }
        if self.peers.max_concurrent_peer_tasks == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_peer_tasks must be positive".to_string(),
            ));
        }
        if self.sync.block_download_seg_size == 0 || self.sync.peer_get_blocks_limit < 2 {
            return Err(ConfigError::Invalid(
                "download segment size and block limit are too small".to_string(),
            ));
        }
        if self.sync.max_milestone_rounds == 0 {
            return Err(ConfigError::Invalid(
                "max_milestone_rounds must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

//! Peer data model
//!
//! A peer is identified by `address:port`. Its state says which registry pool
//! it currently lives in.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol version announced in handshakes
pub const PROTOCOL_VERSION: u32 = 2;

/// Oldest protocol version we still talk to
pub const MIN_PROTOCOL_VERSION: u32 = 2;

/// Peer registry errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PeerError {
    #[error("{pool} pool is full ({limit} peers)")]
    CapacityExceeded { pool: PeerPool, limit: usize },
    #[error("Peer {0} is this host")]
    HostPeer(String),
    #[error("Peer {0} is blacklisted")]
    Blacklisted(String),
    #[error("Peer {0} not found")]
    NotFound(String),
}

/// The four registry pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerPool {
    Known,
    Unresolved,
    Resolved,
    Blacklisted,
}

impl fmt::Display for PeerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerPool::Known => "known",
            PeerPool::Unresolved => "unresolved",
            PeerPool::Resolved => "resolved",
            PeerPool::Blacklisted => "blacklisted",
        };
        f.write_str(name)
    }
}

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    Unresolved,
    Resolved,
    Blacklisted,
}

/// Network identity of a node, as exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub address: String,
    pub port: u16,
    /// Publicly reachable address, if different from `address`
    pub shared_address: Option<String>,
    pub version: u32,
}

impl NodeInfo {
    pub fn new(address: &str, port: u16) -> Self {
        Self {
            address: address.to_string(),
            port,
            shared_address: None,
            version: PROTOCOL_VERSION,
        }
    }

    /// Parse a "host:port" string
    pub fn from_addr_str(addr: &str) -> Option<Self> {
        let (host, port) = addr.trim().rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        let port = port.parse::<u16>().ok()?;
        Some(Self::new(host, port))
    }

    /// Identity key: `address:port`
    pub fn key(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Key of the shared address, when one is set
    pub fn shared_key(&self) -> Option<String> {
        self.shared_address
            .as_ref()
            .map(|shared| format!("{}:{}", shared, self.port))
    }

    /// Address to dial: the shared address wins when present
    pub fn dial_addr(&self) -> String {
        self.shared_key().unwrap_or_else(|| self.key())
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// A remote peer and its lifecycle metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub info: NodeInfo,
    pub state: PeerState,
    /// Last successful handshake
    pub last_updated: Option<DateTime<Utc>>,
    pub blacklisting_time: Option<DateTime<Utc>>,
    pub blacklisting_cause: Option<String>,
}

impl Peer {
    /// A freshly discovered peer starts out unresolved
    pub fn new(info: NodeInfo) -> Self {
        Self {
            info,
            state: PeerState::Unresolved,
            last_updated: None,
            blacklisting_time: None,
            blacklisting_cause: None,
        }
    }

    pub fn key(&self) -> String {
        self.info.key()
    }

    /// Whether the handshake is older than `max_age` (or never happened)
    pub fn needs_refresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        match self.last_updated {
            Some(updated) => updated + max_age < now,
            None => true,
        }
    }

    /// Whether the blacklist period has elapsed
    pub fn blacklist_expired(&self, now: DateTime<Utc>, period: Duration) -> bool {
        match self.blacklisting_time {
            Some(since) => since + period <= now,
            None => true,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.info)
    }
}

//! Network message types for P2P communication
//!
//! Every exchange is a single request answered by a single response.

use crate::core::{Block, ChainType};
use crate::network::peer::NodeInfo;
use serde::{Deserialize, Serialize};

/// Magic bytes for message framing
pub const MAGIC: [u8; 4] = [0x53, 0x59, 0x4E, 0x43]; // "SYNC"

/// Largest frame body accepted from a peer
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Requests a node sends to a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Handshake; the sender introduces itself
    GetPeerInfo { sender: NodeInfo },

    /// Ask for the peer's resolved peers
    GetMorePeers,

    /// Gossip our resolved peers (and ourselves) to the peer
    SendPeers { peers: Vec<NodeInfo> },

    /// Ask for the peer's chain weight
    GetCumulativeDifficulty { chain_type: ChainType },

    /// Ask for milestone block ids to locate a common block
    GetCommonMilestoneBlockIds {
        chain_type: ChainType,
        last_block_id: i64,
        last_milestone_block_id: i64,
    },

    /// Ask for the ids of the blocks following `block_id`, starting with it
    GetNextBlockIds {
        chain_type: ChainType,
        block_id: i64,
        limit: u32,
    },

    /// Ask for the blocks following `block_id` whose ids match `block_ids`
    GetNextBlocks {
        chain_type: ChainType,
        block_ids: Vec<i64>,
        block_id: i64,
    },

    /// Announce a freshly produced block
    SendBlock {
        chain_type: ChainType,
        sender: NodeInfo,
        block: Block,
    },

    /// Relay a raw transaction
    SendTransaction {
        chain_type: ChainType,
        transaction: String,
    },
}

/// Responses a peer sends back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    PeerInfo(NodeInfo),
    Peers(Vec<NodeInfo>),
    CumulativeDifficulty(ChainWeight),
    BlockIds(Vec<i64>),
    Blocks(Vec<Block>),
    Receipt(Receipt),
    Ack,
    /// The peer refused or failed the request
    Error(String),
}

/// A peer's chain weight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainWeight {
    /// Decimal encoded cumulative difficulty of the peer's tip
    pub cumulative_difficulty: String,
    pub height: u32,
}

/// Acknowledgement that a peer received a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Node that sent the block
    pub sender: String,
    /// Node that received it
    pub recipient: String,
    /// Hash of the received block
    pub datum_hash: String,
    /// Receiver's tip when the block arrived
    pub reference_block_height: u32,
    pub reference_block_hash: String,
}

impl Request {
    /// Get request type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::GetPeerInfo { .. } => "GetPeerInfo",
            Request::GetMorePeers => "GetMorePeers",
            Request::SendPeers { .. } => "SendPeers",
            Request::GetCumulativeDifficulty { .. } => "GetCumulativeDifficulty",
            Request::GetCommonMilestoneBlockIds { .. } => "GetCommonMilestoneBlockIds",
            Request::GetNextBlockIds { .. } => "GetNextBlockIds",
            Request::GetNextBlocks { .. } => "GetNextBlocks",
            Request::SendBlock { .. } => "SendBlock",
            Request::SendTransaction { .. } => "SendTransaction",
        }
    }
}

impl Response {
    pub fn type_name(&self) -> &'static str {
        match self {
            Response::PeerInfo(_) => "PeerInfo",
            Response::Peers(_) => "Peers",
            Response::CumulativeDifficulty(_) => "CumulativeDifficulty",
            Response::BlockIds(_) => "BlockIds",
            Response::Blocks(_) => "Blocks",
            Response::Receipt(_) => "Receipt",
            Response::Ack => "Ack",
            Response::Error(_) => "Error",
        }
    }
}

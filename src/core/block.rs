//! Block implementation for the chain
//!
//! A block carries the identity and linkage data the synchronization engine
//! reasons about: id, height, previous hash and cumulative difficulty. The
//! payload (transactions, receipts) is opaque at this layer.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Genesis block timestamp (2020-01-01T00:00:00Z)
pub const GENESIS_TIMESTAMP: i64 = 1_577_836_800;

/// Cumulative difficulty of the genesis block
pub const GENESIS_CUMULATIVE_DIFFICULTY: &str = "0";

/// Blocksmith recorded on the genesis block
pub const GENESIS_BLOCKSMITH: &str = "genesis";

/// Block errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BlockError {
    #[error("Invalid cumulative difficulty: {0:?}")]
    InvalidDifficulty(String),
}

/// Chain a block belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainType {
    /// The main (transaction carrying) chain
    Main,
    /// The spine chain carrying snapshot and registry checkpoints
    Spine,
}

impl ChainType {
    pub fn name(&self) -> &'static str {
        match self {
            ChainType::Main => "main",
            ChainType::Spine => "spine",
        }
    }
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A block in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block id, derived from the first 8 bytes of the block hash
    pub id: i64,
    /// Block height (genesis = 0)
    pub height: u32,
    /// Hex encoded hash of the previous block (empty for genesis)
    pub previous_block_hash: String,
    /// Hex encoded hash of this block
    pub block_hash: String,
    /// Unix timestamp in seconds
    pub timestamp: i64,
    /// Decimal encoded cumulative difficulty of the chain ending here
    pub cumulative_difficulty: String,
    /// Public key (hex) of the blocksmith that produced the block
    pub blocksmith: String,
    /// Hex encoded opaque payload
    pub payload: String,
}

impl Block {
    /// Create the genesis block
    pub fn genesis() -> Self {
        Self::assemble(
            0,
            String::new(),
            GENESIS_TIMESTAMP,
            GENESIS_CUMULATIVE_DIFFICULTY.to_string(),
            GENESIS_BLOCKSMITH.to_string(),
            String::new(),
        )
    }

    /// Create a block on top of `previous`, adding `difficulty` to its
    /// cumulative difficulty.
    pub fn new(
        previous: &Block,
        timestamp: i64,
        difficulty: u64,
        blocksmith: &str,
        payload: &[u8],
    ) -> Result<Self, BlockError> {
        let cumulative = previous.cumulative_difficulty()? + BigUint::from(difficulty);

        Ok(Self::assemble(
            previous.height + 1,
            previous.block_hash.clone(),
            timestamp,
            cumulative.to_string(),
            blocksmith.to_string(),
            hex::encode(payload),
        ))
    }

    fn assemble(
        height: u32,
        previous_block_hash: String,
        timestamp: i64,
        cumulative_difficulty: String,
        blocksmith: String,
        payload: String,
    ) -> Self {
        let hash = Self::calculate_hash(
            height,
            &previous_block_hash,
            timestamp,
            &cumulative_difficulty,
            &blocksmith,
            &payload,
        );

        Self {
            id: Self::id_from_hash(&hash),
            height,
            previous_block_hash,
            block_hash: hex::encode(hash),
            timestamp,
            cumulative_difficulty,
            blocksmith,
            payload,
        }
    }

    /// Hash the block fields
    pub fn calculate_hash(
        height: u32,
        previous_block_hash: &str,
        timestamp: i64,
        cumulative_difficulty: &str,
        blocksmith: &str,
        payload: &str,
    ) -> [u8; 32] {
        let data = format!(
            "{}|{}|{}|{}|{}|{}",
            height, previous_block_hash, timestamp, cumulative_difficulty, blocksmith, payload
        );
        Sha256::digest(data.as_bytes()).into()
    }

    /// Block ids are the little-endian interpretation of the first 8 hash bytes
    pub fn id_from_hash(hash: &[u8; 32]) -> i64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash[..8]);
        i64::from_le_bytes(bytes)
    }

    /// Check that the cached hash and id match the block contents
    pub fn is_valid_hash(&self) -> bool {
        let hash = Self::calculate_hash(
            self.height,
            &self.previous_block_hash,
            self.timestamp,
            &self.cumulative_difficulty,
            &self.blocksmith,
            &self.payload,
        );
        self.block_hash == hex::encode(hash) && self.id == Self::id_from_hash(&hash)
    }

    /// Parsed cumulative difficulty
    pub fn cumulative_difficulty(&self) -> Result<BigUint, BlockError> {
        parse_difficulty(&self.cumulative_difficulty)
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0 && self.previous_block_hash.is_empty()
    }
}

/// Parse a decimal cumulative difficulty, as exchanged between peers.
pub fn parse_difficulty(value: &str) -> Result<BigUint, BlockError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BlockError::InvalidDifficulty(value.to_string()));
    }
    value
        .parse::<BigUint>()
        .map_err(|_| BlockError::InvalidDifficulty(value.to_string()))
}

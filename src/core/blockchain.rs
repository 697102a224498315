//! Blockchain implementation
//!
//! In-memory block store implementing [`BlockService`]. It keeps the active
//! branch only; alternative branches are adopted by popping back to the common
//! block and pushing the branch on top.

use crate::core::block::{Block, BlockError, ChainType};
use crate::core::service::{BlockService, ChainWriteLock};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

/// Maximum allowed time drift into the future, in seconds
pub const MAX_FUTURE_BLOCK_TIME: i64 = 15;

/// Capacity of the accepted-block broadcast channel
const BLOCK_EVENT_CAPACITY: usize = 64;

/// Blockchain-related errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BlockchainError {
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Block not found: {0}")]
    BlockNotFound(String),
    #[error("Duplicate block: {0}")]
    DuplicateBlock(i64),
    #[error(transparent)]
    Block(#[from] BlockError),
}

#[derive(Debug)]
struct ChainData {
    /// Active branch, index = height
    blocks: Vec<Block>,
    /// Block id to height
    index: HashMap<i64, u32>,
}

/// In-memory chain of blocks
#[derive(Debug)]
pub struct Blockchain {
    chain_type: ChainType,
    genesis_id: i64,
    data: RwLock<ChainData>,
    write_lock: ChainWriteLock,
    accepted: broadcast::Sender<Block>,
}

impl Blockchain {
    /// Create a new chain holding only the genesis block
    pub fn new(chain_type: ChainType) -> Self {
        let genesis = Block::genesis();
        let genesis_id = genesis.id;
        let mut index = HashMap::new();
        index.insert(genesis.id, 0);
        let (accepted, _) = broadcast::channel(BLOCK_EVENT_CAPACITY);

        Self {
            chain_type,
            genesis_id,
            data: RwLock::new(ChainData {
                blocks: vec![genesis],
                index,
            }),
            write_lock: ChainWriteLock::new(),
            accepted,
        }
    }

    /// Get blockchain height
    pub async fn height(&self) -> u32 {
        let data = self.data.read().await;
        data.blocks.len() as u32 - 1
    }

    /// Subscribe to blocks pushed with `broadcast = true`
    pub fn subscribe(&self) -> broadcast::Receiver<Block> {
        self.accepted.subscribe()
    }

    /// Ids of blocks with height in `[from, from + limit)`
    pub async fn block_ids_from_height(&self, from: u32, limit: u32) -> Vec<i64> {
        let data = self.data.read().await;
        data.blocks
            .iter()
            .skip(from as usize)
            .take(limit as usize)
            .map(|b| b.id)
            .collect()
    }

    /// Blocks with height in `[from, from + limit)`
    pub async fn blocks_from_height(&self, from: u32, limit: u32) -> Vec<Block> {
        let data = self.data.read().await;
        data.blocks
            .iter()
            .skip(from as usize)
            .take(limit as usize)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BlockService for Blockchain {
    fn chain_type(&self) -> ChainType {
        self.chain_type
    }

    fn genesis_id(&self) -> i64 {
        self.genesis_id
    }

    fn chain_write_lock(&self) -> &ChainWriteLock {
        &self.write_lock
    }

    async fn last_block(&self) -> Result<Block, BlockchainError> {
        let data = self.data.read().await;
        data.blocks
            .last()
            .cloned()
            .ok_or_else(|| BlockchainError::BlockNotFound("chain is empty".to_string()))
    }

    async fn block_by_id(&self, id: i64) -> Result<Option<Block>, BlockchainError> {
        let data = self.data.read().await;
        Ok(data
            .index
            .get(&id)
            .and_then(|height| data.blocks.get(*height as usize))
            .cloned())
    }

    async fn block_by_height(&self, height: u32) -> Result<Option<Block>, BlockchainError> {
        let data = self.data.read().await;
        Ok(data.blocks.get(height as usize).cloned())
    }

    async fn validate_block(
        &self,
        candidate: &Block,
        previous: &Block,
        now: i64,
    ) -> Result<(), BlockchainError> {
        if candidate.previous_block_hash != previous.block_hash {
            return Err(BlockchainError::InvalidBlock(format!(
                "block {} does not reference block {}",
                candidate.id, previous.id
            )));
        }

        if candidate.height != previous.height + 1 {
            return Err(BlockchainError::InvalidBlock(format!(
                "expected height {}, got {}",
                previous.height + 1,
                candidate.height
            )));
        }

        if candidate.timestamp <= previous.timestamp {
            return Err(BlockchainError::InvalidBlock(format!(
                "timestamp {} not after previous block timestamp {}",
                candidate.timestamp, previous.timestamp
            )));
        }

        if candidate.timestamp > now + MAX_FUTURE_BLOCK_TIME {
            return Err(BlockchainError::InvalidBlock(format!(
                "timestamp {} too far in the future",
                candidate.timestamp
            )));
        }

        if !candidate.is_valid_hash() {
            return Err(BlockchainError::InvalidBlock(format!(
                "hash mismatch for block {}",
                candidate.id
            )));
        }

        if candidate.cumulative_difficulty()? <= previous.cumulative_difficulty()? {
            return Err(BlockchainError::InvalidBlock(format!(
                "cumulative difficulty of block {} does not increase",
                candidate.id
            )));
        }

        Ok(())
    }

    async fn push_block(
        &self,
        previous: &Block,
        candidate: Block,
        broadcast: bool,
    ) -> Result<(), BlockchainError> {
        let mut data = self.data.write().await;

        if data.index.contains_key(&candidate.id) {
            return Err(BlockchainError::DuplicateBlock(candidate.id));
        }

        let tip_id = data.blocks.last().map(|b| b.id);
        if tip_id != Some(previous.id) || candidate.previous_block_hash != previous.block_hash {
            return Err(BlockchainError::InvalidBlock(format!(
                "block {} does not extend the current tip",
                candidate.id
            )));
        }

        data.index.insert(candidate.id, candidate.height);
        data.blocks.push(candidate.clone());
        drop(data);

        log::debug!(
            "Pushed block {} at height {} ({} chain)",
            candidate.id,
            candidate.height,
            self.chain_type
        );

        if broadcast {
            // No subscribers is fine
            let _ = self.accepted.send(candidate);
        }

        Ok(())
    }

    async fn pop_off_to_block(&self, common: &Block) -> Result<Vec<Block>, BlockchainError> {
        let mut data = self.data.write().await;

        let on_chain = data
            .blocks
            .get(common.height as usize)
            .map(|b| b.id == common.id)
            .unwrap_or(false);
        if !on_chain {
            return Err(BlockchainError::BlockNotFound(format!(
                "block {} is not on the active chain",
                common.id
            )));
        }

        let popped = data.blocks.split_off(common.height as usize + 1);
        for block in &popped {
            data.index.remove(&block.id);
        }

        if !popped.is_empty() {
            log::info!(
                "Popped {} blocks back to height {}",
                popped.len(),
                common.height
            );
        }

        Ok(popped)
    }
}

//! Block service boundary
//!
//! The synchronization engine never touches block storage directly. It reads
//! the tip, looks blocks up and pushes validated blocks through
//! [`BlockService`], and serialises every chain mutation behind the
//! [`ChainWriteLock`] it shares with block production.

use crate::core::block::{Block, ChainType};
use crate::core::blockchain::BlockchainError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Guard held while the chain is being mutated
pub type ChainWriteGuard = OwnedMutexGuard<()>;

/// Exclusive chain write lock shared between smithing and synchronization
#[derive(Debug, Clone, Default)]
pub struct ChainWriteLock {
    inner: Arc<Mutex<()>>,
}

impl ChainWriteLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to the chain. Released when the guard drops.
    pub async fn acquire(&self) -> ChainWriteGuard {
        Arc::clone(&self.inner).lock_owned().await
    }

    /// Take the lock only if nobody else holds it
    pub fn try_acquire(&self) -> Option<ChainWriteGuard> {
        Arc::clone(&self.inner).try_lock_owned().ok()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

/// Validates, stores and serves blocks of one chain
#[async_trait]
pub trait BlockService: Send + Sync {
    /// Which chain this service manages
    fn chain_type(&self) -> ChainType;

    /// Id of the chain's genesis block
    fn genesis_id(&self) -> i64;

    /// Lock that must be held for any chain mutation
    fn chain_write_lock(&self) -> &ChainWriteLock;

    /// Current chain tip
    async fn last_block(&self) -> Result<Block, BlockchainError>;

    /// Look a block up by id; `Ok(None)` when it is not on the local chain
    async fn block_by_id(&self, id: i64) -> Result<Option<Block>, BlockchainError>;

    /// Look a block up by height on the local chain
    async fn block_by_height(&self, height: u32) -> Result<Option<Block>, BlockchainError>;

    /// Validate `candidate` as the successor of `previous` at time `now`
    async fn validate_block(
        &self,
        candidate: &Block,
        previous: &Block,
        now: i64,
    ) -> Result<(), BlockchainError>;

    /// Append `candidate` on top of `previous`, which must be the current tip
    async fn push_block(
        &self,
        previous: &Block,
        candidate: Block,
        broadcast: bool,
    ) -> Result<(), BlockchainError>;

    /// Remove every block above `common`, returning them in ascending height
    async fn pop_off_to_block(&self, common: &Block) -> Result<Vec<Block>, BlockchainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_chain_write_lock_is_exclusive() {
        let lock = ChainWriteLock::new();
        assert!(!lock.is_locked());

        let guard = lock.acquire().await;
        assert!(lock.is_locked());
        assert!(lock.clone().try_acquire().is_none());

        drop(guard);
        assert!(lock.try_acquire().is_some());
    }
}

//! Chain primitives
//!
//! - Blocks with cumulative difficulty kept as decimal strings
//! - The `BlockService` seam the sync engine and the server write through
//! - An in-memory `Blockchain` implementing it

pub mod block;
pub mod blockchain;
pub mod service;

pub use block::{
    parse_difficulty, Block, BlockError, ChainType, GENESIS_BLOCKSMITH,
    GENESIS_CUMULATIVE_DIFFICULTY, GENESIS_TIMESTAMP,
};
pub use blockchain::{Blockchain, BlockchainError, MAX_FUTURE_BLOCK_TIME};
pub use service::{BlockService, ChainWriteGuard, ChainWriteLock};

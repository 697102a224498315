//! Chain synchronization with peers
//!
//! One round runs at a time, driven by a single-slot queue:
//!
//! ```text
//! Idle -> SelectFeeder -> CompareDifficulty -> FindCommonBlock
//!      -> DownloadSegments -> IngestBlocks -> ConfirmFork -> Idle
//! ```
//!
//! Peers that misbehave during a round are collected in the round's session
//! and disciplined through the registry once the round is over.

mod download;
mod fork;

pub use download::{plan_segments, Segment};
pub use fork::IngestReport;

use crate::config::SyncConfig;
use crate::core::{parse_difficulty, Block, BlockError, BlockService, BlockchainError};
use crate::network::peer::Peer;
use crate::network::registry::PeerRegistry;
use crate::network::transport::{PeerTransport, TransportError};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Synchronization errors
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transport error with {peer}: {source}")]
    Transport {
        peer: String,
        #[source]
        source: TransportError,
    },
    #[error("Protocol violation by {peer}: {reason}")]
    ProtocolViolation { peer: String, reason: String },
    #[error("Invalid block from {peer}: {reason}")]
    InvalidBlock { peer: String, reason: String },
    #[error("Chain error: {0}")]
    Chain(#[from] BlockchainError),
}

impl From<BlockError> for SyncError {
    fn from(e: BlockError) -> Self {
        SyncError::Chain(e.into())
    }
}

impl SyncError {
    fn transport(peer: &Peer, source: TransportError) -> Self {
        SyncError::Transport {
            peer: peer.key(),
            source,
        }
    }
}

/// Where the coordinator currently is in a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    Idle,
    SelectFeeder,
    CompareDifficulty,
    FindCommonBlock,
    DownloadSegments,
    IngestBlocks,
    ConfirmFork,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStage::Idle => "idle",
            SyncStage::SelectFeeder => "select-feeder",
            SyncStage::CompareDifficulty => "compare-difficulty",
            SyncStage::FindCommonBlock => "find-common-block",
            SyncStage::DownloadSegments => "download-segments",
            SyncStage::IngestBlocks => "ingest-blocks",
            SyncStage::ConfirmFork => "confirm-fork",
        };
        f.write_str(name)
    }
}

/// What a completed round achieved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// No resolved peer to sync from
    NoPeers,
    /// The feeder's chain is not heavier than ours
    UpToDate { feeder: String },
    /// The feeder had no blocks we lack
    NoUpdatedChain { feeder: String },
    /// Blocks were downloaded and ingested
    Synced(SyncSummary),
    /// The round was aborted
    Failed { feeder: String, reason: String },
}

/// Summary of a round that ingested blocks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub feeder: String,
    /// Blocks pushed from the feeder's branch
    pub pushed: usize,
    /// Local blocks replaced by the feeder's branch
    pub popped: usize,
    /// Whether the branch turned out lighter and was undone
    pub rolled_back: bool,
    /// Blocks deferred because they did not extend the tip
    pub fork_candidates: usize,
    /// Peers that agreed with our new tip
    pub confirmations: usize,
    /// Peer whose heavier branch was adopted while confirming
    pub adopted_from: Option<String>,
    /// Height of the tip after the round
    pub height: u32,
}

/// Round-scoped state
struct SyncSession {
    feeder: Peer,
    common: Option<Block>,
    disconnect: Vec<(Peer, String)>,
    blacklist: Vec<(Peer, String)>,
}

impl SyncSession {
    fn new(feeder: Peer) -> Self {
        Self {
            feeder,
            common: None,
            disconnect: Vec::new(),
            blacklist: Vec::new(),
        }
    }

    /// Queue `peer` for disconnection once the round ends
    fn queue_disconnect(&mut self, peer: &Peer, reason: impl Into<String>) {
        if !self.is_flagged(peer) {
            self.disconnect.push((peer.clone(), reason.into()));
        }
    }

    /// Queue `peer` for disconnection and describe the violation
    fn flag(&mut self, peer: &Peer, reason: impl Into<String>) -> SyncError {
        let reason = reason.into();
        self.queue_disconnect(peer, reason.clone());
        SyncError::ProtocolViolation {
            peer: peer.key(),
            reason,
        }
    }

    /// Queue `peer` for blacklisting after it served an invalid block
    fn condemn(&mut self, peer: &Peer, reason: impl Into<String>) -> SyncError {
        let reason = reason.into();
        if !self.blacklist.iter().any(|(p, _)| p.key() == peer.key()) {
            self.blacklist.push((peer.clone(), reason.clone()));
        }
        SyncError::InvalidBlock {
            peer: peer.key(),
            reason,
        }
    }

    fn is_flagged(&self, peer: &Peer) -> bool {
        let key = peer.key();
        self.disconnect.iter().any(|(p, _)| p.key() == key)
            || self.blacklist.iter().any(|(p, _)| p.key() == key)
    }
}

/// Drives synchronization rounds against resolved peers
pub struct ChainSyncCoordinator {
    chain: Arc<dyn BlockService>,
    registry: Arc<PeerRegistry>,
    transport: Arc<dyn PeerTransport>,
    config: SyncConfig,
    stage: RwLock<SyncStage>,
    last_outcome: RwLock<Option<RoundOutcome>>,
    round_tx: mpsc::Sender<()>,
    round_rx: Mutex<Option<mpsc::Receiver<()>>>,
    /// Held for the whole of a round
    round: Mutex<()>,
}

impl ChainSyncCoordinator {
    pub fn new(
        chain: Arc<dyn BlockService>,
        registry: Arc<PeerRegistry>,
        transport: Arc<dyn PeerTransport>,
        config: SyncConfig,
    ) -> Self {
        let (round_tx, round_rx) = mpsc::channel(1);
        Self {
            chain,
            registry,
            transport,
            config,
            stage: RwLock::new(SyncStage::Idle),
            last_outcome: RwLock::new(None),
            round_tx,
            round_rx: Mutex::new(Some(round_rx)),
            round: Mutex::new(()),
        }
    }

    /// Ask for a round. Returns false when one is already queued.
    pub fn trigger(&self) -> bool {
        self.round_tx.try_send(()).is_ok()
    }

    pub async fn stage(&self) -> SyncStage {
        *self.stage.read().await
    }

    /// Check if currently syncing
    pub async fn is_syncing(&self) -> bool {
        self.stage().await != SyncStage::Idle
    }

    pub async fn last_outcome(&self) -> Option<RoundOutcome> {
        self.last_outcome.read().await.clone()
    }

    /// Run queued rounds until `shutdown` fires. Every round schedules the
    /// next one after the configured delay. A round in progress is finished
    /// before shutdown is honoured.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let Some(mut rounds) = self.round_rx.lock().await.take() else {
            log::warn!("Sync coordinator is already running");
            return;
        };

        self.trigger();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                signal = rounds.recv() => {
                    if signal.is_none() {
                        break;
                    }
                }
            }

            self.run_round().await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.round_delay()) => {}
            }
            self.trigger();
        }

        log::info!("Sync coordinator stopped");
    }

    /// Run one round against a random resolved peer. Waits for a round
    /// already in progress to finish first.
    pub async fn run_round(&self) -> RoundOutcome {
        let _round = self.round.lock().await;
        self.set_stage(SyncStage::SelectFeeder).await;

        let outcome = match self.registry.random_resolved().await {
            None => {
                log::debug!("No resolved peers to sync from");
                RoundOutcome::NoPeers
            }
            Some(feeder) => match self.sync_from(&feeder).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    match &e {
                        SyncError::Chain(_) => log::error!("Sync round failed: {}", e),
                        _ => log::warn!("Sync round with {} aborted: {}", feeder, e),
                    }
                    RoundOutcome::Failed {
                        feeder: feeder.key(),
                        reason: e.to_string(),
                    }
                }
            },
        };

        self.set_stage(SyncStage::Idle).await;
        *self.last_outcome.write().await = Some(outcome.clone());
        outcome
    }

    /// Run one round with `feeder` as the source of the chain
    async fn sync_from(&self, feeder: &Peer) -> Result<RoundOutcome, SyncError> {
        let mut session = SyncSession::new(feeder.clone());
        let result = self.sync_with(&mut session).await;
        self.discipline(&session).await;
        self.set_stage(SyncStage::Idle).await;
        result
    }

    async fn sync_with(&self, session: &mut SyncSession) -> Result<RoundOutcome, SyncError> {
        let feeder = session.feeder.clone();
        let chain_type = self.chain.chain_type();

        self.set_stage(SyncStage::CompareDifficulty).await;
        let tip = self.chain.last_block().await?;
        let weight = self
            .transport
            .get_cumulative_difficulty(&feeder, chain_type)
            .await
            .map_err(|e| SyncError::transport(&feeder, e))?;
        let theirs = match parse_difficulty(&weight.cumulative_difficulty) {
            Ok(difficulty) => difficulty,
            Err(e) => return Err(session.flag(&feeder, e.to_string())),
        };
        if theirs <= tip.cumulative_difficulty()? {
            log::debug!("Peer {} is not ahead of us", feeder);
            return Ok(RoundOutcome::UpToDate {
                feeder: feeder.key(),
            });
        }
        log::info!(
            "Peer {} is ahead (height {} vs {}), syncing",
            feeder,
            weight.height,
            tip.height
        );

        self.set_stage(SyncStage::FindCommonBlock).await;
        let common = self.find_common_block(session, &feeder).await?;
        session.common = Some(common.clone());

        let Some(report) = self.pull_branch(session, &feeder, &common).await? else {
            log::info!("Peer {} has no updated chain", feeder);
            return Ok(RoundOutcome::NoUpdatedChain {
                feeder: feeder.key(),
            });
        };

        self.set_stage(SyncStage::ConfirmFork).await;
        let confirmation = self.confirm_fork(session).await?;

        let tip = self.chain.last_block().await?;
        log::info!(
            "Synced {} blocks from {}, height now {}",
            report.pushed,
            feeder,
            tip.height
        );

        Ok(RoundOutcome::Synced(SyncSummary {
            feeder: feeder.key(),
            pushed: report.pushed,
            popped: report.popped,
            rolled_back: report.rolled_back,
            fork_candidates: report.fork_candidates,
            confirmations: confirmation.confirmations,
            adopted_from: confirmation.adopted_from,
            height: tip.height,
        }))
    }

    /// Locate the latest block shared with `peer`.
    ///
    /// Milestone ids are requested seeded with our tip; the last id checked
    /// becomes the cursor of the next request. Gives up after
    /// `max_milestone_rounds` requests.
    async fn find_common_block(
        &self,
        session: &mut SyncSession,
        peer: &Peer,
    ) -> Result<Block, SyncError> {
        let tip = self.chain.last_block().await?;
        if tip.id == self.chain.genesis_id() {
            return Ok(tip);
        }

        let limit = self.config.common_milestone_block_ids_limit as usize;
        let mut cursor = 0;
        for _ in 0..self.config.max_milestone_rounds {
            let ids = self
                .transport
                .get_common_milestone_block_ids(peer, self.chain.chain_type(), tip.id, cursor)
                .await
                .map_err(|e| SyncError::transport(peer, e))?;

            if ids.is_empty() {
                return Err(session.flag(peer, "returned no milestone block ids"));
            }
            if ids.len() > limit {
                return Err(session.flag(
                    peer,
                    format!("returned {} milestone ids, limit is {}", ids.len(), limit),
                ));
            }

            for id in ids {
                if let Some(block) = self.chain.block_by_id(id).await? {
                    log::debug!("Common block with {} at height {}", peer, block.height);
                    return Ok(block);
                }
                cursor = id;
            }
        }

        Err(session.flag(
            peer,
            format!(
                "no common block after {} milestone rounds",
                self.config.max_milestone_rounds
            ),
        ))
    }

    /// Download and ingest `peer`'s blocks following `common`.
    /// `None` when the peer has nothing we lack.
    async fn pull_branch(
        &self,
        session: &mut SyncSession,
        peer: &Peer,
        common: &Block,
    ) -> Result<Option<IngestReport>, SyncError> {
        self.set_stage(SyncStage::DownloadSegments).await;

        let limit = self.config.peer_get_blocks_limit;
        let ids = self
            .transport
            .get_next_block_ids(peer, self.chain.chain_type(), common.id, limit)
            .await
            .map_err(|e| SyncError::transport(peer, e))?;
        if ids.len() > limit as usize {
            return Err(session.flag(
                peer,
                format!("returned {} block ids, limit is {}", ids.len(), limit),
            ));
        }

        // Skip what we already have; the last known block anchors the branch
        let mut anchor = common.clone();
        let mut known = 0;
        for id in &ids {
            match self.chain.block_by_id(*id).await? {
                Some(block) => {
                    anchor = block;
                    known += 1;
                }
                None => break,
            }
        }
        let new_ids = &ids[known..];
        if new_ids.is_empty() {
            return Ok(None);
        }

        let tip = self.chain.last_block().await?;
        let depth = tip.height.saturating_sub(anchor.height);
        if depth > self.config.min_rollback_blocks {
            return Err(session.flag(
                peer,
                format!(
                    "branch forks {} blocks back, limit is {}",
                    depth, self.config.min_rollback_blocks
                ),
            ));
        }

        let helpers: Vec<Peer> = self
            .registry
            .shuffled_resolved_except(&peer.key())
            .await
            .into_iter()
            .filter(|p| !session.is_flagged(p))
            .collect();
        let segments = plan_segments(
            anchor.id,
            new_ids,
            self.config.block_download_seg_size as usize,
            peer,
            &helpers,
        );
        log::debug!(
            "Downloading {} blocks after height {} in {} segments",
            new_ids.len(),
            anchor.height,
            segments.len()
        );
        let downloaded = self.download_segments(session, segments).await?;

        self.set_stage(SyncStage::IngestBlocks).await;
        let report = self.ingest(session, &anchor, new_ids, downloaded).await?;
        Ok(Some(report))
    }

    /// Apply the penalties collected during a round
    async fn discipline(&self, session: &SyncSession) {
        for (peer, cause) in &session.blacklist {
            if let Err(e) = self.registry.blacklist(peer, cause).await {
                log::debug!("Could not blacklist {}: {}", peer, e);
            }
        }
        for (peer, reason) in &session.disconnect {
            if session.blacklist.iter().any(|(p, _)| p.key() == peer.key()) {
                continue;
            }
            log::info!("Disconnecting {}: {}", peer, reason);
            self.registry.disconnect(peer).await;
        }
    }

    async fn set_stage(&self, stage: SyncStage) {
        *self.stage.write().await = stage;
    }
}

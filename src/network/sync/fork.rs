//! Block ingestion and fork confirmation

use super::download::Downloaded;
use super::{ChainSyncCoordinator, SyncError, SyncSession};
use crate::core::{parse_difficulty, Block};
use crate::network::peer::Peer;
use chrono::Utc;
use std::collections::HashSet;

/// What ingesting a downloaded branch did to the local chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub pushed: usize,
    pub popped: usize,
    /// Downloaded blocks that did not extend the tip
    pub fork_candidates: usize,
    /// The branch was lighter than ours and the popped blocks were restored
    pub rolled_back: bool,
}

#[derive(Debug, Default)]
pub(super) struct Confirmation {
    pub confirmations: usize,
    pub adopted_from: Option<String>,
}

impl ChainSyncCoordinator {
    /// Switch the chain to the downloaded branch starting after `anchor`.
    ///
    /// Holds the chain write lock throughout. Blocks are applied in height
    /// order until one fails validation, whose source is then blacklisted.
    /// If local blocks had to be popped and the result is not heavier than
    /// before, the popped blocks are put back.
    pub(super) async fn ingest(
        &self,
        session: &mut SyncSession,
        anchor: &Block,
        requested: &[i64],
        downloaded: Downloaded,
    ) -> Result<IngestReport, SyncError> {
        let Downloaded { blocks, sources } = downloaded;
        let wanted: HashSet<i64> = requested.iter().copied().collect();
        let mut blocks: Vec<Block> = blocks
            .into_iter()
            .filter(|b| wanted.contains(&b.id))
            .collect();
        blocks.sort_by_key(|b| b.height);
        blocks.dedup_by_key(|b| b.id);

        let _guard = self.chain.chain_write_lock().acquire().await;

        let before = self.chain.last_block().await?;
        let before_difficulty = before.cumulative_difficulty()?;
        let popped = if before.id != anchor.id {
            self.chain.pop_off_to_block(anchor).await?
        } else {
            Vec::new()
        };

        let mut report = IngestReport {
            popped: popped.len(),
            ..IngestReport::default()
        };
        let mut tip = anchor.clone();
        let mut failure = None;

        for block in blocks {
            if block.previous_block_hash != tip.block_hash {
                report.fork_candidates += 1;
                continue;
            }

            let now = Utc::now().timestamp();
            if let Err(e) = self.chain.validate_block(&block, &tip, now).await {
                match sources.get(&block.id) {
                    Some(peer) => {
                        let violation = session.condemn(peer, e.to_string());
                        log::warn!("{}", violation);
                    }
                    None => log::warn!("Rejected block {}: {}", block.id, e),
                }
                break;
            }

            match self.chain.push_block(&tip, block.clone(), false).await {
                Ok(()) => {
                    report.pushed += 1;
                    tip = block;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            if !popped.is_empty() {
                self.restore(anchor, popped).await?;
            }
            return Err(e.into());
        }

        if !popped.is_empty() {
            let after = self.chain.last_block().await?;
            if after.cumulative_difficulty()? <= before_difficulty {
                log::info!(
                    "Branch after height {} is not heavier, restoring {} blocks",
                    anchor.height,
                    popped.len()
                );
                self.restore(anchor, popped).await?;
                report.rolled_back = true;
            }
        }

        Ok(report)
    }

    /// Put previously popped blocks back on top of `anchor`
    async fn restore(&self, anchor: &Block, popped: Vec<Block>) -> Result<(), SyncError> {
        self.chain.pop_off_to_block(anchor).await?;
        let mut tip = anchor.clone();
        for block in popped {
            self.chain.push_block(&tip, block.clone(), false).await?;
            tip = block;
        }
        Ok(())
    }

    /// Ask other resolved peers whether they agree with our new tip.
    ///
    /// A peer whose common block with us is our tip confirms it. A peer on a
    /// heavier branch within the reorg bound has its branch pulled in, and
    /// confirmation stops there.
    pub(super) async fn confirm_fork(
        &self,
        session: &mut SyncSession,
    ) -> Result<Confirmation, SyncError> {
        let mut confirmation = Confirmation::default();
        let wanted = self.config.default_number_of_fork_confirmations;
        if wanted == 0 {
            return Ok(confirmation);
        }
        if let Some(common) = &session.common {
            log::debug!(
                "Confirming chain that forked at height {} with {} peers",
                common.height,
                wanted
            );
        }

        let witnesses: Vec<Peer> = self
            .registry
            .shuffled_resolved_except(&session.feeder.key())
            .await
            .into_iter()
            .filter(|p| !session.is_flagged(p))
            .take(wanted)
            .collect();

        let chain_type = self.chain.chain_type();
        for peer in witnesses {
            let tip = self.chain.last_block().await?;

            let weight = match self.transport.get_cumulative_difficulty(&peer, chain_type).await {
                Ok(weight) => weight,
                Err(e) => {
                    log::debug!("Skipping confirmation from {}: {}", peer, e);
                    continue;
                }
            };
            let theirs = match parse_difficulty(&weight.cumulative_difficulty) {
                Ok(difficulty) => difficulty,
                Err(e) => {
                    session.flag(&peer, e.to_string());
                    continue;
                }
            };

            let common = match self.find_common_block(session, &peer).await {
                Ok(block) => block,
                Err(SyncError::Chain(e)) => return Err(e.into()),
                Err(e) => {
                    log::debug!("Skipping confirmation from {}: {}", peer, e);
                    continue;
                }
            };

            if common.id == tip.id {
                confirmation.confirmations += 1;
                continue;
            }
            if theirs <= tip.cumulative_difficulty()? {
                continue;
            }

            log::info!(
                "Peer {} is on a heavier branch from height {}",
                peer,
                common.height
            );
            match self.pull_branch(session, &peer, &common).await {
                Ok(Some(report)) if !report.rolled_back && report.pushed > 0 => {
                    confirmation.adopted_from = Some(peer.key());
                    break;
                }
                Ok(_) => {}
                Err(SyncError::Chain(e)) => return Err(e.into()),
                Err(e) => log::debug!("Could not adopt branch of {}: {}", peer, e),
            }
        }

        Ok(confirmation)
    }
}

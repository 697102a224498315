//! Segmented block download
//!
//! The ids of the blocks we lack are cut into fixed-size segments. The
//! feeder serves the first one; the rest go round-robin to the other resolved
//! peers. Peers are asked concurrently, each serving its segments one at a
//! time.

use super::{ChainSyncCoordinator, SyncError, SyncSession};
use crate::core::Block;
use crate::network::peer::Peer;
use crate::network::transport::TransportError;
use futures::future::join_all;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A contiguous run of block ids fetched with one request
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub index: usize,
    /// Id of the block preceding the first id of the segment
    pub from_id: i64,
    pub ids: Vec<i64>,
    /// Peer asked for the segment
    pub peer: Peer,
}

/// Cut `new_ids` (the blocks following `anchor_id`) into segments of at most
/// `size` ids. Segment 0 goes to `feeder`, later ones cycle over `helpers`
/// (or the feeder when there are none).
pub fn plan_segments(
    anchor_id: i64,
    new_ids: &[i64],
    size: usize,
    feeder: &Peer,
    helpers: &[Peer],
) -> Vec<Segment> {
    let mut from_id = anchor_id;
    new_ids
        .chunks(size.max(1))
        .enumerate()
        .map(|(index, chunk)| {
            let peer = if index == 0 || helpers.is_empty() {
                feeder.clone()
            } else {
                helpers[(index - 1) % helpers.len()].clone()
            };
            let segment = Segment {
                index,
                from_id,
                ids: chunk.to_vec(),
                peer,
            };
            from_id = chunk[chunk.len() - 1];
            segment
        })
        .collect()
}

/// Group segments by peer, keeping each peer's segments in order
fn queue_by_peer(segments: Vec<Segment>) -> Vec<Vec<Segment>> {
    let mut queues: Vec<Vec<Segment>> = Vec::new();
    for segment in segments {
        let key = segment.peer.key();
        match queues.iter_mut().find(|q| q[0].peer.key() == key) {
            Some(queue) => queue.push(segment),
            None => queues.push(vec![segment]),
        }
    }
    queues
}

/// Blocks gathered from all segments, with the peer each one came from
#[derive(Debug, Default)]
pub(super) struct Downloaded {
    pub blocks: Vec<Block>,
    pub sources: HashMap<i64, Peer>,
}

impl ChainSyncCoordinator {
    /// Fetch every segment, one request in flight per peer.
    ///
    /// Oversized, empty and timed out answers are discarded and their peer
    /// flagged. Slow answers are kept and their peer is disconnected after
    /// the round. A peer whose request fails is not asked for its remaining
    /// segments. Failing the feeder's segment fails the download.
    pub(super) async fn download_segments(
        &self,
        session: &mut SyncSession,
        segments: Vec<Segment>,
    ) -> Result<Downloaded, SyncError> {
        let chain_type = self.chain.chain_type();
        let workers = queue_by_peer(segments).into_iter().map(|queue| async move {
            let mut fetched = Vec::with_capacity(queue.len());
            let mut queue = queue.into_iter();
            while let Some(segment) = queue.next() {
                let started = Instant::now();
                let result = self
                    .transport
                    .get_next_blocks(&segment.peer, chain_type, &segment.ids, segment.from_id)
                    .await;
                let failed = result.is_err();
                let remaining = queue.len();
                if failed && remaining > 0 {
                    log::debug!("Skipping {} more segments of {}", remaining, segment.peer);
                }
                fetched.push((segment, started.elapsed(), result));
                if failed {
                    break;
                }
            }
            fetched
        });
        let results: Vec<_> = join_all(workers).await.into_iter().flatten().collect();

        let mut downloaded = Downloaded::default();
        let mut feeder_failure = None;
        for (segment, elapsed, result) in results {
            match self.check_segment(session, &segment, elapsed, result) {
                Ok(blocks) => {
                    for block in blocks {
                        downloaded.sources.insert(block.id, segment.peer.clone());
                        downloaded.blocks.push(block);
                    }
                }
                Err(e) => {
                    log::debug!("Segment {} dropped: {}", segment.index, e);
                    if segment.index == 0 {
                        feeder_failure = Some(e);
                    }
                }
            }
        }

        match feeder_failure {
            Some(e) => Err(e),
            None => Ok(downloaded),
        }
    }

    fn check_segment(
        &self,
        session: &mut SyncSession,
        segment: &Segment,
        elapsed: Duration,
        result: Result<Vec<Block>, TransportError>,
    ) -> Result<Vec<Block>, SyncError> {
        let peer = &segment.peer;
        let blocks = match result {
            Ok(blocks) => blocks,
            Err(TransportError::Timeout(after)) => {
                return Err(session.flag(peer, format!("segment timed out after {:?}", after)));
            }
            Err(e) => return Err(SyncError::transport(peer, e)),
        };

        if blocks.len() > segment.ids.len() {
            return Err(session.flag(
                peer,
                format!(
                    "returned {} blocks for a segment of {}",
                    blocks.len(),
                    segment.ids.len()
                ),
            ));
        }
        if blocks.is_empty() {
            return Err(session.flag(peer, "returned an empty segment"));
        }

        let max = self.config.max_response_time();
        if elapsed > max {
            log::warn!(
                "Peer {} answered segment {} in {:?} (max {:?})",
                peer,
                segment.index,
                elapsed,
                max
            );
            session.queue_disconnect(peer, "slow segment response");
        }

        Ok(blocks)
    }
}

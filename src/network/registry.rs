//! Peer registry
//!
//! Owns the four peer pools of the local host:
//! - Known: peers heard of (seeds, exchanges, inbound handshakes). Members of
//!   the other pools always stay; the rest are capped at
//!   `KNOWN_PER_SLOT` entries per pool slot and pruned at random
//! - Unresolved: candidates waiting for a handshake
//! - Resolved: peers that answered a handshake and are used for sync
//! - Blacklisted: peers that violated the protocol, until their period ends
//!
//! A single lock guards all pools so a peer moves between them atomically.
//! Queries hand out copies; nobody outside sees the live maps.

use crate::config::NodeConfig;
use crate::network::peer::{NodeInfo, Peer, PeerError, PeerPool, PeerState};
use crate::network::priority::{PriorityStrategy, StaticPriority};
use chrono::Utc;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

type PeerSet = HashMap<String, Peer>;

/// Dormant known peers kept per unresolved or resolved slot
const KNOWN_PER_SLOT: usize = 4;

#[derive(Debug, Default)]
struct PeerSets {
    known: PeerSet,
    unresolved: PeerSet,
    resolved: PeerSet,
    blacklisted: PeerSet,
}

/// Snapshot of pool sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub known: usize,
    pub unresolved: usize,
    pub resolved: usize,
    pub blacklisted: usize,
}

/// Thread-safe registry of the host's peers
pub struct PeerRegistry {
    host: NodeInfo,
    max_unresolved: usize,
    max_resolved: usize,
    priority: Arc<dyn PriorityStrategy>,
    sets: RwLock<PeerSets>,
}

impl PeerRegistry {
    pub fn new(
        host: NodeInfo,
        max_unresolved: usize,
        max_resolved: usize,
        priority: Arc<dyn PriorityStrategy>,
    ) -> Self {
        Self {
            host,
            max_unresolved,
            max_resolved,
            priority,
            sets: RwLock::new(PeerSets::default()),
        }
    }

    /// Build the registry described by the node configuration
    pub fn from_config(config: &NodeConfig) -> Self {
        let mut host = NodeInfo::new(&config.my_address, config.port);
        host.shared_address = config.shared_address.clone();

        Self::new(
            host,
            config.peers.max_unresolved_peers,
            config.peers.max_resolved_peers,
            Arc::new(StaticPriority::new(config.priority_peers.iter().cloned())),
        )
    }

    /// This node's own info
    pub fn host(&self) -> &NodeInfo {
        &self.host
    }

    pub fn max_unresolved(&self) -> usize {
        self.max_unresolved
    }

    pub fn max_resolved(&self) -> usize {
        self.max_resolved
    }

    /// Most known peers kept outside the other pools
    pub fn known_limit(&self) -> usize {
        (self.max_unresolved + self.max_resolved).max(1) * KNOWN_PER_SLOT
    }

    /// Whether `node` refers to this host
    pub fn is_host(&self, node: &NodeInfo) -> bool {
        let host_key = self.host.key();
        let host_shared = self.host.shared_key();
        let key = node.key();

        key == host_key
            || Some(&key) == host_shared.as_ref()
            || node.shared_key().as_ref() == Some(&host_key)
    }

    pub fn is_priority(&self, node: &NodeInfo) -> bool {
        self.priority.is_priority(node)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn known_peers(&self) -> Vec<Peer> {
        let sets = self.sets.read().await;
        sets.known.values().cloned().collect()
    }

    pub async fn unresolved_peers(&self) -> Vec<Peer> {
        let sets = self.sets.read().await;
        sets.unresolved.values().cloned().collect()
    }

    pub async fn resolved_peers(&self) -> Vec<Peer> {
        let sets = self.sets.read().await;
        sets.resolved.values().cloned().collect()
    }

    pub async fn blacklisted_peers(&self) -> Vec<Peer> {
        let sets = self.sets.read().await;
        sets.blacklisted.values().cloned().collect()
    }

    /// Pool sizes
    pub async fn stats(&self) -> RegistryStats {
        let sets = self.sets.read().await;
        RegistryStats {
            known: sets.known.len(),
            unresolved: sets.unresolved.len(),
            resolved: sets.resolved.len(),
            blacklisted: sets.blacklisted.len(),
        }
    }

    /// Which of Unresolved / Resolved / Blacklisted holds `key`, if any
    pub async fn pool_of(&self, key: &str) -> Option<PeerPool> {
        let sets = self.sets.read().await;
        if sets.resolved.contains_key(key) {
            Some(PeerPool::Resolved)
        } else if sets.unresolved.contains_key(key) {
            Some(PeerPool::Unresolved)
        } else if sets.blacklisted.contains_key(key) {
            Some(PeerPool::Blacklisted)
        } else if sets.known.contains_key(key) {
            Some(PeerPool::Known)
        } else {
            None
        }
    }

    pub async fn random_resolved(&self) -> Option<Peer> {
        let snapshot = self.resolved_peers().await;
        pick_random(snapshot)
    }

    pub async fn random_unresolved(&self) -> Option<Peer> {
        let snapshot = self.unresolved_peers().await;
        pick_random(snapshot)
    }

    pub async fn random_known(&self) -> Option<Peer> {
        let snapshot = self.known_peers().await;
        pick_random(snapshot)
    }

    /// Resolved peers other than `exclude`, in random order
    pub async fn shuffled_resolved_except(&self, exclude: &str) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .resolved_peers()
            .await
            .into_iter()
            .filter(|p| p.key() != exclude)
            .collect();
        peers.shuffle(&mut rand::thread_rng());
        peers
    }

    /// Positive when the unresolved pool holds more peers than allowed
    pub async fn exceed_unresolved_capacity(&self) -> i64 {
        let sets = self.sets.read().await;
        sets.unresolved.len() as i64 - self.max_unresolved as i64
    }

    /// Positive when the resolved pool holds more peers than allowed
    pub async fn exceed_resolved_capacity(&self) -> i64 {
        let sets = self.sets.read().await;
        sets.resolved.len() as i64 - self.max_resolved as i64
    }

    // =========================================================================
    // Unresolved pool
    // =========================================================================

    /// Queue nodes for resolution.
    ///
    /// A full pool rejects the whole batch unless `force` is set, in which
    /// case random non-priority unresolved peers are evicted one at a time to
    /// make room. Nodes that are this host, already unresolved, resolved or
    /// blacklisted are skipped. Returns the number of peers inserted.
    pub async fn add_unresolved(
        &self,
        nodes: Vec<NodeInfo>,
        force: bool,
    ) -> Result<usize, PeerError> {
        let mut sets = self.sets.write().await;

        if !force && sets.unresolved.len() >= self.max_unresolved {
            return Err(PeerError::CapacityExceeded {
                pool: PeerPool::Unresolved,
                limit: self.max_unresolved,
            });
        }

        let mut added = 0;
        for node in nodes {
            let key = node.key();
            if self.is_host(&node)
                || sets.unresolved.contains_key(&key)
                || sets.resolved.contains_key(&key)
                || sets.blacklisted.contains_key(&key)
            {
                continue;
            }

            if sets.unresolved.len() >= self.max_unresolved {
                if !force {
                    break;
                }
                let evicted = evict_random(&mut sets.unresolved, self.priority.as_ref(), 1);
                if evicted.is_empty() {
                    log::debug!("Unresolved pool is full of priority peers, skipping {}", key);
                    break;
                }
            }

            let peer = Peer::new(node);
            sets.known.entry(key.clone()).or_insert_with(|| peer.clone());
            sets.unresolved.insert(key, peer);
            added += 1;
        }

        self.prune_known(&mut sets);
        if added > 0 {
            log::debug!("Added {} unresolved peers", added);
        }
        Ok(added)
    }

    /// Insert a single peer into the unresolved pool without eviction
    pub async fn add_unresolved_peer(&self, peer: Peer) -> Result<(), PeerError> {
        let mut sets = self.sets.write().await;
        self.insert_unresolved(&mut sets, peer)
    }

    pub async fn remove_unresolved(&self, peer: &Peer) -> Result<(), PeerError> {
        let mut sets = self.sets.write().await;
        sets.unresolved
            .remove(&peer.key())
            .ok_or_else(|| PeerError::NotFound(peer.key()))?;
        self.prune_known(&mut sets);
        Ok(())
    }

    // =========================================================================
    // Resolved pool
    // =========================================================================

    /// Promote a peer to resolved, taking it out of the unresolved pool
    pub async fn add_resolved(&self, peer: Peer) -> Result<(), PeerError> {
        let mut sets = self.sets.write().await;
        let key = peer.key();

        if self.is_host(&peer.info) {
            return Err(PeerError::HostPeer(key));
        }
        if sets.blacklisted.contains_key(&key) {
            return Err(PeerError::Blacklisted(key));
        }
        if !sets.resolved.contains_key(&key) && sets.resolved.len() >= self.max_resolved {
            return Err(PeerError::CapacityExceeded {
                pool: PeerPool::Resolved,
                limit: self.max_resolved,
            });
        }

        insert_resolved(&mut sets, peer);
        log::info!("Resolved peer: {}", key);
        Ok(())
    }

    pub async fn remove_resolved(&self, peer: &Peer) -> Result<(), PeerError> {
        let mut sets = self.sets.write().await;
        sets.resolved
            .remove(&peer.key())
            .ok_or_else(|| PeerError::NotFound(peer.key()))?;
        self.prune_known(&mut sets);
        Ok(())
    }

    /// Admit a batch of freshly handshaken peers into the resolved pool.
    ///
    /// Priority candidates always get in: when they do not fit, non-priority
    /// resolved peers are disconnected to make room. Remaining free slots go
    /// to non-priority candidates. Candidates left out stay where they were.
    /// Returns the admitted peers.
    pub async fn admit_resolved(&self, candidates: Vec<Peer>) -> Vec<Peer> {
        let mut sets = self.sets.write().await;
        let mut admitted = Vec::new();
        let mut priority = Vec::new();
        let mut regular = Vec::new();

        for candidate in candidates {
            let key = candidate.key();
            if self.is_host(&candidate.info) || sets.blacklisted.contains_key(&key) {
                continue;
            }
            if let Some(existing) = sets.resolved.get_mut(&key) {
                existing.last_updated = candidate.last_updated;
                admitted.push(existing.clone());
            } else if self.is_priority(&candidate.info) {
                priority.push(candidate);
            } else {
                regular.push(candidate);
            }
        }

        let needed = (sets.resolved.len() + priority.len()).saturating_sub(self.max_resolved);
        if needed > 0 {
            let evicted = evict_random(&mut sets.resolved, self.priority.as_ref(), needed);
            for peer in evicted {
                log::debug!("Evicted resolved peer {} for a priority peer", peer);
                self.requeue(&mut sets, peer);
            }
        }

        for peer in priority.into_iter().chain(regular) {
            if sets.resolved.len() >= self.max_resolved {
                break;
            }
            admitted.push(insert_resolved(&mut sets, peer));
        }
        self.prune_known(&mut sets);

        if !admitted.is_empty() {
            log::info!("Admitted {} resolved peers", admitted.len());
        }
        admitted
    }

    /// Disconnect up to `count` random non-priority resolved peers
    pub async fn evict_resolved(&self, count: usize) -> Vec<Peer> {
        let mut sets = self.sets.write().await;
        let evicted = evict_random(&mut sets.resolved, self.priority.as_ref(), count);
        for peer in &evicted {
            self.requeue(&mut sets, peer.clone());
        }
        self.prune_known(&mut sets);
        evicted
    }

    /// Make room so `candidates` priority peers still fit into the resolved
    /// pool, evicting non-priority resolved peers. Returns the evicted peers.
    pub async fn reserve_for_priority(&self, candidates: &[Peer]) -> Vec<Peer> {
        let mut sets = self.sets.write().await;
        let incoming = candidates
            .iter()
            .filter(|c| self.is_priority(&c.info) && !sets.resolved.contains_key(&c.key()))
            .count();

        let needed = (sets.resolved.len() + incoming).saturating_sub(self.max_resolved);
        if needed == 0 {
            return Vec::new();
        }

        let evicted = evict_random(&mut sets.resolved, self.priority.as_ref(), needed);
        for peer in &evicted {
            self.requeue(&mut sets, peer.clone());
        }
        self.prune_known(&mut sets);
        evicted
    }

    /// Drop a peer from the resolved pool, requeueing it as unresolved when
    /// there is room. Returns whether it was requeued.
    pub async fn disconnect(&self, peer: &Peer) -> bool {
        let mut sets = self.sets.write().await;
        let current = sets.resolved.remove(&peer.key());
        if current.is_none() && sets.unresolved.contains_key(&peer.key()) {
            return true;
        }
        if sets.blacklisted.contains_key(&peer.key()) {
            return false;
        }

        let requeued = self.requeue(&mut sets, current.unwrap_or_else(|| peer.clone()));
        self.prune_known(&mut sets);
        log::info!(
            "Disconnected peer: {} ({})",
            peer,
            if requeued { "requeued" } else { "dropped" }
        );
        requeued
    }

    // =========================================================================
    // Blacklist
    // =========================================================================

    /// Blacklist a peer, taking it out of the unresolved and resolved pools
    pub async fn blacklist(&self, peer: &Peer, cause: &str) -> Result<(), PeerError> {
        if self.is_host(&peer.info) {
            return Err(PeerError::HostPeer(peer.key()));
        }

        let mut sets = self.sets.write().await;
        let key = peer.key();
        sets.unresolved.remove(&key);
        sets.resolved.remove(&key);

        let mut blacklisted = peer.clone();
        blacklisted.state = PeerState::Blacklisted;
        blacklisted.blacklisting_time = Some(Utc::now());
        blacklisted.blacklisting_cause = Some(cause.to_string());
        sets.known.insert(key.clone(), blacklisted.clone());
        sets.blacklisted.insert(key, blacklisted);

        log::warn!("Blacklisted peer {}: {}", peer, cause);
        Ok(())
    }

    /// Lift a blacklist and queue the peer for resolution (not forced)
    pub async fn unblacklist(&self, peer: &Peer) -> Result<(), PeerError> {
        let mut sets = self.sets.write().await;
        let mut restored = sets
            .blacklisted
            .remove(&peer.key())
            .ok_or_else(|| PeerError::NotFound(peer.key()))?;

        restored.state = PeerState::Unresolved;
        restored.blacklisting_time = None;
        restored.blacklisting_cause = None;
        sets.known.insert(restored.key(), restored.clone());

        log::info!("Unblacklisted peer: {}", peer);
        let queued = self.insert_unresolved(&mut sets, restored);
        self.prune_known(&mut sets);
        queued
    }

    /// Insert into the blacklisted pool as is
    pub async fn add_blacklisted(&self, peer: Peer) -> Result<(), PeerError> {
        let cause = peer
            .blacklisting_cause
            .clone()
            .unwrap_or_else(|| "unspecified".to_string());
        self.blacklist(&peer, &cause).await
    }

    pub async fn remove_blacklisted(&self, peer: &Peer) -> Result<(), PeerError> {
        let mut sets = self.sets.write().await;
        sets.blacklisted
            .remove(&peer.key())
            .ok_or_else(|| PeerError::NotFound(peer.key()))?;
        self.prune_known(&mut sets);
        Ok(())
    }

    // =========================================================================
    // Private helpers
    // =========================================================================

    fn insert_unresolved(&self, sets: &mut PeerSets, mut peer: Peer) -> Result<(), PeerError> {
        let key = peer.key();
        if self.is_host(&peer.info) {
            return Err(PeerError::HostPeer(key));
        }
        if sets.blacklisted.contains_key(&key) {
            return Err(PeerError::Blacklisted(key));
        }
        if sets.unresolved.contains_key(&key) || sets.resolved.contains_key(&key) {
            return Ok(());
        }
        if sets.unresolved.len() >= self.max_unresolved {
            return Err(PeerError::CapacityExceeded {
                pool: PeerPool::Unresolved,
                limit: self.max_unresolved,
            });
        }

        peer.state = PeerState::Unresolved;
        sets.known.insert(key.clone(), peer.clone());
        sets.unresolved.insert(key, peer);
        Ok(())
    }

    fn requeue(&self, sets: &mut PeerSets, peer: Peer) -> bool {
        self.insert_unresolved(sets, peer).is_ok()
    }

    /// Forget random known peers outside every pool until at most
    /// `known_limit` of them are left
    fn prune_known(&self, sets: &mut PeerSets) {
        let members = sets.unresolved.len() + sets.resolved.len() + sets.blacklisted.len();
        let dormant = sets.known.len().saturating_sub(members);
        let limit = self.known_limit();
        if dormant <= limit {
            return;
        }

        let mut keys: Vec<String> = sets
            .known
            .keys()
            .filter(|key| {
                !sets.unresolved.contains_key(*key)
                    && !sets.resolved.contains_key(*key)
                    && !sets.blacklisted.contains_key(*key)
            })
            .cloned()
            .collect();
        keys.shuffle(&mut rand::thread_rng());
        for key in keys.into_iter().take(dormant - limit) {
            sets.known.remove(&key);
        }
        log::debug!("Pruned {} known peers", dormant - limit);
    }
}

fn insert_resolved(sets: &mut PeerSets, mut peer: Peer) -> Peer {
    let key = peer.key();
    sets.unresolved.remove(&key);
    peer.state = PeerState::Resolved;
    if peer.last_updated.is_none() {
        peer.last_updated = Some(Utc::now());
    }
    sets.known.insert(key.clone(), peer.clone());
    sets.resolved.insert(key, peer.clone());
    peer
}

/// Remove up to `count` random non-priority peers from `set`
fn evict_random(set: &mut PeerSet, priority: &dyn PriorityStrategy, count: usize) -> Vec<Peer> {
    let mut keys: Vec<String> = set
        .iter()
        .filter(|(_, peer)| !priority.is_priority(&peer.info))
        .map(|(key, _)| key.clone())
        .collect();
    keys.shuffle(&mut rand::thread_rng());

    keys.into_iter()
        .take(count)
        .filter_map(|key| set.remove(&key))
        .collect()
}

fn pick_random(snapshot: Vec<Peer>) -> Option<Peer> {
    snapshot.choose(&mut rand::thread_rng()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::priority::NoPriority;
    use std::collections::HashSet;

    fn node(i: u16) -> NodeInfo {
        NodeInfo::new("10.0.0.1", 9000 + i)
    }

    fn registry(max_unresolved: usize, max_resolved: usize) -> PeerRegistry {
        PeerRegistry::new(
            NodeInfo::new("127.0.0.1", 8001),
            max_unresolved,
            max_resolved,
            Arc::new(NoPriority),
        )
    }

    fn prioritized(max_unresolved: usize, max_resolved: usize, keys: &[&str]) -> PeerRegistry {
        PeerRegistry::new(
            NodeInfo::new("127.0.0.1", 8001),
            max_unresolved,
            max_resolved,
            Arc::new(StaticPriority::new(keys.iter().copied())),
        )
    }

    async fn assert_invariants(registry: &PeerRegistry) {
        let unresolved: HashSet<_> = registry.unresolved_peers().await.iter().map(Peer::key).collect();
        let resolved: HashSet<_> = registry.resolved_peers().await.iter().map(Peer::key).collect();
        let blacklisted: HashSet<_> = registry.blacklisted_peers().await.iter().map(Peer::key).collect();
        let known: HashSet<_> = registry.known_peers().await.iter().map(Peer::key).collect();

        assert!(unresolved.is_subset(&known));
        assert!(resolved.is_subset(&known));
        assert!(blacklisted.is_subset(&known));
        let members = unresolved.len() + resolved.len() + blacklisted.len();
        assert!(known.len() - members <= registry.known_limit());

        assert!(unresolved.len() <= registry.max_unresolved());
        assert!(resolved.len() <= registry.max_resolved());
        assert!(unresolved.is_disjoint(&resolved));
        assert!(unresolved.is_disjoint(&blacklisted));
        assert!(resolved.is_disjoint(&blacklisted));
        assert!(!unresolved.contains(&registry.host().key()));
        assert!(!resolved.contains(&registry.host().key()));
    }

    #[tokio::test]
    async fn test_add_unresolved_skips_host_and_duplicates() {
        let registry = registry(10, 10);
        let nodes = vec![node(1), node(1), NodeInfo::new("127.0.0.1", 8001), node(2)];

        let added = registry.add_unresolved(nodes, false).await.unwrap();
        assert_eq!(added, 2);
        assert_eq!(registry.stats().await.unresolved, 2);
        assert_eq!(registry.stats().await.known, 2);
        assert_invariants(&registry).await;
    }

    #[tokio::test]
    async fn test_add_unresolved_full_rejects_batch() {
        let registry = registry(2, 10);
        registry.add_unresolved(vec![node(1), node(2)], false).await.unwrap();

        let result = registry.add_unresolved(vec![node(3)], false).await;
        assert_eq!(
            result,
            Err(PeerError::CapacityExceeded {
                pool: PeerPool::Unresolved,
                limit: 2
            })
        );
        assert_invariants(&registry).await;
    }

    #[tokio::test]
    async fn test_add_unresolved_partial_batch_stops_at_capacity() {
        let registry = registry(2, 10);
        let added = registry
            .add_unresolved(vec![node(1), node(2), node(3)], false)
            .await
            .unwrap();
        assert_eq!(added, 2);
        assert_invariants(&registry).await;
    }

    #[tokio::test]
    async fn test_add_unresolved_forced_evicts_non_priority() {
        let registry = prioritized(2, 10, &["10.0.0.1:9001"]);
        registry.add_unresolved(vec![node(1), node(2)], false).await.unwrap();

        let added = registry.add_unresolved(vec![node(3)], true).await.unwrap();
        assert_eq!(added, 1);

        let keys: HashSet<_> = registry.unresolved_peers().await.iter().map(Peer::key).collect();
        assert!(keys.contains("10.0.0.1:9001"));
        assert!(keys.contains("10.0.0.1:9003"));
        assert!(!keys.contains("10.0.0.1:9002"));
        assert_invariants(&registry).await;
    }

    #[tokio::test]
    async fn test_add_unresolved_forced_keeps_priority_pool() {
        let registry = prioritized(1, 10, &["10.0.0.1:9001"]);
        registry.add_unresolved(vec![node(1)], false).await.unwrap();

        let added = registry.add_unresolved(vec![node(2)], true).await.unwrap();
        assert_eq!(added, 0);
        assert_eq!(registry.pool_of("10.0.0.1:9001").await, Some(PeerPool::Unresolved));
    }

    #[tokio::test]
    async fn test_add_resolved_moves_out_of_unresolved() {
        let registry = registry(10, 10);
        registry.add_unresolved(vec![node(1)], false).await.unwrap();

        registry.add_resolved(Peer::new(node(1))).await.unwrap();
        assert_eq!(registry.pool_of("10.0.0.1:9001").await, Some(PeerPool::Resolved));
        assert_eq!(registry.stats().await.unresolved, 0);

        let resolved = registry.random_resolved().await.unwrap();
        assert_eq!(resolved.state, PeerState::Resolved);
        assert!(resolved.last_updated.is_some());
        assert_invariants(&registry).await;
    }

    #[tokio::test]
    async fn test_add_resolved_capacity_and_host() {
        let registry = registry(10, 1);
        registry.add_resolved(Peer::new(node(1))).await.unwrap();

        let full = registry.add_resolved(Peer::new(node(2))).await;
        assert!(matches!(full, Err(PeerError::CapacityExceeded { .. })));

        let host = registry.add_resolved(Peer::new(NodeInfo::new("127.0.0.1", 8001))).await;
        assert!(matches!(host, Err(PeerError::HostPeer(_))));

        // Refreshing an already resolved peer does not need a free slot
        assert!(registry.add_resolved(Peer::new(node(1))).await.is_ok());
        assert_invariants(&registry).await;
    }

    #[tokio::test]
    async fn test_random_selection_empty_and_nonempty() {
        let registry = registry(10, 10);
        assert!(registry.random_resolved().await.is_none());
        assert!(registry.random_unresolved().await.is_none());
        assert!(registry.random_known().await.is_none());

        registry.add_unresolved(vec![node(1), node(2)], false).await.unwrap();
        let picked = registry.random_unresolved().await.unwrap();
        assert!(picked.key() == "10.0.0.1:9001" || picked.key() == "10.0.0.1:9002");
        assert!(registry.random_known().await.is_some());
    }

    #[tokio::test]
    async fn test_blacklist_and_unblacklist() {
        let registry = registry(10, 10);
        registry.add_resolved(Peer::new(node(1))).await.unwrap();
        let peer = registry.random_resolved().await.unwrap();

        registry.blacklist(&peer, "sent oversized segment").await.unwrap();
        assert_eq!(registry.pool_of(&peer.key()).await, Some(PeerPool::Blacklisted));
        let listed = registry.blacklisted_peers().await;
        assert_eq!(listed[0].blacklisting_cause.as_deref(), Some("sent oversized segment"));
        assert!(listed[0].blacklisting_time.is_some());

        // Blacklisted peers are not re-added by exchanges
        assert_eq!(registry.add_unresolved(vec![node(1)], true).await.unwrap(), 0);
        assert_invariants(&registry).await;

        registry.unblacklist(&peer).await.unwrap();
        assert_eq!(registry.pool_of(&peer.key()).await, Some(PeerPool::Unresolved));
        let requeued = registry.random_unresolved().await.unwrap();
        assert!(requeued.blacklisting_time.is_none());
        assert!(requeued.blacklisting_cause.is_none());
        assert_invariants(&registry).await;
    }

    #[tokio::test]
    async fn test_direct_pool_removal() {
        let registry = registry(10, 10);
        registry.add_resolved(Peer::new(node(1))).await.unwrap();
        let peer = registry.random_resolved().await.unwrap();

        registry.remove_resolved(&peer).await.unwrap();
        assert_eq!(registry.pool_of(&peer.key()).await, Some(PeerPool::Known));
        assert!(matches!(
            registry.remove_resolved(&peer).await,
            Err(PeerError::NotFound(_))
        ));

        let mut banned = Peer::new(node(2));
        banned.blacklisting_cause = Some("replayed blocks".to_string());
        registry.add_blacklisted(banned.clone()).await.unwrap();
        let listed = registry.blacklisted_peers().await;
        assert_eq!(listed[0].blacklisting_cause.as_deref(), Some("replayed blocks"));

        registry.remove_blacklisted(&banned).await.unwrap();
        assert!(registry.blacklisted_peers().await.is_empty());

        registry.add_unresolved(vec![node(3)], false).await.unwrap();
        let queued = registry.random_unresolved().await.unwrap();
        registry.remove_unresolved(&queued).await.unwrap();
        assert!(registry.unresolved_peers().await.is_empty());
        assert!(registry.remove_unresolved(&queued).await.is_err());
        assert_invariants(&registry).await;
    }

    #[tokio::test]
    async fn test_known_peers_are_bounded() {
        let registry = registry(2, 10);
        assert_eq!(registry.known_limit(), 48);

        for batch in 0..50u16 {
            let nodes = (0..20u16)
                .map(|i| NodeInfo::new("10.1.0.1", 10_000 + batch * 20 + i))
                .collect();
            registry.add_unresolved(nodes, true).await.unwrap();
            assert_invariants(&registry).await;
        }

        let stats = registry.stats().await;
        assert_eq!(stats.unresolved, 2);
        assert_eq!(stats.known, 2 + registry.known_limit());
    }

    #[tokio::test]
    async fn test_unblacklist_into_full_pool() {
        let registry = registry(1, 10);
        let peer = Peer::new(node(1));
        registry.blacklist(&peer, "bad").await.unwrap();
        registry.add_unresolved(vec![node(2)], false).await.unwrap();

        let result = registry.unblacklist(&peer).await;
        assert!(matches!(result, Err(PeerError::CapacityExceeded { .. })));
        assert_eq!(registry.pool_of(&peer.key()).await, Some(PeerPool::Known));
        assert!(registry.unblacklist(&peer).await.is_err());
    }

    #[tokio::test]
    async fn test_blacklist_host_rejected() {
        let registry = registry(10, 10);
        let host = Peer::new(registry.host().clone());
        assert!(matches!(
            registry.blacklist(&host, "self").await,
            Err(PeerError::HostPeer(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_requeues_when_room() {
        let registry = registry(1, 10);
        registry.add_resolved(Peer::new(node(1))).await.unwrap();
        registry.add_resolved(Peer::new(node(2))).await.unwrap();

        assert!(registry.disconnect(&Peer::new(node(1))).await);
        assert_eq!(registry.pool_of("10.0.0.1:9001").await, Some(PeerPool::Unresolved));

        // Unresolved is now full: the second peer is dropped
        assert!(!registry.disconnect(&Peer::new(node(2))).await);
        assert_eq!(registry.pool_of("10.0.0.1:9002").await, Some(PeerPool::Known));
        assert_invariants(&registry).await;
    }

    #[tokio::test]
    async fn test_capacity_overflow_counters() {
        let registry = registry(3, 2);
        assert_eq!(registry.exceed_resolved_capacity().await, -2);
        assert_eq!(registry.exceed_unresolved_capacity().await, -3);

        registry.add_resolved(Peer::new(node(1))).await.unwrap();
        registry.add_resolved(Peer::new(node(2))).await.unwrap();
        assert_eq!(registry.exceed_resolved_capacity().await, 0);
    }

    #[tokio::test]
    async fn test_admit_resolved_priority_evicts_regular() {
        let registry = prioritized(10, 3, &["10.0.0.1:9010", "10.0.0.1:9011"]);
        for i in 1..=3 {
            registry.add_resolved(Peer::new(node(i))).await.unwrap();
        }

        let candidates = vec![Peer::new(node(10)), Peer::new(node(11)), Peer::new(node(4))];
        let admitted = registry.admit_resolved(candidates).await;
        let admitted_keys: HashSet<_> = admitted.iter().map(Peer::key).collect();

        assert!(admitted_keys.contains("10.0.0.1:9010"));
        assert!(admitted_keys.contains("10.0.0.1:9011"));
        assert!(!admitted_keys.contains("10.0.0.1:9004"));
        assert_eq!(registry.stats().await.resolved, 3);
        // Two regular peers were pushed back to unresolved
        assert_eq!(registry.stats().await.unresolved, 2);
        assert_invariants(&registry).await;
    }

    #[tokio::test]
    async fn test_admit_resolved_fills_free_slots() {
        let registry = registry(10, 2);
        registry.add_unresolved(vec![node(1), node(2), node(3)], false).await.unwrap();

        let candidates = vec![Peer::new(node(1)), Peer::new(node(2)), Peer::new(node(3))];
        let admitted = registry.admit_resolved(candidates).await;

        assert_eq!(admitted.len(), 2);
        let stats = registry.stats().await;
        assert_eq!(stats.resolved, 2);
        assert_eq!(stats.unresolved, 1);
        assert_invariants(&registry).await;
    }

    #[tokio::test]
    async fn test_reserve_for_priority() {
        let registry = prioritized(10, 2, &["10.0.0.1:9010"]);
        registry.add_resolved(Peer::new(node(1))).await.unwrap();
        registry.add_resolved(Peer::new(node(2))).await.unwrap();

        let evicted = registry
            .reserve_for_priority(&[Peer::new(node(10)), Peer::new(node(5))])
            .await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(registry.stats().await.resolved, 1);
        assert_invariants(&registry).await;
    }

    #[tokio::test]
    async fn test_evict_resolved_spares_priority() {
        let registry = prioritized(10, 5, &["10.0.0.1:9001"]);
        registry.add_resolved(Peer::new(node(1))).await.unwrap();
        registry.add_resolved(Peer::new(node(2))).await.unwrap();

        let evicted = registry.evict_resolved(2).await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key(), "10.0.0.1:9002");
        assert_eq!(registry.pool_of("10.0.0.1:9001").await, Some(PeerPool::Resolved));
    }

    #[tokio::test]
    async fn test_random_operation_sequence_keeps_invariants() {
        use rand::{Rng, SeedableRng};

        let registry = prioritized(4, 3, &["10.0.0.1:9001", "10.0.0.1:9002"]);
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);

        for _ in 0..400 {
            let i: u16 = rng.gen_range(1..12);
            let peer = Peer::new(node(i));
            match rng.gen_range(0..8) {
                0 => {
                    let _ = registry.add_unresolved(vec![node(i), node(i + 1)], false).await;
                }
                1 => {
                    let _ = registry.add_unresolved(vec![node(i)], true).await;
                }
                2 => {
                    let _ = registry.add_resolved(peer).await;
                }
                3 => {
                    registry.admit_resolved(vec![peer, Peer::new(node(i + 2))]).await;
                }
                4 => {
                    let _ = registry.blacklist(&peer, "fuzz").await;
                }
                5 => {
                    let _ = registry.unblacklist(&peer).await;
                }
                6 => {
                    registry.disconnect(&peer).await;
                }
                _ => {
                    registry.evict_resolved(1).await;
                }
            }
            assert_invariants(&registry).await;
        }
    }
}

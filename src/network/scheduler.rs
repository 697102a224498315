//! Peer lifecycle scheduler
//!
//! Three periodic tasks keep the registry pools moving:
//! - resolve: handshake unresolved peers and refresh stale resolved ones
//! - discover: exchange peer lists with one random resolved peer
//! - unblacklist: release peers whose blacklist period is over
//!
//! Every remote call of a tick runs concurrently, bounded by a semaphore.

use crate::config::PeerConfig;
use crate::network::peer::{Peer, PeerPool, MIN_PROTOCOL_VERSION};
use crate::network::registry::PeerRegistry;
use crate::network::transport::{PeerTransport, TransportError};
use chrono::Utc;
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Result of one resolve tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveReport {
    /// Peers handshaken this tick
    pub attempted: usize,
    /// Peers now sitting in the resolved pool
    pub admitted: usize,
    /// Peers whose handshake failed
    pub failed: usize,
    /// Peers blacklisted for an outdated protocol
    pub rejected: usize,
}

enum Handshake {
    Ok(Peer),
    Failed(Peer, TransportError),
    Outdated(Peer, u32),
}

/// Drives peers through the registry pools
pub struct PeerLifecycleScheduler {
    registry: Arc<PeerRegistry>,
    transport: Arc<dyn PeerTransport>,
    config: PeerConfig,
    limiter: Arc<Semaphore>,
}

impl PeerLifecycleScheduler {
    pub fn new(
        registry: Arc<PeerRegistry>,
        transport: Arc<dyn PeerTransport>,
        config: PeerConfig,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_peer_tasks.max(1)));
        Self {
            registry,
            transport,
            config,
            limiter,
        }
    }

    /// Spawn the three periodic tasks into `tasks`. They stop on `shutdown`.
    pub fn spawn(self: &Arc<Self>, tasks: &mut JoinSet<()>, shutdown: &CancellationToken) {
        let gap = self.config.resolve_peers_gap();

        let this = Arc::clone(self);
        tasks.spawn(every(gap, shutdown.clone(), "resolve", move || {
            let this = Arc::clone(&this);
            async move {
                this.resolve_tick().await;
            }
        }));

        let this = Arc::clone(self);
        tasks.spawn(every(gap, shutdown.clone(), "discover", move || {
            let this = Arc::clone(&this);
            async move {
                this.discover_tick().await;
            }
        }));

        let this = Arc::clone(self);
        let interval = self.config.unblacklist_interval();
        tasks.spawn(every(interval, shutdown.clone(), "unblacklist", move || {
            let this = Arc::clone(&this);
            async move {
                this.unblacklist_tick().await;
            }
        }));
    }

    /// Handshake every unresolved peer and every stale resolved peer
    pub async fn resolve_tick(&self) -> ResolveReport {
        let overflow = self.registry.exceed_resolved_capacity().await;
        if overflow > 0 {
            let evicted = self.registry.evict_resolved(overflow as usize).await;
            log::debug!("Resolved pool over capacity, evicted {} peers", evicted.len());
        }

        let unresolved = self.registry.unresolved_peers().await;
        self.registry.reserve_for_priority(&unresolved).await;

        let now = Utc::now();
        let max_age = chrono::Duration::seconds(self.config.seconds_to_update_peers_connection);
        let stale: Vec<Peer> = self
            .registry
            .resolved_peers()
            .await
            .into_iter()
            .filter(|p| p.needs_refresh(now, max_age))
            .collect();

        let candidates: Vec<Peer> = unresolved.into_iter().chain(stale).collect();
        let mut report = ResolveReport {
            attempted: candidates.len(),
            ..Default::default()
        };
        if candidates.is_empty() {
            return report;
        }

        let outcomes = join_all(candidates.into_iter().map(|peer| self.handshake(peer))).await;

        let mut succeeded = Vec::new();
        for outcome in outcomes {
            match outcome {
                Handshake::Ok(peer) => succeeded.push(peer),
                Handshake::Failed(peer, e) => {
                    report.failed += 1;
                    log::debug!("Handshake with {} failed: {}", peer, e);
                    self.drop_failed(&peer).await;
                }
                Handshake::Outdated(peer, version) => {
                    report.rejected += 1;
                    let cause = format!("protocol version {} below {}", version, MIN_PROTOCOL_VERSION);
                    if let Err(e) = self.registry.blacklist(&peer, &cause).await {
                        log::debug!("Could not blacklist {}: {}", peer, e);
                    }
                }
            }
        }

        report.admitted = self.registry.admit_resolved(succeeded).await.len();
        report
    }

    /// Swap peer lists with one random resolved peer.
    /// Returns the number of new unresolved peers.
    pub async fn discover_tick(&self) -> usize {
        let Some(peer) = self.registry.random_resolved().await else {
            return 0;
        };
        let _permit = match self.limiter.acquire().await {
            Ok(permit) => permit,
            Err(_) => return 0,
        };

        let nodes = match self.transport.get_more_peers(&peer).await {
            Ok(nodes) => nodes,
            Err(e) => {
                log::debug!("Peer exchange with {} failed: {}", peer, e);
                self.registry.disconnect(&peer).await;
                return 0;
            }
        };

        let added = match self.registry.add_unresolved(nodes, true).await {
            Ok(added) => added,
            Err(e) => {
                log::debug!("Discarding peers from {}: {}", peer, e);
                0
            }
        };

        let mut ours: Vec<_> = self
            .registry
            .resolved_peers()
            .await
            .into_iter()
            .filter(|p| p.key() != peer.key())
            .map(|p| p.info)
            .collect();
        ours.push(self.registry.host().clone());
        if let Err(e) = self.transport.send_peers(&peer, ours).await {
            log::debug!("Sending peers to {} failed: {}", peer, e);
        }

        if added > 0 {
            log::info!("Discovered {} new peers via {}", added, peer);
        }
        added
    }

    /// Release every blacklisted peer whose period has elapsed.
    /// Returns the number of peers queued again.
    pub async fn unblacklist_tick(&self) -> usize {
        let now = Utc::now();
        let period = self.config.blacklisting_period();
        let mut released = 0;

        for peer in self.registry.blacklisted_peers().await {
            if !peer.blacklist_expired(now, period) {
                continue;
            }
            match self.registry.unblacklist(&peer).await {
                Ok(()) => released += 1,
                Err(e) => log::debug!("Unblacklisted {} but could not queue it: {}", peer, e),
            }
        }
        released
    }

    async fn handshake(&self, mut peer: Peer) -> Handshake {
        let _permit = match self.limiter.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Handshake::Failed(peer, TransportError::Disconnected),
        };

        match self.transport.get_peer_info(&peer).await {
            Ok(info) if info.version < MIN_PROTOCOL_VERSION => Handshake::Outdated(peer, info.version),
            Ok(info) => {
                peer.info.version = info.version;
                if info.shared_address.is_some() {
                    peer.info.shared_address = info.shared_address;
                }
                peer.last_updated = Some(Utc::now());
                Handshake::Ok(peer)
            }
            Err(e) => Handshake::Failed(peer, e),
        }
    }

    /// Disconnect a peer whose handshake failed. Unresolved peers stay
    /// queued and are retried on the next tick.
    async fn drop_failed(&self, peer: &Peer) {
        if let Some(PeerPool::Resolved | PeerPool::Unresolved) =
            self.registry.pool_of(&peer.key()).await
        {
            self.registry.disconnect(peer).await;
        }
    }
}

/// Run `tick` every `period` until `shutdown` fires
async fn every<F, Fut>(period: Duration, shutdown: CancellationToken, name: &'static str, mut tick: F)
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = ()> + Send,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => tick().await,
        }
    }
    log::debug!("Stopped {} task", name);
}

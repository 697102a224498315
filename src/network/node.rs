//! Node assembly
//!
//! The node owns the chain, the peer registry and the transport, and runs
//! the server, the peer lifecycle scheduler, the sync coordinator and the
//! block relay under one cancellation token.

use crate::config::{ConfigError, NodeConfig};
use crate::core::{Block, BlockService, Blockchain, ChainType};
use crate::network::peer::{NodeInfo, Peer};
use crate::network::registry::{PeerRegistry, RegistryStats};
use crate::network::scheduler::PeerLifecycleScheduler;
use crate::network::server::{ChainResponder, Server};
use crate::network::sync::{ChainSyncCoordinator, RoundOutcome, SyncStage};
use crate::network::transport::{PeerTransport, TcpTransport};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Capacity of the inbound transaction channel
const TRANSACTION_QUEUE: usize = 256;

/// Snapshot of what the node is doing
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStatus {
    pub host: String,
    pub height: u32,
    pub peers: RegistryStats,
    pub syncing: bool,
    pub stage: SyncStage,
    pub last_round: Option<RoundOutcome>,
}

/// A running peer of the network
pub struct Node {
    config: NodeConfig,
    chain: Arc<Blockchain>,
    registry: Arc<PeerRegistry>,
    transport: Arc<dyn PeerTransport>,
    scheduler: Arc<PeerLifecycleScheduler>,
    coordinator: Arc<ChainSyncCoordinator>,
    shutdown: CancellationToken,
}

impl Node {
    /// Create a node talking to peers over TCP
    pub fn new(config: NodeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = Arc::new(PeerRegistry::from_config(&config));
        let transport = Arc::new(TcpTransport::new(
            registry.host().clone(),
            config.peers.request_timeout(),
        ));
        Ok(Self::with_transport(config, registry, transport))
    }

    /// Create a node on top of an existing registry and transport
    pub fn with_transport(
        config: NodeConfig,
        registry: Arc<PeerRegistry>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        let chain = Arc::new(Blockchain::new(ChainType::Main));
        let scheduler = Arc::new(PeerLifecycleScheduler::new(
            registry.clone(),
            transport.clone(),
            config.peers.clone(),
        ));
        let coordinator = Arc::new(ChainSyncCoordinator::new(
            chain.clone(),
            registry.clone(),
            transport.clone(),
            config.sync.clone(),
        ));

        Self {
            config,
            chain,
            registry,
            transport,
            scheduler,
            coordinator,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn chain(&self) -> &Arc<Blockchain> {
        &self.chain
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<ChainSyncCoordinator> {
        &self.coordinator
    }

    /// Token that stops the node when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Queue the configured seed peers for resolution
    pub async fn seed(&self) -> usize {
        let seeds: Vec<NodeInfo> = self
            .config
            .seed_peers
            .iter()
            .filter_map(|addr| {
                let info = NodeInfo::from_addr_str(addr);
                if info.is_none() {
                    log::warn!("Ignoring malformed seed peer: {}", addr);
                }
                info
            })
            .collect();

        match self.registry.add_unresolved(seeds, true).await {
            Ok(added) => added,
            Err(e) => {
                log::warn!("Failed to add seed peers: {}", e);
                0
            }
        }
    }

    pub async fn status(&self) -> NodeStatus {
        NodeStatus {
            host: self.registry.host().key(),
            height: self.chain.height().await,
            peers: self.registry.stats().await,
            syncing: self.coordinator.is_syncing().await,
            stage: self.coordinator.stage().await,
            last_round: self.coordinator.last_outcome().await,
        }
    }

    /// Send raw transaction bytes to every resolved peer.
    /// Returns how many peers accepted them.
    pub async fn broadcast_transaction(&self, transaction: &[u8]) -> usize {
        let chain_type = self.chain.chain_type();
        let peers = self.registry.resolved_peers().await;
        let sends = peers.iter().map(|peer| async move {
            let result = self
                .transport
                .send_transaction(peer, chain_type, transaction)
                .await;
            (peer, result)
        });

        let mut delivered = 0;
        for (peer, result) in join_all(sends).await {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => log::debug!("Failed to send transaction to {}: {}", peer, e),
            }
        }
        delivered
    }

    /// Run the node until Ctrl-C, SIGTERM or the shutdown token
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let server = Server::bind(self.config.port).await?;
        log::info!(
            "Node {} started on port {}, height {}",
            self.registry.host(),
            server.port(),
            self.chain.height().await
        );

        let seeded = self.seed().await;
        if seeded > 0 {
            log::info!("Queued {} seed peers", seeded);
        }

        let (tx_sender, tx_receiver) = mpsc::channel(TRANSACTION_QUEUE);
        let responder = Arc::new(
            ChainResponder::new(self.chain.clone(), self.registry.clone())
                .with_transactions(tx_sender),
        );

        let mut tasks = JoinSet::new();
        tasks.spawn(server.run(responder, self.shutdown.clone()));
        self.scheduler.spawn(&mut tasks, &self.shutdown);
        tasks.spawn(self.coordinator.clone().run(self.shutdown.clone()));
        tasks.spawn(relay_blocks(
            self.chain.subscribe(),
            self.chain.chain_type(),
            self.registry.clone(),
            self.transport.clone(),
            self.shutdown.clone(),
        ));
        tasks.spawn(drain_transactions(tx_receiver, self.shutdown.clone()));

        tokio::select! {
            _ = wait_for_signal() => {
                log::info!("Shutdown signal received");
                self.shutdown.cancel();
            }
            _ = self.shutdown.cancelled() => {}
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                log::error!("Node task failed: {}", e);
            }
        }

        log::info!("Node stopped");
        Ok(())
    }
}

/// Forward every block the chain accepts with broadcast to the resolved peers
async fn relay_blocks(
    mut accepted: broadcast::Receiver<Block>,
    chain_type: ChainType,
    registry: Arc<PeerRegistry>,
    transport: Arc<dyn PeerTransport>,
    shutdown: CancellationToken,
) {
    loop {
        let block = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = accepted.recv() => match received {
                Ok(block) => block,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Block relay lagged behind, skipped {} blocks", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let peers = registry.resolved_peers().await;
        let sends = peers
            .iter()
            .map(|peer| relay_to(transport.as_ref(), chain_type, peer, &block));
        join_all(sends).await;
    }
}

async fn relay_to(transport: &dyn PeerTransport, chain_type: ChainType, peer: &Peer, block: &Block) {
    match transport.send_block(peer, chain_type, block).await {
        Ok(receipt) => log::debug!(
            "Relayed block {} to {} (their height {})",
            block.id,
            peer,
            receipt.reference_block_height
        ),
        Err(e) => log::debug!("Failed to relay block {} to {}: {}", block.id, peer, e),
    }
}

/// Accept transactions pushed by peers. Pool management happens elsewhere.
async fn drain_transactions(mut incoming: mpsc::Receiver<Vec<u8>>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = incoming.recv() => match received {
                Some(transaction) => {
                    log::debug!("Received transaction of {} bytes", transaction.len());
                }
                None => break,
            },
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            log::warn!("Cannot listen for SIGTERM: {}", e);
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
            return;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if result.is_err() {
                terminate.recv().await;
            }
        }
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

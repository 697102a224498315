//! TCP server and request handling
//!
//! Accepts incoming peer connections and answers their requests from the
//! local chain and peer registry.

use crate::core::{Block, BlockService, ChainType};
use crate::network::codec::ServerCodec;
use crate::network::message::{ChainWeight, Receipt, Request, Response};
use crate::network::peer::{NodeInfo, Peer};
use crate::network::registry::PeerRegistry;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// Largest number of block ids or blocks returned by one response
pub const MAX_BLOCKS_PER_RESPONSE: u32 = 1440;

/// Maximum number of milestone ids returned by one response
pub const MAX_MILESTONE_IDS: usize = 10;

/// Step, in blocks, between milestones when starting from the tip
const INITIAL_MILESTONE_JUMP: u32 = 10;

/// Answers peer requests from the local chain and registry
pub struct ChainResponder {
    chain: Arc<dyn BlockService>,
    registry: Arc<PeerRegistry>,
    transactions: Option<mpsc::Sender<Vec<u8>>>,
}

impl ChainResponder {
    pub fn new(chain: Arc<dyn BlockService>, registry: Arc<PeerRegistry>) -> Self {
        Self {
            chain,
            registry,
            transactions: None,
        }
    }

    /// Forward relayed transactions to `tx`
    pub fn with_transactions(mut self, tx: mpsc::Sender<Vec<u8>>) -> Self {
        self.transactions = Some(tx);
        self
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Answer one request. Failures become `Response::Error`.
    pub async fn handle(&self, request: Request) -> Response {
        let name = request.type_name();
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(reason) => {
                log::debug!("{} refused: {}", name, reason);
                Response::Error(reason)
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Response, String> {
        match request {
            Request::GetPeerInfo { sender } => Ok(self.on_peer_info(sender).await),
            Request::GetMorePeers => {
                let peers = self
                    .registry
                    .resolved_peers()
                    .await
                    .into_iter()
                    .map(|p| p.info)
                    .collect();
                Ok(Response::Peers(peers))
            }
            Request::SendPeers { peers } => {
                // A full pool simply ignores the gossip
                if let Err(e) = self.registry.add_unresolved(peers, false).await {
                    log::debug!("Ignoring gossiped peers: {}", e);
                }
                Ok(Response::Ack)
            }
            Request::GetCumulativeDifficulty { chain_type } => {
                self.check_chain(chain_type)?;
                let tip = self.tip().await?;
                Ok(Response::CumulativeDifficulty(ChainWeight {
                    cumulative_difficulty: tip.cumulative_difficulty,
                    height: tip.height,
                }))
            }
            Request::GetCommonMilestoneBlockIds {
                chain_type,
                last_block_id,
                last_milestone_block_id,
            } => {
                self.check_chain(chain_type)?;
                let ids = self
                    .milestone_block_ids(last_block_id, last_milestone_block_id)
                    .await?;
                Ok(Response::BlockIds(ids))
            }
            Request::GetNextBlockIds {
                chain_type,
                block_id,
                limit,
            } => {
                self.check_chain(chain_type)?;
                Ok(Response::BlockIds(self.next_block_ids(block_id, limit).await?))
            }
            Request::GetNextBlocks {
                chain_type,
                block_ids,
                block_id,
            } => {
                self.check_chain(chain_type)?;
                Ok(Response::Blocks(self.next_blocks(&block_ids, block_id).await?))
            }
            Request::SendBlock {
                chain_type,
                sender,
                block,
            } => {
                self.check_chain(chain_type)?;
                Ok(Response::Receipt(self.receive_block(sender, block).await?))
            }
            Request::SendTransaction {
                chain_type,
                transaction,
            } => {
                self.check_chain(chain_type)?;
                let bytes = hex::decode(&transaction).map_err(|e| e.to_string())?;
                match &self.transactions {
                    Some(tx) => tx
                        .send(bytes)
                        .await
                        .map_err(|_| "transaction pool is closed".to_string())?,
                    None => log::debug!("No transaction pool attached, dropping transaction"),
                }
                Ok(Response::Ack)
            }
        }
    }

    fn check_chain(&self, chain_type: ChainType) -> Result<(), String> {
        if chain_type == self.chain.chain_type() {
            Ok(())
        } else {
            Err(format!("{} chain is not served", chain_type))
        }
    }

    async fn tip(&self) -> Result<Block, String> {
        self.chain.last_block().await.map_err(|e| e.to_string())
    }

    async fn on_peer_info(&self, sender: NodeInfo) -> Response {
        // Peers already queued or resolved are left where they are
        if !self.registry.is_host(&sender) {
            if let Err(e) = self.registry.add_unresolved_peer(Peer::new(sender)).await {
                log::debug!("Not queueing inbound peer: {}", e);
            }
        }
        Response::PeerInfo(self.registry.host().clone())
    }

    /// Milestone ids for a peer looking for our common block.
    ///
    /// When the peer's tip is on our chain the answer is that tip alone.
    /// Otherwise ids step back from our tip (or from the peer's last
    /// milestone) by a fixed jump, ending at genesis.
    async fn milestone_block_ids(
        &self,
        last_block_id: i64,
        last_milestone_block_id: i64,
    ) -> Result<Vec<i64>, String> {
        if self.lookup(last_block_id).await?.is_some() {
            return Ok(vec![last_block_id]);
        }

        let tip = self.tip().await?;
        let (mut height, jump) = if last_milestone_block_id == 0 {
            (tip.height, INITIAL_MILESTONE_JUMP)
        } else {
            let milestone = self.lookup(last_milestone_block_id).await?.ok_or_else(|| {
                format!("milestone block {} not found", last_milestone_block_id)
            })?;
            let jump = tip
                .height
                .saturating_sub(milestone.height)
                .clamp(1, MAX_BLOCKS_PER_RESPONSE);
            (milestone.height.saturating_sub(jump), jump)
        };

        let mut ids = Vec::new();
        while height > 0 && ids.len() < MAX_MILESTONE_IDS {
            if let Some(block) = self.block_at(height).await? {
                ids.push(block.id);
            }
            height = height.saturating_sub(jump);
        }
        if height == 0 && ids.len() < MAX_MILESTONE_IDS {
            ids.push(self.chain.genesis_id());
        }

        Ok(ids)
    }

    /// `block_id` followed by the ids of its successors, `limit` ids at most
    async fn next_block_ids(&self, block_id: i64, limit: u32) -> Result<Vec<i64>, String> {
        let Some(start) = self.lookup(block_id).await? else {
            return Ok(Vec::new());
        };

        let limit = limit.min(MAX_BLOCKS_PER_RESPONSE);
        let mut ids = Vec::new();
        let mut height = start.height;
        while (ids.len() as u32) < limit {
            match self.block_at(height).await? {
                Some(block) => ids.push(block.id),
                None => break,
            }
            height += 1;
        }
        Ok(ids)
    }

    /// Blocks after `block_id` for as long as they match `block_ids` in order
    async fn next_blocks(&self, block_ids: &[i64], block_id: i64) -> Result<Vec<Block>, String> {
        let Some(start) = self.lookup(block_id).await? else {
            return Ok(Vec::new());
        };

        let mut blocks = Vec::new();
        let mut height = start.height + 1;
        for expected in block_ids.iter().take(MAX_BLOCKS_PER_RESPONSE as usize) {
            match self.block_at(height).await? {
                Some(block) if block.id == *expected => blocks.push(block),
                _ => break,
            }
            height += 1;
        }
        Ok(blocks)
    }

    async fn receive_block(&self, sender: NodeInfo, block: Block) -> Result<Receipt, String> {
        let datum_hash = block.block_hash.clone();

        if self.lookup(block.id).await?.is_none() {
            let _guard = self.chain.chain_write_lock().acquire().await;
            let tip = self.tip().await?;
            if block.previous_block_hash != tip.block_hash {
                return Err(format!("block {} does not extend our tip", block.id));
            }

            let now = chrono::Utc::now().timestamp();
            self.chain
                .validate_block(&block, &tip, now)
                .await
                .map_err(|e| e.to_string())?;
            self.chain
                .push_block(&tip, block, true)
                .await
                .map_err(|e| e.to_string())?;
        }

        let tip = self.tip().await?;
        Ok(Receipt {
            sender: sender.key(),
            recipient: self.registry.host().key(),
            datum_hash,
            reference_block_height: tip.height,
            reference_block_hash: tip.block_hash,
        })
    }

    async fn lookup(&self, id: i64) -> Result<Option<Block>, String> {
        self.chain.block_by_id(id).await.map_err(|e| e.to_string())
    }

    async fn block_at(&self, height: u32) -> Result<Option<Block>, String> {
        self.chain
            .block_by_height(height)
            .await
            .map_err(|e| e.to_string())
    }
}

/// TCP server for accepting peer connections
pub struct Server {
    listener: TcpListener,
    port: u16,
}

impl Server {
    /// Bind to a port and create the server
    pub async fn bind(port: u16) -> Result<Self, std::io::Error> {
        let addr = format!("0.0.0.0:{}", port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        log::info!("Server listening on 0.0.0.0:{}", port);

        Ok(Self { listener, port })
    }

    /// Get the listening port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept and serve connections until `shutdown` fires
    pub async fn run(self, responder: Arc<ChainResponder>, shutdown: CancellationToken) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let responder = Arc::clone(&responder);
                        connections.spawn(handle_connection(stream, addr, responder));
                    }
                    Err(e) => log::warn!("Failed to accept connection: {}", e),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        connections.shutdown().await;
        log::info!("Server on port {} stopped", self.port);
    }
}

/// Serve requests on one inbound connection until the peer hangs up
async fn handle_connection(stream: TcpStream, addr: SocketAddr, responder: Arc<ChainResponder>) {
    let mut framed = Framed::new(stream, ServerCodec::new());

    loop {
        match framed.next().await {
            Some(Ok(request)) => {
                log::trace!("{} from {}", request.type_name(), addr);
                let response = responder.handle(request).await;
                if let Err(e) = framed.send(response).await {
                    log::debug!("Failed to answer {}: {}", addr, e);
                    break;
                }
            }
            Some(Err(e)) => {
                log::warn!("Error reading from {}: {}", addr, e);
                break;
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Blockchain;
    use crate::network::peer::PeerPool;
    use crate::network::priority::NoPriority;
    use crate::network::testing::extend_chain;
    use crate::network::transport::{PeerTransport, TcpTransport};
    use std::time::Duration;

    fn registry() -> Arc<PeerRegistry> {
        Arc::new(PeerRegistry::new(
            NodeInfo::new("127.0.0.1", 8001),
            10,
            10,
            Arc::new(NoPriority),
        ))
    }

    async fn responder(height: u32) -> (Arc<Blockchain>, ChainResponder) {
        let chain = Arc::new(Blockchain::new(ChainType::Main));
        extend_chain(&chain, height, "smith").await;
        let responder = ChainResponder::new(chain.clone(), registry());
        (chain, responder)
    }

    #[tokio::test]
    async fn test_next_block_ids_start_with_anchor() {
        let (chain, responder) = responder(5).await;
        let anchor = chain.block_by_height(2).await.unwrap().unwrap();

        let ids = responder.next_block_ids(anchor.id, 100).await.unwrap();
        assert_eq!(ids, chain.block_ids_from_height(2, 4).await);

        let capped = responder.next_block_ids(anchor.id, 2).await.unwrap();
        assert_eq!(capped.len(), 2);
        assert!(responder.next_block_ids(42, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_next_blocks_follow_requested_order() {
        let (chain, responder) = responder(5).await;
        let genesis = chain.block_by_height(0).await.unwrap().unwrap();
        let mut ids = chain.block_ids_from_height(1, 3).await;

        let blocks = responder.next_blocks(&ids, genesis.id).await.unwrap();
        assert_eq!(blocks.iter().map(|b| b.id).collect::<Vec<_>>(), ids);

        // A mismatching id cuts the answer short
        ids[1] = 7;
        let blocks = responder.next_blocks(&ids, genesis.id).await.unwrap();
        assert_eq!(blocks.len(), 1);
    }

    #[tokio::test]
    async fn test_milestones_for_known_tip() {
        let (chain, responder) = responder(30).await;
        let known = chain.block_by_height(12).await.unwrap().unwrap();

        let ids = responder.milestone_block_ids(known.id, 0).await.unwrap();
        assert_eq!(ids, vec![known.id]);
    }

    #[tokio::test]
    async fn test_milestones_jump_back_to_genesis() {
        let (chain, responder) = responder(30).await;

        let ids = responder.milestone_block_ids(-1, 0).await.unwrap();
        let expected = vec![
            chain.block_by_height(30).await.unwrap().unwrap().id,
            chain.block_by_height(20).await.unwrap().unwrap().id,
            chain.block_by_height(10).await.unwrap().unwrap().id,
            chain.genesis_id(),
        ];
        assert_eq!(ids, expected);

        // Continuing from a milestone the peer did not know
        let ids = responder.milestone_block_ids(-1, expected[2]).await.unwrap();
        assert_eq!(ids, vec![chain.genesis_id()]);

        assert!(responder.milestone_block_ids(-1, 99).await.is_err());
    }

    #[tokio::test]
    async fn test_handshake_queues_sender() {
        let (_chain, responder) = responder(0).await;
        let sender = NodeInfo::new("10.0.0.9", 8001);

        let response = responder
            .handle(Request::GetPeerInfo {
                sender: sender.clone(),
            })
            .await;
        assert_eq!(response, Response::PeerInfo(responder.registry().host().clone()));
        let registry = responder.registry();
        assert_eq!(
            registry.pool_of(&sender.key()).await,
            Some(PeerPool::Unresolved)
        );

        // A peer that dropped out of the pools is queued again on its next handshake
        let peer = Peer::new(sender.clone());
        registry.remove_unresolved(&peer).await.unwrap();
        responder
            .handle(Request::GetPeerInfo {
                sender: sender.clone(),
            })
            .await;
        assert_eq!(
            registry.pool_of(&sender.key()).await,
            Some(PeerPool::Unresolved)
        );

        // Resolved peers stay resolved
        registry.add_resolved(peer).await.unwrap();
        responder.handle(Request::GetPeerInfo { sender: sender.clone() }).await;
        assert_eq!(
            registry.pool_of(&sender.key()).await,
            Some(PeerPool::Resolved)
        );
    }

    #[tokio::test]
    async fn test_send_block_extends_tip() {
        let (chain, responder) = responder(2).await;
        let tip = chain.last_block().await.unwrap();
        let block = Block::new(&tip, tip.timestamp + 10, 10, "remote", b"tx").unwrap();

        let response = responder
            .handle(Request::SendBlock {
                chain_type: ChainType::Main,
                sender: NodeInfo::new("10.0.0.9", 8001),
                block: block.clone(),
            })
            .await;
        match response {
            Response::Receipt(receipt) => {
                assert_eq!(receipt.datum_hash, block.block_hash);
                assert_eq!(receipt.reference_block_height, 3);
            }
            other => panic!("unexpected response {:?}", other),
        }

        let orphan = Block::new(&tip, tip.timestamp + 20, 10, "other", b"").unwrap();
        let response = responder
            .handle(Request::SendBlock {
                chain_type: ChainType::Main,
                sender: NodeInfo::new("10.0.0.9", 8001),
                block: orphan,
            })
            .await;
        assert!(matches!(response, Response::Error(_)));
    }

    #[tokio::test]
    async fn test_send_transaction_reaches_pool() {
        let (_chain, responder) = responder(0).await;
        let (tx, mut rx) = mpsc::channel(1);
        let responder = responder.with_transactions(tx);

        let response = responder
            .handle(Request::SendTransaction {
                chain_type: ChainType::Main,
                transaction: hex::encode(b"raw tx"),
            })
            .await;
        assert_eq!(response, Response::Ack);
        assert_eq!(rx.recv().await.unwrap(), b"raw tx".to_vec());

        let response = responder
            .handle(Request::GetCumulativeDifficulty {
                chain_type: ChainType::Spine,
            })
            .await;
        assert!(matches!(response, Response::Error(_)));
    }

    #[tokio::test]
    async fn test_server_answers_tcp_transport() {
        let (chain, responder) = responder(3).await;
        let server = Server::bind(0).await.unwrap();
        let port = server.port();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.run(Arc::new(responder), shutdown.clone()));

        let transport = TcpTransport::new(NodeInfo::new("127.0.0.1", 9999), Duration::from_secs(5));
        let peer = Peer::new(NodeInfo::new("127.0.0.1", port));

        let weight = transport
            .get_cumulative_difficulty(&peer, ChainType::Main)
            .await
            .unwrap();
        let tip = chain.last_block().await.unwrap();
        assert_eq!(weight.height, 3);
        assert_eq!(weight.cumulative_difficulty, tip.cumulative_difficulty);

        let info = transport.get_peer_info(&peer).await.unwrap();
        assert_eq!(info.key(), "127.0.0.1:8001");

        shutdown.cancel();
        handle.await.unwrap();
    }
}

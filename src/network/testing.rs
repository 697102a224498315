//! In-memory peers for tests
//!
//! Every mock peer owns a real [`Blockchain`] served through the same
//! [`ChainResponder`] the TCP server uses. Behaviour knobs make a peer slow,
//! unreachable or dishonest.

use crate::core::{Block, BlockService, Blockchain, ChainType};
use crate::network::message::{Request, Response};
use crate::network::peer::{NodeInfo, Peer};
use crate::network::priority::NoPriority;
use crate::network::registry::PeerRegistry;
use crate::network::server::ChainResponder;
use crate::network::transport::{Exchange, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// How a mock peer deviates from an honest one
#[derive(Debug, Clone, Default)]
pub struct Behaviour {
    /// Every call fails to connect
    pub unreachable: bool,
    /// Sleep before answering
    pub delay: Option<Duration>,
    /// Block responses carry every block twice
    pub oversized_blocks: bool,
    /// Block responses carry no blocks
    pub empty_blocks: bool,
    /// Every call times out after the delay
    pub timeout: bool,
    /// Fixed answer to milestone requests
    pub milestone_ids: Option<Vec<i64>>,
    /// Fixed answer to next-block-id requests
    pub next_block_ids: Option<Vec<i64>>,
    /// Protocol version reported in handshakes
    pub version: Option<u32>,
}

struct MockPeer {
    chain: Arc<Blockchain>,
    responder: Arc<ChainResponder>,
    behaviour: Behaviour,
}

/// Transport routing requests to in-process peers
pub struct MockTransport {
    host: NodeInfo,
    peers: RwLock<HashMap<String, MockPeer>>,
    log: Mutex<Vec<(String, &'static str)>>,
    /// Requests in flight and the most seen at once, per peer
    in_flight: Mutex<HashMap<String, (usize, usize)>>,
}

impl MockTransport {
    pub fn new(host: NodeInfo) -> Self {
        Self {
            host,
            peers: RwLock::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Register a peer serving `chain`
    pub async fn add_peer(&self, info: &NodeInfo, chain: Arc<Blockchain>) {
        let registry = Arc::new(PeerRegistry::new(info.clone(), 100, 100, Arc::new(NoPriority)));
        let responder = Arc::new(ChainResponder::new(chain.clone(), registry));
        self.peers.write().await.insert(
            info.key(),
            MockPeer {
                chain,
                responder,
                behaviour: Behaviour::default(),
            },
        );
    }

    pub async fn set_behaviour(&self, info: &NodeInfo, behaviour: Behaviour) {
        if let Some(peer) = self.peers.write().await.get_mut(&info.key()) {
            peer.behaviour = behaviour;
        }
    }

    /// Chain served by a registered peer
    pub async fn chain_of(&self, info: &NodeInfo) -> Option<Arc<Blockchain>> {
        self.peers.read().await.get(&info.key()).map(|p| p.chain.clone())
    }

    /// Registry behind a registered peer's responder
    pub async fn registry_of(&self, info: &NodeInfo) -> Option<Arc<PeerRegistry>> {
        self.peers
            .read()
            .await
            .get(&info.key())
            .map(|p| p.responder.registry().clone())
    }

    /// Every request issued so far as (peer key, request name)
    pub async fn requests(&self) -> Vec<(String, &'static str)> {
        self.log.lock().await.clone()
    }

    /// Number of requests named `name` issued so far
    pub async fn count(&self, name: &str) -> usize {
        self.log.lock().await.iter().filter(|(_, n)| *n == name).count()
    }

    /// Number of requests named `name` sent to `info`
    pub async fn count_to(&self, info: &NodeInfo, name: &str) -> usize {
        let key = info.key();
        self.log
            .lock()
            .await
            .iter()
            .filter(|(k, n)| *k == key && *n == name)
            .count()
    }

    /// Most requests `info` was serving at the same time
    pub async fn peak_in_flight(&self, info: &NodeInfo) -> usize {
        self.in_flight
            .lock()
            .await
            .get(&info.key())
            .map(|(_, peak)| *peak)
            .unwrap_or(0)
    }

    async fn respond(&self, key: String, request: Request) -> Result<Response, TransportError> {
        let (responder, behaviour) = {
            let peers = self.peers.read().await;
            match peers.get(&key) {
                Some(mock) => (mock.responder.clone(), mock.behaviour.clone()),
                None => return Err(TransportError::ConnectionFailed(key)),
            }
        };

        if behaviour.unreachable {
            return Err(TransportError::ConnectionFailed(key));
        }
        if let Some(delay) = behaviour.delay {
            tokio::time::sleep(delay).await;
        }
        if behaviour.timeout {
            return Err(TransportError::Timeout(behaviour.delay.unwrap_or_default()));
        }

        let fixed = match &request {
            Request::GetCommonMilestoneBlockIds { .. } => behaviour.milestone_ids.clone(),
            Request::GetNextBlockIds { .. } => behaviour.next_block_ids.clone(),
            _ => None,
        };
        let response = match fixed {
            Some(ids) => Response::BlockIds(ids),
            None => responder.handle(request).await,
        };

        match response {
            Response::Error(reason) => Err(TransportError::Remote(reason)),
            Response::Blocks(_) if behaviour.empty_blocks => Ok(Response::Blocks(Vec::new())),
            Response::Blocks(mut blocks) if behaviour.oversized_blocks => {
                let copy = blocks.clone();
                blocks.extend(copy);
                Ok(Response::Blocks(blocks))
            }
            Response::PeerInfo(mut info) => {
                if let Some(version) = behaviour.version {
                    info.version = version;
                }
                Ok(Response::PeerInfo(info))
            }
            other => Ok(other),
        }
    }
}

#[async_trait]
impl Exchange for MockTransport {
    fn host(&self) -> &NodeInfo {
        &self.host
    }

    async fn exchange(&self, peer: &Peer, request: Request) -> Result<Response, TransportError> {
        let key = peer.key();
        self.log.lock().await.push((key.clone(), request.type_name()));

        {
            let mut in_flight = self.in_flight.lock().await;
            let entry = in_flight.entry(key.clone()).or_default();
            entry.0 += 1;
            entry.1 = entry.1.max(entry.0);
        }
        let result = self.respond(key.clone(), request).await;
        if let Some(entry) = self.in_flight.lock().await.get_mut(&key) {
            entry.0 -= 1;
        }
        result
    }
}

/// Append `count` blocks of difficulty 10 produced by `smith`
pub async fn extend_chain(chain: &Blockchain, count: u32, smith: &str) -> Vec<Block> {
    extend_with_difficulty(chain, count, smith, 10).await
}

/// Append `count` blocks of the given difficulty produced by `smith`
pub async fn extend_with_difficulty(
    chain: &Blockchain,
    count: u32,
    smith: &str,
    difficulty: u64,
) -> Vec<Block> {
    let mut pushed = Vec::with_capacity(count as usize);
    for i in 0..count {
        let tip = chain.last_block().await.unwrap();
        let block = Block::new(&tip, tip.timestamp + 10, difficulty, smith, &i.to_le_bytes()).unwrap();
        chain.push_block(&tip, block.clone(), false).await.unwrap();
        pushed.push(block);
    }
    pushed
}

/// A main chain of `height` blocks produced by `smith`
pub async fn chain_of_height(height: u32, smith: &str) -> Arc<Blockchain> {
    let chain = Arc::new(Blockchain::new(ChainType::Main));
    extend_chain(&chain, height, smith).await;
    chain
}

/// Copy of `base` up to `height`, extended by `extra` blocks of `smith`
pub async fn fork_of(
    base: &Blockchain,
    height: u32,
    extra: u32,
    smith: &str,
    difficulty: u64,
) -> Arc<Blockchain> {
    let fork = Arc::new(Blockchain::new(ChainType::Main));
    for block in base.blocks_from_height(1, height).await {
        let tip = fork.last_block().await.unwrap();
        fork.push_block(&tip, block, false).await.unwrap();
    }
    extend_with_difficulty(&fork, extra, smith, difficulty).await;
    fork
}

/// Registry of the local test host with room for everybody
pub fn local_registry() -> Arc<PeerRegistry> {
    Arc::new(PeerRegistry::new(
        NodeInfo::new("127.0.0.1", 8001),
        100,
        100,
        Arc::new(NoPriority),
    ))
}

/// Address of the `i`th test peer
pub fn peer_info(i: u16) -> NodeInfo {
    NodeInfo::new("10.0.0.1", 9000 + i)
}

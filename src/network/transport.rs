//! Point-to-point RPC to remote peers
//!
//! [`PeerTransport`] is the only way the scheduler and the sync engine talk to
//! other nodes. Anything that can carry one [`Request`] to a peer and bring
//! back its [`Response`] implements [`Exchange`] and gets the typed RPC
//! surface for free. [`TcpTransport`] dials the peer for every call and wraps
//! the whole exchange in a deadline.

use crate::core::{Block, ChainType};
use crate::network::codec::ClientCodec;
use crate::network::message::{ChainWeight, Receipt, Request, Response};
use crate::network::peer::{NodeInfo, Peer};
use async_trait::async_trait;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Peer returned an error: {0}")]
    Remote(String),
    #[error("Unexpected {0} response")]
    UnexpectedResponse(&'static str),
}

/// RPC surface offered by remote peers
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Handshake: returns the peer's node info
    async fn get_peer_info(&self, peer: &Peer) -> Result<NodeInfo, TransportError>;

    async fn get_more_peers(&self, peer: &Peer) -> Result<Vec<NodeInfo>, TransportError>;

    async fn send_peers(&self, peer: &Peer, peers: Vec<NodeInfo>) -> Result<(), TransportError>;

    async fn get_cumulative_difficulty(
        &self,
        peer: &Peer,
        chain_type: ChainType,
    ) -> Result<ChainWeight, TransportError>;

    async fn get_common_milestone_block_ids(
        &self,
        peer: &Peer,
        chain_type: ChainType,
        last_block_id: i64,
        last_milestone_block_id: i64,
    ) -> Result<Vec<i64>, TransportError>;

    async fn get_next_block_ids(
        &self,
        peer: &Peer,
        chain_type: ChainType,
        block_id: i64,
        limit: u32,
    ) -> Result<Vec<i64>, TransportError>;

    async fn get_next_blocks(
        &self,
        peer: &Peer,
        chain_type: ChainType,
        block_ids: &[i64],
        block_id: i64,
    ) -> Result<Vec<Block>, TransportError>;

    async fn send_block(
        &self,
        peer: &Peer,
        chain_type: ChainType,
        block: &Block,
    ) -> Result<Receipt, TransportError>;

    async fn send_transaction(
        &self,
        peer: &Peer,
        chain_type: ChainType,
        transaction: &[u8],
    ) -> Result<(), TransportError>;
}

/// Carries a single request to a peer and returns its answer
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Identity announced to peers
    fn host(&self) -> &NodeInfo;

    /// Send `request` to `peer`. A `Response::Error` must surface as
    /// `TransportError::Remote`.
    async fn exchange(&self, peer: &Peer, request: Request) -> Result<Response, TransportError>;
}

/// TCP implementation: one connection per call
pub struct TcpTransport {
    host: NodeInfo,
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(host: NodeInfo, timeout: Duration) -> Self {
        Self { host, timeout }
    }
}

#[async_trait]
impl Exchange for TcpTransport {
    fn host(&self) -> &NodeInfo {
        &self.host
    }

    async fn exchange(&self, peer: &Peer, request: Request) -> Result<Response, TransportError> {
        let addr = peer.info.dial_addr();
        let name = request.type_name();

        let round_trip = async {
            let stream = TcpStream::connect(&addr)
                .await
                .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;

            let mut framed = Framed::new(stream, ClientCodec::new());
            framed.send(request).await?;

            match framed.next().await {
                Some(Ok(Response::Error(reason))) => Err(TransportError::Remote(reason)),
                Some(Ok(response)) => Ok(response),
                Some(Err(e)) => Err(TransportError::IoError(e)),
                None => Err(TransportError::Disconnected),
            }
        };

        let result = tokio::time::timeout(self.timeout, round_trip)
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))?;

        if let Err(e) = &result {
            log::debug!("{} to {} failed: {}", name, addr, e);
        }
        result
    }
}

#[async_trait]
impl<T: Exchange> PeerTransport for T {
    async fn get_peer_info(&self, peer: &Peer) -> Result<NodeInfo, TransportError> {
        let request = Request::GetPeerInfo {
            sender: self.host().clone(),
        };
        match self.exchange(peer, request).await? {
            Response::PeerInfo(info) => Ok(info),
            other => Err(TransportError::UnexpectedResponse(other.type_name())),
        }
    }

    async fn get_more_peers(&self, peer: &Peer) -> Result<Vec<NodeInfo>, TransportError> {
        match self.exchange(peer, Request::GetMorePeers).await? {
            Response::Peers(peers) => Ok(peers),
            other => Err(TransportError::UnexpectedResponse(other.type_name())),
        }
    }

    async fn send_peers(&self, peer: &Peer, peers: Vec<NodeInfo>) -> Result<(), TransportError> {
        match self.exchange(peer, Request::SendPeers { peers }).await? {
            Response::Ack => Ok(()),
            other => Err(TransportError::UnexpectedResponse(other.type_name())),
        }
    }

    async fn get_cumulative_difficulty(
        &self,
        peer: &Peer,
        chain_type: ChainType,
    ) -> Result<ChainWeight, TransportError> {
        match self
            .exchange(peer, Request::GetCumulativeDifficulty { chain_type })
            .await?
        {
            Response::CumulativeDifficulty(weight) => Ok(weight),
            other => Err(TransportError::UnexpectedResponse(other.type_name())),
        }
    }

    async fn get_common_milestone_block_ids(
        &self,
        peer: &Peer,
        chain_type: ChainType,
        last_block_id: i64,
        last_milestone_block_id: i64,
    ) -> Result<Vec<i64>, TransportError> {
        let request = Request::GetCommonMilestoneBlockIds {
            chain_type,
            last_block_id,
            last_milestone_block_id,
        };
        match self.exchange(peer, request).await? {
            Response::BlockIds(ids) => Ok(ids),
            other => Err(TransportError::UnexpectedResponse(other.type_name())),
        }
    }

    async fn get_next_block_ids(
        &self,
        peer: &Peer,
        chain_type: ChainType,
        block_id: i64,
        limit: u32,
    ) -> Result<Vec<i64>, TransportError> {
        let request = Request::GetNextBlockIds {
            chain_type,
            block_id,
            limit,
        };
        match self.exchange(peer, request).await? {
            Response::BlockIds(ids) => Ok(ids),
            other => Err(TransportError::UnexpectedResponse(other.type_name())),
        }
    }

    async fn get_next_blocks(
        &self,
        peer: &Peer,
        chain_type: ChainType,
        block_ids: &[i64],
        block_id: i64,
    ) -> Result<Vec<Block>, TransportError> {
        let request = Request::GetNextBlocks {
            chain_type,
            block_ids: block_ids.to_vec(),
            block_id,
        };
        match self.exchange(peer, request).await? {
            Response::Blocks(blocks) => Ok(blocks),
            other => Err(TransportError::UnexpectedResponse(other.type_name())),
        }
    }

    async fn send_block(
        &self,
        peer: &Peer,
        chain_type: ChainType,
        block: &Block,
    ) -> Result<Receipt, TransportError> {
        let request = Request::SendBlock {
            chain_type,
            sender: self.host().clone(),
            block: block.clone(),
        };
        match self.exchange(peer, request).await? {
            Response::Receipt(receipt) => Ok(receipt),
            other => Err(TransportError::UnexpectedResponse(other.type_name())),
        }
    }

    async fn send_transaction(
        &self,
        peer: &Peer,
        chain_type: ChainType,
        transaction: &[u8],
    ) -> Result<(), TransportError> {
        let request = Request::SendTransaction {
            chain_type,
            transaction: hex::encode(transaction),
        };
        match self.exchange(peer, request).await? {
            Response::Ack => Ok(()),
            other => Err(TransportError::UnexpectedResponse(other.type_name())),
        }
    }
}

//! Peer priority scoring
//!
//! Priority peers (registered nodes, high-stake participants) are kept in the
//! resolved pool in preference to everybody else. The scoring itself lives
//! outside this crate; the registry only asks yes or no.

use crate::network::peer::NodeInfo;
use std::collections::HashSet;

/// Decides whether a peer deserves a reserved resolved slot
pub trait PriorityStrategy: Send + Sync {
    fn is_priority(&self, node: &NodeInfo) -> bool;
}

/// Every peer is treated equally
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPriority;

impl PriorityStrategy for NoPriority {
    fn is_priority(&self, _node: &NodeInfo) -> bool {
        false
    }
}

/// A fixed set of priority peers, keyed by `address:port`
#[derive(Debug, Clone, Default)]
pub struct StaticPriority {
    keys: HashSet<String>,
}

impl StaticPriority {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl PriorityStrategy for StaticPriority {
    fn is_priority(&self, node: &NodeInfo) -> bool {
        self.keys.contains(&node.key())
            || node
                .shared_key()
                .map(|key| self.keys.contains(&key))
                .unwrap_or(false)
    }
}

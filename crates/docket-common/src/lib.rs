//! Shared types of docket: error type, identifiers and node paths.
use std::{
    fmt::Display,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

mod error;
mod internal_string;
mod path;

pub use error::{DocError, DocResult};
pub use internal_string::InternalString;
pub use path::{parse_index, NodePath, COUNTER_SEGMENT, PATH_SEPARATOR};

/// Identifies a transaction in the history log.
///
/// Ids chosen by callers (`Fixed` mode) are usually small numbers. Node-derived
/// ids start at [NodeUid::FIRST] and allocated ids at [TxnId::FIRST_ALLOCATED],
/// so the three sources only meet when a caller picks a large id on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl TxnId {
    pub const FIRST_ALLOCATED: TxnId = TxnId(1 << 48);

    #[inline]
    pub fn next(self) -> TxnId {
        TxnId(self.0 + 1)
    }
}

impl Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for TxnId {
    fn from(value: u64) -> Self {
        TxnId(value)
    }
}

/// Process-unique identity of a node. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeUid(u64);

static NEXT_NODE_UID: AtomicU64 = AtomicU64::new(NodeUid::FIRST);

impl NodeUid {
    pub const FIRST: u64 = 1 << 32;

    pub fn fresh() -> Self {
        NodeUid(NEXT_NODE_UID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<NodeUid> for TxnId {
    fn from(value: NodeUid) -> Self {
        TxnId(value.0)
    }
}

impl Display for NodeUid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

use crate::error::Result;
use crate::types::Rank;

/// Physical placement of one rank, as reported by the location oracle.
///
/// Fields may be individually absent when the oracle does not support the
/// corresponding level; a derivation requiring an absent field fails the same
/// way a query failure does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Location {
    pub subnet_id: Option<u32>,
    pub node_id: Option<u32>,
    pub socket_id: Option<u32>,
}

/// Reports per-rank physical placement. Implemented outside this crate
/// (hwloc, scheduler metadata, a bootstrap exchange); injected into
/// `Topology`/`AlgoGroup` construction.
pub trait LocationOracle: Send + Sync {
    fn location(&self, rank: Rank) -> Result<Location>;
}

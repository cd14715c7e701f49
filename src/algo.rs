//! Algorithm-plane group derivation.
//!
//! Collective plans sometimes need ad hoc subgroups of an arbitrary virtual
//! group rather than of the whole job: "the members of this group on my
//! node", or "one member per socket on my node". `AlgoGroup` derives those on
//! top of any caller-supplied `VirtualGroup`, memoized per instance with the
//! same lifecycle as topology levels.

use std::sync::Arc;

use indexmap::IndexSet;

use crate::error::{MeshError, Result};
use crate::group::VirtualGroup;
use crate::location::LocationOracle;
use crate::rankmap::RankMap;
use crate::topology::{CacheCell, TopoGroup};
use crate::types::Rank;

/// Target partitioning for an algorithm-plane derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgoScope {
    /// Members of the group sharing the caller's node.
    Node,
    /// Members on the caller's node that are the designated one-per-socket
    /// representative (first group member seen on each socket).
    Socket,
}

impl AlgoScope {
    const COUNT: usize = 2;

    fn idx(self) -> usize {
        match self {
            AlgoScope::Node => 0,
            AlgoScope::Socket => 1,
        }
    }
}

/// Memoized ad hoc derivations over one base group.
pub struct AlgoGroup {
    base: VirtualGroup,
    oracle: Arc<dyn LocationOracle>,
    cells: [CacheCell; AlgoScope::COUNT],
}

impl AlgoGroup {
    pub fn new(base: VirtualGroup, oracle: Arc<dyn LocationOracle>) -> Self {
        Self {
            base,
            oracle,
            cells: std::array::from_fn(|_| CacheCell::NotComputed),
        }
    }

    pub fn base(&self) -> &VirtualGroup {
        &self.base
    }

    /// Look up a derivation, computing and caching it on first use.
    ///
    /// Resolved cells (including failures other than allocation) are
    /// permanent: re-invocation short-circuits without re-scanning.
    pub fn get(&mut self, scope: AlgoScope) -> Result<&TopoGroup> {
        let idx = scope.idx();
        if matches!(self.cells[idx], CacheCell::NotComputed) {
            let outcome = self.derive(scope);
            if let Err(e) = &outcome {
                tracing::debug!(scope = ?scope, error = %e, "algo group derivation failed");
            }
            self.cells[idx].resolve(outcome)?;
        }
        match self.cells[idx].get()? {
            Some(tg) => Ok(tg),
            None => unreachable!("cell resolved above"),
        }
    }

    fn derive(&self, scope: AlgoScope) -> Result<TopoGroup> {
        let my_global = self.base.my_global();
        let my_loc = self.oracle.location(my_global)?;
        let my_node = my_loc
            .node_id
            .ok_or_else(|| MeshError::location(my_global, "node id not reported"))?;

        let mut members: Vec<Rank> = Vec::new();
        members
            .try_reserve(self.base.size() as usize)
            .map_err(|_| MeshError::OutOfMemory {
                reason: "algo group member table".into(),
            })?;

        let mut seen_sockets: IndexSet<u32> = IndexSet::new();
        let mut my_pos: Option<Rank> = None;

        // One linear scan: local -> global translation plus a location query
        // per member.
        for v in 0..self.base.size() {
            let global = self
                .base
                .global(v)
                .ok_or_else(|| MeshError::invalid(format!("group rank {v} unresolved")))?;
            let loc = self.oracle.location(global)?;
            let node = loc
                .node_id
                .ok_or_else(|| MeshError::location(global, "node id not reported"))?;
            if node != my_node {
                continue;
            }
            if scope == AlgoScope::Socket {
                let socket = loc
                    .socket_id
                    .ok_or_else(|| MeshError::location(global, "socket id not reported"))?;
                if !seen_sockets.insert(socket) {
                    continue;
                }
            }
            if global == my_global {
                my_pos = Some(members.len() as Rank);
            }
            members.push(global);
        }

        match my_pos {
            Some(myrank) if members.len() > 1 => Ok(TopoGroup::sized(VirtualGroup::new(
                myrank,
                RankMap::from_owned_table(members),
            )?)),
            Some(myrank) => Ok(TopoGroup::disabled(Some(VirtualGroup::new(
                myrank,
                RankMap::from_owned_table(members),
            )?))),
            // The caller is not the designated representative for its socket.
            None => Ok(TopoGroup::disabled(None)),
        }
    }
}

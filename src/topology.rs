//! Topology-aware hierarchical group derivation.
//!
//! Every process of a job runs the same derivation rules against per-rank
//! placement metadata and arrives at an identical partition of the process
//! set, with no coordination: node groups, socket groups, and the leader
//! planes that scope inter-partition collective steps.
//!
//! Derivation is lazy and cached per level. A location-query failure while
//! scanning a level is permanent for that level on this instance; allocation
//! failures are transient and the next lookup retries.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::{MeshError, Result};
use crate::group::VirtualGroup;
use crate::location::{Location, LocationOracle};
use crate::rankmap::RankMap;
use crate::types::Rank;

/// Hierarchy levels derivable from a job's placement metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopoLevel {
    /// The whole job (root of the hierarchy).
    Fabric,
    /// Members sharing the caller's subnet.
    Subnet,
    /// One representative per subnet.
    SubnetLeader,
    /// Members sharing the caller's node.
    Node,
    /// One representative per node.
    NodeLeader,
    /// Members sharing the caller's socket.
    Socket,
    /// One representative per socket on the caller's node.
    SocketLeader,
}

impl TopoLevel {
    pub(crate) const COUNT: usize = 7;

    pub(crate) fn idx(self) -> usize {
        match self {
            TopoLevel::Fabric => 0,
            TopoLevel::Subnet => 1,
            TopoLevel::SubnetLeader => 2,
            TopoLevel::Node => 3,
            TopoLevel::NodeLeader => 4,
            TopoLevel::Socket => 5,
            TopoLevel::SocketLeader => 6,
        }
    }

    fn name(self) -> &'static str {
        match self {
            TopoLevel::Fabric => "fabric",
            TopoLevel::Subnet => "subnet",
            TopoLevel::SubnetLeader => "subnet-leader",
            TopoLevel::Node => "node",
            TopoLevel::NodeLeader => "node-leader",
            TopoLevel::Socket => "socket",
            TopoLevel::SocketLeader => "socket-leader",
        }
    }
}

impl fmt::Display for TopoLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The location field that partitions a level.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PartitionKey {
    Subnet,
    Node,
    Socket,
}

impl PartitionKey {
    fn name(self) -> &'static str {
        match self {
            PartitionKey::Subnet => "subnet id",
            PartitionKey::Node => "node id",
            PartitionKey::Socket => "socket id",
        }
    }

    /// Extract the field; a missing field is treated like a query failure.
    pub(crate) fn require(self, loc: &Location, rank: Rank) -> Result<u32> {
        let field = match self {
            PartitionKey::Subnet => loc.subnet_id,
            PartitionKey::Node => loc.node_id,
            PartitionKey::Socket => loc.socket_id,
        };
        field.ok_or_else(|| MeshError::location(rank, format!("{} not reported", self.name())))
    }
}

/// Lifecycle of a derived group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    /// The caller is a member and the group is large enough to communicate in.
    Enabled,
    /// Derivation succeeded but the group carries no communication value for
    /// the caller: the caller is not a member (leader planes), or membership
    /// cardinality is <= 1.
    Disabled,
}

/// A derived hierarchy group: lifecycle status plus the group itself.
#[derive(Debug, Clone)]
pub struct TopoGroup {
    status: GroupStatus,
    group: Option<VirtualGroup>,
}

impl TopoGroup {
    /// Wrap a group the caller belongs to; enabled iff it has > 1 member.
    pub(crate) fn sized(group: VirtualGroup) -> Self {
        let status = if group.size() > 1 {
            GroupStatus::Enabled
        } else {
            GroupStatus::Disabled
        };
        Self {
            status,
            group: Some(group),
        }
    }

    pub(crate) fn disabled(group: Option<VirtualGroup>) -> Self {
        Self {
            status: GroupStatus::Disabled,
            group,
        }
    }

    pub fn status(&self) -> GroupStatus {
        self.status
    }

    pub fn is_enabled(&self) -> bool {
        self.status == GroupStatus::Enabled
    }

    /// The derived group; `None` when the caller is not a member.
    pub fn group(&self) -> Option<&VirtualGroup> {
        self.group.as_ref()
    }
}

/// Per-level derivation cache cell.
///
/// Transient failures (allocation) are returned without being stored, so
/// `NotComputed` survives them and a later call retries.
#[derive(Debug)]
pub(crate) enum CacheCell {
    NotComputed,
    Ready(TopoGroup),
    Permanent(MeshError),
}

impl CacheCell {
    /// Resolve this cell from a derivation outcome, returning the result for
    /// the caller. Only non-transient failures stick.
    pub(crate) fn resolve(&mut self, outcome: Result<TopoGroup>) -> Result<()> {
        match outcome {
            Ok(tg) => {
                *self = CacheCell::Ready(tg);
                Ok(())
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                *self = CacheCell::Permanent(e.clone());
                Err(e)
            }
        }
    }

    pub(crate) fn get(&self) -> Result<Option<&TopoGroup>> {
        match self {
            CacheCell::NotComputed => Ok(None),
            CacheCell::Ready(tg) => Ok(Some(tg)),
            CacheCell::Permanent(e) => Err(e.clone()),
        }
    }
}

/// Lazily derives and caches the hierarchy levels of one job instance.
pub struct Topology {
    origin: VirtualGroup,
    oracle: Arc<dyn LocationOracle>,
    cells: [CacheCell; TopoLevel::COUNT],
}

impl Topology {
    /// `origin` is the whole-job group (the originating rank map plus this
    /// process's rank in it); `oracle` reports per-rank placement.
    pub fn new(origin: VirtualGroup, oracle: Arc<dyn LocationOracle>) -> Self {
        Self {
            origin,
            oracle,
            cells: std::array::from_fn(|_| CacheCell::NotComputed),
        }
    }

    pub fn origin(&self) -> &VirtualGroup {
        &self.origin
    }

    /// Look up a hierarchy level, deriving and caching it on first use.
    ///
    /// Cached outcomes (including permanent failures) are returned without
    /// re-querying the location oracle.
    pub fn get_group(&mut self, level: TopoLevel) -> Result<&TopoGroup> {
        let idx = level.idx();
        if matches!(self.cells[idx], CacheCell::NotComputed) {
            let outcome = self.derive(level);
            if let Err(e) = &outcome {
                tracing::debug!(level = %level, error = %e, "group derivation failed");
            }
            self.cells[idx].resolve(outcome)?;
        }
        match self.cells[idx].get()? {
            Some(tg) => Ok(tg),
            None => unreachable!("cell resolved above"),
        }
    }

    fn derive(&mut self, level: TopoLevel) -> Result<TopoGroup> {
        match level {
            TopoLevel::Fabric => Ok(TopoGroup::sized(self.origin.clone())),
            TopoLevel::Subnet => self.derive_partition(TopoLevel::Fabric, PartitionKey::Subnet),
            TopoLevel::Node => self.derive_partition(TopoLevel::Fabric, PartitionKey::Node),
            TopoLevel::Socket => self.derive_partition(TopoLevel::Node, PartitionKey::Socket),
            TopoLevel::SubnetLeader => {
                self.derive_leaders(TopoLevel::Subnet, TopoLevel::Fabric, PartitionKey::Subnet)
            }
            TopoLevel::NodeLeader => {
                self.derive_leaders(TopoLevel::Node, TopoLevel::Fabric, PartitionKey::Node)
            }
            TopoLevel::SocketLeader => {
                self.derive_leaders(TopoLevel::Socket, TopoLevel::Node, PartitionKey::Socket)
            }
        }
    }

    /// Ensure a prerequisite level is derived; a permanent failure there
    /// surfaces as `Unsupported` for the dependent level.
    fn require_level(&mut self, level: TopoLevel) -> Result<()> {
        match self.get_group(level) {
            Ok(_) => Ok(()),
            Err(e) if e.is_transient() => Err(e),
            Err(e) => Err(MeshError::Unsupported {
                level,
                reason: e.to_string(),
            }),
        }
    }

    fn cached(&self, level: TopoLevel) -> &VirtualGroup {
        match &self.cells[level.idx()] {
            CacheCell::Ready(tg) => tg
                .group()
                .expect("prerequisite levels always carry a member group"),
            _ => unreachable!("require_level ran first"),
        }
    }

    /// Partition the parent level by a location field: the caller's own
    /// partition becomes the derived group, member order following parent
    /// virtual-rank order.
    fn derive_partition(&mut self, parent: TopoLevel, key: PartitionKey) -> Result<TopoGroup> {
        self.require_level(parent)?;
        let parent_group = self.cached(parent);

        let my_global = self.origin.my_global();
        let my_key = key.require(&self.oracle.location(my_global)?, my_global)?;

        let mut members: Vec<Rank> = Vec::new();
        members
            .try_reserve(parent_group.size() as usize)
            .map_err(|_| MeshError::OutOfMemory {
                reason: format!("{key:?} member table"),
            })?;

        let mut my_offset = 0;
        for v in 0..parent_group.size() {
            let global = parent_group
                .global(v)
                .ok_or_else(|| MeshError::invalid(format!("parent rank {v} unresolved")))?;
            let loc = self.oracle.location(global)?;
            if key.require(&loc, global)? == my_key {
                if global == my_global {
                    my_offset = members.len() as Rank;
                }
                members.push(global);
            }
        }

        let group = VirtualGroup::new(my_offset, RankMap::from_owned_table(members))?;
        Ok(TopoGroup::sized(group))
    }

    /// Select one representative per partition of `scan` at the caller's own
    /// offset within its `base` partition. Partitions too small to reach that
    /// offset contribute no representative.
    ///
    /// Only callers at the designated leader offset 0 are enabled members of
    /// the leader plane; everyone else caches its congruent group disabled.
    fn derive_leaders(
        &mut self,
        base: TopoLevel,
        scan: TopoLevel,
        key: PartitionKey,
    ) -> Result<TopoGroup> {
        self.require_level(base)?;
        self.require_level(scan)?;

        let my_offset = self.cached(base).myrank();
        let scan_group = self.cached(scan);
        let my_global = self.origin.my_global();

        let mut reps: Vec<Rank> = Vec::new();
        reps.try_reserve(scan_group.size() as usize)
            .map_err(|_| MeshError::OutOfMemory {
                reason: format!("{key:?} leader table"),
            })?;

        let mut seen: IndexMap<u32, Rank> = IndexMap::new();
        let mut my_pos = 0;
        for v in 0..scan_group.size() {
            let global = scan_group
                .global(v)
                .ok_or_else(|| MeshError::invalid(format!("parent rank {v} unresolved")))?;
            let partition = key.require(&self.oracle.location(global)?, global)?;
            let counter = seen.entry(partition).or_insert(0);
            let offset = *counter;
            *counter += 1;
            if offset == my_offset {
                if global == my_global {
                    my_pos = reps.len() as Rank;
                }
                reps.push(global);
            }
        }

        let group = VirtualGroup::new(my_pos, RankMap::from_owned_table(reps))?;
        if my_offset == 0 && group.size() > 1 {
            Ok(TopoGroup::sized(group))
        } else {
            Ok(TopoGroup::disabled(Some(group)))
        }
    }
}

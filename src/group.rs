use crate::error::{MeshError, Result};
use crate::rankmap::RankMap;
use crate::types::Rank;

/// A virtual-rank space paired with the mapping back into its parent's ranks.
///
/// Algorithm code holds a `VirtualGroup` per communication plane: `myrank` is
/// the calling process's position inside the group, and the map translates
/// any member's virtual rank to a global rank. A group owns its map
/// exclusively; cloning deep-copies (and re-optimizes) the map.
#[derive(Debug, Clone)]
pub struct VirtualGroup {
    /// Group identifier packed into wire tags so concurrent logical groups
    /// sharing one transport context don't cross-match.
    id: u16,
    myrank: Rank,
    map: RankMap,
}

impl VirtualGroup {
    /// Build a group from the calling process's virtual rank and a map.
    pub fn new(myrank: Rank, map: RankMap) -> Result<Self> {
        if myrank >= map.size() {
            return Err(MeshError::invalid(format!(
                "myrank {myrank} out of range for group of size {}",
                map.size()
            )));
        }
        if map.eval(myrank).is_none() {
            return Err(MeshError::invalid(format!(
                "myrank {myrank} does not resolve to a global rank"
            )));
        }
        Ok(Self {
            id: 0,
            myrank,
            map,
        })
    }

    /// Assign the wire-tag group identifier.
    pub fn with_id(mut self, id: u16) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// This process's virtual rank within the group.
    pub fn myrank(&self) -> Rank {
        self.myrank
    }

    /// Number of members.
    pub fn size(&self) -> u32 {
        self.map.size()
    }

    /// The rank mapping into the parent space.
    pub fn map(&self) -> &RankMap {
        &self.map
    }

    /// Translate a member's virtual rank to its global rank.
    pub fn global(&self, vrank: Rank) -> Option<Rank> {
        self.map.eval(vrank)
    }

    /// The calling process's own global rank.
    pub fn my_global(&self) -> Rank {
        // myrank is validated at construction, so this cannot miss.
        self.map.eval(self.myrank).unwrap_or(Rank::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_basics() {
        let g = VirtualGroup::new(2, RankMap::from_owned_table(vec![4, 5, 6, 7])).unwrap();
        assert_eq!(g.size(), 4);
        assert_eq!(g.myrank(), 2);
        assert_eq!(g.my_global(), 6);
        assert_eq!(g.global(0), Some(4));
        assert_eq!(g.global(4), None);
    }

    #[test]
    fn test_myrank_out_of_range_rejected() {
        let err = VirtualGroup::new(4, RankMap::identity(4)).unwrap_err();
        assert!(matches!(err, MeshError::InvalidArgument { .. }));
    }

    #[test]
    fn test_clone_deep_copies_map() {
        let g = VirtualGroup::new(0, RankMap::from_owned_table(vec![0, 1, 4, 9])).unwrap();
        let mut copy = g.clone();
        if let RankMap::Table(t) = &mut copy.map {
            t[1] = 42;
        } else {
            panic!("expected Table");
        }
        assert_eq!(g.global(1), Some(1));
        assert_eq!(copy.global(1), Some(42));
    }

    #[test]
    fn test_id_defaults_to_zero() {
        let g = VirtualGroup::new(0, RankMap::identity(2)).unwrap();
        assert_eq!(g.id(), 0);
        assert_eq!(g.with_id(9).id(), 9);
    }
}

//! Compact virtual-rank to global-rank mappings.
//!
//! A `RankMap` is a function from a dense local index space `[0, size)` into
//! the parent group's rank space. Regular distributions (round-robin, block)
//! are the overwhelmingly common case on large clusters, so table maps are
//! inspected on construction and on copy: a uniform-stride table collapses to
//! `Affine`, and `Affine {start: 0, stride: 1}` collapses further to
//! `Identity`, shrinking O(size) storage to O(1).

use std::fmt;
use std::sync::Arc;

use crate::error::{MeshError, Result};
use crate::types::Rank;

/// Signature for callback-backed maps. The opaque argument of a C-style
/// `(fn, arg)` pair is the closure capture.
pub type RankMapFn = dyn Fn(Rank) -> Rank + Send + Sync;

/// A virtual-rank to global-rank mapping.
pub enum RankMap {
    /// Virtual rank equals global rank.
    Identity { size: u32 },
    /// `global = start + vrank * stride`; stride may be negative.
    Affine { size: u32, start: Rank, stride: i64 },
    /// Explicit per-vrank table; owned storage.
    Table(Vec<Rank>),
    /// Computed mapping.
    Callback { size: u32, f: Arc<RankMapFn> },
}

impl RankMap {
    /// Identity map over `[0, size)`.
    pub fn identity(size: u32) -> Self {
        RankMap::Identity { size }
    }

    /// Affine map; collapses to `Identity` when `start == 0 && stride == 1`.
    pub fn affine(size: u32, start: Rank, stride: i64) -> Self {
        let mut map = RankMap::Affine {
            size,
            start,
            stride,
        };
        map.optimize();
        map
    }

    /// Callback-backed map. `f` must be a pure function of the virtual rank.
    pub fn callback(size: u32, f: Arc<RankMapFn>) -> Self {
        RankMap::Callback { size, f }
    }

    /// Build a map taking ownership of the caller's table.
    ///
    /// The table is inspected once; uniform-stride tables downgrade to
    /// `Affine`/`Identity` and the backing storage is dropped.
    pub fn from_owned_table(ranks: Vec<Rank>) -> Self {
        let mut map = RankMap::Table(ranks);
        map.optimize();
        map
    }

    /// Build a map from a borrowed table, copying the contents.
    ///
    /// The only fallible-allocation path: fails with `OutOfMemory` if the
    /// copy cannot be reserved.
    pub fn from_table(ranks: &[Rank]) -> Result<Self> {
        let mut owned = Vec::new();
        owned
            .try_reserve_exact(ranks.len())
            .map_err(|_| MeshError::OutOfMemory {
                reason: format!("rank table copy of {} entries", ranks.len()),
            })?;
        owned.extend_from_slice(ranks);
        Ok(Self::from_owned_table(owned))
    }

    /// Number of virtual ranks in the map's domain.
    pub fn size(&self) -> u32 {
        match self {
            RankMap::Identity { size }
            | RankMap::Affine { size, .. }
            | RankMap::Callback { size, .. } => *size,
            RankMap::Table(t) => t.len() as u32,
        }
    }

    /// Translate a virtual rank to a global rank.
    ///
    /// Returns `None` for a virtual rank outside `[0, size)` or an affine
    /// result outside the rank range.
    pub fn eval(&self, vrank: Rank) -> Option<Rank> {
        if vrank >= self.size() {
            return None;
        }
        match self {
            RankMap::Identity { .. } => Some(vrank),
            RankMap::Affine { start, stride, .. } => {
                let global = *start as i64 + vrank as i64 * stride;
                Rank::try_from(global).ok()
            }
            RankMap::Table(t) => Some(t[vrank as usize]),
            RankMap::Callback { f, .. } => Some(f(vrank)),
        }
    }

    /// Collapse the map to its most compact equivalent representation.
    ///
    /// Single pass over table contents, short-circuiting on the first
    /// non-uniform delta. Tables of size <= 1 are trivially uniform.
    pub fn optimize(&mut self) {
        match self {
            RankMap::Identity { .. } | RankMap::Callback { .. } => {}
            RankMap::Affine {
                size,
                start: 0,
                stride: 1,
            } => {
                let size = *size;
                *self = RankMap::Identity { size };
            }
            RankMap::Affine { .. } => {}
            RankMap::Table(t) => {
                let size = t.len() as u32;
                let (start, stride) = match t.len() {
                    0 => (0, 1),
                    1 => (t[0], 1),
                    _ => {
                        let stride = t[1] as i64 - t[0] as i64;
                        for w in t.windows(2) {
                            if w[1] as i64 - w[0] as i64 != stride {
                                return;
                            }
                        }
                        (t[0], stride)
                    }
                };
                // Dropping the table reclaims the O(size) storage.
                *self = RankMap::affine(size, start, stride);
            }
        }
    }
}

/// Copies deep-copy the table (the copy owns independent storage) and re-run
/// the optimization pass for consistency.
impl Clone for RankMap {
    fn clone(&self) -> Self {
        match self {
            RankMap::Identity { size } => RankMap::identity(*size),
            RankMap::Affine {
                size,
                start,
                stride,
            } => RankMap::affine(*size, *start, *stride),
            RankMap::Table(t) => RankMap::from_owned_table(t.clone()),
            RankMap::Callback { size, f } => RankMap::Callback {
                size: *size,
                f: Arc::clone(f),
            },
        }
    }
}

impl fmt::Debug for RankMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RankMap::Identity { size } => f.debug_struct("Identity").field("size", size).finish(),
            RankMap::Affine {
                size,
                start,
                stride,
            } => f
                .debug_struct("Affine")
                .field("size", size)
                .field("start", start)
                .field("stride", stride)
                .finish(),
            RankMap::Table(t) => f.debug_tuple("Table").field(t).finish(),
            RankMap::Callback { size, .. } => f
                .debug_struct("Callback")
                .field("size", size)
                .finish_non_exhaustive(),
        }
    }
}

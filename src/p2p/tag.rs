//! Wire-tag layout.
//!
//! A single transport context carries traffic for many logical groups and
//! steps at once; receive matching disambiguates them by packing the user
//! tag, the sender's global rank, and the group identifier into disjoint bit
//! ranges of the 64-bit wire tag.

use crate::transport::WireTag;
use crate::types::Rank;

/// Bits available for the caller-supplied tag.
pub const USER_TAG_BITS: u32 = 24;
/// Bits available for the sender's global rank.
pub const SENDER_BITS: u32 = 24;
/// Bits available for the group identifier.
pub const GROUP_BITS: u32 = 16;

const USER_TAG_SHIFT: u32 = 0;
const SENDER_SHIFT: u32 = USER_TAG_BITS;
const GROUP_SHIFT: u32 = USER_TAG_BITS + SENDER_BITS;

/// Largest user tag representable in the wire layout.
pub const MAX_USER_TAG: u32 = (1 << USER_TAG_BITS) - 1;
/// Largest sender rank representable in the wire layout.
pub const MAX_SENDER: Rank = (1 << SENDER_BITS) - 1;

/// Receive matching is exact on every field.
pub const FULL_MASK: WireTag = WireTag::MAX;

/// Pack the matching fields into a wire tag. Callers validate ranges.
pub fn encode(user_tag: u32, sender: Rank, group: u16) -> WireTag {
    ((group as WireTag) << GROUP_SHIFT)
        | (((sender & MAX_SENDER) as WireTag) << SENDER_SHIFT)
        | (((user_tag & MAX_USER_TAG) as WireTag) << USER_TAG_SHIFT)
}

/// Split a wire tag back into `(user_tag, sender, group)`; diagnostics only.
pub fn decode(tag: WireTag) -> (u32, Rank, u16) {
    let user = ((tag >> USER_TAG_SHIFT) as u32) & MAX_USER_TAG;
    let sender = ((tag >> SENDER_SHIFT) as Rank) & MAX_SENDER;
    let group = (tag >> GROUP_SHIFT) as u16;
    (user, sender, group)
}

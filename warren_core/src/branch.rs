use std::cmp::Ordering;

use crate::map::CoverageMap;

// Branch state cells use the low two bits; bounded string compares pack an
// observed length into the remaining six.
const STATE_MASK: u8 = 0b11;
const UNSEEN: u8 = 0;
const TAKEN_SEEN: u8 = 1;
const UNTAKEN_SEEN: u8 = 2;
const SATURATED: u8 = 3;
const LENGTH_SHIFT: u8 = 2;
const LENGTH_MAX: usize = 0b11_1111;

/// The comparison family a recorded branch belongs to.
///
/// Each family reduces to one predicate on the ordering of the operands:
/// when the predicate holds, the observation counts for the "taken" side of
/// the branch, otherwise for the fall-through side. Negated kinds share the
/// predicate of their positive counterpart, because observing either side
/// of `a != b` tells the search exactly as much as observing `a == b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonKind {
    SignedGreater,
    UnsignedGreater,
    Equal,
    NotEqual,
    SignedGreaterOrEqual,
    UnsignedGreaterOrEqual,
    SignedLess,
    UnsignedLess,
    SignedLessOrEqual,
    UnsignedLessOrEqual,
}

impl ComparisonKind {
    fn taken(self, ordering: Ordering) -> bool {
        use ComparisonKind::*;
        match self {
            SignedGreater | UnsignedGreater => ordering == Ordering::Greater,
            Equal | NotEqual => ordering == Ordering::Equal,
            SignedGreaterOrEqual | UnsignedGreaterOrEqual => ordering != Ordering::Less,
            SignedLess | UnsignedLess => ordering == Ordering::Less,
            SignedLessOrEqual | UnsignedLessOrEqual => ordering != Ordering::Greater,
        }
    }
}

fn transition(state: u8, taken: bool) -> Option<u8> {
    match (state, taken) {
        (UNSEEN, true) => Some(TAKEN_SEEN),
        (UNSEEN, false) => Some(UNTAKEN_SEEN),
        (UNTAKEN_SEEN, true) | (TAKEN_SEEN, false) => Some(SATURATED),
        _ => None,
    }
}

/// Advance the 2-bit polarity state machine for `branch_id`.
///
/// Saturated cells are left untouched for the rest of the run; the state is
/// monotonic and order-independent, so arrival order only changes how soon
/// saturation is reached, never the final value.
fn observe(map: &mut CoverageMap, branch_id: u32, taken: bool) {
    let index = branch_id as usize;
    let state = map.slot(index) & STATE_MASK;
    if state == SATURATED {
        return;
    }
    if let Some(next) = transition(state, taken) {
        map.set_slot(index, next);
    }
}

/// Like `observe`, but packing `length` into the high bits on every state
/// transition. Later observations overwrite earlier lengths; no write
/// happens at all without a transition.
fn observe_with_length(map: &mut CoverageMap, branch_id: u32, taken: bool, length: usize) {
    let index = branch_id as usize;
    let state = map.slot(index) & STATE_MASK;
    if state == SATURATED {
        return;
    }
    if let Some(next) = transition(state, taken) {
        let packed = (length.min(LENGTH_MAX) as u8) << LENGTH_SHIFT;
        map.set_slot(index, next | packed);
    }
}

pub fn record_cmp_i8(map: &mut CoverageMap, branch_id: u32, kind: ComparisonKind, lhs: i8, rhs: i8) {
    observe(map, branch_id, kind.taken(lhs.cmp(&rhs)));
}

pub fn record_cmp_i16(
    map: &mut CoverageMap,
    branch_id: u32,
    kind: ComparisonKind,
    lhs: i16,
    rhs: i16,
) {
    observe(map, branch_id, kind.taken(lhs.cmp(&rhs)));
}

pub fn record_cmp_i32(
    map: &mut CoverageMap,
    branch_id: u32,
    kind: ComparisonKind,
    lhs: i32,
    rhs: i32,
) {
    observe(map, branch_id, kind.taken(lhs.cmp(&rhs)));
}

pub fn record_cmp_i64(
    map: &mut CoverageMap,
    branch_id: u32,
    kind: ComparisonKind,
    lhs: i64,
    rhs: i64,
) {
    observe(map, branch_id, kind.taken(lhs.cmp(&rhs)));
}

/// String comparison sites reuse the equality rule on the three-way result
/// of the byte-wise comparison.
pub fn record_str_eq(map: &mut CoverageMap, branch_id: u32, lhs: &[u8], rhs: &[u8]) {
    observe(map, branch_id, ComparisonKind::Equal.taken(lhs.cmp(rhs)));
}

/// Bounded string comparison: only the first `limit` bytes of each operand
/// take part, and `limit` itself is stored (best effort, lossy) in the high
/// bits of the state cell so the search can size its guesses.
pub fn record_str_eq_bounded(
    map: &mut CoverageMap,
    branch_id: u32,
    lhs: &[u8],
    rhs: &[u8],
    limit: usize,
) {
    let lhs = &lhs[..lhs.len().min(limit)];
    let rhs = &rhs[..rhs.len().min(limit)];
    let taken = ComparisonKind::Equal.taken(lhs.cmp(rhs));
    observe_with_length(map, branch_id, taken, limit);
}

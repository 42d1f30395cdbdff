use crate::map::CoverageMap;

/// Written into the last slot word when a capture hit: lets the controller
/// tell an intentional capture exit apart from a genuine target crash.
pub const CAPTURE_SENTINEL: i32 = 12;

/// The capture slot repurposes the first four 32-bit words of the map:
/// `[watched branch id, lhs operand, rhs operand, sentinel]`, native endian.
pub const CAPTURE_SLOT_BYTES: usize = 16;

const TARGET_WORD: usize = 0;
const LHS_WORD: usize = 1;
const RHS_WORD: usize = 2;
const SENTINEL_WORD: usize = 3;

fn read_word(bytes: &[u8], word: usize) -> i32 {
    let offset = word * 4;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    i32::from_ne_bytes(buf)
}

fn write_word(bytes: &mut [u8], word: usize, value: i32) {
    let offset = word * 4;
    bytes[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}

/// Operand pair observed at the watched branch site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturedOperands {
    pub lhs: i32,
    pub rhs: i32,
}

/// Controller side: select the branch site to watch for the next execution
/// and clear any stale capture state. Called after the target has attached,
/// between executions, so it never races the mark byte.
pub fn arm(map_bytes: &mut [u8], branch_id: i32) {
    write_word(map_bytes, TARGET_WORD, branch_id);
    write_word(map_bytes, LHS_WORD, 0);
    write_word(map_bytes, RHS_WORD, 0);
    write_word(map_bytes, SENTINEL_WORD, 0);
}

/// Controller side: the operands, if the watched site fired during the run.
pub fn read_captured(map_bytes: &[u8]) -> Option<CapturedOperands> {
    if read_word(map_bytes, SENTINEL_WORD) != CAPTURE_SENTINEL {
        return None;
    }
    Some(CapturedOperands {
        lhs: read_word(map_bytes, LHS_WORD),
        rhs: read_word(map_bytes, RHS_WORD),
    })
}

fn capture_if_selected(map: &mut CoverageMap, branch_id: i32, lhs: i32, rhs: i32) -> bool {
    if read_word(map.as_slice(), TARGET_WORD) != branch_id {
        return false;
    }
    let bytes = map.as_mut_slice();
    write_word(bytes, LHS_WORD, lhs);
    write_word(bytes, RHS_WORD, rhs);
    write_word(bytes, SENTINEL_WORD, CAPTURE_SENTINEL);
    true
}

// A hit ends the run on the spot: the whole point of a capture execution is
// this one operand pair, and the exit itself is the success signal. Builds
// carrying these call sites are only ever driven by a controller that armed
// the slot first.

pub fn maybe_capture_i8(map: &mut CoverageMap, branch_id: i32, lhs: i8, rhs: i8) {
    if capture_if_selected(map, branch_id, lhs as i32, rhs as i32) {
        std::process::exit(0);
    }
}

pub fn maybe_capture_i16(map: &mut CoverageMap, branch_id: i32, lhs: i16, rhs: i16) {
    if capture_if_selected(map, branch_id, lhs as i32, rhs as i32) {
        std::process::exit(0);
    }
}

pub fn maybe_capture_i32(map: &mut CoverageMap, branch_id: i32, lhs: i32, rhs: i32) {
    if capture_if_selected(map, branch_id, lhs, rhs) {
        std::process::exit(0);
    }
}

/// Wide operands are reported truncated to 32 bits; the search only needs
/// the low end to steer equality guesses.
pub fn maybe_capture_i64(map: &mut CoverageMap, branch_id: i32, lhs: i64, rhs: i64) {
    if capture_if_selected(map, branch_id, lhs as i32, rhs as i32) {
        std::process::exit(0);
    }
}

/// String sites report the first byte of each operand (0 when empty).
pub fn maybe_capture_str(map: &mut CoverageMap, branch_id: i32, lhs: &[u8], rhs: &[u8]) {
    let lhs = lhs.first().copied().unwrap_or(0) as i32;
    let rhs = rhs.first().copied().unwrap_or(0) as i32;
    if capture_if_selected(map, branch_id, lhs, rhs) {
        std::process::exit(0);
    }
}

pub fn maybe_capture_str_bounded(
    map: &mut CoverageMap,
    branch_id: i32,
    lhs: &[u8],
    rhs: &[u8],
    _limit: usize,
) {
    maybe_capture_str(map, branch_id, lhs, rhs);
}

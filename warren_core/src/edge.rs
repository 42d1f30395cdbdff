use rand::Rng;
use std::cell::Cell;

use crate::config::InstrumentationRatio;
use crate::map::{CoverageMap, MAP_SIZE};

thread_local! {
    /// Contribution of the last recorded edge to the next edge's key.
    /// Thread-local so a multi-threaded target keeps one hot-path register
    /// per thread instead of contending on shared state.
    static PREVIOUS_LOCATION: Cell<u32> = const { Cell::new(0) };
}

/// Record one executed control-flow edge.
///
/// The map cell is keyed by `current ^ previous`; afterwards the register
/// becomes `current >> 1`. The shift breaks the symmetry that would make a
/// self-loop collide with the initial zero state. Identifier collisions are
/// accepted; the counter wraps rather than saturating hard.
#[inline]
pub fn record_edge(map: &mut CoverageMap, current: u32) {
    PREVIOUS_LOCATION.with(|previous| {
        map.bump((current ^ previous.get()) as usize);
        previous.set(current >> 1);
    });
}

/// Reset the previous-location register, so the next edge is keyed as if it
/// were the first of the execution. Called at persistent-loop boundaries.
pub fn reset_previous_location() {
    PREVIOUS_LOCATION.with(|previous| previous.set(0));
}

/// Location ids for guard-style instrumentation, assigned once per build at
/// module-load time. A slot left at 0 means "not instrumented"; recording
/// through it still touches cell 0, which is harmless.
pub struct GuardTable {
    ids: Box<[u32]>,
}

impl GuardTable {
    /// Assign a random non-zero location id to `ratio` percent of the guard
    /// slots. The first slot is always assigned; duplicate init calls are
    /// detected through it by callers.
    pub fn assign<R: Rng>(guards: usize, ratio: InstrumentationRatio, rng: &mut R) -> Self {
        let mut ids = vec![0u32; guards].into_boxed_slice();
        if let Some(first) = ids.first_mut() {
            *first = rng.random_range(1..MAP_SIZE as u32);
        }
        for id in ids.iter_mut().skip(1) {
            if rng.random_range(0..100u8) < ratio.percent() {
                *id = rng.random_range(1..MAP_SIZE as u32);
            }
        }
        Self { ids }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, slot: usize) -> u32 {
        self.ids[slot]
    }

    /// Bump the map cell assigned to `slot`.
    #[inline]
    pub fn record(&self, map: &mut CoverageMap, slot: usize) {
        map.bump(self.ids[slot] as usize);
    }
}

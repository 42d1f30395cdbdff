use nix::sys::signal::{Signal, raise};

use crate::config::PERSISTENT_ENV;
use crate::edge;
use crate::map::CoverageMap;

/// Cooperative iteration helper for targets that process many logical
/// inputs inside one forked process.
///
/// Call `iteration` at the top of the target-owned loop; run one input per
/// `true`. Between iterations the process suspends itself so the supervisor
/// observes a stop instead of an exit and can resume it without forking.
/// When persistent mode is off the helper degrades to a single `true`.
pub struct PersistentLoop {
    active: bool,
    first_pass: bool,
    remaining: u32,
}

impl PersistentLoop {
    pub fn new(active: bool) -> Self {
        Self {
            active,
            first_pass: true,
            remaining: 0,
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var_os(PERSISTENT_ENV).is_some())
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// `true` to run one more input, `false` to leave the loop.
    ///
    /// With a budget of `k` the caller gets exactly `k` proceeds; the map's
    /// mark byte is non-zero after every one of them. The first pass wipes
    /// the map so the loop starts from a clean slate; the last pass retires
    /// the map to the private buffer so post-loop code is not attributed to
    /// the fuzzed run.
    pub fn iteration(&mut self, map: &mut CoverageMap, budget: u32) -> bool {
        if self.first_pass {
            if self.active {
                map.clear();
                map.mark_alive();
                edge::reset_previous_location();
            }
            self.remaining = budget;
            self.first_pass = false;
            return true;
        }

        if !self.active {
            return false;
        }

        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining > 0 {
            let _ = raise(Signal::SIGSTOP);
            // Resumed by the supervisor: fresh iteration, fresh keying.
            map.mark_alive();
            edge::reset_previous_location();
            true
        } else {
            map.retire_to_private();
            false
        }
    }
}

use crate::config::{InstrumentationRatio, PERSISTENT_ENV};
use crate::edge::GuardTable;
use crate::forksrv::{self, Handoff};
use crate::map::CoverageMap;
use crate::persistent::PersistentLoop;

/// Everything an instrumented target threads through its harness after
/// bootstrap: the map the recorders write into and the persistent-loop
/// state. `role` says whether this process is a supervised child or an
/// ordinary standalone run.
pub struct Runtime {
    pub map: CoverageMap,
    pub persistent: PersistentLoop,
    pub role: Handoff,
}

/// Target-side bootstrap, called before any target logic runs.
///
/// Attaches the shared map if the environment provides one, then hands the
/// process over to the fork server. A handle that is present but
/// unattachable ends the process immediately, since a supervised run
/// without observability is worthless. Forked children and unsupervised
/// processes come back out with a ready-to-use `Runtime`.
pub fn init() -> Runtime {
    let map = match CoverageMap::from_env() {
        Ok(map) => map,
        Err(err) => {
            eprintln!("ERROR: {err}");
            std::process::exit(1);
        }
    };

    let persistent = std::env::var_os(PERSISTENT_ENV).is_some();
    let role = forksrv::serve(persistent);

    Runtime {
        map,
        persistent: PersistentLoop::new(persistent),
        role,
    }
}

/// Populate the guard table for guard-style instrumentation, honoring the
/// configured density. Runs once at module load; a ratio outside 1-100 is a
/// build misconfiguration and aborts with a diagnostic rather than being
/// clamped.
pub fn init_guard_table(guards: usize) -> GuardTable {
    match InstrumentationRatio::from_env() {
        Ok(ratio) => GuardTable::assign(guards, ratio, &mut rand::rng()),
        Err(err) => {
            eprintln!("ERROR: {err}");
            std::process::abort();
        }
    }
}

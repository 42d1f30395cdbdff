use nix::sys::signal::{Signal, kill};
use nix::unistd::{ForkResult, Pid, fork};
use std::os::fd::RawFd;

/// Request descriptor: the controller writes 4-byte go tokens here.
pub const CONTROL_FD: RawFd = 198;
/// Report descriptor: acknowledgement, child pids and wait statuses go back
/// to the controller here, 4 bytes each.
pub const STATUS_FD: RawFd = 199;

/// Which role the current process continues in once `serve` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// A freshly forked child; control returns to the instrumented target.
    Child,
    /// No controller answered the handshake; this is an ordinary run.
    Unsupervised,
}

// Protocol failures mean the controller is gone or the OS is out of
// resources; there is no in-process remedy and no cleanup of the shared map
// (the controller owns its lifecycle across process deaths).
fn fatal() -> ! {
    unsafe { libc::_exit(1) }
}

fn read_exact_u32(fd: RawFd) -> Result<u32, ()> {
    let mut buf = [0u8; 4];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), 4) };
    if n != 4 {
        return Err(());
    }
    Ok(u32::from_ne_bytes(buf))
}

fn write_exact_u32(fd: RawFd, value: u32) -> Result<(), ()> {
    let buf = value.to_ne_bytes();
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), 4) };
    if n == 4 { Ok(()) } else { Err(()) }
}

/// Run the fork server until the controller goes away.
///
/// Called once, after the map is attached and before any target logic runs.
/// The long-lived parent never returns: it loops answering go tokens,
/// forking a child per request (or resuming a stopped one in persistent
/// mode) and relaying pid and raw wait status. Only forked children and
/// unsupervised processes come back out, and children return with both
/// handshake descriptors closed.
pub fn serve(persistent: bool) -> Handoff {
    let mut child_pid: libc::pid_t = 0;
    let mut child_stopped = false;

    // Phone home. Nobody listening means we are running outside the
    // harness; carry on as a normal process.
    if write_exact_u32(STATUS_FD, 0).is_err() {
        return Handoff::Unsupervised;
    }

    loop {
        let Ok(was_killed) = read_exact_u32(CONTROL_FD) else {
            fatal()
        };

        // The controller may have killed a stopped child just before this
        // request; write the old process off before spawning a fresh one.
        if child_stopped && was_killed != 0 {
            child_stopped = false;
            let mut status: libc::c_int = 0;
            if unsafe { libc::waitpid(child_pid, &mut status, 0) } < 0 {
                fatal();
            }
        }

        if !child_stopped {
            match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    unsafe {
                        libc::close(CONTROL_FD);
                        libc::close(STATUS_FD);
                    }
                    return Handoff::Child;
                }
                Ok(ForkResult::Parent { child }) => child_pid = child.as_raw(),
                Err(_) => fatal(),
            }
        } else {
            // Alive-but-stopped child: resume it instead of forking.
            let _ = kill(Pid::from_raw(child_pid), Signal::SIGCONT);
            child_stopped = false;
        }

        if write_exact_u32(STATUS_FD, child_pid as u32).is_err() {
            fatal();
        }

        let mut status: libc::c_int = 0;
        let flags = if persistent { libc::WUNTRACED } else { 0 };
        if unsafe { libc::waitpid(child_pid, &mut status, flags) } < 0 {
            fatal();
        }

        // A child that stopped itself is kept around for the next request;
        // anything else exited for real and the next token forks fresh.
        if libc::WIFSTOPPED(status) {
            child_stopped = true;
        }

        if write_exact_u32(STATUS_FD, status as u32).is_err() {
            fatal();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge;
    use crate::map::CoverageMap;
    use crate::testutil::spawn_supervised;

    fn run_to_completion_body(map: &mut CoverageMap) -> i32 {
        // The handshake descriptors must already be closed in here.
        let leaked = unsafe { libc::write(STATUS_FD, [0u8; 4].as_ptr().cast(), 4) };
        edge::record_edge(map, 0x1234);
        if leaked == -1 { 42 } else { 43 }
    }

    #[test]
    fn one_request_yields_one_pid_and_one_exit_status() {
        let harness = spawn_supervised(false, run_to_completion_body);
        harness.expect_ack();

        let (pid, status) = harness.request_run(0);
        assert!(pid > 0, "supervisor must report the child pid");
        assert!(libc::WIFEXITED(status));
        assert_eq!(
            libc::WEXITSTATUS(status),
            42,
            "child saw an open handshake descriptor (or wrong exit path)"
        );

        let region = harness.map_snapshot();
        assert_eq!(region.as_slice()[0], 1, "attach must leave the mark byte");
        assert_eq!(region.as_slice()[0x1234], 1, "child's edge is missing");

        harness.finish();
    }

    #[test]
    fn consecutive_requests_fork_fresh_children() {
        let harness = spawn_supervised(false, run_to_completion_body);
        harness.expect_ack();

        let (first_pid, first_status) = harness.request_run(0);
        let (second_pid, second_status) = harness.request_run(0);
        assert!(libc::WIFEXITED(first_status));
        assert!(libc::WIFEXITED(second_status));
        assert_ne!(first_pid, second_pid, "exited children are never reused");

        let region = harness.map_snapshot();
        assert_eq!(region.as_slice()[0x1234], 2, "both runs recorded the edge");

        harness.finish();
    }

    #[test]
    fn crashing_children_are_reported_by_signal() {
        let harness = spawn_supervised(false, |_map| {
            unsafe { libc::raise(libc::SIGKILL) };
            0
        });
        harness.expect_ack();

        let (_pid, status) = harness.request_run(0);
        assert!(libc::WIFSIGNALED(status));
        assert_eq!(libc::WTERMSIG(status), libc::SIGKILL);

        harness.finish();
    }
}

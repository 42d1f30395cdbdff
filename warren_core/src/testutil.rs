//! Scaffolding for process-level tests: a scripted controller talking to a
//! real forked supervisor over the fixed handshake descriptors.

use crate::forksrv::{CONTROL_FD, STATUS_FD, serve};
use crate::map::{CoverageMap, MAP_SIZE, SharedRegion};
use nix::fcntl::OFlag;
use nix::unistd::{ForkResult, fork, pipe2};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use tempfile::NamedTempFile;

pub(crate) fn read4(fd: RawFd) -> u32 {
    let mut buf = [0u8; 4];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), 4) };
    assert_eq!(n, 4, "short read from supervisor");
    u32::from_ne_bytes(buf)
}

pub(crate) fn write4(fd: RawFd, value: u32) {
    let buf = value.to_ne_bytes();
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), 4) };
    assert_eq!(n, 4, "short write to supervisor");
}

pub(crate) struct Harness {
    pub supervisor: libc::pid_t,
    pub control_tx: OwnedFd,
    pub status_rx: OwnedFd,
    pub shm: NamedTempFile,
}

/// Fork a supervised target process wired to fresh handshake pipes and a
/// fresh shared map file, with `body` as the instrumented target code run by
/// each forked child. The child side allocates nothing after the fork and
/// only leaves via `_exit`.
pub(crate) fn spawn_supervised(persistent: bool, body: fn(&mut CoverageMap) -> i32) -> Harness {
    let shm = NamedTempFile::new().expect("temp map file");
    shm.as_file()
        .set_len(MAP_SIZE as u64)
        .expect("set_len on map file");

    let (control_rx, control_tx) = pipe2(OFlag::empty()).expect("control pipe");
    let (status_rx, status_tx) = pipe2(OFlag::empty()).expect("status pipe");

    // Attach before forking so the child allocates nothing afterwards.
    let mut map = CoverageMap::new();
    map.attach(shm.path()).expect("attach");

    match unsafe { fork() }.expect("fork supervisor") {
        ForkResult::Child => {
            unsafe {
                if libc::dup2(control_rx.as_raw_fd(), CONTROL_FD) < 0
                    || libc::dup2(status_tx.as_raw_fd(), STATUS_FD) < 0
                {
                    libc::_exit(98);
                }
            }
            drop(control_rx);
            drop(control_tx);
            drop(status_rx);
            drop(status_tx);
            match serve(persistent) {
                crate::forksrv::Handoff::Child => {
                    let code = body(&mut map);
                    unsafe { libc::_exit(code) }
                }
                crate::forksrv::Handoff::Unsupervised => unsafe { libc::_exit(99) },
            }
        }
        ForkResult::Parent { child } => {
            drop(control_rx);
            drop(status_tx);
            Harness {
                supervisor: child.as_raw(),
                control_tx,
                status_rx,
                shm,
            }
        }
    }
}

impl Harness {
    /// Read the 4-byte acknowledgement the supervisor sends on startup.
    pub(crate) fn expect_ack(&self) {
        assert_eq!(read4(self.status_rx.as_raw_fd()), 0, "handshake acknowledgement");
    }

    /// One full request: go token out, pid report and status report back.
    pub(crate) fn request_run(&self, was_killed: u32) -> (i32, i32) {
        write4(self.control_tx.as_raw_fd(), was_killed);
        let pid = read4(self.status_rx.as_raw_fd()) as i32;
        let status = read4(self.status_rx.as_raw_fd()) as i32;
        (pid, status)
    }

    pub(crate) fn map_snapshot(&self) -> SharedRegion {
        SharedRegion::map_file(self.shm.as_file(), MAP_SIZE).expect("snapshot mapping")
    }

    /// Closing the request pipe makes the supervisor's next read fail,
    /// which is its cue to die; then reap it.
    pub(crate) fn finish(self) {
        drop(self.control_tx);
        let mut status = 0;
        unsafe { libc::waitpid(self.supervisor, &mut status, 0) };
    }
}

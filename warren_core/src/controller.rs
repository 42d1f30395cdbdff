use nix::fcntl::OFlag;
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, pipe2};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::capture::{self, CapturedOperands};
use crate::config::{ControllerSettings, PERSISTENT_ENV, SHM_PATH_ENV};
use crate::forksrv::{CONTROL_FD, STATUS_FD};
use crate::map::{MAP_SIZE, MapError, SharedRegion};

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("target command is empty")]
    EmptyCommand,
    #[error("failed to set up shared map file: {0}")]
    MapSetup(std::io::Error),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error("failed to create handshake pipes: {0}")]
    Pipe(nix::errno::Errno),
    #[error("failed to spawn target '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("target never completed the handshake (is it built with the runtime?)")]
    Handshake,
    #[error("short {0} message from target; controller and target are out of sync")]
    Protocol(&'static str),
}

/// What one execution request came back as, decoded from the raw wait
/// status the supervisor relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Exited(i32),
    Signaled(i32),
    Stopped(i32),
}

impl RunOutcome {
    pub fn from_raw(status: i32) -> Self {
        if libc::WIFSIGNALED(status) {
            RunOutcome::Signaled(libc::WTERMSIG(status))
        } else if libc::WIFSTOPPED(status) {
            RunOutcome::Stopped(libc::WSTOPSIG(status))
        } else {
            RunOutcome::Exited(libc::WEXITSTATUS(status))
        }
    }

    pub fn is_crash(&self) -> bool {
        matches!(self, RunOutcome::Signaled(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutionReport {
    pub pid: i32,
    pub raw_status: i32,
    pub outcome: RunOutcome,
}

/// The driving side of the handshake: owns the target process, the
/// handshake pipes and a read-write view of the shared map.
///
/// The protocol keeps map access temporally separated: the controller only
/// reads (or arms) the map between `run_once` calls, never while a child is
/// executing.
pub struct Controller {
    target: Child,
    control_tx: OwnedFd,
    status_rx: OwnedFd,
    region: SharedRegion,
    map_file: NamedTempFile,
    last_pid: Option<i32>,
    killed_since_last_run: bool,
}

impl Controller {
    /// Create the shared map file, spawn the target with the handshake
    /// descriptors wired onto the well-known fd numbers, and wait for the
    /// runtime's acknowledgement.
    pub fn launch(settings: &ControllerSettings) -> Result<Self, ControllerError> {
        let program = settings.command.first().ok_or(ControllerError::EmptyCommand)?;

        let map_file = NamedTempFile::new().map_err(ControllerError::MapSetup)?;
        map_file
            .as_file()
            .set_len(MAP_SIZE as u64)
            .map_err(ControllerError::MapSetup)?;
        let region = SharedRegion::map_file(map_file.as_file(), MAP_SIZE)?;

        let (control_rx, control_tx) = pipe2(OFlag::O_CLOEXEC).map_err(ControllerError::Pipe)?;
        let (status_rx, status_tx) = pipe2(OFlag::O_CLOEXEC).map_err(ControllerError::Pipe)?;

        let mut command = Command::new(program);
        command.args(&settings.command[1..]);
        command.env(SHM_PATH_ENV, map_file.path());
        if settings.persistent {
            command.env(PERSISTENT_ENV, "1");
        }
        if let Some(dir) = &settings.working_dir {
            command.current_dir(dir);
        }
        command.stdin(Stdio::null());

        let control_raw = control_rx.as_raw_fd();
        let status_raw = status_tx.as_raw_fd();
        unsafe {
            // dup2 drops the close-on-exec flag, so only the well-known
            // descriptor numbers survive into the target.
            command.pre_exec(move || {
                if libc::dup2(control_raw, CONTROL_FD) < 0
                    || libc::dup2(status_raw, STATUS_FD) < 0
                {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let target = command.spawn().map_err(|source| ControllerError::Spawn {
            command: program.clone(),
            source,
        })?;
        drop(control_rx);
        drop(status_tx);

        let mut controller = Self {
            target,
            control_tx,
            status_rx,
            region,
            map_file,
            last_pid: None,
            killed_since_last_run: false,
        };
        controller
            .read_u32("handshake")
            .map_err(|_| ControllerError::Handshake)?;
        Ok(controller)
    }

    fn read_u32(&mut self, what: &'static str) -> Result<u32, ControllerError> {
        let mut buf = [0u8; 4];
        let n = unsafe {
            libc::read(self.status_rx.as_raw_fd(), buf.as_mut_ptr().cast(), 4)
        };
        if n != 4 {
            return Err(ControllerError::Protocol(what));
        }
        Ok(u32::from_ne_bytes(buf))
    }

    fn write_u32(&mut self, value: u32, what: &'static str) -> Result<(), ControllerError> {
        let buf = value.to_ne_bytes();
        let n = unsafe { libc::write(self.control_tx.as_raw_fd(), buf.as_ptr().cast(), 4) };
        if n == 4 {
            Ok(())
        } else {
            Err(ControllerError::Protocol(what))
        }
    }

    /// One execution: go token out, pid report and status report back.
    /// The token carries the was-killed flag when `kill_child` intervened
    /// since the previous run, so the supervisor can reap the corpse.
    pub fn run_once(&mut self) -> Result<ExecutionReport, ControllerError> {
        let token = u32::from(self.killed_since_last_run);
        self.killed_since_last_run = false;
        self.write_u32(token, "run request")?;
        let pid = self.read_u32("pid report")? as i32;
        self.last_pid = Some(pid);
        let raw_status = self.read_u32("status report")? as i32;
        Ok(ExecutionReport {
            pid,
            raw_status,
            outcome: RunOutcome::from_raw(raw_status),
        })
    }

    /// Read-only view of the feedback map. Only meaningful between runs.
    pub fn coverage(&self) -> &[u8] {
        self.region.as_slice()
    }

    /// Digest of the whole map, for cheap "have we seen this shape before"
    /// bookkeeping.
    pub fn coverage_digest(&self) -> [u8; 16] {
        md5::compute(self.region.as_slice()).0
    }

    pub fn path(&self) -> &std::path::Path {
        self.map_file.path()
    }

    /// Select the branch site whose operands the next run should capture.
    pub fn arm_capture(&mut self, branch_id: i32) {
        capture::arm(self.region.as_mut_slice(), branch_id);
    }

    /// The operand pair, if the armed site fired during the last run.
    pub fn captured_operands(&self) -> Option<CapturedOperands> {
        capture::read_captured(self.region.as_slice())
    }

    /// Forcibly end the in-flight (or stopped) child, e.g. on an external
    /// timeout. The next `run_once` tells the supervisor about it.
    pub fn kill_child(&mut self) -> bool {
        match self.last_pid {
            Some(pid) => {
                self.killed_since_last_run = kill(Pid::from_raw(pid), Signal::SIGKILL).is_ok();
                self.killed_since_last_run
            }
            None => false,
        }
    }

    /// Tear the whole target process tree down.
    pub fn shutdown(mut self) {
        let _ = self.target.kill();
        let _ = self.target.wait();
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        let _ = self.target.kill();
        let _ = self.target.wait();
    }
}

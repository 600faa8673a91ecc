//! Pseudo-terminal plumbing for interactive shells.
//!
//! A shell is spawned on the slave side of a pty in its own session and
//! process group; the master side is handed to the terminal bridge as a
//! pair of blocking reader/writer handles.

use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::pty::{openpty, Winsize};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Extra process setup run in the child between fork and exec.
/// Must be async-signal-safe: raw syscalls only, no allocation.
pub type ChildPrep = Box<dyn FnMut() -> io::Result<()> + Send + Sync>;

/// How a shell process is launched.
pub struct SpawnOptions {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, OsString)>,
    /// Whether the server's own environment is passed through.
    pub inherit_env: bool,
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
}

/// A live interactive shell attached to a pty.
#[derive(Debug)]
pub struct ShellProcess {
    child: Child,
    master: OwnedFd,
    pgid: Pid,
}

fn winsize(cols: u16, rows: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Spawns `opts.program` on a fresh pty.
///
/// The child calls `setsid`, takes the pty as its controlling terminal,
/// then runs `prep` (namespace entry, chroot, privilege drop) before exec.
pub fn spawn(opts: SpawnOptions, mut prep: Option<ChildPrep>) -> Result<ShellProcess> {
    let pty = openpty(Some(&winsize(opts.cols, opts.rows)), None)
        .map_err(|e| Error::Provision(format!("openpty: {e}")))?;

    let mut cmd = Command::new(&opts.program);
    cmd.args(&opts.args);
    if !opts.inherit_env {
        cmd.env_clear();
    }
    for (key, value) in &opts.env {
        cmd.env(key, value);
    }
    if let Some(cwd) = &opts.cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::from(pty.slave.try_clone()?));
    cmd.stdout(Stdio::from(pty.slave.try_clone()?));
    cmd.stderr(Stdio::from(pty.slave));

    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }
            // The pty slave is stdin at this point.
            if libc::ioctl(0, libc::TIOCSCTTY, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            if let Some(prep) = prep.as_mut() {
                prep()?;
            }
            Ok(())
        });
    }

    let child = cmd
        .spawn()
        .map_err(|e| Error::Provision(format!("spawn {}: {e}", opts.program)))?;
    // setsid makes the child the leader of its own process group.
    let pgid = Pid::from_raw(child.id() as i32);
    debug!(pid = child.id(), program = %opts.program, "shell spawned");

    Ok(ShellProcess {
        child,
        master: pty.master,
        pgid,
    })
}

impl ShellProcess {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Independent blocking reader over the pty master. Returns EOF (or
    /// EIO, which callers treat the same) once the shell exits.
    pub fn clone_reader(&self) -> io::Result<File> {
        Ok(File::from(self.master.try_clone()?))
    }

    /// Independent blocking writer into the pty master.
    pub fn clone_writer(&self) -> io::Result<File> {
        Ok(File::from(self.master.try_clone()?))
    }

    /// Applies new terminal dimensions to the pty.
    pub fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        let size = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let rc = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &size) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn try_wait(&mut self) -> io::Result<Option<std::process::ExitStatus>> {
        self.child.try_wait()
    }

    /// Terminates the whole shell process group and reaps the leader.
    /// Blocking; run on a blocking thread. Safe to call after exit.
    pub fn terminate(&mut self) {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }
        let _ = killpg(self.pgid, Signal::SIGHUP);

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(pid = self.child.id(), ?status, "shell exited");
                    return;
                }
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(pid = self.child.id(), %err, "wait on shell failed");
                    return;
                }
            }
        }

        let _ = killpg(self.pgid, Signal::SIGKILL);
        let _ = self.child.wait();
        debug!(pid = self.child.id(), "shell killed");
    }
}

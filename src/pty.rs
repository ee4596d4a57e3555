//! PTY (pseudo-terminal) primitives.
//!
//! Provides:
//! - Creating a PTY and spawning the agent on its slave side
//! - Non-blocking reads and writes on the master side
//! - Reaping and signalling the child
//! - Host terminal raw mode and size detection

use crate::error::SupervisorError;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{self, Signal};
use nix::sys::termios::{self, InputFlags, LocalFlags, OutputFlags, SetArg, Termios};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, dup2, execve, fork, read, setsid, write, ForkResult, Pid};
use std::ffi::CString;
use std::io::IsTerminal;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// Host terminal settings saved before entering raw mode
static ORIGINAL_TERMIOS: Mutex<Option<Termios>> = Mutex::new(None);

/// Environment variables forced on the agent
const CHILD_ENV: &[(&str, &str)] = &[("TERM", "xterm-256color"), ("FORCE_COLOR", "1")];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl TerminalSize {
    pub const DEFAULT: TerminalSize = TerminalSize {
        rows: 40,
        cols: 120,
    };

    fn winsize(self) -> Winsize {
        Winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

/// Result of a non-blocking read on the master side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    WouldBlock,
    /// The slave side is gone (EOF or EIO)
    Closed,
}

/// PTY handle for communicating with the child process
pub struct Pty {
    /// Master file descriptor
    master_fd: OwnedFd,
    /// Child process ID
    child_pid: Pid,
}

impl Pty {
    /// Open a PTY and run `program args...` on it in `cwd`.
    pub fn spawn(
        program: &Path,
        args: &[String],
        cwd: &Path,
        size: TerminalSize,
    ) -> Result<Self, SupervisorError> {
        if !cwd.is_dir() {
            return Err(SupervisorError::Spawn(format!(
                "working directory {} does not exist",
                cwd.display()
            )));
        }

        // Everything the child needs is allocated before fork
        let c_program = CString::new(program.as_os_str().as_bytes())
            .map_err(|_| SupervisorError::Spawn("program path contains NUL".to_string()))?;
        let mut c_args = vec![c_program.clone()];
        for arg in args {
            c_args.push(
                CString::new(arg.as_str())
                    .map_err(|_| SupervisorError::Spawn(format!("argument {:?} contains NUL", arg)))?,
            );
        }
        let c_cwd = CString::new(cwd.as_os_str().as_bytes())
            .map_err(|_| SupervisorError::Spawn("working directory contains NUL".to_string()))?;
        let c_env = child_environment();

        let OpenptyResult { master, slave } = openpty(&size.winsize(), None)
            .map_err(|e| SupervisorError::PtyUnavailable(e.to_string()))?;

        match unsafe { fork() }.map_err(|e| SupervisorError::Spawn(format!("fork failed: {}", e)))? {
            ForkResult::Parent { child } => {
                // Close slave in parent
                drop(slave);

                // Set master to non-blocking
                let flags = fcntl(master.as_raw_fd(), FcntlArg::F_GETFL)
                    .map_err(|e| SupervisorError::PtyUnavailable(e.to_string()))?;
                let flags = OFlag::from_bits_truncate(flags);
                fcntl(
                    master.as_raw_fd(),
                    FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK),
                )
                .map_err(|e| SupervisorError::PtyUnavailable(e.to_string()))?;

                info!("Spawned {} with PID {}", program.display(), child);

                Ok(Self {
                    master_fd: master,
                    child_pid: child,
                })
            }
            ForkResult::Child => {
                drop(master);

                // New session with the slave as controlling terminal
                setsid().ok();
                unsafe {
                    libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY as libc::c_ulong, 0);
                }

                let slave_raw = slave.as_raw_fd();
                dup2(slave_raw, libc::STDIN_FILENO).ok();
                dup2(slave_raw, libc::STDOUT_FILENO).ok();
                dup2(slave_raw, libc::STDERR_FILENO).ok();
                if slave_raw > 2 {
                    drop(slave);
                } else {
                    std::mem::forget(slave);
                }

                let _ = chdir(c_cwd.as_c_str());
                let _ = execve(&c_program, &c_args, &c_env);
                unsafe { libc::_exit(127) }
            }
        }
    }

    pub fn child_pid(&self) -> Pid {
        self.child_pid
    }

    /// Resize the PTY
    pub fn resize(&self, size: TerminalSize) -> Result<(), SupervisorError> {
        let winsize = size.winsize();
        unsafe {
            if libc::ioctl(self.master_fd.as_raw_fd(), libc::TIOCSWINSZ, &winsize) < 0 {
                return Err(SupervisorError::Resize);
            }
        }
        debug!("PTY resized to {}x{}", size.cols, size.rows);
        Ok(())
    }

    /// Write data to the PTY (send to child). Returns 0 when the PTY is full.
    pub fn write_data(&self, data: &[u8]) -> nix::Result<usize> {
        match write(&self.master_fd, data) {
            Ok(n) => Ok(n),
            Err(nix::errno::Errno::EAGAIN) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Read data from the PTY (output from child)
    pub fn read_data(&self, buf: &mut [u8]) -> nix::Result<ReadOutcome> {
        match read(self.master_fd.as_raw_fd(), buf) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(nix::errno::Errno::EAGAIN) => Ok(ReadOutcome::WouldBlock),
            // EIO means the child closed the terminal
            Err(nix::errno::Errno::EIO) => Ok(ReadOutcome::Closed),
            Err(e) => Err(e),
        }
    }

    /// Reap the child if it has exited
    pub fn try_wait(&self) -> Option<i32> {
        match waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => None,
            Ok(status) => exit_code(status),
            Err(nix::errno::Errno::EINTR) => None,
            Err(_) => Some(-1),
        }
    }

    /// Block until the child exits
    pub fn wait(&self) -> i32 {
        loop {
            match waitpid(self.child_pid, None) {
                Ok(status) => {
                    if let Some(code) = exit_code(status) {
                        return code;
                    }
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => return -1,
            }
        }
    }

    /// Signal the child's process group
    pub fn signal(&self, sig: Signal) -> Result<(), SupervisorError> {
        signal::killpg(self.child_pid, sig)
            .or_else(|_| signal::kill(self.child_pid, sig))
            .map_err(SupervisorError::from)
    }

    /// Check if stdin is a TTY
    pub fn is_tty() -> bool {
        std::io::stdin().is_terminal()
    }

    /// Set raw mode on stdin for transparent terminal passthrough.
    /// Returns Ok(false) if stdin is not a TTY (headless mode).
    pub fn set_raw_mode() -> nix::Result<bool> {
        if !Self::is_tty() {
            debug!("stdin is not a TTY, skipping raw mode (headless mode)");
            return Ok(false);
        }

        let stdin = std::io::stdin();
        let original = termios::tcgetattr(&stdin)?;

        let mut raw = original.clone();
        raw.local_flags
            .remove(LocalFlags::ECHO | LocalFlags::ICANON | LocalFlags::ISIG | LocalFlags::IEXTEN);
        raw.input_flags.remove(InputFlags::IXON | InputFlags::ICRNL);
        raw.output_flags.remove(OutputFlags::OPOST);
        termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw)?;

        *ORIGINAL_TERMIOS.lock().unwrap_or_else(|e| e.into_inner()) = Some(original);
        debug!("Terminal set to raw mode");
        Ok(true)
    }

    /// Restore original terminal settings
    pub fn restore_terminal() {
        let saved = ORIGINAL_TERMIOS.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(original) = saved {
            if termios::tcsetattr(&std::io::stdin(), SetArg::TCSANOW, &original).is_ok() {
                debug!("Terminal restored");
            }
        }
    }

    /// Size of the host terminal, if stdout is one
    pub fn host_size() -> Option<TerminalSize> {
        let mut winsize = Winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        unsafe {
            if libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut winsize) == 0
                && winsize.ws_row > 0
                && winsize.ws_col > 0
            {
                Some(TerminalSize {
                    rows: winsize.ws_row,
                    cols: winsize.ws_col,
                })
            } else {
                None
            }
        }
    }
}

/// Exit code for a terminal wait status; signal deaths map to 128 + signo.
pub fn exit_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, sig, _) => Some(128 + sig as i32),
        _ => None,
    }
}

/// Inherited environment with the agent's terminal variables forced
fn child_environment() -> Vec<CString> {
    std::env::vars_os()
        .filter(|(key, _)| !CHILD_ENV.iter().any(|(name, _)| key.as_bytes() == name.as_bytes()))
        .filter_map(|(key, value)| {
            let mut entry = key.into_vec();
            entry.push(b'=');
            entry.extend(value.into_vec());
            CString::new(entry).ok()
        })
        .chain(
            CHILD_ENV
                .iter()
                .filter_map(|(key, value)| CString::new(format!("{}={}", key, value)).ok()),
        )
        .collect()
}

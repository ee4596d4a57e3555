//! Process supervisor: one agent subprocess on a PTY at a time.
//!
//! Output is read on a background thread and delivered as
//! [`SupervisorEvent::Data`]; that same thread is the only one that reaps the
//! child, so [`SupervisorEvent::Exit`] is sent exactly once per session.

use crate::config::LineTerminator;
use crate::error::SupervisorError;
use crate::pty::{Pty, ReadOutcome, TerminalSize};
use nix::sys::signal::Signal;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, trace, warn};

/// Grace period between SIGTERM and SIGKILL
const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A chunk of combined stdout/stderr
    Data(Vec<u8>),
    /// The session's process exited; signal deaths are 128 + signo
    Exit { session_id: u64, code: i32 },
    /// The session could not be started; `code` is the status to exit with
    Error { message: String, code: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { session_id: u64 },
    AlreadyRunning,
}

/// The agent-facing side the orchestrator drives
pub trait AgentIo {
    fn start(&mut self, cwd: &Path) -> Result<StartOutcome, SupervisorError>;
    fn write(&mut self, data: &[u8]) -> Result<(), SupervisorError>;
    fn interrupt(&mut self) -> Result<(), SupervisorError>;
    fn resize(&mut self, size: TerminalSize) -> Result<(), SupervisorError>;
    fn is_running(&self) -> bool;
    /// Forget the session after its exit event was handled
    fn session_exited(&mut self, session_id: u64);
    fn stop(&mut self);

    fn send_line(&mut self, text: &str, terminator: LineTerminator) -> Result<(), SupervisorError> {
        let mut line = String::with_capacity(text.len() + 2);
        line.push_str(text);
        line.push_str(terminator.as_str());
        self.write(line.as_bytes())
    }
}

/// What to run
#[derive(Debug, Clone)]
pub struct AgentCommand {
    /// Explicit binary path; searched for by `name` when absent
    pub binary: Option<PathBuf>,
    pub name: String,
    pub args: Vec<String>,
}

struct Session {
    id: u64,
    pty: Arc<Pty>,
    running: Arc<AtomicBool>,
    /// Set by `stop`; the reader drops events instead of waiting on a full channel
    stopping: Arc<AtomicBool>,
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    cwd: PathBuf,
}

pub struct ProcessSupervisor {
    command: AgentCommand,
    size: TerminalSize,
    events_tx: mpsc::Sender<SupervisorEvent>,
    session: Option<Session>,
    next_session_id: u64,
}

impl ProcessSupervisor {
    pub fn new(
        command: AgentCommand,
        size: TerminalSize,
        events_tx: mpsc::Sender<SupervisorEvent>,
    ) -> Self {
        Self {
            command,
            size,
            events_tx,
            session: None,
            next_session_id: 1,
        }
    }

    /// Replace the binary and arguments used by the next start
    pub fn set_command(&mut self, command: AgentCommand) {
        self.command = command;
    }

    pub fn size(&self) -> TerminalSize {
        self.size
    }

    fn report(&self, error: SupervisorError) -> SupervisorError {
        warn!("Failed to start agent: {}", error);
        if self
            .events_tx
            .try_send(SupervisorEvent::Error {
                message: error.to_string(),
                code: error.exit_code(),
            })
            .is_err()
        {
            warn!("Supervisor event channel unavailable, dropping error event");
        }
        error
    }

    fn reader_thread(
        session_id: u64,
        pty: Arc<Pty>,
        running: Arc<AtomicBool>,
        stopping: Arc<AtomicBool>,
        tx: mpsc::Sender<SupervisorEvent>,
    ) {
        let mut buf = [0u8; 4096];
        let mut reaped = None;
        loop {
            match pty.read_data(&mut buf) {
                Ok(ReadOutcome::Data(n)) => {
                    if !deliver(&tx, SupervisorEvent::Data(buf[..n].to_vec()), &stopping) {
                        break;
                    }
                }
                Ok(ReadOutcome::WouldBlock) => {
                    // A grandchild may hold the slave open after the agent exits
                    if let Some(code) = pty.try_wait() {
                        while let Ok(ReadOutcome::Data(n)) = pty.read_data(&mut buf) {
                            deliver(&tx, SupervisorEvent::Data(buf[..n].to_vec()), &stopping);
                        }
                        reaped = Some(code);
                        break;
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Ok(ReadOutcome::Closed) => break,
                Err(e) => {
                    error!("PTY read error: {}", e);
                    break;
                }
            }
        }

        let code = reaped.unwrap_or_else(|| pty.wait());
        running.store(false, Ordering::SeqCst);
        info!("Session {} exited with code {}", session_id, code);
        deliver(&tx, SupervisorEvent::Exit { session_id, code }, &stopping);
        debug!("Reader thread exiting");
    }

    fn writer_thread(
        pty: Arc<Pty>,
        running: Arc<AtomicBool>,
        mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        while let Some(data) = rx.blocking_recv() {
            if !running.load(Ordering::SeqCst) {
                break;
            }

            let mut written = 0;
            while written < data.len() {
                match pty.write_data(&data[written..]) {
                    Ok(0) => thread::sleep(Duration::from_millis(1)),
                    Ok(n) => written += n,
                    Err(e) => {
                        error!("PTY write error: {}", e);
                        return;
                    }
                }
            }
        }
        debug!("Writer thread exiting");
    }
}

impl AgentIo for ProcessSupervisor {
    fn start(&mut self, cwd: &Path) -> Result<StartOutcome, SupervisorError> {
        if self.is_running() {
            debug!("Start requested while a session is running");
            return Ok(StartOutcome::AlreadyRunning);
        }

        let program = resolve_binary(self.command.binary.as_deref(), &self.command.name)
            .map_err(|e| self.report(e))?;
        let pty = Pty::spawn(&program, &self.command.args, cwd, self.size)
            .map_err(|e| self.report(e))?;

        let session_id = self.next_session_id;
        self.next_session_id += 1;

        let pty = Arc::new(pty);
        let running = Arc::new(AtomicBool::new(true));
        let stopping = Arc::new(AtomicBool::new(false));
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        // Spawn reader thread (not async task, since PTY is sync)
        {
            let pty = Arc::clone(&pty);
            let running = Arc::clone(&running);
            let stopping = Arc::clone(&stopping);
            let tx = self.events_tx.clone();
            thread::spawn(move || Self::reader_thread(session_id, pty, running, stopping, tx));
        }
        {
            let pty = Arc::clone(&pty);
            let running = Arc::clone(&running);
            thread::spawn(move || Self::writer_thread(pty, running, input_rx));
        }

        info!(
            "Session {} started: {} {:?} in {}",
            session_id,
            program.display(),
            self.command.args,
            cwd.display()
        );
        self.session = Some(Session {
            id: session_id,
            pty,
            running,
            stopping,
            input_tx,
            cwd: cwd.to_path_buf(),
        });
        Ok(StartOutcome::Started { session_id })
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SupervisorError> {
        let session = self.session.as_ref().ok_or(SupervisorError::NotRunning)?;
        if !session.running.load(Ordering::SeqCst) {
            return Err(SupervisorError::NotRunning);
        }
        session
            .input_tx
            .send(data.to_vec())
            .map_err(|_| SupervisorError::ChannelClosed)
    }

    fn interrupt(&mut self) -> Result<(), SupervisorError> {
        let session = self.session.as_ref().ok_or(SupervisorError::NotRunning)?;
        debug!("Forwarding SIGINT to session {}", session.id);
        session.pty.signal(Signal::SIGINT)
    }

    fn resize(&mut self, size: TerminalSize) -> Result<(), SupervisorError> {
        self.size = size;
        match &self.session {
            Some(session) => session.pty.resize(size),
            None => Ok(()),
        }
    }

    fn is_running(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.running.load(Ordering::SeqCst))
    }

    fn session_exited(&mut self, session_id: u64) {
        if self.session.as_ref().is_some_and(|s| s.id == session_id) {
            if let Some(session) = self.session.take() {
                debug!("Session {} in {} cleared", session.id, session.cwd.display());
            }
        }
    }

    /// Terminate the child (SIGTERM, then SIGKILL after the grace period)
    fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if !session.running.load(Ordering::SeqCst) {
            return;
        }

        info!("Stopping session {}", session.id);
        session.stopping.store(true, Ordering::SeqCst);
        let _ = session.pty.signal(Signal::SIGTERM);

        let deadline = Instant::now() + STOP_GRACE;
        while session.running.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        if session.running.load(Ordering::SeqCst) {
            warn!("Session {} ignored SIGTERM, sending SIGKILL", session.id);
            let _ = session.pty.signal(Signal::SIGKILL);
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Send an event, waiting while the channel is full unless the session is
/// being stopped. Returns false once the receiver is gone.
fn deliver(
    tx: &mpsc::Sender<SupervisorEvent>,
    mut event: SupervisorEvent,
    stopping: &AtomicBool,
) -> bool {
    loop {
        match tx.try_send(event) {
            Ok(()) => return true,
            Err(TrySendError::Closed(_)) => return false,
            Err(TrySendError::Full(returned)) => {
                if stopping.load(Ordering::SeqCst) {
                    trace!("Event channel full while stopping, dropping event");
                    return true;
                }
                event = returned;
                thread::sleep(Duration::from_millis(5));
            }
        }
    }
}

/// Well-known install locations searched after PATH
fn fallback_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        dirs.push(home.join(".claude/local"));
        dirs.push(home.join(".local/bin"));
        dirs.push(home.join(".npm-global/bin"));
    }
    dirs.push(PathBuf::from("/usr/local/bin"));
    dirs.push(PathBuf::from("/opt/homebrew/bin"));
    dirs
}

/// Absolute path of the agent binary.
///
/// An explicit path (or a name containing `/`) is validated as-is;
/// otherwise PATH is searched, then common install locations.
pub fn resolve_binary(explicit: Option<&Path>, name: &str) -> Result<PathBuf, SupervisorError> {
    let explicit = explicit.or_else(|| name.contains('/').then(|| Path::new(name)));
    if let Some(path) = explicit {
        return if is_executable(path) {
            Ok(std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()))
        } else {
            Err(SupervisorError::BinaryNotFound(format!(
                "{} is not an executable file",
                path.display()
            )))
        };
    }

    let mut dirs: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).collect())
        .unwrap_or_default();
    dirs.extend(fallback_dirs());

    search_dirs(name, &dirs).ok_or_else(|| {
        SupervisorError::BinaryNotFound(format!(
            "'{}' not found in PATH or common install locations",
            name
        ))
    })
}

fn search_dirs(name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .filter(|dir| dir.is_absolute())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn sh(script: &str) -> AgentCommand {
        AgentCommand {
            binary: Some(PathBuf::from("/bin/sh")),
            name: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn supervisor(command: AgentCommand) -> (ProcessSupervisor, mpsc::Receiver<SupervisorEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (ProcessSupervisor::new(command, TerminalSize::DEFAULT, tx), rx)
    }

    /// Collect output until the exit event
    async fn drain(rx: &mut mpsc::Receiver<SupervisorEvent>) -> (String, i32) {
        let mut output = Vec::new();
        loop {
            match timeout(Duration::from_secs(10), rx.recv()).await {
                Ok(Some(SupervisorEvent::Data(data))) => output.extend(data),
                Ok(Some(SupervisorEvent::Exit { code, .. })) => {
                    return (String::from_utf8_lossy(&output).into_owned(), code)
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_output_then_single_exit() {
        let (mut supervisor, mut rx) = supervisor(sh("printf hello; exit 4"));
        let outcome = supervisor.start(Path::new("/")).unwrap();
        assert!(matches!(outcome, StartOutcome::Started { session_id: 1 }));

        let (output, code) = drain(&mut rx).await;
        assert!(output.contains("hello"));
        assert_eq!(code, 4);
        assert!(!supervisor.is_running());

        supervisor.session_exited(1);
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_write_reaches_child() {
        let (mut supervisor, mut rx) = supervisor(sh("read line; echo \"got:$line\""));
        supervisor.start(Path::new("/")).unwrap();
        supervisor.send_line("ping", LineTerminator::Lf).unwrap();

        let (output, code) = drain(&mut rx).await;
        assert!(output.contains("got:ping"), "output: {:?}", output);
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_second_start_while_running() {
        let (mut supervisor, mut rx) = supervisor(sh("sleep 30"));
        supervisor.start(Path::new("/")).unwrap();
        assert_eq!(
            supervisor.start(Path::new("/")).unwrap(),
            StartOutcome::AlreadyRunning
        );

        supervisor.stop();
        let (_, code) = drain(&mut rx).await;
        assert_eq!(code, 128 + Signal::SIGTERM as i32);
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_stop_with_undrained_events() {
        let (tx, _rx) = mpsc::channel(1);
        let mut supervisor = ProcessSupervisor::new(
            sh("while :; do echo flood; done"),
            TerminalSize::DEFAULT,
            tx,
        );
        supervisor.start(Path::new("/")).unwrap();
        // Nobody reads the channel, so it fills up
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The reader must reap after SIGTERM even though nobody drains events
        let started = Instant::now();
        supervisor.stop();
        assert!(started.elapsed() < STOP_GRACE);
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_missing_binary_reports_error() {
        let (mut supervisor, mut rx) = supervisor(AgentCommand {
            binary: Some(PathBuf::from("/no/such/agent")),
            name: "agent".to_string(),
            args: Vec::new(),
        });
        let result = supervisor.start(Path::new("/"));
        assert!(matches!(result, Err(SupervisorError::BinaryNotFound(_))));
        assert!(!supervisor.is_running());
        assert!(matches!(rx.try_recv(), Ok(SupervisorEvent::Error { code: 127, .. })));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_write_without_session() {
        let (mut supervisor, _rx) = supervisor(sh("true"));
        assert!(matches!(
            supervisor.write(b"x"),
            Err(SupervisorError::NotRunning)
        ));
        // Safe when nothing is running
        supervisor.stop();
    }

    #[test]
    fn test_search_dirs_requires_exec_bit() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("agent");
        std::fs::write(&plain, "#!/bin/sh\n").unwrap();
        let dirs = vec![dir.path().to_path_buf()];
        assert_eq!(search_dirs("agent", &dirs), None);

        std::fs::set_permissions(&plain, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(search_dirs("agent", &dirs), Some(plain));
    }

    #[test]
    fn test_resolve_explicit_path() {
        let resolved = resolve_binary(Some(Path::new("/bin/sh")), "claude").unwrap();
        assert!(resolved.is_absolute());

        let dir = TempDir::new().unwrap();
        assert!(matches!(
            resolve_binary(Some(dir.path()), "claude"),
            Err(SupervisorError::BinaryNotFound(_))
        ));
    }
}

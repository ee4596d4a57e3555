//! pilot-pty: auto-pilot for interactive CLI agents
//!
//! Runs an agent CLI (claude by default) inside a PTY, passes the terminal
//! through to the user, and answers the agent's confirmation prompts with a
//! language model when nobody is typing.
//!
//! Usage:
//!   pilot-pty --instructions "Approve file reads, refuse deletes" -- --model opus

// Allow dead code - library-style APIs (snapshots, accessors) not all used by the binary
#![allow(dead_code)]

mod config;
mod config_watch;
mod detector;
mod error;
mod log;
mod orchestrator;
mod parser;
mod patterns;
mod protocol;
mod pty;
mod responder;
mod supervisor;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, ConfigOverrides, LineTerminator, Model};
use config_watch::ConfigWatcher;
use log::{JsonLinesResponseLog, ResponseLog, TracingResponseLog};
use orchestrator::{Orchestrator, SessionControl};
use pty::{Pty, TerminalSize};
use responder::{AutoResponder, ResponderSettings};
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use supervisor::{AgentCommand, AgentIo, ProcessSupervisor, SupervisorEvent};
use tokio::io::AsyncWriteExt;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Auto-pilot for interactive CLI agents
#[derive(Parser, Debug)]
#[command(name = "pilot-pty")]
#[command(about = "Answers an interactive agent's prompts while you are away")]
#[command(version)]
struct Args {
    /// Explicit agent binary (default: search PATH and common install dirs)
    #[arg(long)]
    binary: Option<PathBuf>,

    /// Agent binary name to search for
    #[arg(long, default_value = "claude")]
    binary_name: String,

    /// Working directory for the agent (default: current directory)
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// JSON config file (camelCase keys), watched for live changes
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Instructions given to the model when answering prompts
    #[arg(long, conflicts_with = "instructions_file")]
    instructions: Option<String>,

    /// Read the instructions from a file
    #[arg(long)]
    instructions_file: Option<PathBuf>,

    /// Model used for auto-responses
    #[arg(long, value_enum)]
    model: Option<Model>,

    /// Provider API key
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Milliseconds of silence before a streamed message is complete (500-5000)
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Milliseconds of silence before heuristic prompt patterns are checked
    #[arg(long)]
    quiet_period: Option<u64>,

    /// Extra regex treated as a prompt (repeatable)
    #[arg(long = "prompt-pattern")]
    prompt_patterns: Vec<String>,

    /// Start with auto-responses off (toggle with SIGUSR2)
    #[arg(long)]
    disabled: bool,

    /// Line terminator used when typing into the agent
    #[arg(long, value_enum)]
    line_terminator: Option<LineTerminator>,

    /// Line sent to the agent once it starts
    #[arg(long)]
    initial_prompt: Option<String>,

    /// Output auto-pilot events as JSON to stderr
    #[arg(long)]
    json_output: bool,

    /// Append every auto-response as a JSON line to this file
    #[arg(long)]
    response_log: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Terminal rows (for headless mode)
    #[arg(long)]
    rows: Option<u16>,

    /// Terminal columns (for headless mode)
    #[arg(long)]
    cols: Option<u16>,

    /// Arguments passed to the agent (after --)
    #[arg(last = true)]
    agent_args: Vec<String>,
}

impl Args {
    fn overrides(&self) -> Result<ConfigOverrides> {
        let instructions = match &self.instructions_file {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read instructions: {}", path.display()))?,
            ),
            None => self.instructions.clone(),
        };

        Ok(ConfigOverrides {
            enabled: self.disabled.then_some(false),
            instructions,
            idle_timeout_ms: self.idle_timeout,
            quiet_period_ms: self.quiet_period,
            model: self.model,
            api_key: self.api_key.clone(),
            prompt_patterns: self.prompt_patterns.clone(),
            binary_path: self.binary.clone(),
            binary_args: self.agent_args.clone(),
            line_terminator: self.line_terminator,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    log::init_tracing(&args.log_level);

    info!("pilot-pty v{}", env!("CARGO_PKG_VERSION"));

    let overrides = args.overrides()?;
    let config = overrides
        .resolve(args.config.as_deref())
        .context("Invalid configuration")?;
    debug!("Configuration: {:?}", config);
    if config.api_key.trim().is_empty() {
        warn!("No API key configured; prompts will be left for you to answer");
    }

    let cwd = match &args.cwd {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to read current directory")?,
    };

    let size = match (args.rows, args.cols) {
        (Some(rows), Some(cols)) => TerminalSize { rows, cols },
        _ => Pty::host_size().unwrap_or(TerminalSize::DEFAULT),
    };
    info!("Terminal size: {}x{}", size.cols, size.rows);

    let response_log: Arc<dyn ResponseLog> = match &args.response_log {
        Some(path) => Arc::new(JsonLinesResponseLog::open(path).with_context(|| {
            format!("Failed to open response log: {}", path.display())
        })?),
        None => Arc::new(TracingResponseLog),
    };

    let mut config_watcher = match &args.config {
        Some(path) => match ConfigWatcher::start(path, overrides.clone(), config.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Live config reload unavailable: {}", e);
                None
            }
        },
        None => None,
    };

    // Supervisor events: output, exit, spawn errors
    let (agent_tx, mut agent_rx) = mpsc::channel::<SupervisorEvent>(256);
    let supervisor = ProcessSupervisor::new(
        agent_command(&config, &args.binary_name),
        size,
        agent_tx,
    );
    let responder = Arc::new(AutoResponder::new(ResponderSettings::from(&config)));
    let (mut orchestrator, mut completions) =
        Orchestrator::new(supervisor, config, cwd, responder, response_log);

    let json_output = args.json_output;
    let mut events = orchestrator.subscribe().events;

    // Set raw mode for transparent terminal passthrough (if TTY available)
    let is_interactive = Pty::set_raw_mode().context("Failed to set raw mode")?;
    if is_interactive {
        info!("Running in interactive mode (TTY)");
    } else {
        info!("Running in headless mode (no TTY)");
    }

    match &args.initial_prompt {
        Some(line) => orchestrator.submit_line(line),
        None => {
            orchestrator.start_session();
        }
    }

    // Set up signal handlers
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigwinch = signal(SignalKind::window_change())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    // Create stdin reader (always - for both interactive and piped input)
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(32);
    std::thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut stdout = tokio::io::stdout();
    let mut exit_code = 0;

    loop {
        let idle_at = orchestrator.parser_deadline();
        let quiet_at = orchestrator.detector_deadline();

        select! {
            biased;

            _ = sigterm.recv() => {
                info!("SIGTERM received");
                break;
            }

            _ = sigint.recv() => {
                info!("SIGINT received");
                orchestrator.interrupt();
            }

            _ = sigwinch.recv() => {
                debug!("SIGWINCH received");
                if let Some(size) = Pty::host_size() {
                    orchestrator.resize(size);
                }
            }

            _ = sigusr1.recv() => {
                orchestrator.pause_next_prompt();
            }

            _ = sigusr2.recv() => {
                let mut config = orchestrator.config().clone();
                config.enabled = !config.enabled;
                orchestrator.apply_config(config);
            }

            // Handle stdin (user input)
            Some(data) = stdin_rx.recv() => {
                debug!("Received {} bytes from stdin", data.len());
                orchestrator.handle_input(&data);
            }

            Some(event) = agent_rx.recv() => {
                if let SupervisorEvent::Data(data) = &event {
                    stdout.write_all(data).await?;
                    stdout.flush().await?;

                    // Without a host terminal nobody answers cursor position queries (CSI 6n)
                    if !is_interactive && contains_cursor_query(data) {
                        debug!("Answering cursor position query");
                        if let Err(e) = orchestrator.agent_mut().write(b"\x1b[1;1R") {
                            warn!("Failed to send cursor position response: {}", e);
                        }
                    }
                }
                match &event {
                    SupervisorEvent::Exit { code, .. } | SupervisorEvent::Error { code, .. } => {
                        exit_code = *code;
                    }
                    SupervisorEvent::Data(_) => {}
                }
                if orchestrator.handle_supervisor_event(event) == SessionControl::Ended {
                    break;
                }
            }

            Some(completion) = completions.recv() => {
                orchestrator.handle_completion(completion);
            }

            Some(config) = next_config(&mut config_watcher) => {
                orchestrator
                    .agent_mut()
                    .set_command(agent_command(&config, &args.binary_name));
                orchestrator.apply_config(config);
            }

            _ = sleep_until_opt(idle_at) => {
                orchestrator.on_idle_timeout();
            }

            _ = sleep_until_opt(quiet_at) => {
                orchestrator.on_quiet_timeout();
            }

            result = events.recv(), if json_output => {
                match result {
                    Ok(event) => emit_json(&event)?,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Dropped {} events from JSON output", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                }
            }
        }
    }

    // Cleanup
    info!("Shutting down...");

    if json_output {
        while let Ok(event) = events.try_recv() {
            emit_json(&event)?;
        }
    }

    // Nothing reads agent events any more; stopping waits on the reader thread
    drop(agent_rx);
    tokio::task::block_in_place(|| orchestrator.shutdown());

    // Restore terminal
    Pty::restore_terminal();

    info!("Goodbye!");
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

fn agent_command(config: &Config, binary_name: &str) -> AgentCommand {
    AgentCommand {
        binary: config.binary_path.clone(),
        name: binary_name.to_string(),
        args: config.binary_args.clone(),
    }
}

fn emit_json(event: &protocol::CoreEvent) -> Result<()> {
    let json = serde_json::to_string(event)?;
    eprintln!("{}", json);
    Ok(())
}

/// ESC [ 6 n or ESC [ ? 6 n
fn contains_cursor_query(data: &[u8]) -> bool {
    data.windows(4).any(|w| w == b"\x1b[6n") || data.windows(5).any(|w| w == b"\x1b[?6n")
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_config(watcher: &mut Option<ConfigWatcher>) -> Option<Config> {
    match watcher {
        Some(watcher) => watcher.next_change().await,
        None => std::future::pending().await,
    }
}

//! Orchestrator: wires supervisor output through the parser and prompt
//! detector, dispatches auto-responses, and arbitrates between the
//! auto-pilot and a human typing at the same terminal.
//!
//! All state lives on one task. The only concurrent piece is the provider
//! call, which runs in a spawned task and reports back as a [`Completion`]
//! tagged with its dispatch sequence number; anything stale is discarded.

use crate::config::Config;
use crate::detector::{DetectorEvent, PromptDetector};
use crate::log::ResponseLog;
use crate::parser::{OutputParser, ParserEvent};
use crate::protocol::{
    AutoPilotState, AutoResponse, CoreEvent, Message, MessageContent, MessageStatus, PromptContext,
    Role, UiState, UiStatus,
};
use crate::pty::TerminalSize;
use crate::responder::{AutoResponder, ResponderSettings};
use crate::supervisor::{AgentIo, StartOutcome, SupervisorEvent};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Ctrl-C as typed in a raw-mode terminal
const ETX: u8 = 0x03;
/// Messages kept in the snapshot list
const MAX_MESSAGES: usize = 500;
const EVENT_CAPACITY: usize = 256;

const PAUSED_NOTICE: &str = "[Auto-Pilot paused for this prompt - type your response manually]";

/// A resolved responder call, tagged with the dispatch it belongs to
#[derive(Debug, Clone)]
pub struct Completion {
    pub seq: u64,
    pub response: AutoResponse,
}

/// Whether the event loop should keep going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    Continue,
    Ended,
}

/// Observer handles for a running session
pub struct SessionView {
    pub messages: watch::Receiver<Vec<Message>>,
    pub ui: watch::Receiver<UiState>,
    pub responses: watch::Receiver<u64>,
    pub events: broadcast::Receiver<CoreEvent>,
}

struct Observers {
    messages: watch::Sender<Vec<Message>>,
    ui: watch::Sender<UiState>,
    responses: watch::Sender<u64>,
    events: broadcast::Sender<CoreEvent>,
}

impl Observers {
    fn new() -> Self {
        Self {
            messages: watch::channel(Vec::new()).0,
            ui: watch::channel(UiState::idle()).0,
            responses: watch::channel(0).0,
            events: broadcast::channel(EVENT_CAPACITY).0,
        }
    }

    fn emit(&self, event: CoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

pub struct Orchestrator<A: AgentIo> {
    agent: A,
    config: Config,
    cwd: PathBuf,
    parser: OutputParser,
    detector: PromptDetector,
    responder: Arc<AutoResponder>,
    response_log: Arc<dyn ResponseLog>,

    is_responding: bool,
    manual_override: bool,
    pause_next: bool,
    /// Sequence number of the most recent dispatch
    dispatch_seq: u64,
    response_count: u64,
    /// System notice tracking the in-flight dispatch
    notice_id: Option<String>,

    messages: Vec<Message>,
    observers: Observers,
    completion_tx: mpsc::UnboundedSender<Completion>,
}

impl<A: AgentIo> Orchestrator<A> {
    /// Returns the orchestrator and the receiver its responder completions
    /// arrive on; feed those back through [`Orchestrator::handle_completion`].
    pub fn new(
        agent: A,
        config: Config,
        cwd: PathBuf,
        responder: Arc<AutoResponder>,
        response_log: Arc<dyn ResponseLog>,
    ) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let parser = OutputParser::new(Duration::from_millis(config.idle_timeout_ms));
        let detector = PromptDetector::new(
            config.enabled,
            Duration::from_millis(config.quiet_period_ms),
            &config.prompt_patterns,
        );

        let orchestrator = Self {
            agent,
            config,
            cwd,
            parser,
            detector,
            responder,
            response_log,
            is_responding: false,
            manual_override: false,
            pause_next: false,
            dispatch_seq: 0,
            response_count: 0,
            notice_id: None,
            messages: Vec::new(),
            observers: Observers::new(),
            completion_tx,
        };
        (orchestrator, completion_rx)
    }

    pub fn subscribe(&self) -> SessionView {
        SessionView {
            messages: self.observers.messages.subscribe(),
            ui: self.observers.ui.subscribe(),
            responses: self.observers.responses.subscribe(),
            events: self.observers.events.subscribe(),
        }
    }

    pub fn autopilot_state(&self) -> AutoPilotState {
        self.detector.state()
    }

    pub fn is_responding(&self) -> bool {
        self.is_responding
    }

    pub fn manual_override(&self) -> bool {
        self.manual_override
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn agent_mut(&mut self) -> &mut A {
        &mut self.agent
    }

    pub fn parser_deadline(&self) -> Option<Instant> {
        self.parser.idle_deadline()
    }

    pub fn detector_deadline(&self) -> Option<Instant> {
        self.detector.quiet_deadline()
    }

    /// Start the agent if it is not already running
    pub fn start_session(&mut self) -> bool {
        if self.agent.is_running() {
            return true;
        }
        self.set_ui(UiState::with_message(UiStatus::Starting, "Starting agent..."));
        self.push_message(Message::text(
            Role::System,
            "Starting auto-pilot session...",
            MessageStatus::Complete,
        ));
        match self.agent.start(&self.cwd) {
            Ok(StartOutcome::Started { session_id }) => {
                info!("Agent session {} running in {}", session_id, self.cwd.display());
                true
            }
            Ok(StartOutcome::AlreadyRunning) => true,
            Err(e) => {
                // Reported to the user through the supervisor's error event
                debug!("Start failed: {}", e);
                false
            }
        }
    }

    pub fn handle_supervisor_event(&mut self, event: SupervisorEvent) -> SessionControl {
        match event {
            SupervisorEvent::Data(data) => {
                self.handle_output(&data);
                SessionControl::Continue
            }
            SupervisorEvent::Exit { session_id, code } => {
                self.handle_exit(session_id, code);
                SessionControl::Ended
            }
            SupervisorEvent::Error { message, .. } => {
                error!("Agent failed to start: {}", message);
                self.push_message(Message::text(
                    Role::System,
                    format!("Failed to start agent: {}", message),
                    MessageStatus::Error,
                ));
                self.set_ui(UiState::with_message(
                    UiStatus::Error,
                    format!("Error: {}", message),
                ));
                SessionControl::Ended
            }
        }
    }

    /// Agent output, in arrival order
    pub fn handle_output(&mut self, data: &[u8]) {
        for event in self.parser.feed_chunk(data) {
            self.apply_parser_event(event);
        }
        let events = self.detector.feed(data, Instant::now());
        self.apply_detector_events(events);
    }

    /// Bytes typed by the human
    pub fn handle_input(&mut self, data: &[u8]) {
        if data.contains(&ETX) {
            self.write_through(data);
            self.reset_after_interrupt();
            return;
        }

        if self.is_responding {
            info!("Human input while auto-responding, taking manual control");
            self.responder.cancel_pending();
            self.is_responding = false;
            self.manual_override = true;
            self.finish_notice("Auto-Pilot cancelled - manual input", MessageStatus::Complete);
            self.set_ui(UiState::idle());
        }

        self.write_through(data);

        if (self.manual_override || !self.config.enabled) && contains_line_end(data) {
            if self.manual_override {
                info!("Manual override ended");
            }
            self.manual_override = false;
            let events = self.detector.reset();
            self.apply_detector_events(events);
        }
    }

    /// Host SIGINT: forward to the agent and drop all auto-pilot state
    pub fn interrupt(&mut self) {
        if let Err(e) = self.agent.interrupt() {
            debug!("Interrupt not delivered: {}", e);
        }
        self.reset_after_interrupt();
    }

    /// Record a user message and send it as a line, starting the agent first
    /// if needed
    pub fn submit_line(&mut self, text: &str) {
        if !self.agent.is_running() && !self.start_session() {
            return;
        }
        let message = self.parser.add_user_message(text);
        self.push_message(message);
        if let Err(e) = self.agent.send_line(text, self.config.line_terminator) {
            warn!("Failed to submit line: {}", e);
            return;
        }
        self.set_ui(UiState::with_message(
            UiStatus::Responding,
            "Agent is responding...",
        ));
    }

    /// Let the human answer the next detected prompt
    pub fn pause_next_prompt(&mut self) {
        info!("Auto-Pilot will pause at the next prompt");
        self.pause_next = true;
    }

    pub fn resize(&mut self, size: TerminalSize) {
        if let Err(e) = self.agent.resize(size) {
            warn!("Failed to resize PTY: {}", e);
        }
    }

    /// Apply a live configuration update
    pub fn apply_config(&mut self, config: Config) {
        info!(
            "Applying configuration (enabled: {}, model: {:?})",
            config.enabled, config.model
        );
        self.detector.set_enabled(config.enabled);
        if config.prompt_patterns != self.config.prompt_patterns {
            self.detector.set_custom_patterns(&config.prompt_patterns);
        }
        self.detector
            .set_quiet_period(Duration::from_millis(config.quiet_period_ms));
        self.parser
            .set_idle_timeout(Duration::from_millis(config.idle_timeout_ms));
        self.responder
            .update_settings(ResponderSettings::from(&config));
        self.config = config;
    }

    pub fn on_idle_timeout(&mut self) {
        if let Some(event) = self.parser.on_idle_timeout() {
            self.apply_parser_event(event);
        }
    }

    pub fn on_quiet_timeout(&mut self) {
        let events = self.detector.on_quiet_timeout(Instant::now());
        self.apply_detector_events(events);
    }

    /// Apply a responder result if it still belongs to the live dispatch
    pub fn handle_completion(&mut self, completion: Completion) {
        let Completion { seq, response } = completion;
        self.response_log.record(&response);
        self.observers.emit(CoreEvent::AutoResponse {
            response: response.clone(),
        });

        if seq != self.dispatch_seq || !self.is_responding {
            debug!(
                "Discarding stale auto-response (seq {}, current {})",
                seq, self.dispatch_seq
            );
            return;
        }
        self.is_responding = false;

        let error = match response.error.as_ref() {
            Some(error) => error.to_string(),
            None if response.response.is_empty() => "empty response".to_string(),
            None => match self
                .agent
                .send_line(&response.response, self.config.line_terminator)
            {
                Ok(()) => {
                    self.on_response_sent(&response.response);
                    return;
                }
                Err(e) => e.to_string(),
            },
        };
        self.on_response_failed(&error);
    }

    /// Stop the agent
    pub fn shutdown(&mut self) {
        self.responder.cancel_pending();
        self.agent.stop();
    }

    fn on_response_sent(&mut self, text: &str) {
        self.response_count += 1;
        self.observers.responses.send_replace(self.response_count);
        info!("Auto-Pilot typed {:?} (response #{})", text, self.response_count);

        self.finish_notice_with(
            |notice| format!("{} -> \"{}\"", notice, text),
            MessageStatus::Complete,
        );
        let events = self.detector.reset();
        self.apply_detector_events(events);

        let message = self.parser.add_user_message(&format!("[Auto-Pilot] {}", text));
        self.push_message(message);
        self.set_ui(UiState::with_message(
            UiStatus::Responding,
            "Agent is responding...",
        ));
    }

    fn on_response_failed(&mut self, error: &str) {
        warn!("Auto-Pilot failed: {}", error);
        self.finish_notice(&format!("Auto-Pilot error: {}", error), MessageStatus::Error);
        let events = self.detector.reset();
        self.apply_detector_events(events);
        self.manual_override = true;
        self.set_ui(UiState::with_message(
            UiStatus::Error,
            format!("Error: {}", error),
        ));
    }

    fn handle_prompt(&mut self, context: PromptContext) {
        if !self.config.enabled {
            debug!("Auto-Pilot disabled, leaving prompt to the human");
            return;
        }
        if self.manual_override || self.is_responding {
            debug!("Prompt ignored (manual override or response in flight)");
            return;
        }

        if self.pause_next {
            self.pause_next = false;
            self.manual_override = true;
            let events = self.detector.reset();
            self.apply_detector_events(events);
            info!("Auto-Pilot paused for prompt {:?}", context.prompt_text);
            self.push_message(Message::text(
                Role::System,
                PAUSED_NOTICE,
                MessageStatus::Complete,
            ));
            return;
        }

        self.is_responding = true;
        self.dispatch_seq += 1;
        let seq = self.dispatch_seq;
        let events = self.detector.mark_responding();
        self.apply_detector_events(events);

        let notice = Message::text(
            Role::System,
            format!("Auto-Pilot responding to: \"{}\"", context.prompt_text),
            MessageStatus::Streaming,
        );
        self.notice_id = Some(notice.id.clone());
        self.push_message(notice);
        self.set_ui(UiState::with_message(
            UiStatus::Responding,
            "Auto-Pilot responding...",
        ));

        // Claimed before spawning so input arriving first can still cancel it
        let ticket = self.responder.begin();
        let responder = Arc::clone(&self.responder);
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let response = responder.respond_with(ticket, context).await;
            let _ = tx.send(Completion { seq, response });
        });
    }

    fn handle_exit(&mut self, session_id: u64, code: i32) {
        info!("Agent exited with code {}", code);
        // Flush what was already streamed before dropping parser state
        if let Some(event) = self.parser.on_idle_timeout() {
            self.apply_parser_event(event);
        }
        self.parser.reset();
        self.responder.cancel_pending();
        self.is_responding = false;
        self.manual_override = false;
        self.pause_next = false;
        self.finish_notice("Auto-Pilot cancelled - agent exited", MessageStatus::Error);
        let events = self.detector.reset();
        self.apply_detector_events(events);
        self.agent.session_exited(session_id);

        self.push_message(Message::text(
            Role::System,
            format!("Agent exited (code: {})", code),
            MessageStatus::Complete,
        ));
        self.set_ui(UiState::with_message(UiStatus::Idle, "Session ended"));
        self.observers.emit(CoreEvent::SessionExited { code });
    }

    fn reset_after_interrupt(&mut self) {
        info!("Interrupt: resetting auto-pilot");
        self.responder.cancel_pending();
        self.is_responding = false;
        self.manual_override = false;
        self.finish_notice("Auto-Pilot cancelled - interrupted", MessageStatus::Complete);
        let events = self.detector.reset();
        self.apply_detector_events(events);
        self.set_ui(UiState::idle());
    }

    fn write_through(&mut self, data: &[u8]) {
        if let Err(e) = self.agent.write(data) {
            debug!("Dropping input: {}", e);
        }
    }

    fn apply_parser_event(&mut self, event: ParserEvent) {
        match event {
            ParserEvent::NewMessage(message) => {
                if message.status == MessageStatus::Complete {
                    self.observers.emit(CoreEvent::MessageCompleted {
                        message: message.clone(),
                    });
                }
                self.push_message(message);
            }
            ParserEvent::MessageUpdated(message) => self.push_message(message),
        }
    }

    fn apply_detector_events(&mut self, events: Vec<DetectorEvent>) {
        for event in events {
            match event {
                DetectorEvent::StateChanged(state) => {
                    self.observers.emit(CoreEvent::StateChanged { state });
                    self.update_ui_for(state);
                }
                DetectorEvent::PromptDetected(context) => {
                    self.observers.emit(CoreEvent::PromptDetected {
                        context: context.clone(),
                    });
                    self.handle_prompt(context);
                }
            }
        }
    }

    fn update_ui_for(&mut self, state: AutoPilotState) {
        let ui = match state {
            AutoPilotState::Responding => {
                UiState::with_message(UiStatus::Responding, "Auto-Pilot responding...")
            }
            AutoPilotState::PromptDetected => {
                UiState::with_message(UiStatus::Responding, "Prompt detected...")
            }
            AutoPilotState::Outputting => {
                UiState::with_message(UiStatus::Responding, "Agent is responding...")
            }
            AutoPilotState::Idle | AutoPilotState::IdleDetected => {
                if self.is_responding {
                    return;
                }
                UiState::idle()
            }
        };
        self.set_ui(ui);
    }

    fn set_ui(&mut self, ui: UiState) {
        if *self.observers.ui.borrow() == ui {
            return;
        }
        self.observers.ui.send_replace(ui.clone());
        self.observers.emit(CoreEvent::UiStateChanged { ui });
    }

    /// Insert or replace by id, then publish the snapshot
    fn push_message(&mut self, message: Message) {
        match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message,
            None => {
                self.messages.push(message);
                if self.messages.len() > MAX_MESSAGES {
                    let excess = self.messages.len() - MAX_MESSAGES;
                    self.messages.drain(..excess);
                }
            }
        }
        self.observers.messages.send_replace(self.messages.clone());
    }

    fn finish_notice(&mut self, text: &str, status: MessageStatus) {
        self.finish_notice_with(|_| text.to_string(), status);
    }

    fn finish_notice_with(&mut self, render: impl FnOnce(&str) -> String, status: MessageStatus) {
        let Some(id) = self.notice_id.take() else {
            return;
        };
        let Some(existing) = self.messages.iter().find(|m| m.id == id).cloned() else {
            return;
        };
        let original = existing
            .content
            .iter()
            .find_map(|block| match block {
                MessageContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .unwrap_or_default()
            .to_string();
        let mut updated = existing;
        updated.content = vec![MessageContent::Text {
            text: render(&original),
        }];
        updated.status = status;
        self.push_message(updated);
    }
}

fn contains_line_end(data: &[u8]) -> bool {
    data.iter().any(|b| *b == b'\r' || *b == b'\n')
}

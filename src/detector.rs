//! Prompt detector.
//!
//! Watches the same output stream as the parser and decides when the agent
//! is blocked waiting for input. Strong patterns (approval questions, y/n
//! brackets, permission requests) fire as soon as they appear; heuristic
//! patterns (a trailing `?` or `>`) only fire once the output has been quiet
//! for the quiet period.

use crate::parser::StreamDecoder;
use crate::patterns::PatternTable;
use crate::protocol::{current_timestamp_ms, AutoPilotState, PromptContext};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Bytes of cleaned output kept for matching
const WINDOW_MAX: usize = 4000;
/// Bytes of output handed to the responder as context
const CONTEXT_MAX: usize = 2000;
/// Non-empty trailing lines scanned for a prompt
const SCAN_LINES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptCategory {
    /// "Do you want to proceed?"
    Approval,
    /// "(y/n)", "[Y/n]", "(yes/no)"
    YesNo,
    /// "Press Enter to continue", "Type your response"
    Continue,
    /// "Allow Read(file.txt)?", "Approve ...", "Deny ..."
    Permission,
    /// Numbered choice menu starting with "1. Yes"
    Choice,
    /// Line ending in `?`
    Question,
    /// Line ending in `>`
    InputMarker,
    /// User-configured pattern
    Custom,
}

impl PromptCategory {
    /// Heuristic categories only fire after the quiet period.
    pub fn is_heuristic(self) -> bool {
        matches!(self, PromptCategory::Question | PromptCategory::InputMarker)
    }
}

const BUILTIN_PATTERNS: &[(&str, PromptCategory)] = &[
    (
        r"(?i)do you want to (?:proceed|continue|make this edit|create|run|allow|overwrite)",
        PromptCategory::Approval,
    ),
    (
        r"(?i)\((?:y/n|yes/no)\)|\[(?:y/n|yes/no)\]",
        PromptCategory::YesNo,
    ),
    (r"(?i)press enter to continue", PromptCategory::Continue),
    (r"(?i)type your response", PromptCategory::Continue),
    (
        r"(?i)^\W*(?:allow|approve|deny)\s+\S",
        PromptCategory::Permission,
    ),
    (r"(?i)^\W*1\.\s+yes\b", PromptCategory::Choice),
    (r"\?\s*$", PromptCategory::Question),
    (r">\s*$", PromptCategory::InputMarker),
];

#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    StateChanged(AutoPilotState),
    PromptDetected(PromptContext),
}

pub struct PromptDetector {
    enabled: bool,
    state: AutoPilotState,
    patterns: PatternTable<PromptCategory>,
    decoder: StreamDecoder,
    /// Trailing cleaned output since the last reset
    window: String,
    quiet_period: Duration,
    quiet_deadline: Option<Instant>,
}

impl PromptDetector {
    pub fn new(enabled: bool, quiet_period: Duration, custom_patterns: &[String]) -> Self {
        Self {
            enabled,
            state: AutoPilotState::Idle,
            patterns: build_patterns(custom_patterns),
            decoder: StreamDecoder::new(),
            window: String::new(),
            quiet_period,
            quiet_deadline: None,
        }
    }

    pub fn state(&self) -> AutoPilotState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// When heuristic patterns will be evaluated if output stays quiet
    pub fn quiet_deadline(&self) -> Option<Instant> {
        self.quiet_deadline
    }

    /// Disabling keeps the state machine tracking output but never fires.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            info!("Prompt detection {}", if enabled { "enabled" } else { "disabled" });
        }
        self.enabled = enabled;
    }

    pub fn set_quiet_period(&mut self, quiet_period: Duration) {
        self.quiet_period = quiet_period;
    }

    pub fn set_custom_patterns(&mut self, custom_patterns: &[String]) {
        self.patterns = build_patterns(custom_patterns);
    }

    /// Record a chunk of output
    pub fn feed(&mut self, raw: &[u8], now: Instant) -> Vec<DetectorEvent> {
        let mut events = Vec::new();
        let text = self.decoder.decode(raw);
        if text.is_empty() {
            return events;
        }
        push_bounded(&mut self.window, &text, WINDOW_MAX);

        match self.state {
            // Recorded, but a prompt already in flight never re-fires
            AutoPilotState::PromptDetected | AutoPilotState::Responding => return events,
            AutoPilotState::Idle | AutoPilotState::IdleDetected => {
                if text.trim().is_empty() {
                    return events;
                }
                self.transition(AutoPilotState::Outputting, &mut events);
            }
            AutoPilotState::Outputting => {}
        }

        self.quiet_deadline = Some(now + self.quiet_period);
        if self.enabled {
            if let Some(context) = self.scan(false) {
                self.fire(context, &mut events);
            }
        }
        events
    }

    /// Evaluate the window after the quiet period passed with no output
    pub fn on_quiet_timeout(&mut self, _now: Instant) -> Vec<DetectorEvent> {
        let mut events = Vec::new();
        self.quiet_deadline = None;
        if self.state != AutoPilotState::Outputting {
            return events;
        }
        if self.enabled {
            if let Some(context) = self.scan(true) {
                self.fire(context, &mut events);
                return events;
            }
        }
        self.transition(AutoPilotState::IdleDetected, &mut events);
        events
    }

    /// A response is being produced for the detected prompt
    pub fn mark_responding(&mut self) -> Vec<DetectorEvent> {
        let mut events = Vec::new();
        self.transition(AutoPilotState::Responding, &mut events);
        events
    }

    /// Back to idle with an empty window
    pub fn reset(&mut self) -> Vec<DetectorEvent> {
        let mut events = Vec::new();
        self.window.clear();
        self.decoder.reset();
        self.quiet_deadline = None;
        self.transition(AutoPilotState::Idle, &mut events);
        events
    }

    fn fire(&mut self, context: PromptContext, events: &mut Vec<DetectorEvent>) {
        info!("Prompt detected: {:?}", context.prompt_text);
        self.quiet_deadline = None;
        self.transition(AutoPilotState::PromptDetected, events);
        events.push(DetectorEvent::PromptDetected(context));
    }

    fn transition(&mut self, next: AutoPilotState, events: &mut Vec<DetectorEvent>) {
        if self.state == next {
            return;
        }
        debug!("Auto-pilot state {:?} -> {:?}", self.state, next);
        self.state = next;
        events.push(DetectorEvent::StateChanged(next));
    }

    /// First matching line among the last few, oldest first. Heuristics are
    /// only tried on the final line.
    fn scan(&self, include_heuristics: bool) -> Option<PromptContext> {
        let lines: Vec<&str> = self
            .window
            .lines()
            .filter(|line| !line.trim().is_empty())
            .collect();
        let tail = &lines[lines.len().saturating_sub(SCAN_LINES)..];

        for (idx, line) in tail.iter().enumerate() {
            let is_last = idx + 1 == tail.len();
            for entry in self.patterns.iter() {
                if entry.category.is_heuristic() && !(include_heuristics && is_last) {
                    continue;
                }
                if entry.regex.is_match(line) {
                    return Some(PromptContext {
                        recent_output: tail_on_char_boundary(&self.window, CONTEXT_MAX)
                            .to_string(),
                        prompt_text: line.trim().to_string(),
                        matched_pattern: entry.regex.as_str().to_string(),
                        detected_at: current_timestamp_ms(),
                    });
                }
            }
        }
        None
    }
}

fn build_patterns(custom_patterns: &[String]) -> PatternTable<PromptCategory> {
    let mut table = PatternTable::from_static(BUILTIN_PATTERNS);
    for pattern in custom_patterns {
        if let Err(e) = table.push(pattern, PromptCategory::Custom) {
            warn!("Ignoring invalid prompt pattern {:?}: {}", pattern, e);
        }
    }
    table
}

/// Append and drop from the front so at most `max` bytes remain
fn push_bounded(buffer: &mut String, text: &str, max: usize) {
    buffer.push_str(text);
    if buffer.len() > max {
        let start = buffer.len() - tail_on_char_boundary(buffer, max).len();
        buffer.drain(..start);
    }
}

/// The last `max` bytes of `text`, moved forward to a char boundary
pub fn tail_on_char_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

//! Data model shared by the parser, detector, responder and orchestrator.
//!
//! Every type here is serde-serializable so it can be pushed to observers
//! as JSON lines (`--json-output`) or written to the response log.

use crate::error::ResponderError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static MESSAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Who produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Lifecycle of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Output is still arriving and the message may change
    Streaming,
    /// Frozen after the idle timeout or when synthesized
    Complete,
    /// Frozen with an error
    Error,
}

/// One typed block inside a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MessageContent {
    /// Plain prose
    Text { text: String },
    /// Content of a `<thinking>` block
    Thinking { text: String },
    /// A tool invocation line plus its indented continuation lines
    ToolCall { name: String, description: String },
    /// A result line attributed to the preceding tool call
    ToolResult {
        name: String,
        output: String,
        success: bool,
    },
    /// A fenced code block
    Code { language: String, code: String },
}

/// A structured unit of conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// `msg_<unix-ms>_<counter>`
    pub id: String,
    pub role: Role,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    pub content: Vec<MessageContent>,
    pub status: MessageStatus,
}

impl Message {
    pub fn new(role: Role, content: Vec<MessageContent>, status: MessageStatus) -> Self {
        let timestamp = current_timestamp_ms();
        let counter = MESSAGE_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
        Self {
            id: format!("msg_{}_{}", timestamp, counter),
            role,
            timestamp,
            content,
            status,
        }
    }

    /// A single-block text message.
    pub fn text(role: Role, text: impl Into<String>, status: MessageStatus) -> Self {
        Self::new(role, vec![MessageContent::Text { text: text.into() }], status)
    }
}

/// Snapshot of the output around a detected prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptContext {
    /// Trailing window of cleaned output
    pub recent_output: String,
    /// The line that matched
    pub prompt_text: String,
    /// Source of the pattern that matched
    pub matched_pattern: String,
    /// Unix timestamp in milliseconds
    pub detected_at: u64,
}

/// Outcome of one auto-responder call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoResponse {
    pub prompt: PromptContext,
    /// Text to type, empty on failure
    pub response: String,
    pub latency_ms: u64,
    /// Unix timestamp in milliseconds
    pub responded_at: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponderError>,
}

impl AutoResponse {
    pub fn succeeded(prompt: PromptContext, response: String, latency_ms: u64) -> Self {
        Self {
            prompt,
            response,
            latency_ms,
            responded_at: current_timestamp_ms(),
            success: true,
            error: None,
        }
    }

    pub fn failed(prompt: PromptContext, error: ResponderError, latency_ms: u64) -> Self {
        Self {
            prompt,
            response: String::new(),
            latency_ms,
            responded_at: current_timestamp_ms(),
            success: false,
            error: Some(error),
        }
    }
}

/// Prompt detector state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoPilotState {
    Idle,
    Outputting,
    IdleDetected,
    PromptDetected,
    Responding,
}

/// Coarse status shown to a UI collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiStatus {
    Idle,
    Starting,
    Responding,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    pub status: UiStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

impl UiState {
    pub fn idle() -> Self {
        Self {
            status: UiStatus::Idle,
            status_message: None,
        }
    }

    pub fn with_message(status: UiStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            status_message: Some(message.into()),
        }
    }
}

impl Default for UiState {
    fn default() -> Self {
        Self::idle()
    }
}

/// Events pushed to observers of a running session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    /// Prompt detector transitioned
    StateChanged { state: AutoPilotState },
    /// A prompt was recognized in the output
    PromptDetected { context: PromptContext },
    /// A message reached a final status
    MessageCompleted { message: Message },
    /// The responder resolved (including stale or cancelled calls)
    AutoResponse { response: AutoResponse },
    /// UI status changed
    UiStateChanged { ui: UiState },
    /// The agent subprocess exited
    SessionExited { code: i32 },
}

/// Get current timestamp in milliseconds
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

//! Output stream parser.
//!
//! Turns the raw, ANSI-laden byte stream of the agent into structured
//! messages made of typed content blocks:
//! - `<thinking>` blocks
//! - fenced code blocks
//! - tool invocations and their results
//! - everything else as prose
//!
//! The whole buffer is re-parsed on every chunk, so a block split across
//! chunks is classified correctly once its closing delimiter arrives.

use crate::patterns::PatternTable;
use crate::protocol::{Message, MessageContent, MessageStatus, Role};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Regex patterns (compiled once)
static ANSI_PATTERN: OnceLock<Regex> = OnceLock::new();
static THINKING_PATTERN: OnceLock<Regex> = OnceLock::new();
static CODE_PATTERN: OnceLock<Regex> = OnceLock::new();
static TOOL_NAME_FALLBACK: OnceLock<Regex> = OnceLock::new();
static TOOL_CALL_PATTERNS: OnceLock<PatternTable<ToolCallRule>> = OnceLock::new();
static RESULT_PATTERNS: OnceLock<PatternTable<ResultOutcome>> = OnceLock::new();

/// Longest escape sequence held back while waiting for its terminator
const MAX_PENDING_ESCAPE: usize = 256;

/// Tool names recognized anywhere in an invocation line. Longer names that
/// contain shorter ones come first.
const KNOWN_TOOLS: &[&str] = &[
    "TodoWrite",
    "WebFetch",
    "WebSearch",
    "Read",
    "Write",
    "Edit",
    "Bash",
    "Glob",
    "Grep",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolCallRule {
    /// "Running tool `name`", "Using name"
    Invocation,
    /// "Tool: name"
    Labeled,
    /// "Read(", "Bash:"
    KnownTool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultOutcome {
    Success,
    Failure,
}

fn ansi_pattern() -> &'static Regex {
    ANSI_PATTERN.get_or_init(|| {
        // CSI (including private parameters), OSC ended by BEL or ST,
        // charset designation, and two-byte escapes
        Regex::new(
            r"\x1B\[[0-?]*[ -/]*[@-~]|\x1B\][^\x07\x1B]*(?:\x07|\x1B\\)|\x1B[()][A-Za-z0-9]|\x1B[@-Z\\-_=>78]",
        )
        .unwrap()
    })
}

fn thinking_pattern() -> &'static Regex {
    THINKING_PATTERN.get_or_init(|| Regex::new(r"(?s)<thinking>(.*?)(?:</thinking>|\z)").unwrap())
}

fn code_pattern() -> &'static Regex {
    CODE_PATTERN.get_or_init(|| Regex::new(r"(?s)```(\w*)\n(.*?)(?:```|\z)").unwrap())
}

fn tool_name_fallback() -> &'static Regex {
    TOOL_NAME_FALLBACK.get_or_init(|| Regex::new(r"(?i)(?:tool|using|running)\s+(\w+)").unwrap())
}

fn tool_call_patterns() -> &'static PatternTable<ToolCallRule> {
    TOOL_CALL_PATTERNS.get_or_init(|| {
        PatternTable::from_static(&[
            (
                r#"(?i)(?:Running|Executing|Using)\s+(?:tool\s+)?[`"]?(\w+)[`"]?"#,
                ToolCallRule::Invocation,
            ),
            (r"(?i)Tool:\s*(\w+)", ToolCallRule::Labeled),
            (
                r"(?i)(?:Read|Write|Edit|Bash|Glob|Grep)\s*(?:\(|:)",
                ToolCallRule::KnownTool,
            ),
        ])
    })
}

fn result_patterns() -> &'static PatternTable<ResultOutcome> {
    RESULT_PATTERNS.get_or_init(|| {
        PatternTable::from_static(&[
            (
                r"(?i)(?:Success|Done|Completed|Created|Updated|Modified)",
                ResultOutcome::Success,
            ),
            (
                r"(?i)(?:Error|Failed|Exception|Cannot|Unable)",
                ResultOutcome::Failure,
            ),
        ])
    })
}

/// Strip ANSI escape sequences from text
pub fn strip_ansi(text: &str) -> String {
    ansi_pattern().replace_all(text, "").to_string()
}

/// Strip escape sequences and drop control characters other than newline
/// and tab (carriage returns included).
pub fn clean_output(text: &str) -> String {
    strip_ansi(text)
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Incremental decoder for PTY output.
///
/// Holds back a trailing partial UTF-8 sequence or an unterminated escape
/// sequence until the next chunk completes it.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a chunk into cleaned text.
    pub fn decode(&mut self, raw: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(raw);

        let valid_up_to = match std::str::from_utf8(&bytes) {
            Ok(_) => bytes.len(),
            // Truncated multi-byte sequence at the end
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => bytes.len(),
        };
        let mut text = String::from_utf8_lossy(&bytes[..valid_up_to]).into_owned();
        let mut held = bytes[valid_up_to..].to_vec();

        if let Some(esc) = text.rfind('\x1b') {
            let tail = &text[esc..];
            if tail.len() < MAX_PENDING_ESCAPE && is_incomplete_escape(tail) {
                let mut carry = tail.as_bytes().to_vec();
                carry.append(&mut held);
                held = carry;
                text.truncate(esc);
            }
        }

        self.pending = held;
        clean_output(&text)
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

fn is_incomplete_escape(tail: &str) -> bool {
    let rest = &tail[1..];
    match rest.chars().next() {
        None => true,
        Some('[') => !rest[1..].chars().any(|c| ('@'..='~').contains(&c)),
        Some(']') => !rest.contains('\x07'),
        Some('(') | Some(')') => rest.len() < 2,
        Some(_) => false,
    }
}

/// Parser lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    Idle,
    StreamingAssistant,
    Complete,
}

/// What a chunk or timeout did to the message list
#[derive(Debug, Clone, PartialEq)]
pub enum ParserEvent {
    /// A message started (streaming) or was completed
    NewMessage(Message),
    /// The streaming message was re-parsed
    MessageUpdated(Message),
}

/// Output parser state
pub struct OutputParser {
    state: ParserState,
    decoder: StreamDecoder,
    /// Cleaned text of the streaming message
    buffer: String,
    current: Option<Message>,
    idle_timeout: Duration,
    idle_deadline: Option<Instant>,
}

impl OutputParser {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            state: ParserState::Idle,
            decoder: StreamDecoder::new(),
            buffer: String::new(),
            current: None,
            idle_timeout,
            idle_deadline: None,
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// When the streaming message completes if no more output arrives
    pub fn idle_deadline(&self) -> Option<Instant> {
        self.idle_deadline
    }

    pub fn set_idle_timeout(&mut self, idle_timeout: Duration) {
        self.idle_timeout = idle_timeout;
    }

    /// Process a chunk of raw output
    pub fn feed_chunk(&mut self, raw: &[u8]) -> Vec<ParserEvent> {
        let text = self.decoder.decode(raw);
        if text.is_empty() {
            return Vec::new();
        }
        // Whitespace never starts a message, but belongs to a streaming one
        if self.current.is_none() && text.trim().is_empty() {
            trace!("Ignoring whitespace-only chunk while idle");
            return Vec::new();
        }

        self.buffer.push_str(&text);
        self.idle_deadline = Some(Instant::now() + self.idle_timeout);

        let mut events = Vec::with_capacity(2);
        let mut message = match self.current.take() {
            Some(message) => message,
            None => {
                self.state = ParserState::StreamingAssistant;
                let message = Message::new(Role::Assistant, Vec::new(), MessageStatus::Streaming);
                debug!("Assistant message {} started", message.id);
                events.push(ParserEvent::NewMessage(message.clone()));
                message
            }
        };
        message.content = parse_blocks(&self.buffer);
        events.push(ParserEvent::MessageUpdated(message.clone()));
        self.current = Some(message);
        events
    }

    /// Complete the streaming message after the idle deadline passed
    pub fn on_idle_timeout(&mut self) -> Option<ParserEvent> {
        self.idle_deadline = None;
        if self.state != ParserState::StreamingAssistant {
            return None;
        }
        let mut message = self.current.take()?;
        message.status = MessageStatus::Complete;
        self.state = ParserState::Complete;
        self.buffer.clear();
        debug!(
            "Assistant message {} complete ({} blocks)",
            message.id,
            message.content.len()
        );
        Some(ParserEvent::NewMessage(message))
    }

    /// Synthesize a complete user message
    pub fn add_user_message(&mut self, text: &str) -> Message {
        Message::text(Role::User, text, MessageStatus::Complete)
    }

    /// Drop all buffered state without emitting anything
    pub fn reset(&mut self) {
        self.state = ParserState::Idle;
        self.decoder.reset();
        self.buffer.clear();
        self.current = None;
        self.idle_deadline = None;
    }
}

/// Classify a cleaned buffer into content blocks.
///
/// Order: prose first, then thinking, then code, then line-scanned tool
/// calls and results.
fn parse_blocks(buffer: &str) -> Vec<MessageContent> {
    let mut content = Vec::new();

    // Thinking blocks, removed from the text
    let mut without_thinking = String::with_capacity(buffer.len());
    let mut last = 0;
    for caps in thinking_pattern().captures_iter(buffer) {
        let Some(whole) = caps.get(0) else { continue };
        let text = caps.get(1).map_or("", |m| m.as_str()).trim();
        if !text.is_empty() {
            content.push(MessageContent::Thinking {
                text: text.to_string(),
            });
        }
        without_thinking.push_str(&buffer[last..whole.start()]);
        last = whole.end();
    }
    without_thinking.push_str(&buffer[last..]);

    // Code blocks, replaced by a newline
    let mut remaining = String::with_capacity(without_thinking.len());
    let mut last = 0;
    for caps in code_pattern().captures_iter(&without_thinking) {
        let Some(whole) = caps.get(0) else { continue };
        let language = caps
            .get(1)
            .map(|m| m.as_str())
            .filter(|lang| !lang.is_empty())
            .unwrap_or("text");
        let code = caps.get(2).map_or("", |m| m.as_str()).trim_end();
        // A bare opening fence carries nothing yet
        if !code.is_empty() {
            content.push(MessageContent::Code {
                language: language.to_string(),
                code: code.to_string(),
            });
        }
        remaining.push_str(&without_thinking[last..whole.start()]);
        remaining.push('\n');
        last = whole.end();
    }
    remaining.push_str(&without_thinking[last..]);

    // Tool calls and results, line by line
    let lines: Vec<&str> = remaining.split('\n').collect();
    let mut prose: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];

        if let Some(name) = match_tool_call(line) {
            let mut description = line.to_string();
            let mut j = i + 1;
            while j < lines.len() && (lines[j].starts_with("  ") || lines[j].starts_with('\t')) {
                description.push('\n');
                description.push_str(lines[j]);
                j += 1;
            }
            content.push(MessageContent::ToolCall {
                name,
                description: description.trim().to_string(),
            });
            i = j;
            continue;
        }

        if let Some(entry) = result_patterns().first_match(line) {
            if let Some(name) = preceding_tool_call(&content) {
                content.push(MessageContent::ToolResult {
                    name,
                    output: line.trim().to_string(),
                    success: entry.category == ResultOutcome::Success,
                });
                i += 1;
                continue;
            }
        }

        prose.push(line);
        i += 1;
    }

    let text = prose.join("\n");
    let text = text.trim();
    if !text.is_empty() {
        content.insert(
            0,
            MessageContent::Text {
                text: text.to_string(),
            },
        );
    }

    // Never lose output: fall back to the raw text
    if content.is_empty() {
        let raw = buffer.trim();
        if !raw.is_empty() {
            content.push(MessageContent::Text {
                text: raw.to_string(),
            });
        }
    }

    content
}

fn match_tool_call(line: &str) -> Option<String> {
    let entry = tool_call_patterns().first_match(line)?;
    let named = entry
        .regex
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());
    Some(named.unwrap_or_else(|| extract_tool_name(line)))
}

fn extract_tool_name(line: &str) -> String {
    if let Some(tool) = KNOWN_TOOLS.iter().find(|tool| line.contains(*tool)) {
        return tool.to_string();
    }
    tool_name_fallback()
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map_or_else(|| "unknown".to_string(), |m| m.as_str().to_string())
}

/// Name of the nearest tool call, unless prose came after it
fn preceding_tool_call(content: &[MessageContent]) -> Option<String> {
    for block in content.iter().rev() {
        match block {
            MessageContent::ToolCall { name, .. } => return Some(name.clone()),
            MessageContent::Text { .. } => return None,
            _ => continue,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> OutputParser {
        OutputParser::new(Duration::from_millis(1500))
    }

    fn current(events: &[ParserEvent]) -> &Message {
        match events.last() {
            Some(ParserEvent::MessageUpdated(m)) => m,
            other => panic!("expected MessageUpdated, got {:?}", other),
        }
    }

    #[test]
    fn test_strip_ansi() {
        let input = "\x1b[32mgreen\x1b[0m \x1b[?25lhidden\x1b[?25h \x1b]0;title\x07done\x1b(B";
        assert_eq!(strip_ansi(input), "green hidden done");
    }

    #[test]
    fn test_clean_output_drops_carriage_returns() {
        assert_eq!(clean_output("line one\r\nline two\r"), "line one\nline two");
    }

    #[test]
    fn test_decoder_holds_split_escape() {
        let mut decoder = StreamDecoder::new();
        assert_eq!(decoder.decode(b"hello \x1b[3"), "hello ");
        assert_eq!(decoder.decode(b"1mred"), "red");
    }

    #[test]
    fn test_decoder_holds_split_utf8() {
        let mut decoder = StreamDecoder::new();
        let bytes = "caf\u{e9}".as_bytes();
        assert_eq!(decoder.decode(&bytes[..4]), "caf");
        assert_eq!(decoder.decode(&bytes[4..]), "\u{e9}");
    }

    #[test]
    fn test_thinking_split_across_chunks() {
        let mut parser = parser();
        parser.feed_chunk(b"<thinking>part-a");
        let events = parser.feed_chunk(b"part-b</thinking>");
        let message = current(&events);
        assert_eq!(
            message.content,
            vec![MessageContent::Thinking {
                text: "part-apart-b".to_string()
            }]
        );
    }

    #[test]
    fn test_text_precedes_thinking_and_code() {
        let mut parser = parser();
        let events = parser
            .feed_chunk(b"<thinking>plan</thinking>Here you go:\n```rust\nfn main() {}\n```\nBye");
        let message = current(&events);
        assert_eq!(
            message.content,
            vec![
                MessageContent::Text {
                    text: "Here you go:\n\n\nBye".to_string()
                },
                MessageContent::Thinking {
                    text: "plan".to_string()
                },
                MessageContent::Code {
                    language: "rust".to_string(),
                    code: "fn main() {}".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_unterminated_code_defaults_language() {
        let blocks = parse_blocks("```\necho hi\n");
        assert_eq!(
            blocks,
            vec![MessageContent::Code {
                language: "text".to_string(),
                code: "echo hi".to_string()
            }]
        );
    }

    #[test]
    fn test_tool_call_with_continuation_and_result() {
        let blocks = parse_blocks("Read(src/main.rs)\n  lines 1-40\nDone reading file");
        assert_eq!(
            blocks,
            vec![
                MessageContent::ToolCall {
                    name: "Read".to_string(),
                    description: "Read(src/main.rs)\n  lines 1-40".to_string()
                },
                MessageContent::ToolResult {
                    name: "Read".to_string(),
                    output: "Done reading file".to_string(),
                    success: true
                },
            ]
        );
    }

    #[test]
    fn test_tool_call_names() {
        assert_eq!(match_tool_call("Running tool `deploy`"), Some("deploy".to_string()));
        assert_eq!(match_tool_call("Tool: Grep"), Some("Grep".to_string()));
        assert_eq!(match_tool_call("TodoWrite: 3 items"), Some("TodoWrite".to_string()));
        assert_eq!(match_tool_call("just words"), None);
    }

    #[test]
    fn test_failed_result_attributed_to_call() {
        let blocks = parse_blocks("Bash(cargo test)\nError: 2 tests failed");
        assert_eq!(
            blocks[1],
            MessageContent::ToolResult {
                name: "Bash".to_string(),
                output: "Error: 2 tests failed".to_string(),
                success: false
            }
        );
    }

    #[test]
    fn test_result_without_call_is_prose() {
        let blocks = parse_blocks("Everything is done now");
        assert_eq!(
            blocks,
            vec![MessageContent::Text {
                text: "Everything is done now".to_string()
            }]
        );
    }

    #[test]
    fn test_empty_extraction_falls_back_to_raw() {
        let blocks = parse_blocks("<thinking></thinking>");
        assert_eq!(
            blocks,
            vec![MessageContent::Text {
                text: "<thinking></thinking>".to_string()
            }]
        );
    }

    #[test]
    fn test_whitespace_does_not_start_message() {
        let mut parser = parser();
        assert!(parser.feed_chunk(b"  \r\n").is_empty());
        assert_eq!(parser.state(), ParserState::Idle);
        assert!(parser.idle_deadline().is_none());
    }

    #[test]
    fn test_first_chunk_starts_streaming_message() {
        let mut parser = parser();
        let events = parser.feed_chunk(b"Hello");
        assert_eq!(events.len(), 2);
        match &events[0] {
            ParserEvent::NewMessage(m) => {
                assert_eq!(m.role, Role::Assistant);
                assert_eq!(m.status, MessageStatus::Streaming);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(parser.state(), ParserState::StreamingAssistant);

        // Later chunks only update
        let events = parser.feed_chunk(b" world");
        assert_eq!(events.len(), 1);
        assert_eq!(
            current(&events).content,
            vec![MessageContent::Text {
                text: "Hello world".to_string()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_completes_message() {
        let mut parser = parser();
        parser.feed_chunk(b"Do you want to proceed? (y/n)");
        let first_id = match parser.feed_chunk(b" ").pop() {
            Some(ParserEvent::MessageUpdated(m)) => m.id,
            other => panic!("unexpected {:?}", other),
        };

        tokio::time::advance(Duration::from_millis(1500)).await;
        let deadline = parser.idle_deadline().unwrap();
        assert!(deadline <= Instant::now());

        match parser.on_idle_timeout() {
            Some(ParserEvent::NewMessage(m)) => {
                assert_eq!(m.id, first_id);
                assert_eq!(m.status, MessageStatus::Complete);
                assert_eq!(
                    m.content,
                    vec![MessageContent::Text {
                        text: "Do you want to proceed? (y/n)".to_string()
                    }]
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(parser.state(), ParserState::Complete);
        assert!(parser.on_idle_timeout().is_none());

        // Output after completion starts a fresh message
        let events = parser.feed_chunk(b"next");
        match &events[0] {
            ParserEvent::NewMessage(m) => assert_ne!(m.id, first_id),
            other => panic!("unexpected {:?}", other),
        }
    }

    /// Every block's text, one block per line
    fn render(blocks: &[MessageContent]) -> String {
        let mut rendered = String::new();
        for block in blocks {
            match block {
                MessageContent::Text { text } | MessageContent::Thinking { text } => {
                    rendered.push_str(text)
                }
                MessageContent::ToolCall { description, .. } => rendered.push_str(description),
                MessageContent::ToolResult { output, .. } => rendered.push_str(output),
                MessageContent::Code { code, .. } => rendered.push_str(code),
            }
            rendered.push('\n');
        }
        rendered
    }

    const MIXED_OUTPUT: &str = "Intro line\n<thinking>reasoning</thinking>\nUsing Bash\n  ls -la\n\
                                Created 2 files\n```sh\nmake\n```\n\x1b[32mOutro line\x1b[0m";

    const MIXED_FRAGMENTS: &[&str] = &[
        "Intro line",
        "reasoning",
        "Using Bash",
        "ls -la",
        "Created 2 files",
        "make",
        "Outro line",
    ];

    #[test]
    fn test_no_text_is_lost() {
        let rendered = render(&parse_blocks(&clean_output(MIXED_OUTPUT)));
        for fragment in MIXED_FRAGMENTS {
            assert!(rendered.contains(fragment), "lost {:?}", fragment);
        }
    }

    #[test]
    fn test_no_text_is_lost_at_any_chunk_boundary() {
        let bytes = MIXED_OUTPUT.as_bytes();
        for split in 0..=bytes.len() {
            let mut parser = parser();
            parser.feed_chunk(&bytes[..split]);
            parser.feed_chunk(&bytes[split..]);
            let message = match parser.on_idle_timeout() {
                Some(ParserEvent::NewMessage(message)) => message,
                other => panic!("split {}: expected completed message, got {:?}", split, other),
            };
            assert_eq!(message.status, MessageStatus::Complete);

            let rendered = render(&message.content);
            for fragment in MIXED_FRAGMENTS {
                assert!(
                    rendered.contains(fragment),
                    "split {}: lost {:?} from {:?}",
                    split,
                    fragment,
                    rendered
                );
            }
            assert!(!rendered.contains('\x1b'), "split {}: escape leaked", split);
        }
    }

    #[test]
    fn test_bare_fence_is_not_a_code_block() {
        let mut parser = parser();
        let events = parser.feed_chunk(b"Here:\n```rust\n");
        let message = current(&events);
        assert!(!message
            .content
            .iter()
            .any(|block| matches!(block, MessageContent::Code { .. })));
        assert_eq!(render(&message.content), "Here:\n");
    }

    #[test]
    fn test_user_message_is_complete() {
        let mut parser = parser();
        let message = parser.add_user_message("hello");
        assert_eq!(message.role, Role::User);
        assert_eq!(message.status, MessageStatus::Complete);
        assert_eq!(parser.state(), ParserState::Idle);
    }

    #[test]
    fn test_reset_discards_streaming_message() {
        let mut parser = parser();
        parser.feed_chunk(b"partial");
        parser.reset();
        assert_eq!(parser.state(), ParserState::Idle);
        assert!(parser.on_idle_timeout().is_none());
    }
}

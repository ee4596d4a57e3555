//! Auto responder: asks a language model what to type at a detected prompt.
//!
//! At most one call is meaningful at a time. Starting a new call supersedes
//! the previous one, and [`AutoResponder::cancel_pending`] makes the
//! in-flight call resolve as cancelled without waiting for the provider.

use crate::config::{Config, Model};
use crate::detector::tail_on_char_boundary;
use crate::error::ResponderError;
use crate::protocol::{AutoResponse, PromptContext};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 100;
const OUTPUT_CONTEXT_MAX: usize = 2000;

const SYSTEM_POLICY: &str = "You are an auto-pilot answering prompts from an interactive \
command-line coding agent on behalf of its user. Reply with ONLY the literal text to type \
into the terminal: a single line, no quotes, no explanation. If the user's instructions do \
not cover the situation, approve the action (for example \"y\" or \"yes\").";

/// What the responder needs from the configuration
#[derive(Clone, PartialEq, Eq)]
pub struct ResponderSettings {
    pub api_key: String,
    pub model: Model,
    pub instructions: String,
}

impl From<&Config> for ResponderSettings {
    fn from(config: &Config) -> Self {
        Self {
            api_key: config.api_key.clone(),
            model: config.model,
            instructions: config.instructions.clone(),
        }
    }
}

/// One provider request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Return the first text block of the model's reply.
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ResponderError>;
}

/// Builds a provider for the given settings. Called lazily and cached.
pub type ProviderFactory =
    Arc<dyn Fn(&ResponderSettings) -> Arc<dyn CompletionProvider> + Send + Sync>;

/// Anthropic Messages API client
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl CompletionProvider for AnthropicProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ResponderError> {
        let body = CreateMessageRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            system: &request.system,
            messages: vec![RequestMessage {
                role: "user",
                content: &request.user,
            }],
        };

        let response = self
            .client
            .post(MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|err| ResponderError::Provider(format!("request failed: {err}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body_text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body_text)
                .map(|wrapper| wrapper.error.message)
                .unwrap_or(body_text);
            return Err(ResponderError::Provider(format!(
                "HTTP {}: {}",
                status.as_u16(),
                message
            )));
        }

        let parsed: CreateMessageResponse = response
            .json()
            .await
            .map_err(|err| ResponderError::Provider(format!("invalid response: {err}")))?;

        parsed
            .content
            .into_iter()
            .find_map(|block| match block {
                ResponseBlock::Text { text } => Some(text),
                ResponseBlock::Other => None,
            })
            .ok_or_else(|| ResponderError::Provider("response contained no text".to_string()))
    }
}

#[derive(Serialize)]
struct CreateMessageRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<RequestMessage<'a>>,
}

#[derive(Serialize)]
struct RequestMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct CreateMessageResponse {
    content: Vec<ResponseBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

struct PendingCall {
    id: u64,
    cancel_tx: oneshot::Sender<()>,
}

/// A claimed call slot; resolves as cancelled once the slot is taken away
pub struct CallTicket {
    id: u64,
    cancel_rx: oneshot::Receiver<()>,
}

pub struct AutoResponder {
    settings: Mutex<ResponderSettings>,
    factory: ProviderFactory,
    client: Mutex<Option<Arc<dyn CompletionProvider>>>,
    pending: Mutex<Option<PendingCall>>,
    next_call: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AutoResponder {
    /// Responder backed by the Anthropic API
    pub fn new(settings: ResponderSettings) -> Self {
        Self::with_factory(
            settings,
            Arc::new(|settings: &ResponderSettings| {
                Arc::new(AnthropicProvider::new(settings.api_key.clone()))
                    as Arc<dyn CompletionProvider>
            }),
        )
    }

    pub fn with_factory(settings: ResponderSettings, factory: ProviderFactory) -> Self {
        Self {
            settings: Mutex::new(settings),
            factory,
            client: Mutex::new(None),
            pending: Mutex::new(None),
            next_call: AtomicU64::new(1),
        }
    }

    /// Decide what to type for a detected prompt
    pub async fn respond(&self, context: PromptContext) -> AutoResponse {
        let ticket = self.begin();
        self.respond_with(ticket, context).await
    }

    /// Claim the pending slot for a new call, superseding any previous one.
    ///
    /// The call is cancellable from here on, before [`Self::respond_with`]
    /// has been polled.
    pub fn begin(&self) -> CallTicket {
        let id = self.next_call.fetch_add(1, Ordering::SeqCst);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        if let Some(previous) = lock(&self.pending).replace(PendingCall { id, cancel_tx }) {
            debug!("Call {} superseded by call {}", previous.id, id);
            let _ = previous.cancel_tx.send(());
        }
        CallTicket { id, cancel_rx }
    }

    /// Run the call claimed by `ticket`
    pub async fn respond_with(&self, ticket: CallTicket, context: PromptContext) -> AutoResponse {
        let started = Instant::now();
        let settings = lock(&self.settings).clone();
        let CallTicket {
            id: call_id,
            cancel_rx,
        } = ticket;

        if settings.api_key.trim().is_empty() {
            let error = if self.release(call_id) {
                warn!("No API key configured, skipping auto-response");
                ResponderError::NoCredentials
            } else {
                ResponderError::Cancelled
            };
            return AutoResponse::failed(context, error, 0);
        }

        let provider = self.provider(&settings);
        let request = build_request(&settings, &context);

        let outcome = tokio::select! {
            biased;
            _ = cancel_rx => Err(ResponderError::Cancelled),
            result = provider.complete(&request) => result,
        };

        // If the slot no longer holds this call, it was cancelled or superseded
        let still_current = self.release(call_id);
        let outcome = if still_current {
            outcome
        } else {
            Err(ResponderError::Cancelled)
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        match outcome.and_then(|reply| first_line(&reply)) {
            Ok(response) => {
                info!("Auto-response {:?} in {}ms", response, latency_ms);
                AutoResponse::succeeded(context, response, latency_ms)
            }
            Err(error) => {
                warn!("Auto-response failed after {}ms: {}", latency_ms, error);
                AutoResponse::failed(context, error, latency_ms)
            }
        }
    }

    /// Abort the in-flight call, if any
    pub fn cancel_pending(&self) -> bool {
        match lock(&self.pending).take() {
            Some(call) => {
                debug!("Cancelling call {}", call.id);
                let _ = call.cancel_tx.send(());
                true
            }
            None => false,
        }
    }

    /// Free the pending slot if it still belongs to `call_id`
    fn release(&self, call_id: u64) -> bool {
        let mut pending = lock(&self.pending);
        if pending.as_ref().is_some_and(|p| p.id == call_id) {
            pending.take();
            true
        } else {
            false
        }
    }

    /// Drop the cached client so the next call builds a fresh one
    pub fn reset_client(&self) {
        lock(&self.client).take();
    }

    /// Apply live settings; credential or model changes drop the client
    pub fn update_settings(&self, settings: ResponderSettings) {
        let mut current = lock(&self.settings);
        if current.api_key != settings.api_key || current.model != settings.model {
            self.reset_client();
        }
        *current = settings;
    }

    fn provider(&self, settings: &ResponderSettings) -> Arc<dyn CompletionProvider> {
        let mut client = lock(&self.client);
        match client.as_ref() {
            Some(provider) => Arc::clone(provider),
            None => {
                debug!("Creating provider client for {:?}", settings.model);
                let provider = (self.factory)(settings);
                *client = Some(Arc::clone(&provider));
                provider
            }
        }
    }
}

fn build_request(settings: &ResponderSettings, context: &PromptContext) -> CompletionRequest {
    let mut system = SYSTEM_POLICY.to_string();
    let instructions = settings.instructions.trim();
    if !instructions.is_empty() {
        system.push_str("\n\nUser instructions:\n");
        system.push_str(instructions);
    }

    let user = format!(
        "Recent terminal output:\n```\n{}\n```\n\nDetected prompt: {}\n\nWhat should be typed in response?",
        tail_on_char_boundary(&context.recent_output, OUTPUT_CONTEXT_MAX),
        context.prompt_text
    );

    CompletionRequest {
        model: settings.model.api_id().to_string(),
        system,
        user,
        max_tokens: MAX_TOKENS,
    }
}

fn first_line(reply: &str) -> Result<String, ResponderError> {
    let line = reply.trim().lines().next().unwrap_or("").trim();
    if line.is_empty() {
        return Err(ResponderError::Provider(
            "provider returned an empty reply".to_string(),
        ));
    }
    Ok(line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct ScriptedProvider {
        reply: Option<Result<String, ResponderError>>,
        started: Arc<Notify>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        async fn complete(&self, request: &CompletionRequest) -> Result<String, ResponderError> {
            self.requests.lock().unwrap().push(request.clone());
            self.started.notify_one();
            match &self.reply {
                Some(reply) => reply.clone(),
                None => std::future::pending().await,
            }
        }
    }

    struct Harness {
        responder: Arc<AutoResponder>,
        provider: Arc<ScriptedProvider>,
        builds: Arc<AtomicUsize>,
    }

    fn harness(reply: Option<Result<String, ResponderError>>, api_key: &str) -> Harness {
        let provider = Arc::new(ScriptedProvider {
            reply,
            started: Arc::new(Notify::new()),
            requests: Mutex::new(Vec::new()),
        });
        let builds = Arc::new(AtomicUsize::new(0));
        let factory: ProviderFactory = {
            let provider = Arc::clone(&provider);
            let builds = Arc::clone(&builds);
            Arc::new(move |_settings: &ResponderSettings| {
                builds.fetch_add(1, Ordering::SeqCst);
                Arc::clone(&provider) as Arc<dyn CompletionProvider>
            })
        };
        let settings = ResponderSettings {
            api_key: api_key.to_string(),
            model: Model::Haiku,
            instructions: "Always answer yes to file reads.".to_string(),
        };
        Harness {
            responder: Arc::new(AutoResponder::with_factory(settings, factory)),
            provider,
            builds,
        }
    }

    fn context() -> PromptContext {
        PromptContext {
            recent_output: "Reading config...\nAllow Read(file.txt)?".to_string(),
            prompt_text: "Allow Read(file.txt)?".to_string(),
            matched_pattern: "allow".to_string(),
            detected_at: 0,
        }
    }

    #[tokio::test]
    async fn test_missing_credentials_skip_provider() {
        let h = harness(Some(Ok("y".to_string())), "  ");
        let response = h.responder.respond(context()).await;
        assert!(!response.success);
        assert_eq!(response.error, Some(ResponderError::NoCredentials));
        assert_eq!(response.error.unwrap().to_string(), "No API key configured");
        assert_eq!(h.builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reply_reduced_to_first_line() {
        let h = harness(Some(Ok("  yes\nBecause reads are safe.".to_string())), "key");
        let response = h.responder.respond(context()).await;
        assert!(response.success);
        assert_eq!(response.response, "yes");
        assert_eq!(response.prompt.prompt_text, "Allow Read(file.txt)?");

        let requests = h.provider.requests.lock().unwrap();
        assert_eq!(requests[0].max_tokens, 100);
        assert_eq!(requests[0].model, "claude-3-5-haiku-latest");
        assert!(requests[0].system.contains("Always answer yes to file reads."));
        assert!(requests[0].user.contains("Detected prompt: Allow Read(file.txt)?"));
    }

    #[tokio::test]
    async fn test_empty_reply_is_provider_error() {
        let h = harness(Some(Ok(" \n ".to_string())), "key");
        let response = h.responder.respond(context()).await;
        assert!(!response.success);
        assert!(matches!(response.error, Some(ResponderError::Provider(_))));
    }

    #[tokio::test]
    async fn test_provider_error_is_reported() {
        let h = harness(
            Some(Err(ResponderError::Provider("HTTP 529: overloaded".to_string()))),
            "key",
        );
        let response = h.responder.respond(context()).await;
        assert_eq!(
            response.error,
            Some(ResponderError::Provider("HTTP 529: overloaded".to_string()))
        );
    }

    #[tokio::test]
    async fn test_cancel_pending_resolves_cancelled() {
        let h = harness(None, "key");
        let started = Arc::clone(&h.provider.started);
        let responder = Arc::clone(&h.responder);
        let call = tokio::spawn(async move { responder.respond(context()).await });

        started.notified().await;
        assert!(h.responder.cancel_pending());
        let response = call.await.unwrap();
        assert!(!response.success);
        assert_eq!(response.error, Some(ResponderError::Cancelled));
        assert_eq!(response.error.unwrap().to_string(), "Cancelled by user");

        assert!(!h.responder.cancel_pending());
    }

    #[tokio::test]
    async fn test_cancel_before_call_runs() {
        let h = harness(Some(Ok("y".to_string())), "key");
        let ticket = h.responder.begin();
        assert!(h.responder.cancel_pending());

        let response = h.responder.respond_with(ticket, context()).await;
        assert_eq!(response.error, Some(ResponderError::Cancelled));
        assert!(h.provider.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_call_runs_without_credentials() {
        let h = harness(Some(Ok("y".to_string())), "");
        let ticket = h.responder.begin();
        h.responder.cancel_pending();
        let response = h.responder.respond_with(ticket, context()).await;
        assert_eq!(response.error, Some(ResponderError::Cancelled));
    }

    #[tokio::test]
    async fn test_new_call_supersedes_previous() {
        let h = harness(None, "key");
        let started = Arc::clone(&h.provider.started);

        let responder = Arc::clone(&h.responder);
        let first = tokio::spawn(async move { responder.respond(context()).await });
        started.notified().await;

        let responder = Arc::clone(&h.responder);
        let second = tokio::spawn(async move { responder.respond(context()).await });

        let response = first.await.unwrap();
        assert_eq!(response.error, Some(ResponderError::Cancelled));

        started.notified().await;
        h.responder.cancel_pending();
        assert_eq!(
            second.await.unwrap().error,
            Some(ResponderError::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_client_is_cached_until_reset() {
        let h = harness(Some(Ok("y".to_string())), "key");
        h.responder.respond(context()).await;
        h.responder.respond(context()).await;
        assert_eq!(h.builds.load(Ordering::SeqCst), 1);

        h.responder.reset_client();
        h.responder.respond(context()).await;
        assert_eq!(h.builds.load(Ordering::SeqCst), 2);

        // Same credentials and model keep the client
        h.responder.update_settings(ResponderSettings {
            api_key: "key".to_string(),
            model: Model::Haiku,
            instructions: "new".to_string(),
        });
        h.responder.respond(context()).await;
        assert_eq!(h.builds.load(Ordering::SeqCst), 2);

        h.responder.update_settings(ResponderSettings {
            api_key: "key".to_string(),
            model: Model::Sonnet,
            instructions: "new".to_string(),
        });
        h.responder.respond(context()).await;
        assert_eq!(h.builds.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_response_block_parsing() {
        let parsed: CreateMessageResponse = serde_json::from_str(
            r#"{"content":[{"type":"thinking","thinking":"hm"},{"type":"text","text":"y"}]}"#,
        )
        .unwrap();
        assert!(matches!(&parsed.content[1], ResponseBlock::Text { text } if text == "y"));
        assert!(matches!(parsed.content[0], ResponseBlock::Other));
    }
}

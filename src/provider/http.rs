//! HTTP adapter implementing [`Generator`] for local and cloud backends.
//!
//! Local backends speak either a completion shape (`{model, prompt,
//! options}` -> `{response}`) or a chat shape (`{model, messages}` ->
//! `{choices[0].message.content}`). Cloud backends speak a messages API
//! with a credential header and an optional extended-reasoning budget.
//! All transport failures are mapped to the error taxonomy here; nothing
//! above this layer sees a raw `reqwest` error.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, StatusCode, Url};
use serde_json::{Value, json};
use tokio::time::Instant;

use crate::config::{BackendKind, BackendSettings};
use crate::context::FetchContext;
use crate::error::DiggerError;
use crate::planner::budget::BackendCapability;
use crate::provider::guard::ensure_private_host;
use crate::provider::{Generator, GeneratorReply, ParsedModelId, parse_model_id};
use crate::redact;
use crate::retry::BackoffPolicy;

/// Minimum remaining budget worth attempting a request with.
const MIN_REMAINING: Duration = Duration::from_millis(100);
/// Per-probe timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// How much upstream error body is kept (after redaction).
const MAX_ERROR_SNIPPET_CHARS: usize = 500;
/// Sampling defaults sent to every backend.
const TEMPERATURE: f64 = 0.8;
const TOP_P: f64 = 0.9;
/// Completion cap floor when the window is small.
const MIN_MAX_TOKENS: u32 = 512;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct HttpGenerator {
    settings: BackendSettings,
    base_url: Url,
    model: RwLock<ParsedModelId>,
    client: Client,
    /// One operator-visible auth warning per (backend, credential); a
    /// new credential means a rebuilt adapter, which resets this.
    auth_warned: std::sync::atomic::AtomicBool,
}

impl HttpGenerator {
    pub fn new(settings: BackendSettings, model_id: &str) -> Result<Self, DiggerError> {
        let base_url = Url::parse(&settings.base_url).map_err(|e| {
            DiggerError::InvalidConfig(format!("backend {}: bad base_url: {e}", settings.id))
        })?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| {
                DiggerError::InvalidConfig(format!(
                    "backend {}: cannot build HTTP client: {e}",
                    settings.id
                ))
            })?;
        Ok(Self {
            base_url,
            model: RwLock::new(parse_model_id(model_id)),
            settings,
            client,
            auth_warned: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn warn_auth_once(&self) {
        use std::sync::atomic::Ordering;
        if !self.auth_warned.swap(true, Ordering::Relaxed) {
            let credential_hash = crate::fingerprint::fingerprint(&[self
                .settings
                .credential
                .as_deref()
                .unwrap_or_default()]);
            tracing::warn!(
                backend = %self.settings.id,
                credential_hash,
                "authentication failed, check the configured credential"
            );
        }
    }

    fn max_completion_tokens(&self) -> u32 {
        MIN_MAX_TOKENS.max((self.settings.context_window as f64 * 0.20) as u32)
    }

    fn build_body(&self, prompt: &str) -> Value {
        let model = self.model.read().clone();
        match self.settings.kind {
            BackendKind::LocalCompletion => json!({
                "model": model.base,
                "prompt": prompt,
                "stream": false,
                "options": {
                    "temperature": TEMPERATURE,
                    "top_p": TOP_P,
                    "max_tokens": self.max_completion_tokens(),
                },
            }),
            BackendKind::LocalChat => json!({
                "model": model.base,
                "messages": [{"role": "user", "content": prompt}],
                "temperature": TEMPERATURE,
                "max_tokens": self.max_completion_tokens(),
                "stream": false,
            }),
            BackendKind::CloudMessages => {
                let mut body = json!({
                    "model": model.base,
                    "system": "You recommend music as structured JSON.",
                    "messages": [{"role": "user", "content": prompt}],
                    "max_tokens": self.max_completion_tokens(),
                    "temperature": TEMPERATURE,
                });
                if model.thinking.enabled {
                    let mut thinking = json!({"type": "auto"});
                    if let Some(budget) = model.thinking.budget_tokens {
                        thinking["budget_tokens"] = json!(budget);
                    }
                    body["thinking"] = thinking;
                }
                body
            }
        }
    }

    /// Pull the reply text (and usage, when present) out of a 2xx body.
    fn extract_reply(&self, body: &Value) -> Option<(String, Option<u64>, Option<u64>)> {
        match self.settings.kind {
            BackendKind::LocalCompletion => {
                let text = body.get("response")?.as_str()?;
                Some((text.to_string(), None, None))
            }
            BackendKind::LocalChat => {
                let text = body
                    .get("choices")?
                    .get(0)?
                    .get("message")?
                    .get("content")?
                    .as_str()?;
                Some((text.to_string(), None, None))
            }
            BackendKind::CloudMessages => {
                let blocks = body.get("content")?.as_array()?;
                let text: String = blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect();
                if text.is_empty() {
                    return None;
                }
                let usage = body.get("usage");
                let input = usage
                    .and_then(|u| u.get("input_tokens"))
                    .and_then(Value::as_u64);
                let output = usage
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(Value::as_u64);
                Some((text, input, output))
            }
        }
    }

    async fn attempt(
        &self,
        prompt: &str,
        ctx: &FetchContext,
        deadline: Instant,
        started: Instant,
    ) -> Result<GeneratorReply, DiggerError> {
        let backend = self.settings.id.clone();
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining < MIN_REMAINING {
            return Err(DiggerError::DeadlineExceeded(
                started.elapsed().as_millis() as u64,
            ));
        }

        if self.settings.kind.is_local() {
            ensure_private_host(&backend, &self.base_url).await?;
        }

        let mut request = self
            .client
            .post(self.base_url.clone())
            .timeout(remaining)
            .header("Content-Type", "application/json")
            .header("X-Correlation-Id", ctx.correlation_id());
        if self.settings.kind == BackendKind::CloudMessages {
            let credential = self.settings.credential.as_deref().unwrap_or_default();
            request = request
                .header("x-api-key", credential)
                .header("anthropic-version", ANTHROPIC_VERSION);
        }

        let send = request.json(&self.build_body(prompt)).send();
        let response = tokio::select! {
            result = send => result,
            _ = ctx.cancellation().cancelled() => {
                return Err(DiggerError::Cancelled(started.elapsed().as_millis() as u64));
            }
        }
        .map_err(|e| {
            if e.is_timeout() {
                DiggerError::DeadlineExceeded(started.elapsed().as_millis() as u64)
            } else {
                DiggerError::BackendTransient {
                    backend: backend.clone(),
                    message: format!("request failed: {e}"),
                    status: None,
                }
            }
        })?;

        let status = response.status();
        let bytes = tokio::select! {
            result = response.bytes() => result,
            _ = ctx.cancellation().cancelled() => {
                return Err(DiggerError::Cancelled(started.elapsed().as_millis() as u64));
            }
        }
        .map_err(|e| DiggerError::BackendTransient {
            backend: backend.clone(),
            message: format!("body read failed: {e}"),
            status: Some(status.as_u16()),
        })?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.warn_auth_once();
            return Err(DiggerError::BackendAuth {
                backend,
                message: format!("{status}"),
            });
        }
        if !status.is_success() {
            let snippet = redact::truncate(
                &redact::redact(&String::from_utf8_lossy(&bytes)),
                MAX_ERROR_SNIPPET_CHARS,
            );
            // Upstream 429s and 5xx are worth retrying; any other 4xx is
            // a request we built wrong and will keep building wrong.
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                return Err(DiggerError::BackendTransient {
                    backend,
                    message: format!("{status}: {snippet}"),
                    status: Some(status.as_u16()),
                });
            }
            return Err(DiggerError::BackendBadRequest {
                backend,
                status: status.as_u16(),
                message: format!("{status}: {snippet}"),
            });
        }

        // 2xx with an empty or malformed body is a failure, not a silent
        // success.
        let parsed: Value =
            serde_json::from_slice(&bytes).map_err(|e| DiggerError::BackendTransient {
                backend: backend.clone(),
                message: format!("malformed 2xx body: {e}"),
                status: Some(status.as_u16()),
            })?;
        let (text, input_tokens, output_tokens) =
            self.extract_reply(&parsed)
                .ok_or_else(|| DiggerError::BackendTransient {
                    backend: backend.clone(),
                    message: "2xx body missing reply text".to_string(),
                    status: Some(status.as_u16()),
                })?;
        if text.trim().is_empty() {
            return Err(DiggerError::BackendTransient {
                backend,
                message: "2xx body with empty reply text".to_string(),
                status: Some(status.as_u16()),
            });
        }

        Ok(GeneratorReply {
            text,
            input_tokens,
            output_tokens,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    fn name(&self) -> &str {
        &self.settings.id
    }

    fn capability(&self) -> BackendCapability {
        BackendCapability {
            context_window: self.settings.context_window,
            prompt_ceiling: self.settings.prompt_ceiling,
        }
    }

    fn probe_url(&self) -> String {
        self.settings
            .probe_url
            .clone()
            .unwrap_or_else(|| self.settings.base_url.clone())
    }

    async fn invoke(&self, prompt: &str, ctx: &FetchContext) -> Result<GeneratorReply, DiggerError> {
        let started = Instant::now();
        let deadline = ctx.deadline().min(started + self.settings.timeout());

        let policy = BackoffPolicy::transient();
        let mut attempt = 0;
        loop {
            match self.attempt(prompt, ctx, deadline, started).await {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    attempt += 1;
                    let delay = policy.delay(attempt - 1);
                    let out_of_time =
                        Instant::now() + delay >= deadline || attempt >= policy.max_attempts;
                    if !err.is_retryable() || out_of_time {
                        return Err(err);
                    }
                    tracing::debug!(
                        backend = %self.settings.id,
                        correlation_id = ctx.correlation_id(),
                        attempt,
                        "transient backend error, retrying: {err}"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancellation().cancelled() => {
                            return Err(DiggerError::Cancelled(
                                started.elapsed().as_millis() as u64,
                            ));
                        }
                    }
                }
            }
        }
    }

    async fn probe(&self) -> Result<(), DiggerError> {
        let url = self.probe_url();
        let response = self
            .client
            .get(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| DiggerError::BackendTransient {
                backend: self.settings.id.clone(),
                message: format!("probe failed: {e}"),
                status: None,
            })?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(DiggerError::BackendTransient {
                backend: self.settings.id.clone(),
                message: format!("probe status {}", response.status()),
                status: Some(response.status().as_u16()),
            })
        }
    }

    fn update_model(&self, model_id: &str) {
        *self.model.write() = parse_model_id(model_id);
    }
}

impl std::fmt::Debug for HttpGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpGenerator")
            .field("id", &self.settings.id)
            .field("kind", &self.settings.kind)
            .field("base_url", &self.settings.base_url)
            .field("credential", &"[REDACTED]")
            .field("model", &self.model.read().base)
            .finish()
    }
}

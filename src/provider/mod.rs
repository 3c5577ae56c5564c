pub mod guard;
pub mod http;
pub mod registry;

use async_trait::async_trait;

use crate::context::FetchContext;
use crate::error::DiggerError;
use crate::planner::budget::BackendCapability;

/// Uniform result type every backend adapter returns.
#[derive(Debug, Clone)]
pub struct GeneratorReply {
    pub text: String,
    /// Usage figures when the vendor reports them.
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub elapsed_ms: u64,
}

/// Capability surface of one text-generation backend.
#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;
    fn capability(&self) -> BackendCapability;
    /// URL the health monitor probes for liveness.
    fn probe_url(&self) -> String;
    /// Send one prompt. Enforces min(configured timeout, ctx deadline)
    /// end to end and maps transport failures to the error taxonomy.
    async fn invoke(&self, prompt: &str, ctx: &FetchContext) -> Result<GeneratorReply, DiggerError>;
    async fn probe(&self) -> Result<(), DiggerError>;
    /// Swap the active model id (accepts the `#thinking` suffix form).
    fn update_model(&self, model_id: &str);
}

/// Extended-reasoning directive parsed from a model id suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThinkingDirective {
    pub enabled: bool,
    pub budget_tokens: Option<u32>,
}

/// Model id split into the transmitted base id and the reasoning
/// directive. Supported suffixes: `#thinking`, `#thinking(tokens=N)`,
/// `#thinking(N)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedModelId {
    pub base: String,
    pub thinking: ThinkingDirective,
}

pub fn parse_model_id(raw: &str) -> ParsedModelId {
    let Some((base, suffix)) = raw.split_once('#') else {
        return ParsedModelId {
            base: raw.to_string(),
            thinking: ThinkingDirective::default(),
        };
    };

    let base = base.to_string();
    let suffix = suffix.trim();
    if !suffix.starts_with("thinking") {
        // Unknown suffix: keep the raw id intact rather than guess.
        return ParsedModelId {
            base: raw.to_string(),
            thinking: ThinkingDirective::default(),
        };
    }

    let rest = &suffix["thinking".len()..];
    let budget_tokens = rest
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .and_then(|inner| {
            let inner = inner.trim();
            inner
                .strip_prefix("tokens=")
                .unwrap_or(inner)
                .trim()
                .parse::<u32>()
                .ok()
        });

    ParsedModelId {
        base,
        thinking: ThinkingDirective {
            enabled: true,
            budget_tokens,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_id_passes_through() {
        let parsed = parse_model_id("llama3:8b");
        assert_eq!(parsed.base, "llama3:8b");
        assert!(!parsed.thinking.enabled);
    }

    #[test]
    fn bare_thinking_suffix() {
        let parsed = parse_model_id("claude-sonnet#thinking");
        assert_eq!(parsed.base, "claude-sonnet");
        assert!(parsed.thinking.enabled);
        assert_eq!(parsed.thinking.budget_tokens, None);
    }

    #[test]
    fn thinking_with_named_budget() {
        let parsed = parse_model_id("claude-sonnet#thinking(tokens=8192)");
        assert_eq!(parsed.base, "claude-sonnet");
        assert_eq!(parsed.thinking.budget_tokens, Some(8192));
    }

    #[test]
    fn thinking_with_bare_budget() {
        let parsed = parse_model_id("claude-sonnet#thinking(4096)");
        assert_eq!(parsed.thinking.budget_tokens, Some(4096));
    }

    #[test]
    fn unknown_suffix_is_left_alone() {
        let parsed = parse_model_id("model#turbo");
        assert_eq!(parsed.base, "model#turbo");
        assert!(!parsed.thinking.enabled);
    }

    #[test]
    fn malformed_budget_enables_thinking_without_budget() {
        let parsed = parse_model_id("m#thinking(tokens=abc)");
        assert!(parsed.thinking.enabled);
        assert_eq!(parsed.thinking.budget_tokens, None);
    }
}

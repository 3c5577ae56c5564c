//! Resolves a backend's context window and a sampling tier into prompt
//! and completion token reserves.

use crate::types::SamplingTier;

/// Tokens kept aside for the system/preamble portion of the prompt.
pub const SYSTEM_RESERVE_TOKENS: u32 = 500;
/// Minimum usable prompt budget regardless of context size.
pub const PROMPT_FLOOR_TOKENS: u32 = 1500;

/// Capability descriptor for the selected backend/model.
#[derive(Debug, Clone, Copy)]
pub struct BackendCapability {
    pub context_window: u32,
    /// Vendor-imposed hard prompt ceiling, when lower than the window.
    pub prompt_ceiling: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBudget {
    pub context_tokens: u32,
    /// What the planner aims the rendered prompt at.
    pub target_tokens: u32,
    /// Reserve absorbing estimation error.
    pub headroom_tokens: u32,
    pub system_reserve_tokens: u32,
    /// Model id the tokenizer registry is keyed by.
    pub model_key: String,
}

/// Resolve the budget for one request.
///
/// `comprehensive_override`, when set, caps the comprehensive tier's
/// target so an operator can bound prompt spend on huge context windows.
pub fn resolve(
    tier: SamplingTier,
    capability: BackendCapability,
    model_key: &str,
    comprehensive_override: Option<u32>,
) -> TokenBudget {
    let context = capability.context_window;
    let completion_reserve = 512.max((context as f64 * 0.20) as u32);
    let headroom = 256.max((context as f64 * 0.10) as u32);

    let mut prompt_budget = PROMPT_FLOOR_TOKENS.max(
        context
            .saturating_sub(SYSTEM_RESERVE_TOKENS)
            .saturating_sub(completion_reserve)
            .saturating_sub(headroom),
    );
    if let Some(ceiling) = capability.prompt_ceiling
        && ceiling < prompt_budget
    {
        prompt_budget = ceiling;
    }

    let ratio = tier.ratio();
    let floor_share = (PROMPT_FLOOR_TOKENS as f64 * ratio) as u32;
    let budget_share = (prompt_budget as f64 * ratio) as u32;
    let mut target = prompt_budget.min(floor_share.max(budget_share));

    if tier == SamplingTier::Comprehensive
        && let Some(cap) = comprehensive_override
    {
        target = target.min(cap);
    }

    // The prompt target plus headroom can never exceed the window.
    target = target.min(context.saturating_sub(headroom));

    TokenBudget {
        context_tokens: context,
        target_tokens: target,
        headroom_tokens: headroom,
        system_reserve_tokens: SYSTEM_RESERVE_TOKENS,
        model_key: model_key.to_string(),
    }
}

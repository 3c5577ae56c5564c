use std::sync::LazyLock;

use regex::Regex;

/// Secret shapes that must never reach logs or error messages:
/// API keys (`sk-…`), bearer headers, `api_key=` query/body params,
/// email addresses, and JWTs.
static PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"sk-[A-Za-z0-9_\-]{8,}").expect("sk pattern"),
        Regex::new(r"(?i)bearer\s+[A-Za-z0-9._\-]+").expect("bearer pattern"),
        Regex::new(r"(?i)api[_\-]?key\s*[=:]\s*[^\s&\x22']+").expect("api_key pattern"),
        Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").expect("email pattern"),
        Regex::new(r"eyJ[A-Za-z0-9_\-]{4,}\.[A-Za-z0-9_\-]{4,}\.[A-Za-z0-9_\-]{4,}")
            .expect("jwt pattern"),
    ]
});

/// Replace any embedded secret with `[REDACTED]`. Applied to every
/// upstream body snippet before it lands in an error or a log line.
pub fn redact(input: &str) -> String {
    let mut out = input.to_string();
    for pattern in PATTERNS.iter() {
        out = pattern.replace_all(&out, "[REDACTED]").into_owned();
    }
    out
}

/// Truncate to `max_chars` characters, marking the cut. Pairs with
/// [`redact`] when surfacing upstream error bodies.
pub fn truncate(input: &str, max_chars: usize) -> String {
    let truncated: String = input.chars().take(max_chars).collect();
    if truncated.len() < input.len() {
        format!("{truncated}... [{} bytes total]", input.len())
    } else {
        truncated
    }
}

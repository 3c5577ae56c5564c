//! Lenient extraction of recommendations from free-form generator text.
//!
//! Generators are told to answer with a JSON array and routinely don't:
//! prose around the array, nested `[[...]]`, a bare object, or a dashed
//! list. This parser accepts all of those and returns an empty list in
//! the worst case. It never errors; malformed input is a normal input.

use serde_json::Value;

use crate::types::Recommendation;

/// Confidence assigned when the field is missing or unparsable.
const DEFAULT_CONFIDENCE: f64 = 0.7;
const UNKNOWN: &str = "Unknown";

/// Parse generator output into zero or more recommendations.
pub fn parse_recommendations(raw: &str) -> Vec<Recommendation> {
    let text = raw.trim_start_matches('\u{feff}');

    if let Some(items) = parse_json_window(text) {
        return items;
    }
    parse_dashed_lines(text)
}

/// Try the substring between the first `[` and the last `]`; fall back
/// to a whole-text object parse for bare-object replies.
fn parse_json_window(text: &str) -> Option<Vec<Recommendation>> {
    let elements = extract_elements(text)?;
    let items: Vec<Recommendation> = elements
        .iter()
        .filter_map(element_to_recommendation)
        .collect();
    if items.is_empty() { None } else { Some(items) }
}

fn extract_elements(text: &str) -> Option<Vec<Value>> {
    let window = match (text.find('['), text.rfind(']')) {
        (Some(open), Some(close)) if open < close => Some(&text[open..=close]),
        _ => None,
    };

    if let Some(window) = window
        && let Ok(value) = serde_json::from_str::<Value>(window)
    {
        return match value {
            Value::Array(outer) => {
                // `[[...]]` with a single inner array unwraps to it.
                if outer.len() == 1
                    && let Some(Value::Array(inner)) = outer.first()
                {
                    Some(inner.clone())
                } else {
                    Some(outer)
                }
            }
            Value::Object(_) => Some(vec![value]),
            _ => None,
        };
    }

    // No usable bracket window: a bare object still counts.
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(text.trim()) {
        return Some(vec![value]);
    }
    None
}

fn element_to_recommendation(element: &Value) -> Option<Recommendation> {
    let object = element.as_object()?;
    if object.is_empty() {
        return None;
    }

    let field = |name: &str| -> Option<&Value> {
        object
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    };
    let string_field = |name: &str, default: &str| -> String {
        field(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| default.to_string())
    };

    Some(Recommendation {
        artist: string_field("artist", UNKNOWN),
        album: string_field("album", UNKNOWN),
        genre: string_field("genre", UNKNOWN),
        confidence: clamp_confidence(field("confidence")),
        reason: string_field("reason", ""),
    })
}

/// Non-numeric, NaN, and infinities collapse to the default; the rest
/// clamps into [0, 1].
fn clamp_confidence(value: Option<&Value>) -> f64 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => v.clamp(0.0, 1.0),
        _ => DEFAULT_CONFIDENCE,
    }
}

/// Fallback: one item per line shaped like `Artist - Album`, tolerating
/// en/em dashes and leading list markers.
fn parse_dashed_lines(text: &str) -> Vec<Recommendation> {
    text.lines()
        .filter_map(|line| {
            let line = strip_list_markers(line);
            let (artist, album) = split_on_dash(line)?;
            let artist = artist.trim();
            let album = album.trim();
            if artist.is_empty() && album.is_empty() {
                return None;
            }
            Some(Recommendation {
                artist: if artist.is_empty() {
                    UNKNOWN.to_string()
                } else {
                    artist.to_string()
                },
                album: album.to_string(),
                genre: UNKNOWN.to_string(),
                confidence: DEFAULT_CONFIDENCE,
                reason: String::new(),
            })
        })
        .collect()
}

/// Remove leading `•`, `*`, `1.`-style enumeration, bullet dashes, and
/// whitespace.
fn strip_list_markers(line: &str) -> &str {
    let mut rest = line.trim_start();
    loop {
        let before = rest;
        rest = rest.trim_start_matches(['•', '*']).trim_start();
        // Enumeration markers are digits followed by a dot ("12. ");
        // bare digits stay, so "2Pac" keeps its name.
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits_end > 0 && rest[digits_end..].starts_with('.') {
            rest = rest[digits_end + 1..].trim_start();
        }
        if rest == before {
            break;
        }
    }
    // A dash followed by whitespace at line start is a bullet, not the
    // artist/album separator.
    if let Some(stripped) = rest.strip_prefix('-')
        && stripped.starts_with(char::is_whitespace)
    {
        return stripped.trim_start();
    }
    rest
}

fn split_on_dash(line: &str) -> Option<(&str, &str)> {
    let index = line.char_indices().find(|(_, c)| matches!(c, '-' | '–' | '—'))?;
    let (left, right) = line.split_at(index.0);
    let right = &right[index.1.len_utf8()..];
    Some((left, right))
}

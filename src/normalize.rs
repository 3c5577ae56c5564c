//! Identity normalization for recommendations and catalog entries.
//!
//! Two items are the same recommendation iff their normalized keys are
//! equal, regardless of raw casing, stray whitespace, or HTML entities
//! the generator left behind.

/// Normalize a raw name: HTML-unescape, trim, collapse whitespace runs
/// to a single space, case-fold.
pub fn normalize(raw: &str) -> String {
    let unescaped = html_escape::decode_html_entities(raw);
    let mut out = String::with_capacity(unescaped.len());
    let mut pending_space = false;
    for ch in unescaped.trim().chars() {
        if ch.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        for lower in ch.to_lowercase() {
            out.push(lower);
        }
    }
    out
}

/// Dedup key for album-mode recommendations: `N(artist)|N(album)`.
pub fn album_key(artist: &str, album: &str) -> String {
    format!("{}|{}", normalize(artist), normalize(album))
}

/// Dedup key for artist-mode recommendations. The `artist_` prefix keeps
/// artist keys from colliding with album keys in a shared history set.
pub fn artist_key(artist: &str) -> String {
    format!("artist_{}", normalize(artist))
}

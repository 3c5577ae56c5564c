use serde::{Deserialize, Serialize};

use crate::normalize::{album_key, artist_key};

/// Semantic bias of the suggestions relative to the library.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// Stay close to what the library already contains.
    #[default]
    Similar,
    /// Neighboring genres and scenes.
    Adjacent,
    /// Deliberately far afield.
    Exploratory,
}

impl DiscoveryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Similar => "similar",
            Self::Adjacent => "adjacent",
            Self::Exploratory => "exploratory",
        }
    }
}

/// Budget class determining how much of the library the prompt carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingTier {
    Minimal,
    #[default]
    Balanced,
    Comprehensive,
}

impl SamplingTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Balanced => "balanced",
            Self::Comprehensive => "comprehensive",
        }
    }

    /// Fraction of the prompt budget this tier is allowed to spend.
    pub fn ratio(self) -> f64 {
        match self {
            Self::Minimal => 0.35,
            Self::Balanced => 0.60,
            Self::Comprehensive => 1.00,
        }
    }
}

/// Whether the caller wants whole albums or just artists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationMode {
    #[default]
    Album,
    ArtistOnly,
}

impl RecommendationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Album => "album",
            Self::ArtistOnly => "artist_only",
        }
    }
}

/// One fetch request as the host hands it over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSpec {
    /// Which configured backend to drive.
    pub backend_id: String,
    /// Opaque model identifier, optionally suffixed `#thinking[(tokens=N)]`.
    pub model_id: String,
    pub discovery: DiscoveryMode,
    pub tier: SamplingTier,
    /// How many unique recommendations the caller wants (>= 1).
    pub target_count: usize,
    pub mode: RecommendationMode,
    /// Free-form style constraints ("shoegaze", "no live albums", ...).
    #[serde(default)]
    pub style_filters: Vec<String>,
}

impl RequestSpec {
    /// Style filters, sorted and deduplicated, for stable hashing.
    pub fn sorted_filters(&self) -> Vec<String> {
        let mut filters = self.style_filters.clone();
        filters.sort();
        filters.dedup();
        filters
    }
}

/// A single suggested item as returned to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub artist: String,
    /// Empty in artist-only mode.
    pub album: String,
    pub genre: String,
    /// Always clamped to [0, 1].
    pub confidence: f64,
    pub reason: String,
}

impl Recommendation {
    /// Identity key under the given mode. Equal keys collapse to one
    /// item during dedup regardless of raw spelling.
    pub fn key(&self, mode: RecommendationMode) -> String {
        match mode {
            RecommendationMode::Album => album_key(&self.artist, &self.album),
            RecommendationMode::ArtistOnly => artist_key(&self.artist),
        }
    }

    /// True when the item carries enough identity to keep: a non-empty
    /// artist always, and a non-empty album in album mode.
    pub fn is_complete(&self, mode: RecommendationMode) -> bool {
        if self.artist.trim().is_empty() {
            return false;
        }
        match mode {
            RecommendationMode::Album => !self.album.trim().is_empty(),
            RecommendationMode::ArtistOnly => true,
        }
    }
}

//! Read-only view of the user's library plus derived statistics.
//!
//! The core never mutates catalog items; the host owns the data and
//! exposes it through the [`Catalog`] trait.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::fingerprint;
use crate::normalize::{album_key, artist_key, normalize};
use crate::types::RecommendationMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artist {
    pub name: String,
    pub added_at: DateTime<Utc>,
    pub album_count: u32,
    #[serde(default)]
    pub genres: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Album {
    pub artist: String,
    pub title: String,
    pub added_at: DateTime<Utc>,
    /// Community rating in [0, 10]; 0 when unrated.
    pub rating: f64,
    pub rating_votes: u32,
    #[serde(default)]
    pub genres: Vec<String>,
}

/// Read-only catalog accessor the host implements.
pub trait Catalog: Send + Sync {
    fn artists(&self) -> Vec<Artist>;
    fn albums(&self) -> Vec<Album>;
    /// Stable identifier for the current catalog content; changes when
    /// the library changes. Keys the plan cache and operation keys.
    fn library_fingerprint(&self) -> String;
}

/// Owned in-memory catalog. The reference implementation used by tests
/// and by hosts that already hold their library in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryCatalog {
    artists: Vec<Artist>,
    albums: Vec<Album>,
}

impl MemoryCatalog {
    pub fn new(artists: Vec<Artist>, albums: Vec<Album>) -> Self {
        Self { artists, albums }
    }
}

impl Catalog for MemoryCatalog {
    fn artists(&self) -> Vec<Artist> {
        self.artists.clone()
    }

    fn albums(&self) -> Vec<Album> {
        self.albums.clone()
    }

    fn library_fingerprint(&self) -> String {
        let mut identities: Vec<String> = self
            .artists
            .iter()
            .map(|a| artist_key(&a.name))
            .chain(
                self.albums
                    .iter()
                    .map(|al| album_key(&al.artist, &al.title)),
            )
            .collect();
        identities.sort();
        let parts: Vec<&str> = identities.iter().map(String::as_str).collect();
        fingerprint(&parts)
    }
}

/// Typed metadata value carried in the profile's signal map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl MetaValue {
    /// Stable textual form used when hashing profile signals.
    pub fn render(&self) -> String {
        match self {
            Self::Flag(b) => b.to_string(),
            Self::Number(n) => format!("{n:.4}"),
            Self::Text(s) => s.clone(),
        }
    }
}

/// Derived statistics over the catalog, consumed read-only by the
/// planner. `BTreeMap` keeps metadata iteration sorted for seeding.
#[derive(Debug, Clone, Default)]
pub struct LibraryProfile {
    pub total_artists: usize,
    pub total_albums: usize,
    /// Genre -> artist count, most common first.
    pub top_genres: Vec<(String, usize)>,
    /// Artist names by album count, largest first.
    pub top_artists: Vec<String>,
    /// Artist names by added-at, newest first.
    pub recently_added: Vec<String>,
    pub metadata: BTreeMap<String, MetaValue>,
}

const TOP_GENRES: usize = 10;
const TOP_ARTISTS: usize = 25;
const RECENT_ARTISTS: usize = 20;

impl LibraryProfile {
    pub fn from_catalog(catalog: &dyn Catalog) -> Self {
        let artists = catalog.artists();
        let albums = catalog.albums();

        let mut genre_counts: HashMap<String, usize> = HashMap::new();
        for artist in &artists {
            for genre in &artist.genres {
                let g = normalize(genre);
                if !g.is_empty() {
                    *genre_counts.entry(g).or_default() += 1;
                }
            }
        }
        let mut top_genres: Vec<(String, usize)> = genre_counts.into_iter().collect();
        // Count desc, then name asc so equal counts order deterministically.
        top_genres.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_genres.truncate(TOP_GENRES);

        let mut by_albums = artists.clone();
        by_albums.sort_by(|a, b| {
            b.album_count
                .cmp(&a.album_count)
                .then_with(|| a.name.cmp(&b.name))
        });
        let top_artists: Vec<String> = by_albums
            .iter()
            .take(TOP_ARTISTS)
            .map(|a| a.name.clone())
            .collect();

        let mut by_recency = artists.clone();
        by_recency.sort_by(|a, b| b.added_at.cmp(&a.added_at).then_with(|| a.name.cmp(&b.name)));
        let recently_added: Vec<String> = by_recency
            .iter()
            .take(RECENT_ARTISTS)
            .map(|a| a.name.clone())
            .collect();

        let rated: Vec<f64> = albums
            .iter()
            .filter(|a| a.rating_votes > 0)
            .map(|a| a.rating)
            .collect();
        let avg_rating = if rated.is_empty() {
            0.0
        } else {
            rated.iter().sum::<f64>() / rated.len() as f64
        };

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "avg_album_rating".to_string(),
            MetaValue::Number(avg_rating),
        );
        metadata.insert(
            "albums_per_artist".to_string(),
            MetaValue::Number(if artists.is_empty() {
                0.0
            } else {
                albums.len() as f64 / artists.len() as f64
            }),
        );
        metadata.insert(
            "large_library".to_string(),
            MetaValue::Flag(artists.len() > 200),
        );
        if let Some((genre, _)) = top_genres.first() {
            metadata.insert(
                "dominant_genre".to_string(),
                MetaValue::Text(genre.clone()),
            );
        }

        Self {
            total_artists: artists.len(),
            total_albums: albums.len(),
            top_genres,
            top_artists,
            recently_added,
            metadata,
        }
    }
}

/// Set of normalized catalog keys under the given mode, used to reject
/// suggestions the library already owns.
pub fn library_keys(catalog: &dyn Catalog, mode: RecommendationMode) -> HashSet<String> {
    match mode {
        RecommendationMode::Album => catalog
            .albums()
            .iter()
            .map(|a| album_key(&a.artist, &a.title))
            .collect(),
        RecommendationMode::ArtistOnly => catalog
            .artists()
            .iter()
            .map(|a| artist_key(&a.name))
            .collect(),
    }
}

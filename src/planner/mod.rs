//! Library-aware prompt planning: deterministic sampling of the catalog
//! into a token-bounded prompt.
//!
//! Determinism contract: identical inputs (catalog fingerprint, request,
//! profile) produce byte-identical prompts. All randomness flows from a
//! stable seed, and every ordering has a total tiebreak.

pub mod budget;
pub mod cache;
pub mod tokenizer;

use std::collections::HashSet;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::catalog::{Album, Artist, Catalog, LibraryProfile};
use crate::config::PlanCacheSettings;
use crate::fingerprint::{fingerprint, stable_hash32};
use crate::metrics::SharedMetrics;
use crate::normalize::{album_key, artist_key};
use crate::provider::parse_model_id;
use crate::types::{DiscoveryMode, RecommendationMode, RequestSpec, SamplingTier};

use budget::{BackendCapability, TokenBudget};
use cache::PlanCache;
use tokenizer::TokenizerRegistry;

/// Library size at or below which the catalog is included directly.
const SMALL_LIBRARY_MAX: usize = 50;
/// Library size above which sampling becomes token-constrained.
const LARGE_LIBRARY_MIN: usize = 200;
/// Direct-include caps for small libraries.
const SMALL_MAX_ARTISTS: usize = 40;
const SMALL_MAX_ALBUMS: usize = 100;
/// Share of the strategic mix drawn from recently-added artists.
const RECENT_SHARE: f64 = 0.30;
/// Iterative appendix caps.
const MAX_REJECTED_IN_PROMPT: usize = 10;
const MAX_COLLECTED_IN_PROMPT: usize = 15;
/// Artist list never shrinks below this during compression.
const COMPRESSION_MIN_ARTISTS: usize = 10;

/// Appendix data for refinement rounds after the first.
#[derive(Debug, Clone, Default)]
pub struct IterativeContext {
    pub iteration: u32,
    pub rejected_total: usize,
    pub rejected_keys: Vec<String>,
    pub collected_artists: Vec<String>,
}

/// A rendered, budgeted prompt plus the statistics the orchestrator
/// reports.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptPlan {
    pub prompt: String,
    /// Stable hash of the selected artist/album identities.
    pub sample_fingerprint: String,
    pub seed: u32,
    pub context_tokens: u32,
    pub target_tokens: u32,
    pub headroom_tokens: u32,
    pub compressed: bool,
    pub trimmed: bool,
    pub sampled_artists: usize,
    pub sampled_albums: usize,
    pub estimated_tokens_pre: u32,
    pub estimated_tokens_post: u32,
}

#[derive(Debug, Clone, Default)]
struct Sample {
    artists: Vec<Artist>,
    albums: Vec<Album>,
}

impl Sample {
    fn fingerprint(&self) -> String {
        let mut identities: Vec<String> = self
            .artists
            .iter()
            .map(|a| artist_key(&a.name))
            .chain(self.albums.iter().map(|a| album_key(&a.artist, &a.title)))
            .collect();
        identities.sort();
        let parts: Vec<&str> = identities.iter().map(String::as_str).collect();
        fingerprint(&parts)
    }
}

pub struct PromptPlanner {
    tokenizers: TokenizerRegistry,
    cache: PlanCache,
    comprehensive_override: Option<u32>,
    metrics: SharedMetrics,
}

impl PromptPlanner {
    pub fn new(
        tokenizers: TokenizerRegistry,
        cache_settings: &PlanCacheSettings,
        comprehensive_override: Option<u32>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            tokenizers,
            cache: PlanCache::new(cache_settings.capacity, cache_settings.ttl()),
            comprehensive_override,
            metrics,
        }
    }

    /// Build (or fetch from cache) the prompt plan for one generator
    /// round.
    pub fn plan(
        &self,
        spec: &RequestSpec,
        profile: &LibraryProfile,
        catalog: &dyn Catalog,
        capability: BackendCapability,
        request_size: usize,
        iterative: Option<&IterativeContext>,
    ) -> PromptPlan {
        let model_key = parse_model_id(&spec.model_id).base;
        let budget = budget::resolve(
            spec.tier,
            capability,
            &model_key,
            self.comprehensive_override,
        );

        let cache_key = self.cache_key(spec, catalog, request_size, iterative);
        if let Some(plan) = self.cache.get(&cache_key, budget.target_tokens) {
            self.metrics.record(
                "prompt.plan_cache_hit",
                1.0,
                &[("backend", &spec.backend_id)],
            );
            return plan;
        }
        self.metrics.record(
            "prompt.plan_cache_hit",
            0.0,
            &[("backend", &spec.backend_id)],
        );

        let seed = self.seed(spec, profile);
        let estimator = self.tokenizers.for_model(&model_key);
        let mut sample = self.select_sample(spec, profile, catalog, &budget, &*estimator, seed);

        let mut include_profile = true;
        let render = |sample: &Sample, include_profile: bool| {
            render_prompt(
                spec,
                profile,
                sample,
                request_size,
                iterative,
                include_profile,
            )
        };

        let mut prompt = render(&sample, include_profile);
        let estimated_pre = estimator.estimate(&prompt);
        let mut estimated = estimated_pre;
        let mut compressed = false;

        // Compression ladder, applied in order until the prompt fits.
        while estimated > budget.target_tokens {
            if sample.albums.len() > SMALL_MAX_ALBUMS / 2 {
                sample.albums.truncate(sample.albums.len() / 2);
            } else if !sample.albums.is_empty() {
                sample.albums.clear();
            } else if sample.artists.len() > COMPRESSION_MIN_ARTISTS {
                let keep = (sample.artists.len() * 3 / 4).max(COMPRESSION_MIN_ARTISTS);
                sample.artists.truncate(keep);
            } else if include_profile {
                include_profile = false;
            } else {
                break;
            }
            compressed = true;
            prompt = render(&sample, include_profile);
            estimated = estimator.estimate(&prompt);
        }
        let trimmed = estimated > budget.target_tokens;

        let plan = PromptPlan {
            sample_fingerprint: sample.fingerprint(),
            seed,
            context_tokens: budget.context_tokens,
            target_tokens: budget.target_tokens,
            headroom_tokens: budget.headroom_tokens,
            compressed,
            trimmed,
            sampled_artists: sample.artists.len(),
            sampled_albums: sample.albums.len(),
            estimated_tokens_pre: estimated_pre,
            estimated_tokens_post: estimated,
            prompt,
        };

        self.metrics.record(
            "prompt.actual_tokens",
            estimated as f64,
            &[("backend", &spec.backend_id)],
        );
        if estimated_pre > 0 {
            self.metrics.record(
                "prompt.compression_ratio",
                estimated as f64 / estimated_pre as f64,
                &[("backend", &spec.backend_id)],
            );
        }

        // Trimmed plans are over budget even after compression; caching
        // one would keep serving a known-bad render.
        if trimmed {
            self.cache.invalidate(&cache_key);
        } else {
            self.cache.insert(&cache_key, plan.clone(), budget.target_tokens);
        }
        plan
    }

    fn cache_key(
        &self,
        spec: &RequestSpec,
        catalog: &dyn Catalog,
        request_size: usize,
        iterative: Option<&IterativeContext>,
    ) -> String {
        let mut parts: Vec<String> = vec![
            catalog.library_fingerprint(),
            spec.backend_id.clone(),
            spec.model_id.clone(),
            spec.discovery.as_str().to_string(),
            spec.tier.as_str().to_string(),
            spec.mode.as_str().to_string(),
            spec.target_count.to_string(),
            request_size.to_string(),
        ];
        parts.extend(spec.sorted_filters());
        if let Some(iter) = iterative {
            parts.push(format!("iter{}", iter.iteration));
            parts.push(iter.rejected_total.to_string());
            let mut rejected = iter.rejected_keys.clone();
            rejected.sort();
            parts.extend(rejected);
        }
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        fingerprint(&refs)
    }

    /// Seed = stable 32-bit hash of the ordered component list.
    fn seed(&self, spec: &RequestSpec, profile: &LibraryProfile) -> u32 {
        let mut parts: Vec<String> = vec![
            spec.backend_id.clone(),
            spec.tier.as_str().to_string(),
            spec.discovery.as_str().to_string(),
            spec.target_count.to_string(),
            spec.mode.as_str().to_string(),
            profile.total_artists.to_string(),
            profile.total_albums.to_string(),
        ];
        let mut signals: Vec<String> = profile
            .top_genres
            .iter()
            .map(|(genre, count)| format!("{genre}:{count}"))
            .collect();
        signals.sort();
        parts.extend(signals);
        parts.extend(spec.sorted_filters());
        let mut recent = profile.recently_added.clone();
        recent.sort();
        parts.extend(recent);
        for (key, value) in &profile.metadata {
            parts.push(format!("{key}={}", value.render()));
        }
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        stable_hash32(&refs)
    }

    fn select_sample(
        &self,
        spec: &RequestSpec,
        profile: &LibraryProfile,
        catalog: &dyn Catalog,
        budget: &TokenBudget,
        estimator: &dyn tokenizer::TokenEstimator,
        seed: u32,
    ) -> Sample {
        let mut artists = catalog.artists();
        artists.sort_by(|a, b| a.name.cmp(&b.name));
        let mut albums = catalog.albums();
        albums.sort_by(|a, b| a.artist.cmp(&b.artist).then_with(|| a.title.cmp(&b.title)));

        let k = artists.len();
        let mut rng = StdRng::seed_from_u64(seed as u64);

        if k <= SMALL_LIBRARY_MAX {
            if artists.len() > SMALL_MAX_ARTISTS {
                artists.shuffle(&mut rng);
                artists.truncate(SMALL_MAX_ARTISTS);
                artists.sort_by(|a, b| a.name.cmp(&b.name));
            }
            if albums.len() > SMALL_MAX_ALBUMS {
                albums.shuffle(&mut rng);
                albums.truncate(SMALL_MAX_ALBUMS);
                albums.sort_by(|a, b| a.artist.cmp(&b.artist).then_with(|| a.title.cmp(&b.title)));
            }
            if spec.mode == RecommendationMode::ArtistOnly {
                albums.clear();
            }
            return Sample { artists, albums };
        }

        if k <= LARGE_LIBRARY_MIN {
            self.strategic_mix(spec, artists, albums, &mut rng)
        } else {
            self.token_constrained_fill(spec, profile, artists, albums, budget, estimator)
        }
    }

    /// 50 < K <= 200: fixed-size mix of top, recent, and random artists.
    fn strategic_mix(
        &self,
        spec: &RequestSpec,
        artists: Vec<Artist>,
        albums: Vec<Album>,
        rng: &mut StdRng,
    ) -> Sample {
        let target = match spec.tier {
            SamplingTier::Minimal => 30,
            SamplingTier::Balanced => 60,
            SamplingTier::Comprehensive => 100,
        }
        .min(artists.len());

        let top_share = match spec.discovery {
            DiscoveryMode::Similar => 0.60,
            DiscoveryMode::Adjacent => 0.40,
            DiscoveryMode::Exploratory => 0.30,
        };

        let mut by_albums = artists.clone();
        by_albums.sort_by(|a, b| {
            b.album_count
                .cmp(&a.album_count)
                .then_with(|| a.name.cmp(&b.name))
        });
        let mut by_recency = artists.clone();
        by_recency.sort_by(|a, b| b.added_at.cmp(&a.added_at).then_with(|| a.name.cmp(&b.name)));

        let n_top = (target as f64 * top_share).round() as usize;
        let n_recent = (target as f64 * RECENT_SHARE).round() as usize;

        let mut selected: Vec<Artist> = Vec::with_capacity(target);
        let mut taken: HashSet<String> = HashSet::new();
        for artist in by_albums.into_iter().take(n_top) {
            if taken.insert(artist_key(&artist.name)) {
                selected.push(artist);
            }
        }
        for artist in by_recency {
            if selected.len() >= n_top + n_recent {
                break;
            }
            if taken.insert(artist_key(&artist.name)) {
                selected.push(artist);
            }
        }
        let mut remainder: Vec<Artist> = artists
            .into_iter()
            .filter(|a| !taken.contains(&artist_key(&a.name)))
            .collect();
        remainder.shuffle(rng);
        for artist in remainder {
            if selected.len() >= target {
                break;
            }
            selected.push(artist);
        }
        selected.sort_by(|a, b| a.name.cmp(&b.name));

        let albums = if spec.mode == RecommendationMode::ArtistOnly {
            Vec::new()
        } else {
            let names: HashSet<String> =
                selected.iter().map(|a| artist_key(&a.name)).collect();
            let mut owned: Vec<Album> = albums
                .into_iter()
                .filter(|album| names.contains(&artist_key(&album.artist)))
                .collect();
            owned.sort_by(|a, b| {
                b.rating
                    .partial_cmp(&a.rating)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.rating_votes.cmp(&a.rating_votes))
                    .then_with(|| a.artist.cmp(&b.artist))
                    .then_with(|| a.title.cmp(&b.title))
            });
            owned.truncate(2 * target);
            owned.sort_by(|a, b| a.artist.cmp(&b.artist).then_with(|| a.title.cmp(&b.title)));
            owned
        };

        Sample {
            artists: selected,
            albums,
        }
    }

    /// K > 200: append items while their estimated cost fits the share
    /// of the budget assigned to each section.
    fn token_constrained_fill(
        &self,
        spec: &RequestSpec,
        profile: &LibraryProfile,
        artists: Vec<Artist>,
        albums: Vec<Album>,
        budget: &TokenBudget,
        estimator: &dyn tokenizer::TokenEstimator,
    ) -> Sample {
        let (artist_share, album_share) = match spec.discovery {
            DiscoveryMode::Similar => (0.70, 0.30),
            DiscoveryMode::Exploratory => (0.40, 0.60),
            DiscoveryMode::Adjacent => (0.60, 0.40),
        };

        // Whatever the fixed sections cost comes off the top; the rest is
        // split between the artist and album lists.
        let empty = Sample::default();
        let fixed = estimator.estimate(&render_prompt(
            spec,
            profile,
            &empty,
            spec.target_count,
            None,
            true,
        ));
        let sample_budget = budget.target_tokens.saturating_sub(fixed);
        let artist_budget = (sample_budget as f64 * artist_share) as u32;
        let album_budget = if spec.mode == RecommendationMode::ArtistOnly {
            0
        } else {
            (sample_budget as f64 * album_share) as u32
        };

        let mut by_albums = artists.clone();
        by_albums.sort_by(|a, b| {
            b.album_count
                .cmp(&a.album_count)
                .then_with(|| a.name.cmp(&b.name))
        });
        let mut by_recency = artists;
        by_recency.sort_by(|a, b| b.added_at.cmp(&a.added_at).then_with(|| a.name.cmp(&b.name)));

        let mut selected_artists: Vec<Artist> = Vec::new();
        let mut taken: HashSet<String> = HashSet::new();
        let mut used: u32 = 0;
        for artist in by_albums.into_iter().chain(by_recency) {
            let key = artist_key(&artist.name);
            if taken.contains(&key) {
                continue;
            }
            let cost = estimator.estimate(&artist_line(&artist));
            if used + cost > artist_budget {
                break;
            }
            used += cost;
            taken.insert(key);
            selected_artists.push(artist);
        }
        selected_artists.sort_by(|a, b| a.name.cmp(&b.name));

        let mut selected_albums: Vec<Album> = Vec::new();
        if album_budget > 0 {
            let mut top_rated = albums.clone();
            top_rated.sort_by(|a, b| {
                b.rating
                    .partial_cmp(&a.rating)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.rating_votes.cmp(&a.rating_votes))
                    .then_with(|| a.artist.cmp(&b.artist))
                    .then_with(|| a.title.cmp(&b.title))
            });
            let mut recent = albums;
            recent.sort_by(|a, b| {
                b.added_at
                    .cmp(&a.added_at)
                    .then_with(|| a.artist.cmp(&b.artist))
                    .then_with(|| a.title.cmp(&b.title))
            });

            // Interleave the two streams, deduplicating on identity.
            let mut seen: HashSet<String> = HashSet::new();
            let mut used_albums: u32 = 0;
            let mut top_iter = top_rated.into_iter();
            let mut recent_iter = recent.into_iter();
            let mut from_top = true;
            loop {
                let next = if from_top {
                    top_iter.next()
                } else {
                    recent_iter.next()
                };
                from_top = !from_top;
                let Some(album) = next else {
                    let rest: Vec<Album> =
                        top_iter.by_ref().chain(recent_iter.by_ref()).collect();
                    for album in rest {
                        if seen.contains(&album_key(&album.artist, &album.title)) {
                            continue;
                        }
                        let cost = estimator.estimate(&album_line(&album));
                        if used_albums + cost > album_budget {
                            break;
                        }
                        used_albums += cost;
                        seen.insert(album_key(&album.artist, &album.title));
                        selected_albums.push(album);
                    }
                    break;
                };
                let key = album_key(&album.artist, &album.title);
                if seen.contains(&key) {
                    continue;
                }
                let cost = estimator.estimate(&album_line(&album));
                if used_albums + cost > album_budget {
                    break;
                }
                used_albums += cost;
                seen.insert(key);
                selected_albums.push(album);
            }
            selected_albums
                .sort_by(|a, b| a.artist.cmp(&b.artist).then_with(|| a.title.cmp(&b.title)));
        }

        Sample {
            artists: selected_artists,
            albums: selected_albums,
        }
    }
}

fn artist_line(artist: &Artist) -> String {
    format!("- {} ({} albums)\n", artist.name, artist.album_count)
}

fn album_line(album: &Album) -> String {
    format!("- {} / {}\n", album.artist, album.title)
}

fn render_prompt(
    spec: &RequestSpec,
    profile: &LibraryProfile,
    sample: &Sample,
    request_size: usize,
    iterative: Option<&IterativeContext>,
    include_profile: bool,
) -> String {
    let mut out = String::with_capacity(4096);

    out.push_str("You are a music discovery assistant for a personal library.\n");
    match spec.mode {
        RecommendationMode::Album => {
            out.push_str(&format!(
                "Recommend exactly {request_size} albums the listener does not own yet.\n"
            ));
        }
        RecommendationMode::ArtistOnly => {
            out.push_str(&format!(
                "Recommend exactly {request_size} artists missing from the library.\n"
            ));
        }
    }

    match spec.discovery {
        DiscoveryMode::Similar => {
            out.push_str("Stay close to the styles the library already contains.\n");
        }
        DiscoveryMode::Adjacent => {
            out.push_str("Lean into neighboring genres and scenes the library touches.\n");
        }
        DiscoveryMode::Exploratory => {
            out.push_str("Range widely: surprising picks are welcome if they connect.\n");
        }
    }

    let filters = spec.sorted_filters();
    if !filters.is_empty() {
        out.push_str("Style constraints: ");
        out.push_str(&filters.join(", "));
        out.push('\n');
    }

    if include_profile {
        out.push_str(&format!(
            "\nLibrary: {} artists, {} albums.\n",
            profile.total_artists, profile.total_albums
        ));
        if !profile.top_genres.is_empty() {
            let genres: Vec<String> = profile
                .top_genres
                .iter()
                .map(|(genre, count)| format!("{genre} ({count})"))
                .collect();
            out.push_str(&format!("Main genres: {}.\n", genres.join(", ")));
        }
    }

    if !sample.artists.is_empty() {
        out.push_str("\nOwned artists:\n");
        for artist in &sample.artists {
            out.push_str(&artist_line(artist));
        }
    }
    if !sample.albums.is_empty() {
        out.push_str("\nOwned albums:\n");
        for album in &sample.albums {
            out.push_str(&album_line(album));
        }
    }

    out.push_str("\nRespond with a JSON array only, no prose. Each element: ");
    match spec.mode {
        RecommendationMode::Album => out.push_str(
            "{\"artist\": string, \"album\": string, \"genre\": string, \
             \"confidence\": number between 0 and 1, \"reason\": string}.\n",
        ),
        RecommendationMode::ArtistOnly => out.push_str(
            "{\"artist\": string, \"genre\": string, \
             \"confidence\": number between 0 and 1, \"reason\": string}.\n",
        ),
    }
    out.push_str("Never repeat anything listed above.\n");

    if let Some(iter) = iterative {
        out.push_str(&format!(
            "\nRefinement round {}: {} earlier suggestions were rejected as \
             duplicates or library hits.\n",
            iter.iteration, iter.rejected_total
        ));
        if !iter.rejected_keys.is_empty() {
            let mut rejected = iter.rejected_keys.clone();
            rejected.sort();
            rejected.truncate(MAX_REJECTED_IN_PROMPT);
            out.push_str("Do not suggest again: ");
            out.push_str(&rejected.join("; "));
            out.push('\n');
        }
        if !iter.collected_artists.is_empty() {
            let mut collected = iter.collected_artists.clone();
            collected.sort();
            collected.truncate(MAX_COLLECTED_IN_PROMPT);
            out.push_str("Already accepted this session: ");
            out.push_str(&collected.join(", "));
            out.push('\n');
        }
        out.push_str("Diversify: vary genres, eras, and labels across the list.\n");
    }

    out
}

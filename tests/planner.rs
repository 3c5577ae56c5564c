//! Planner behavior across library-size bands, discovery modes, and the
//! plan cache, driven through the public API.

mod common;

use std::sync::Arc;

use common::{RecordingMetrics, album, artist};
use digger::catalog::{Catalog, LibraryProfile, MemoryCatalog};
use digger::config::PlanCacheSettings;
use digger::metrics::MetricsSink;
use digger::planner::PromptPlanner;
use digger::planner::budget::BackendCapability;
use digger::planner::tokenizer::TokenizerRegistry;
use digger::types::{DiscoveryMode, RecommendationMode, RequestSpec, SamplingTier};

fn planner() -> PromptPlanner {
    PromptPlanner::new(
        TokenizerRegistry::new(),
        &PlanCacheSettings::default(),
        None,
        digger::metrics::noop(),
    )
}

fn capability() -> BackendCapability {
    BackendCapability {
        context_window: 32_768,
        prompt_ceiling: None,
    }
}

fn spec(discovery: DiscoveryMode, tier: SamplingTier) -> RequestSpec {
    RequestSpec {
        backend_id: "ollama".to_string(),
        model_id: "llama3".to_string(),
        discovery,
        tier,
        target_count: 10,
        mode: RecommendationMode::Album,
        style_filters: vec![],
    }
}

fn mid_catalog(order_reversed: bool) -> MemoryCatalog {
    let mut artists: Vec<_> = (0..120)
        .map(|i| artist(&format!("Artist {i:03}"), (i % 9) as u32, (i % 60) as u32))
        .collect();
    let mut albums: Vec<_> = (0..240)
        .map(|i| album(&format!("Artist {:03}", i % 120), &format!("Album {i:03}"), (i % 60) as u32))
        .collect();
    if order_reversed {
        artists.reverse();
        albums.reverse();
    }
    MemoryCatalog::new(artists, albums)
}

fn big_catalog() -> MemoryCatalog {
    let artists = (0..500)
        .map(|i| artist(&format!("Artist {i:04}"), (i % 20) as u32, (i % 90) as u32))
        .collect();
    let albums = (0..1000)
        .map(|i| {
            album(
                &format!("Artist {:04}", i % 500),
                &format!("Album {i:04}"),
                (i % 90) as u32,
            )
        })
        .collect();
    MemoryCatalog::new(artists, albums)
}

#[tokio::test]
async fn plans_are_stable_under_catalog_insertion_order() {
    let forward = mid_catalog(false);
    let reversed = mid_catalog(true);
    assert_eq!(forward.library_fingerprint(), reversed.library_fingerprint());

    let spec = spec(DiscoveryMode::Similar, SamplingTier::Balanced);
    let profile_a = LibraryProfile::from_catalog(&forward);
    let profile_b = LibraryProfile::from_catalog(&reversed);

    let a = planner().plan(&spec, &profile_a, &forward, capability(), 10, None);
    let b = planner().plan(&spec, &profile_b, &reversed, capability(), 10, None);
    assert_eq!(a.prompt, b.prompt);
    assert_eq!(a.sample_fingerprint, b.sample_fingerprint);
}

#[tokio::test]
async fn discovery_mode_changes_seed_and_prompt() {
    let catalog = mid_catalog(false);
    let profile = LibraryProfile::from_catalog(&catalog);

    let similar = planner().plan(
        &spec(DiscoveryMode::Similar, SamplingTier::Balanced),
        &profile,
        &catalog,
        capability(),
        10,
        None,
    );
    let exploratory = planner().plan(
        &spec(DiscoveryMode::Exploratory, SamplingTier::Balanced),
        &profile,
        &catalog,
        capability(),
        10,
        None,
    );
    assert_ne!(similar.seed, exploratory.seed);
    assert_ne!(similar.prompt, exploratory.prompt);
    assert!(similar.prompt.contains("Stay close"));
    assert!(exploratory.prompt.contains("Range widely"));
}

#[tokio::test]
async fn tier_controls_strategic_mix_size() {
    let catalog = mid_catalog(false);
    let profile = LibraryProfile::from_catalog(&catalog);

    let minimal = planner().plan(
        &spec(DiscoveryMode::Similar, SamplingTier::Minimal),
        &profile,
        &catalog,
        capability(),
        10,
        None,
    );
    let comprehensive = planner().plan(
        &spec(DiscoveryMode::Similar, SamplingTier::Comprehensive),
        &profile,
        &catalog,
        capability(),
        10,
        None,
    );
    assert_eq!(minimal.sampled_artists, 30);
    assert_eq!(comprehensive.sampled_artists, 100);
}

#[tokio::test]
async fn large_band_gives_similar_mode_more_artists_than_exploratory() {
    let catalog = big_catalog();
    let profile = LibraryProfile::from_catalog(&catalog);
    // A window small enough that the 500-artist catalog cannot fit
    // whole, so the mode split actually bites.
    let cap = BackendCapability {
        context_window: 8192,
        prompt_ceiling: None,
    };

    let similar = planner().plan(
        &spec(DiscoveryMode::Similar, SamplingTier::Balanced),
        &profile,
        &catalog,
        cap,
        10,
        None,
    );
    let exploratory = planner().plan(
        &spec(DiscoveryMode::Exploratory, SamplingTier::Balanced),
        &profile,
        &catalog,
        cap,
        10,
        None,
    );
    // Similar splits the sample budget 70/30 artists/albums,
    // exploratory 40/60.
    assert!(similar.sampled_artists > exploratory.sampled_artists);
    assert!(similar.sampled_albums < exploratory.sampled_albums);
    assert!(similar.estimated_tokens_post <= similar.target_tokens);
    assert!(exploratory.estimated_tokens_post <= exploratory.target_tokens);
}

#[tokio::test]
async fn style_filters_render_sorted_and_deduplicated() {
    let catalog = mid_catalog(false);
    let profile = LibraryProfile::from_catalog(&catalog);
    let mut request = spec(DiscoveryMode::Similar, SamplingTier::Balanced);
    request.style_filters = vec![
        "shoegaze".to_string(),
        "ambient".to_string(),
        "shoegaze".to_string(),
    ];

    let plan = planner().plan(&request, &profile, &catalog, capability(), 10, None);
    assert!(plan.prompt.contains("Style constraints: ambient, shoegaze\n"));
}

#[tokio::test]
async fn requested_count_lands_in_the_prompt() {
    let catalog = mid_catalog(false);
    let profile = LibraryProfile::from_catalog(&catalog);
    let plan = planner().plan(
        &spec(DiscoveryMode::Similar, SamplingTier::Balanced),
        &profile,
        &catalog,
        capability(),
        17,
        None,
    );
    assert!(plan.prompt.contains("exactly 17 albums"));
}

#[tokio::test]
async fn cache_hits_are_visible_in_metrics() {
    let metrics = Arc::new(RecordingMetrics::default());
    let planner = PromptPlanner::new(
        TokenizerRegistry::new(),
        &PlanCacheSettings::default(),
        None,
        Arc::clone(&metrics) as Arc<dyn MetricsSink>,
    );
    let catalog = mid_catalog(false);
    let profile = LibraryProfile::from_catalog(&catalog);
    let request = spec(DiscoveryMode::Similar, SamplingTier::Balanced);

    let first = planner.plan(&request, &profile, &catalog, capability(), 10, None);
    let second = planner.plan(&request, &profile, &catalog, capability(), 10, None);
    assert_eq!(first, second);

    let hits: Vec<f64> = metrics
        .events
        .lock()
        .iter()
        .filter(|(name, _, _)| name == "prompt.plan_cache_hit")
        .map(|(_, value, _)| *value)
        .collect();
    assert_eq!(hits, vec![0.0, 1.0]);
}

#[tokio::test]
async fn tight_ceiling_forces_compression() {
    let catalog = mid_catalog(false);
    let profile = LibraryProfile::from_catalog(&catalog);
    let tight = BackendCapability {
        context_window: 32_768,
        prompt_ceiling: Some(200),
    };
    let plan = planner().plan(
        &spec(DiscoveryMode::Similar, SamplingTier::Comprehensive),
        &profile,
        &catalog,
        tight,
        10,
        None,
    );
    assert!(plan.compressed);
    assert!(plan.estimated_tokens_post < plan.estimated_tokens_pre);
}

//! Single-flight coalescing, throttle spacing, and history semantics.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use digger::context::FetchContext;
use digger::flight::{FlightConfig, RecommendationHistory, SingleFlight};
use digger::types::{Recommendation, RecommendationMode};

fn rec(artist: &str, album: &str) -> Recommendation {
    Recommendation {
        artist: artist.to_string(),
        album: album.to_string(),
        genre: "indie".to_string(),
        confidence: 0.8,
        reason: String::new(),
    }
}

fn ctx() -> FetchContext {
    FetchContext::with_timeout(Duration::from_secs(60))
}

fn flight() -> SingleFlight<usize> {
    SingleFlight::new(FlightConfig {
        min_interval: Duration::from_secs(5),
        retention: Duration::from_secs(600),
        cleanup_cadence: Duration::from_secs(60),
    })
}

#[tokio::test(start_paused = true)]
async fn ten_concurrent_callers_share_one_execution() {
    let flight = Arc::new(flight());
    let calls = Arc::new(AtomicUsize::new(0));
    let ctx = ctx();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let flight = Arc::clone(&flight);
        let calls = Arc::clone(&calls);
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            flight
                .run("op", &ctx, async move {
                    // Long enough that all ten callers pile up.
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    calls.fetch_add(1, Ordering::SeqCst) + 1
                })
                .await
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.expect("join"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|&value| value == 1));
}

#[tokio::test(start_paused = true)]
async fn distinct_keys_run_concurrently() {
    let flight = Arc::new(flight());
    let calls = Arc::new(AtomicUsize::new(0));
    let ctx = ctx();

    let a = {
        let flight = Arc::clone(&flight);
        let calls = Arc::clone(&calls);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            flight
                .run("a", &ctx, async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    0
                })
                .await
        })
    };
    let b = {
        let flight = Arc::clone(&flight);
        let calls = Arc::clone(&calls);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            flight
                .run("b", &ctx, async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    0
                })
                .await
        })
    };
    a.await.expect("join a");
    b.await.expect("join b");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn second_run_of_same_key_is_throttled() {
    let flight = flight();
    let ctx = ctx();

    flight.run("op", &ctx, async { 1 }).await;

    let start = tokio::time::Instant::now();
    flight.run("op", &ctx, async { 2 }).await;
    let waited = start.elapsed();
    assert!(
        waited >= Duration::from_millis(4900),
        "expected ~5s throttle, got {waited:?}"
    );

    // A different key is not throttled.
    let start = tokio::time::Instant::now();
    flight.run("other", &ctx, async { 3 }).await;
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn error_results_are_shared_and_next_run_starts_fresh() {
    let flight: SingleFlight<Result<usize, String>> = SingleFlight::new(FlightConfig {
        min_interval: Duration::ZERO,
        retention: Duration::from_secs(600),
        cleanup_cadence: Duration::from_secs(60),
    });
    let ctx = ctx();

    let failed = flight
        .run("op", &ctx, async { Err::<usize, _>("boom".to_string()) })
        .await;
    assert_eq!(failed, Err("boom".to_string()));

    // The failed entry was removed; a new run executes.
    let ok = flight.run("op", &ctx, async { Ok(7) }).await;
    assert_eq!(ok, Ok(7));
    assert_eq!(flight.inflight_len(), 0);
}

#[tokio::test]
async fn dedupe_is_idempotent_and_unique() {
    let history = RecommendationHistory::new(Duration::from_secs(600));
    let items = vec![
        rec("A", "X"),
        rec("a ", "x"),
        rec("B", "Y"),
        rec("", "orphan"),
        rec("C", ""),
    ];

    let deduped = history.dedupe(items, RecommendationMode::Album);
    // "a /x" collapses into "A/X"; empty identities drop.
    assert_eq!(deduped.len(), 2);
    let keys: HashSet<String> = deduped
        .iter()
        .map(|r| r.key(RecommendationMode::Album))
        .collect();
    assert_eq!(keys.len(), deduped.len());

    let again = history.dedupe(deduped.clone(), RecommendationMode::Album);
    assert_eq!(again, deduped);
}

#[tokio::test]
async fn filter_respects_history_and_session_allow() {
    let history = RecommendationHistory::new(Duration::from_secs(600));
    let batch = vec![rec("A", "X"), rec("B", "Y")];
    let deduped = history.dedupe(batch, RecommendationMode::Album);
    let session: HashSet<String> = deduped
        .iter()
        .map(|r| r.key(RecommendationMode::Album))
        .collect();

    // Same fetch: session allowance lets its own items through.
    let kept = history.filter(deduped.clone(), RecommendationMode::Album, &session);
    assert_eq!(kept.len(), 2);

    // A later fetch without the allowance sees them suppressed.
    let suppressed = history.filter(deduped, RecommendationMode::Album, &HashSet::new());
    assert!(suppressed.is_empty());
}

#[tokio::test(start_paused = true)]
async fn history_entries_expire_after_retention() {
    let history = RecommendationHistory::new(Duration::from_secs(600));
    let deduped = history.dedupe(vec![rec("A", "X")], RecommendationMode::Album);
    let key = deduped[0].key(RecommendationMode::Album);
    assert!(history.is_suppressed(&key));

    tokio::time::advance(Duration::from_secs(601)).await;
    assert!(!history.is_suppressed(&key));
    let kept = history.filter(deduped, RecommendationMode::Album, &HashSet::new());
    assert_eq!(kept.len(), 1);
}

#[tokio::test]
async fn clear_empties_history() {
    let history = RecommendationHistory::new(Duration::from_secs(600));
    history.dedupe(vec![rec("A", "X")], RecommendationMode::Album);
    assert_eq!(history.len(), 1);
    history.clear();
    assert!(history.is_empty());
}

#[tokio::test]
async fn artist_mode_keys_do_not_collide_with_album_mode() {
    let history = RecommendationHistory::new(Duration::from_secs(600));
    history.dedupe(vec![rec("A", "X")], RecommendationMode::Album);
    // Artist-mode lookup for the same artist is a different key space.
    let kept = history.filter(
        vec![rec("A", "")],
        RecommendationMode::ArtistOnly,
        &HashSet::new(),
    );
    assert_eq!(kept.len(), 1);
}

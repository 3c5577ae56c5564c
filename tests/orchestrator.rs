//! End-to-end fetches over scripted generators: happy path, coalescing,
//! health gating, history retention, and error propagation rules.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    RecordingMetrics, ScriptedGenerator, Step, owned_catalog, reply_json, settings_with_backend,
    spec,
};
use digger::error::DiggerError;
use digger::health::BackendStatus;
use digger::metrics::MetricsSink;
use digger::orchestrator::Orchestrator;
use digger::provider::Generator;

fn orchestrator_with(
    steps: Vec<Step>,
    min_interval_secs: u64,
) -> (Arc<Orchestrator>, Arc<ScriptedGenerator>, Arc<RecordingMetrics>) {
    common::init_tracing();
    let generator = Arc::new(ScriptedGenerator::new("mock", steps));
    let metrics = Arc::new(RecordingMetrics::default());
    let mut settings = settings_with_backend("mock");
    settings.min_interval_secs = min_interval_secs;
    let orchestrator = Orchestrator::with_generators(
        settings,
        Arc::new(owned_catalog(10)),
        vec![Arc::clone(&generator) as Arc<dyn Generator>],
        Arc::clone(&metrics) as Arc<dyn MetricsSink>,
    )
    .expect("valid settings");
    (Arc::new(orchestrator), generator, metrics)
}

#[tokio::test]
async fn small_library_happy_path() {
    let reply = reply_json(&[("Fresh X", "Y"), ("Fresh A", "B")]);
    let (orchestrator, generator, metrics) = orchestrator_with(vec![Step::Reply(reply)], 0);

    let items = orchestrator.fetch(&spec("mock", 2)).await.expect("fetch");
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].artist, "Fresh X");
    assert_eq!(items[1].artist, "Fresh A");
    assert_eq!(generator.invocation_count(), 1);
    assert_eq!(orchestrator.health_status("mock"), BackendStatus::Healthy);
    assert_eq!(metrics.count("fetch.elapsed_ms"), 1);
    // The fetch model id reached the adapter.
    assert_eq!(generator.model.lock().as_str(), "test-model");
}

#[tokio::test(start_paused = true)]
async fn concurrent_fetches_with_same_key_coalesce() {
    let reply = reply_json(&[("Fresh X", "Y"), ("Fresh A", "B")]);
    let generator = Arc::new(
        ScriptedGenerator::new("mock", vec![Step::Reply(reply)])
            .with_delay(Duration::from_millis(200)),
    );
    let metrics = Arc::new(RecordingMetrics::default());
    let orchestrator = Arc::new(
        Orchestrator::with_generators(
            settings_with_backend("mock"),
            Arc::new(owned_catalog(10)),
            vec![Arc::clone(&generator) as Arc<dyn Generator>],
            Arc::clone(&metrics) as Arc<dyn MetricsSink>,
        )
        .expect("valid settings"),
    );

    let mut handles = Vec::new();
    for _ in 0..10 {
        let orchestrator = Arc::clone(&orchestrator);
        handles.push(tokio::spawn(async move {
            orchestrator.fetch(&spec("mock", 2)).await.expect("fetch")
        }));
    }
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.expect("join"));
    }

    assert_eq!(generator.invocation_count(), 1);
    assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(results[0].len(), 2);
}

#[tokio::test]
async fn unhealthy_backend_short_circuits_fetches() {
    let steps = (0..5)
        .map(|_| Step::Transient("503".to_string()))
        .collect();
    let (orchestrator, generator, metrics) = orchestrator_with(steps, 0);

    for _ in 0..5 {
        let items = orchestrator.fetch(&spec("mock", 3)).await.expect("fetch");
        assert!(items.is_empty());
    }
    assert_eq!(orchestrator.health_status("mock"), BackendStatus::Unhealthy);
    assert_eq!(generator.invocation_count(), 5);

    // Sixth fetch is gated before any generator call.
    let items = orchestrator.fetch(&spec("mock", 3)).await.expect("fetch");
    assert!(items.is_empty());
    assert_eq!(generator.invocation_count(), 5);
    assert!(
        metrics
            .tag_values("fetch.empty_reason", "reason")
            .contains(&"backend_unhealthy".to_string())
    );
}

#[tokio::test]
async fn surfaced_items_are_suppressed_until_cleared() {
    let reply = reply_json(&[("Fresh X", "Y"), ("Fresh A", "B")]);
    let (orchestrator, _, _) = orchestrator_with(vec![Step::Reply(reply)], 0);

    let first = orchestrator.fetch(&spec("mock", 2)).await.expect("fetch");
    assert_eq!(first.len(), 2);

    // Generator repeats itself; everything is already in history.
    let second = orchestrator.fetch(&spec("mock", 2)).await.expect("fetch");
    assert!(second.is_empty());

    orchestrator.clear_history();
    let third = orchestrator.fetch(&spec("mock", 2)).await.expect("fetch");
    assert_eq!(third.len(), 2);
}

#[tokio::test]
async fn owned_albums_never_come_back() {
    // Half the reply is already in the catalog.
    let reply = reply_json(&[
        ("Owned 1", "Record A"),
        ("Owned 2", "Record B"),
        ("Fresh X", "Y"),
        ("Fresh A", "B"),
    ]);
    let (orchestrator, _, _) = orchestrator_with(vec![Step::Reply(reply)], 0);

    let items = orchestrator.fetch(&spec("mock", 4)).await.expect("fetch");
    assert!(items.iter().all(|r| !r.artist.starts_with("Owned")));
    assert!(items.iter().all(|r| (0.0..=1.0).contains(&r.confidence)));
}

#[tokio::test]
async fn invalid_requests_propagate_as_errors() {
    let (orchestrator, _, _) = orchestrator_with(vec![], 0);

    let unknown = orchestrator.fetch(&spec("nope", 2)).await;
    assert!(matches!(unknown, Err(DiggerError::InvalidConfig(_))));

    let zero = orchestrator.fetch(&spec("mock", 0)).await;
    assert!(matches!(zero, Err(DiggerError::InvalidConfig(_))));
}

#[tokio::test]
async fn generator_failure_yields_empty_list_not_error() {
    let (orchestrator, _, metrics) =
        orchestrator_with(vec![Step::Transient("502".to_string())], 0);

    let items = orchestrator.fetch(&spec("mock", 3)).await.expect("fetch");
    assert!(items.is_empty());
    assert!(
        metrics
            .tag_values("fetch.empty_reason", "reason")
            .contains(&"backend_transient".to_string())
    );
}

#[tokio::test]
async fn backend_summaries_expose_status_and_window() {
    let reply = reply_json(&[("Fresh X", "Y")]);
    let (orchestrator, _, _) = orchestrator_with(vec![Step::Reply(reply)], 0);

    let before = orchestrator.backends();
    assert_eq!(before.len(), 1);
    assert_eq!(before[0].id, "mock");
    assert_eq!(before[0].status, BackendStatus::Unknown);
    assert_eq!(before[0].context_window, 8192);

    orchestrator.fetch(&spec("mock", 1)).await.expect("fetch");
    let after = orchestrator.backends();
    assert_eq!(after[0].status, BackendStatus::Healthy);
}

#[tokio::test]
async fn caller_cancellation_returns_empty_not_error() {
    let reply = reply_json(&[("Fresh X", "Y")]);
    let generator = Arc::new(
        ScriptedGenerator::new("mock", vec![Step::Reply(reply)])
            .with_delay(Duration::from_secs(30)),
    );
    let metrics = Arc::new(RecordingMetrics::default());
    let mut settings = settings_with_backend("mock");
    settings.min_interval_secs = 0;
    let orchestrator = Arc::new(
        Orchestrator::with_generators(
            settings,
            Arc::new(owned_catalog(10)),
            vec![Arc::clone(&generator) as Arc<dyn digger::provider::Generator>],
            Arc::clone(&metrics) as Arc<dyn MetricsSink>,
        )
        .expect("valid settings"),
    );

    let caller = tokio_util::sync::CancellationToken::new();
    let fetch = {
        let orchestrator = Arc::clone(&orchestrator);
        let caller = caller.clone();
        tokio::spawn(async move {
            orchestrator
                .fetch_with_token(&spec("mock", 1), &caller)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    caller.cancel();

    let items = fetch.await.expect("join").expect("fetch");
    assert!(items.is_empty());
}

#[test]
fn blocking_edge_runs_a_fetch_to_completion() -> anyhow::Result<()> {
    // The sync host shim owns its own executor; no runtime exists here.
    let reply = reply_json(&[("Fresh X", "Y")]);
    let (orchestrator, _, _) = orchestrator_with(vec![Step::Reply(reply)], 0);
    let items = orchestrator.fetch_blocking(&spec("mock", 1))?;
    assert_eq!(items.len(), 1);
    Ok(())
}

#[tokio::test]
async fn auth_failure_yields_empty_list() {
    let (orchestrator, generator, _) = orchestrator_with(vec![Step::Auth], 0);

    let items = orchestrator.fetch(&spec("mock", 3)).await.expect("fetch");
    assert!(items.is_empty());
    // Auth errors are never retried inside the loop.
    assert_eq!(generator.invocation_count(), 1);
}

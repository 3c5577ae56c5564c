//! Shared fixtures: scripted generators, a recording metrics sink, and
//! catalog builders.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

use digger::catalog::{Album, Artist, MemoryCatalog};
use digger::config::{BackendKind, BackendSettings, Settings};
use digger::context::FetchContext;
use digger::error::DiggerError;
use digger::metrics::MetricsSink;
use digger::planner::budget::BackendCapability;
use digger::provider::{Generator, GeneratorReply};
use digger::types::{DiscoveryMode, RecommendationMode, RequestSpec, SamplingTier};

/// Install a test subscriber once so failing tests print the core's
/// tracing output. Safe to call from every test.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// One scripted generator turn.
pub enum Step {
    Reply(String),
    Transient(String),
    Auth,
    Timeout,
}

/// Generator that replays a fixed script. When the script is exhausted
/// it repeats the last textual reply, so convergence loops keep seeing
/// the same upstream behavior.
pub struct ScriptedGenerator {
    name: String,
    steps: Mutex<VecDeque<Step>>,
    last_reply: Mutex<Option<String>>,
    pub invocations: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
    pub model: Mutex<String>,
    delay: Option<Duration>,
}

impl ScriptedGenerator {
    pub fn new(name: &str, steps: Vec<Step>) -> Self {
        Self {
            name: name.to_string(),
            steps: Mutex::new(steps.into()),
            last_reply: Mutex::new(None),
            invocations: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            model: Mutex::new(String::new()),
            delay: None,
        }
    }

    /// Make every invocation take `delay` of (virtual) time.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> BackendCapability {
        BackendCapability {
            context_window: 8192,
            prompt_ceiling: None,
        }
    }

    fn probe_url(&self) -> String {
        format!("http://127.0.0.1:1/{}", self.name)
    }

    async fn invoke(
        &self,
        prompt: &str,
        ctx: &FetchContext,
    ) -> Result<GeneratorReply, DiggerError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(prompt.to_string());
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancellation().cancelled() => {
                    return Err(DiggerError::Cancelled(delay.as_millis() as u64));
                }
            }
        }

        let step = self.steps.lock().pop_front();
        let text = match step {
            Some(Step::Reply(text)) => {
                *self.last_reply.lock() = Some(text.clone());
                text
            }
            Some(Step::Transient(message)) => {
                return Err(DiggerError::BackendTransient {
                    backend: self.name.clone(),
                    message,
                    status: Some(500),
                });
            }
            Some(Step::Auth) => {
                return Err(DiggerError::BackendAuth {
                    backend: self.name.clone(),
                    message: "401 Unauthorized".to_string(),
                });
            }
            Some(Step::Timeout) => {
                return Err(DiggerError::DeadlineExceeded(1000));
            }
            None => self.last_reply.lock().clone().unwrap_or_default(),
        };

        Ok(GeneratorReply {
            text,
            input_tokens: None,
            output_tokens: None,
            elapsed_ms: 5,
        })
    }

    async fn probe(&self) -> Result<(), DiggerError> {
        Ok(())
    }

    fn update_model(&self, model_id: &str) {
        *self.model.lock() = model_id.to_string();
    }
}

/// One recorded metrics event: name, value, tag pairs.
pub type MetricEvent = (String, f64, Vec<(String, String)>);

/// Metrics sink that records every event for assertions.
#[derive(Default)]
pub struct RecordingMetrics {
    pub events: Mutex<Vec<MetricEvent>>,
}

impl MetricsSink for RecordingMetrics {
    fn record(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.events.lock().push((
            name.to_string(),
            value,
            tags.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ));
    }
}

impl RecordingMetrics {
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|(n, _, _)| n == name).count()
    }

    pub fn tag_values(&self, name: &str, tag: &str) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|(n, _, _)| n == name)
            .flat_map(|(_, _, tags)| {
                tags.iter()
                    .filter(|(k, _)| k == tag)
                    .map(|(_, v)| v.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

pub fn artist(name: &str, album_count: u32, day: u32) -> Artist {
    Artist {
        name: name.to_string(),
        added_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::days(day as i64),
        album_count,
        genres: vec!["indie".to_string()],
    }
}

pub fn album(artist: &str, title: &str, day: u32) -> Album {
    Album {
        artist: artist.to_string(),
        title: title.to_string(),
        added_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::days(day as i64),
        rating: 7.5,
        rating_votes: 40,
        genres: vec!["indie".to_string()],
    }
}

/// Catalog with `n` artists named "Owned N" each owning two albums
/// "Owned N / Record A|B".
pub fn owned_catalog(n: usize) -> MemoryCatalog {
    let artists = (0..n)
        .map(|i| artist(&format!("Owned {i}"), 2, i as u32))
        .collect();
    let albums = (0..n)
        .flat_map(|i| {
            let name = format!("Owned {i}");
            vec![
                album(&name, "Record A", i as u32),
                album(&name, "Record B", i as u32),
            ]
        })
        .collect();
    MemoryCatalog::new(artists, albums)
}

/// Settings with one local backend named `backend_id`.
pub fn settings_with_backend(backend_id: &str) -> Settings {
    Settings {
        backends: vec![BackendSettings {
            id: backend_id.to_string(),
            kind: BackendKind::LocalCompletion,
            base_url: "http://127.0.0.1:11434/api/generate".to_string(),
            credential: None,
            probe_url: None,
            context_window: 8192,
            prompt_ceiling: None,
            timeout_secs: 30,
        }],
        ..Settings::default()
    }
}

pub fn spec(backend_id: &str, target_count: usize) -> RequestSpec {
    RequestSpec {
        backend_id: backend_id.to_string(),
        model_id: "test-model".to_string(),
        discovery: DiscoveryMode::Similar,
        tier: SamplingTier::Balanced,
        target_count,
        mode: RecommendationMode::Album,
        style_filters: vec![],
    }
}

/// JSON array reply of (artist, album) pairs.
pub fn reply_json(items: &[(&str, &str)]) -> String {
    let elements: Vec<String> = items
        .iter()
        .map(|(artist, album)| {
            format!(
                r#"{{"artist":"{artist}","album":"{album}","genre":"indie","confidence":0.9,"reason":"fits"}}"#
            )
        })
        .collect();
    format!("[{}]", elements.join(","))
}

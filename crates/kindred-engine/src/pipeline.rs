use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

use kindred_contracts::cache::{CacheEntry, GenerationCache};
use kindred_contracts::conversation::{collect_context, HostState, DEFAULT_MESSAGE_WINDOW};
use kindred_contracts::events::{EventLog, EventPayload};
use kindred_contracts::features::Feature;
use kindred_contracts::prompt::build_prompt;
use kindred_contracts::recovery::parse_structured;
use kindred_contracts::settings::ApiSettings;

use crate::gateway::{ChatGateway, GatewayError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("a {feature} generation is already running for conversation {conversation}")]
    Busy { feature: &'static str, conversation: String },
    #[error("result discarded: a newer generation already completed")]
    Stale,
    #[error("generation cancelled")]
    Cancelled,
    #[error("failed to persist result: {0}")]
    Storage(String),
}

/// Shared flag a caller flips to abandon an in-progress generation. The
/// pipeline checks it at its own boundaries; it does not abort a request
/// already on the wire.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Skip the cache lookup and always call the model.
    pub force_refresh: bool,
    /// Override for the recent-message window size.
    pub window: Option<usize>,
    pub cancel: Option<CancelToken>,
}

/// What a generation produced, whether it came from cache, and the payload
/// to render.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationReport {
    pub feature: Feature,
    pub conversation_id: String,
    pub data: Value,
    pub fallback: bool,
    pub truncated: bool,
    pub from_cache: bool,
    pub sequence: u64,
}

/// Runs the full generation flow for one feature: context collection,
/// prompt build, the model call, recovery parsing and persistence.
///
/// Concurrency rules:
/// - at most one in-flight generation per `(feature, conversation)`
/// - requests are spaced by `min_request_interval_ms`
/// - a result whose sequence is older than the last completed one for the
///   pair is discarded instead of overwriting the newer payload
pub struct GenerationPipeline {
    gateway: ChatGateway,
    settings: ApiSettings,
    cache: Mutex<GenerationCache>,
    events: EventLog,
    in_flight: Mutex<HashSet<(Feature, String)>>,
    completed: Mutex<HashMap<(Feature, String), u64>>,
    next_sequence: AtomicU64,
    last_request_at: Mutex<Option<Instant>>,
}

impl GenerationPipeline {
    pub fn new(
        gateway: ChatGateway,
        settings: ApiSettings,
        cache: GenerationCache,
        events: EventLog,
    ) -> Self {
        Self {
            gateway,
            settings,
            cache: Mutex::new(cache),
            events,
            in_flight: Mutex::new(HashSet::new()),
            completed: Mutex::new(HashMap::new()),
            next_sequence: AtomicU64::new(1),
            last_request_at: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &ApiSettings {
        &self.settings
    }

    pub fn generate(
        &self,
        state: &HostState,
        feature: Feature,
        conversation_id: &str,
        options: &GenerateOptions,
    ) -> Result<GenerationReport, PipelineError> {
        let window = options.window.unwrap_or(DEFAULT_MESSAGE_WINDOW);
        let snapshot = collect_context(state, conversation_id, window);
        let character = snapshot.character_name.clone();

        if !options.force_refresh {
            let cached = lock(&self.cache).get(feature, conversation_id, &character);
            if let Some(entry) = cached {
                self.emit(
                    "cache_hit",
                    feature,
                    conversation_id,
                    [("sequence", Value::from(entry.sequence))],
                );
                return Ok(GenerationReport {
                    feature,
                    conversation_id: conversation_id.to_string(),
                    data: entry.data,
                    fallback: entry.fallback,
                    truncated: false,
                    from_cache: true,
                    sequence: entry.sequence,
                });
            }
        }

        let _guard = InFlightGuard::acquire(&self.in_flight, feature, conversation_id)?;
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        self.emit(
            "generation_started",
            feature,
            conversation_id,
            [("sequence", Value::from(sequence))],
        );

        self.check_cancelled(options, feature, conversation_id)?;

        let spec = feature.spec();
        let prompt = build_prompt(&snapshot, &spec, Utc::now());
        self.throttle(feature, conversation_id);

        let outcome = match self.gateway.call_chat_completion(&self.settings, &prompt) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.emit(
                    "generation_failed",
                    feature,
                    conversation_id,
                    [
                        ("sequence", Value::from(sequence)),
                        ("error", Value::String(err.to_string())),
                    ],
                );
                return Err(err.into());
            }
        };

        self.check_cancelled(options, feature, conversation_id)?;

        let fallback = feature.fallback_default();
        let recovered = parse_structured(&outcome.text, &spec.shape, &fallback);

        {
            let mut completed = lock(&self.completed);
            let pair = (feature, conversation_id.to_string());
            if completed.get(&pair).is_some_and(|latest| *latest > sequence) {
                self.emit(
                    "generation_discarded",
                    feature,
                    conversation_id,
                    [("sequence", Value::from(sequence))],
                );
                return Err(PipelineError::Stale);
            }
            completed.insert(pair, sequence);
        }

        let entry = CacheEntry::new(
            recovered.value.clone(),
            character,
            recovered.fallback,
            sequence,
        );
        lock(&self.cache)
            .put(feature, conversation_id, &entry)
            .map_err(|err| PipelineError::Storage(err.to_string()))?;

        self.emit(
            "generation_finished",
            feature,
            conversation_id,
            [
                ("sequence", Value::from(sequence)),
                ("fallback", Value::Bool(recovered.fallback)),
                ("truncated", Value::Bool(outcome.truncated)),
            ],
        );

        Ok(GenerationReport {
            feature,
            conversation_id: conversation_id.to_string(),
            data: recovered.value,
            fallback: recovered.fallback,
            truncated: outcome.truncated,
            from_cache: false,
            sequence,
        })
    }

    /// Cached payload for the pair, honoring the character-identity check.
    pub fn load_cached(
        &self,
        feature: Feature,
        conversation_id: &str,
        active_character: &str,
    ) -> Option<CacheEntry> {
        lock(&self.cache).get(feature, conversation_id, active_character)
    }

    pub fn clear_cached(
        &self,
        feature: Feature,
        conversation_id: &str,
    ) -> Result<bool, PipelineError> {
        lock(&self.cache)
            .clear(feature, conversation_id)
            .map_err(|err| PipelineError::Storage(err.to_string()))
    }

    pub fn clear_all_cached(&self) -> Result<usize, PipelineError> {
        lock(&self.cache)
            .clear_all()
            .map_err(|err| PipelineError::Storage(err.to_string()))
    }

    pub fn fetch_models(&self) -> Result<Vec<String>, PipelineError> {
        Ok(self.gateway.fetch_models(&self.settings)?)
    }

    fn check_cancelled(
        &self,
        options: &GenerateOptions,
        feature: Feature,
        conversation_id: &str,
    ) -> Result<(), PipelineError> {
        if options
            .cancel
            .as_ref()
            .is_some_and(CancelToken::is_cancelled)
        {
            self.emit("generation_cancelled", feature, conversation_id, []);
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    /// Spaces model calls by the configured minimum interval.
    fn throttle(&self, feature: Feature, conversation_id: &str) {
        let min_interval = Duration::from_millis(self.settings.min_request_interval_ms);
        let mut last = lock(&self.last_request_at);
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < min_interval {
                let wait = min_interval - elapsed;
                self.emit(
                    "request_throttled",
                    feature,
                    conversation_id,
                    [("wait_ms", Value::from(wait.as_millis() as u64))],
                );
                std::thread::sleep(wait);
            }
        }
        *last = Some(Instant::now());
    }

    // Telemetry is best effort and never fails a generation.
    fn emit<const N: usize>(
        &self,
        event_type: &str,
        feature: Feature,
        conversation_id: &str,
        extra: [(&str, Value); N],
    ) {
        let mut payload = EventPayload::new();
        for (key, value) in extra {
            payload.insert(key.to_string(), value);
        }
        let _ = self
            .events
            .emit_generation(event_type, feature, conversation_id, payload);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks a pair as in flight for the guard's lifetime.
struct InFlightGuard<'a> {
    registry: &'a Mutex<HashSet<(Feature, String)>>,
    pair: (Feature, String),
}

impl<'a> InFlightGuard<'a> {
    fn acquire(
        registry: &'a Mutex<HashSet<(Feature, String)>>,
        feature: Feature,
        conversation_id: &str,
    ) -> Result<Self, PipelineError> {
        let pair = (feature, conversation_id.to_string());
        let mut active = lock(registry);
        if !active.insert(pair.clone()) {
            return Err(PipelineError::Busy {
                feature: feature.key(),
                conversation: conversation_id.to_string(),
            });
        }
        Ok(Self { registry, pair })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        lock(self.registry).remove(&self.pair);
    }
}

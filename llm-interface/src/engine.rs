//! Rate-limited generation engine.
//!
//! Every call to a generative model goes through [`GenerationEngine`]. A call either
//! ends `Succeeded` with a parsed payload or `Exhausted` after `max_retries` attempts;
//! provider errors are classified here and never escape.

use crate::json::strip_code_fences;
use crate::LlmProvider;
use async_trait::async_trait;
use personasim_core::{ErrorExt, GenerationSettings};
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub max_retries: u32,
    /// Slept before every call, including the first.
    pub min_interval: Duration,
    /// Slept between attempts, except after the last one.
    pub retry_backoff: Duration,
    pub quota_backoff_base: Duration,
    /// Added once per attempt index on quota errors.
    pub quota_backoff_step: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_interval: Duration::from_millis(4500),
            retry_backoff: Duration::from_secs(2),
            quota_backoff_base: Duration::from_secs(30),
            quota_backoff_step: Duration::from_secs(10),
        }
    }
}

impl From<&GenerationSettings> for EngineConfig {
    fn from(settings: &GenerationSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            min_interval: settings.min_interval(),
            retry_backoff: settings.retry_backoff(),
            quota_backoff_base: settings.quota_backoff_base(),
            quota_backoff_step: settings.quota_backoff_step(),
        }
    }
}

impl EngineConfig {
    /// Linear escalation: `base + step * attempt_index`.
    pub fn quota_backoff(&self, attempt_index: u32) -> Duration {
        self.quota_backoff_base + self.quota_backoff_step * attempt_index
    }

    /// Rough lower bound on wall-clock time for `calls` successful calls.
    pub fn estimated_duration(&self, calls: usize) -> Duration {
        self.min_interval * calls as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedResponse,
    Quota,
    Provider,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptState {
    pub attempt_count: u32,
    pub last_error_kind: Option<ErrorKind>,
}

#[derive(Debug)]
pub enum GenerationOutcome<T> {
    Succeeded(T, AttemptState),
    Exhausted(AttemptState),
}

impl<T> GenerationOutcome<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            GenerationOutcome::Succeeded(value, _) => Some(value),
            GenerationOutcome::Exhausted(_) => None,
        }
    }

    pub fn state(&self) -> &AttemptState {
        match self {
            GenerationOutcome::Succeeded(_, state) | GenerationOutcome::Exhausted(state) => state,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, GenerationOutcome::Exhausted(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineMetrics {
    pub calls: u64,
    pub successes: u64,
    pub exhaustions: u64,
    pub quota_hits: u64,
    pub malformed_responses: u64,
    pub provider_errors: u64,
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

pub struct GenerationEngine {
    provider: Arc<dyn LlmProvider>,
    config: EngineConfig,
    sleeper: Arc<dyn Sleeper>,
    metrics: Mutex<EngineMetrics>,
}

impl GenerationEngine {
    pub fn new(provider: Arc<dyn LlmProvider>, config: EngineConfig) -> Self {
        Self {
            provider,
            config,
            sleeper: Arc::new(TokioSleeper),
            metrics: Mutex::new(EngineMetrics::default()),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn metrics(&self) -> EngineMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Requests JSON and deserializes it into `T`.
    pub async fn generate_json<T>(&self, label: &str, prompt: &str) -> Option<T>
    where
        T: DeserializeOwned + Send,
    {
        self.generate_with(label, prompt, |text| {
            serde_json::from_str::<T>(text).map_err(|e| e.to_string())
        })
        .await
        .into_value()
    }

    /// Requests JSON and hands the fence-stripped text to `parse`. A parse error counts
    /// as a malformed response and consumes an attempt.
    pub async fn generate_with<T, F>(
        &self,
        label: &str,
        prompt: &str,
        parse: F,
    ) -> GenerationOutcome<T>
    where
        T: Send,
        F: Fn(&str) -> Result<T, String> + Send + Sync,
    {
        let mut state = AttemptState::default();

        for attempt in 0..self.config.max_retries {
            state.attempt_count = attempt + 1;
            if attempt > 0 {
                debug!("Retry attempt {} for {}", attempt + 1, label);
            }

            self.sleeper.sleep(self.config.min_interval).await;
            self.record(|m| m.calls += 1);

            match self.provider.complete(prompt, true).await {
                Ok(raw) => match parse(strip_code_fences(&raw)) {
                    Ok(value) => {
                        self.record(|m| m.successes += 1);
                        if attempt > 0 {
                            info!("{} succeeded after {} attempts", label, attempt + 1);
                        }
                        return GenerationOutcome::Succeeded(value, state);
                    }
                    Err(reason) => {
                        state.last_error_kind = Some(ErrorKind::MalformedResponse);
                        self.record(|m| m.malformed_responses += 1);
                        warn!(
                            label,
                            attempt = attempt + 1,
                            reason = %reason,
                            raw = %raw,
                            "Model returned malformed JSON"
                        );
                    }
                },
                Err(error) if error.is_quota_signature() => {
                    state.last_error_kind = Some(ErrorKind::Quota);
                    self.record(|m| m.quota_hits += 1);
                    let wait = self.config.quota_backoff(attempt);
                    warn!(
                        "Rate limit hit for {} ({}). Waiting {:?}",
                        label, error, wait
                    );
                    self.sleeper.sleep(wait).await;
                }
                Err(error) => {
                    state.last_error_kind = Some(ErrorKind::Provider);
                    self.record(|m| m.provider_errors += 1);
                    warn!(
                        "Error for {} (attempt {}): {}",
                        label,
                        attempt + 1,
                        error.user_friendly_message()
                    );
                    error.log_warn();
                }
            }

            if attempt + 1 < self.config.max_retries {
                self.sleeper.sleep(self.config.retry_backoff).await;
            }
        }

        self.record(|m| m.exhaustions += 1);
        warn!(
            "Failed to generate {} after {} attempts (last error: {:?})",
            label, state.attempt_count, state.last_error_kind
        );
        GenerationOutcome::Exhausted(state)
    }

    fn record(&self, update: impl FnOnce(&mut EngineMetrics)) {
        let mut metrics = self
            .metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        update(&mut metrics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use personasim_core::LlmError;
    use serde::Deserialize;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct RecordingSleeper {
        sleeps: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        fn sleeps(&self) -> Vec<Duration> {
            self.sleeps.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
        }
    }

    /// Replays scripted responses; repeats the last one once the script runs out.
    struct ScriptedProvider {
        script: Mutex<VecDeque<Result<String, LlmError>>>,
        fallback: fn() -> Result<String, LlmError>,
        calls: Mutex<u32>,
    }

    impl ScriptedProvider {
        fn new(
            script: Vec<Result<String, LlmError>>,
            fallback: fn() -> Result<String, LlmError>,
        ) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _prompt: &str, want_json: bool) -> Result<String, LlmError> {
            assert!(want_json);
            *self.calls.lock().unwrap() += 1;
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| (self.fallback)())
        }
    }

    fn quota_error() -> Result<String, LlmError> {
        Err(LlmError::RequestFailed {
            provider: "scripted".to_string(),
            status: 429,
            message: "quota exceeded".to_string(),
        })
    }

    fn server_error() -> Result<String, LlmError> {
        Err(LlmError::ServiceUnavailable {
            provider: "scripted".to_string(),
        })
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Reply {
        author: String,
        content: String,
    }

    fn engine_with(
        provider: Arc<ScriptedProvider>,
        sleeper: Arc<RecordingSleeper>,
    ) -> GenerationEngine {
        GenerationEngine::new(provider, EngineConfig::default()).with_sleeper(sleeper)
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let provider = Arc::new(ScriptedProvider::new(
            vec![Ok(r#"{"author": "a", "content": "b"}"#.to_string())],
            server_error,
        ));
        let sleeper = Arc::new(RecordingSleeper::default());
        let engine = engine_with(provider.clone(), sleeper.clone());

        let reply: Option<Reply> = engine.generate_json("comment", "prompt").await;

        assert_eq!(
            reply,
            Some(Reply {
                author: "a".to_string(),
                content: "b".to_string()
            })
        );
        assert_eq!(provider.calls(), 1);
        // Only the mandatory pre-call interval.
        assert_eq!(sleeper.sleeps(), vec![Duration::from_millis(4500)]);
    }

    #[tokio::test]
    async fn test_quota_errors_escalate_then_succeed() {
        let provider = Arc::new(ScriptedProvider::new(
            vec![
                quota_error(),
                quota_error(),
                Ok("```json\n{\"author\": \"x\", \"content\": \"y\"}\n```".to_string()),
            ],
            server_error,
        ));
        let sleeper = Arc::new(RecordingSleeper::default());
        let engine = engine_with(provider.clone(), sleeper.clone());

        let outcome = engine
            .generate_with("comment", "prompt", |text| {
                serde_json::from_str::<Reply>(text).map_err(|e| e.to_string())
            })
            .await;

        assert_eq!(outcome.state().attempt_count, 3);
        assert_eq!(outcome.state().last_error_kind, Some(ErrorKind::Quota));
        let reply = outcome.into_value().unwrap();
        assert_eq!(reply.content, "y");
        assert_eq!(provider.calls(), 3);

        let sleeps = sleeper.sleeps();
        assert_eq!(
            sleeps,
            vec![
                Duration::from_millis(4500),
                Duration::from_secs(30),
                Duration::from_secs(2),
                Duration::from_millis(4500),
                Duration::from_secs(40),
                Duration::from_secs(2),
                Duration::from_millis(4500),
            ]
        );
        let quota_waits: Vec<Duration> = sleeps
            .into_iter()
            .filter(|d| *d >= Duration::from_secs(30))
            .collect();
        assert!(quota_waits.windows(2).all(|w| w[0] < w[1]));

        let metrics = engine.metrics();
        assert_eq!(metrics.quota_hits, 2);
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.exhaustions, 0);
    }

    #[tokio::test]
    async fn test_never_succeeds_exhausts_after_max_retries() {
        let provider = Arc::new(ScriptedProvider::new(vec![], server_error));
        let sleeper = Arc::new(RecordingSleeper::default());
        let engine = engine_with(provider.clone(), sleeper.clone());

        let outcome = engine
            .generate_with("persona", "prompt", |text| {
                serde_json::from_str::<Reply>(text).map_err(|e| e.to_string())
            })
            .await;

        assert!(outcome.is_exhausted());
        assert_eq!(outcome.state().attempt_count, 3);
        assert_eq!(outcome.state().last_error_kind, Some(ErrorKind::Provider));
        assert_eq!(provider.calls(), 3);

        // No backoff after the final attempt.
        assert_eq!(
            sleeper.sleeps(),
            vec![
                Duration::from_millis(4500),
                Duration::from_secs(2),
                Duration::from_millis(4500),
                Duration::from_secs(2),
                Duration::from_millis(4500),
            ]
        );
        assert_eq!(engine.metrics().exhaustions, 1);
    }

    #[tokio::test]
    async fn test_malformed_json_consumes_attempt() {
        let provider = Arc::new(ScriptedProvider::new(
            vec![
                Ok("Sure! Here is the comment you asked for".to_string()),
                Ok(r#"{"author": "a"}"#.to_string()),
                Ok(r#"{"author": "a", "content": "fixed"}"#.to_string()),
            ],
            server_error,
        ));
        let sleeper = Arc::new(RecordingSleeper::default());
        let engine = engine_with(provider.clone(), sleeper.clone());

        let reply: Option<Reply> = engine.generate_json("comment", "prompt").await;

        assert_eq!(reply.map(|r| r.content), Some("fixed".to_string()));
        assert_eq!(engine.metrics().malformed_responses, 2);
        // Malformed responses get only the ordinary backoff.
        assert!(sleeper
            .sleeps()
            .iter()
            .all(|d| *d < Duration::from_secs(30)));
    }

    #[test]
    fn test_single_retry_budget_has_no_backoff() {
        let provider = Arc::new(ScriptedProvider::new(vec![], quota_error));
        let sleeper = Arc::new(RecordingSleeper::default());
        let config = EngineConfig {
            max_retries: 1,
            ..Default::default()
        };
        let engine = GenerationEngine::new(provider.clone(), config).with_sleeper(sleeper.clone());

        let reply: Option<Reply> =
            tokio_test::block_on(engine.generate_json("comment", "prompt"));

        assert!(reply.is_none());
        assert_eq!(provider.calls(), 1);
        assert_eq!(
            sleeper.sleeps(),
            vec![Duration::from_millis(4500), Duration::from_secs(30)]
        );
    }

    #[test]
    fn test_quota_backoff_is_linear() {
        let config = EngineConfig::default();
        assert_eq!(config.quota_backoff(0), Duration::from_secs(30));
        assert_eq!(config.quota_backoff(1), Duration::from_secs(40));
        assert_eq!(config.quota_backoff(2), Duration::from_secs(50));
        assert_eq!(config.estimated_duration(4), Duration::from_secs(18));
    }
}

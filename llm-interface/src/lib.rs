//! Generative model providers and the rate-limited engine every model call goes through.

use async_trait::async_trait;
use personasim_core::LlmError;

pub mod engine;
pub mod gemini;
pub mod json;
pub mod openai;

pub use engine::{
    AttemptState, EngineConfig, EngineMetrics, ErrorKind, GenerationEngine, GenerationOutcome,
    Sleeper, TokioSleeper,
};
pub use gemini::GeminiProvider;
pub use json::strip_code_fences;
pub use openai::OpenAiCompatibleProvider;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name used in logs and errors.
    fn name(&self) -> &str;

    /// Sends one prompt and returns the raw text of the first completion.
    async fn complete(&self, prompt: &str, want_json: bool) -> Result<String, LlmError>;
}

pub(crate) fn map_transport_error(provider: &str, error: reqwest::Error) -> LlmError {
    if error.is_timeout() {
        LlmError::RequestTimeout {
            provider: provider.to_string(),
        }
    } else {
        LlmError::Transport {
            provider: provider.to_string(),
            // URLs can carry credentials; keep them out of messages and logs.
            message: error.without_url().to_string(),
        }
    }
}

/// Maps a non-success HTTP status to the error taxonomy.
pub(crate) fn classify_status(provider: &str, status: u16, body: String) -> LlmError {
    let lowered = body.to_lowercase();
    match status {
        401 | 403 => LlmError::InvalidApiKey {
            provider: provider.to_string(),
        },
        404 => LlmError::ModelNotAvailable { model: body },
        429 if lowered.contains("quota") => LlmError::QuotaExhausted {
            provider: provider.to_string(),
        },
        429 => LlmError::RateLimitExceeded {
            provider: provider.to_string(),
            message: body,
        },
        503 => LlmError::ServiceUnavailable {
            provider: provider.to_string(),
        },
        _ => LlmError::RequestFailed {
            provider: provider.to_string(),
            status,
            message: body,
        },
    }
}

use async_trait::async_trait;
use llm_interface::{EngineConfig, GenerationEngine, LlmProvider, Sleeper};
use personasim_core::LlmError;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct NoopSleeper;

#[async_trait]
impl Sleeper for NoopSleeper {
    async fn sleep(&self, _duration: Duration) {}
}

/// Answers persona prompts and comment prompts with fixed replies.
pub struct ScriptedProvider {
    persona_reply: String,
    comment_reply: String,
    calls: AtomicU32,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn repeating(reply: &str) -> Arc<Self> {
        Self::routed(reply, reply)
    }

    pub fn routed(persona_reply: &str, comment_reply: &str) -> Arc<Self> {
        Arc::new(Self {
            persona_reply: persona_reply.to_string(),
            comment_reply: comment_reply.to_string(),
            calls: AtomicU32::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, prompt: &str, _want_json: bool) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        if prompt.starts_with("Create persona") {
            Ok(self.persona_reply.clone())
        } else {
            Ok(self.comment_reply.clone())
        }
    }
}

pub fn engine_with(provider: Arc<ScriptedProvider>) -> Arc<GenerationEngine> {
    Arc::new(
        GenerationEngine::new(provider, EngineConfig::default()).with_sleeper(Arc::new(NoopSleeper)),
    )
}

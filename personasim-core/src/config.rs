//! Application configuration.
//!
//! Settings are read from a TOML file where every field has a default, then the
//! environment knobs of a deployment are applied on top. Secrets are never read from
//! the file; they are resolved from environment variables when a client is built.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub corpus: CorpusSettings,
    pub ranking: RankingSettings,
    pub persona: PersonaSettings,
    pub generation: GenerationSettings,
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusSettings {
    pub user_agent: String,
    pub post_limit: u32,
    pub max_comments_per_post: usize,
    pub author_history_limit: usize,
    /// Cap on the history texts kept per author.
    pub author_history_keep: usize,
    pub client_id_env: String,
    pub client_secret_env: String,
}

impl Default for CorpusSettings {
    fn default() -> Self {
        Self {
            user_agent: "personasim/0.1".to_string(),
            post_limit: 200,
            max_comments_per_post: 30,
            author_history_limit: 50,
            author_history_keep: 30,
            client_id_env: "REDDIT_CLIENT_ID".to_string(),
            client_secret_env: "REDDIT_CLIENT_SECRET".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorerSetting {
    Embedding,
    Lexical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackSetting {
    Lexical,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingSettings {
    pub top_k: usize,
    pub scorer: ScorerSetting,
    pub on_embedding_failure: FallbackSetting,
    /// Directory holding `config.json`, `tokenizer.json` and `model.safetensors` of a
    /// sentence-transformer. Without it the hashing embedder is used.
    pub model_dir: Option<PathBuf>,
    pub hashing_dimension: usize,
}

impl Default for RankingSettings {
    fn default() -> Self {
        Self {
            top_k: 10,
            scorer: ScorerSetting::Embedding,
            on_embedding_failure: FallbackSetting::Lexical,
            model_dir: None,
            hashing_dimension: 384,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedMode {
    Author,
    Cluster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaSetting {
    Basic,
    Strict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaSettings {
    pub seed_mode: SeedMode,
    pub schema: SchemaSetting,
    pub num_clusters: usize,
    pub max_sentences: usize,
    pub min_source_texts: usize,
    pub max_personas: usize,
    pub char_budget: usize,
}

impl Default for PersonaSettings {
    fn default() -> Self {
        Self {
            seed_mode: SeedMode::Cluster,
            schema: SchemaSetting::Basic,
            num_clusters: 10,
            max_sentences: 100,
            min_source_texts: 5,
            max_personas: 100,
            char_budget: 2000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderSetting {
    Gemini,
    OpenAi,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub provider: ProviderSetting,
    pub model: String,
    /// Only used by OpenAI-compatible providers.
    pub base_url: Option<String>,
    pub api_key_env: String,
    pub temperature: f32,
    pub max_retries: u32,
    pub min_interval_secs: f64,
    pub retry_backoff_secs: f64,
    pub quota_backoff_base_secs: f64,
    pub quota_backoff_step_secs: f64,
    pub request_timeout_secs: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            provider: ProviderSetting::Gemini,
            model: "gemini-1.5-flash".to_string(),
            base_url: None,
            api_key_env: "GEMINI_API_KEY".to_string(),
            temperature: 1.0,
            max_retries: 3,
            min_interval_secs: 4.5,
            retry_backoff_secs: 2.0,
            quota_backoff_base_secs: 30.0,
            quota_backoff_step_secs: 10.0,
            request_timeout_secs: 120,
        }
    }
}

impl GenerationSettings {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs_f64(self.min_interval_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.retry_backoff_secs)
    }

    pub fn quota_backoff_base(&self) -> Duration {
        Duration::from_secs_f64(self.quota_backoff_base_secs)
    }

    pub fn quota_backoff_step(&self) -> Duration {
        Duration::from_secs_f64(self.quota_backoff_step_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub database_url: String,
    pub backup_dir: PathBuf,
    pub comments_table: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://personasim.db".to_string(),
            backup_dir: PathBuf::from("backups"),
            comments_table: "comments".to_string(),
        }
    }
}

impl AppConfig {
    /// Loads `path` if given, falling back to defaults, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Applies the deployment knobs (`MAX_PERSONAS`, `TOP_SIMILAR_POSTS`, ...).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MAX_PERSONAS") {
            self.persona.max_personas = parse_env("MAX_PERSONAS", &v)?;
        }
        if let Some(v) = lookup("MIN_COMMENTS_FOR_PERSONA") {
            self.persona.min_source_texts = parse_env("MIN_COMMENTS_FOR_PERSONA", &v)?;
        }
        if let Some(v) = lookup("REDDIT_POST_LIMIT") {
            self.corpus.post_limit = parse_env("REDDIT_POST_LIMIT", &v)?;
        }
        if let Some(v) = lookup("TOP_SIMILAR_POSTS") {
            self.ranking.top_k = parse_env("TOP_SIMILAR_POSTS", &v)?;
        }
        if let Some(v) = lookup("REDDIT_USER_AGENT") {
            self.corpus.user_agent = v;
        }
        if let Some(v) = lookup("GEMINI_MODEL_NAME") {
            if self.generation.provider == ProviderSetting::Gemini {
                self.generation.model = v;
            }
        }
        if let Some(v) = lookup("DATABASE_URL") {
            self.storage.database_url = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let g = &self.generation;
        if g.max_retries == 0 {
            return Err(invalid("generation.max_retries", "0"));
        }
        for (field, value) in [
            ("generation.min_interval_secs", g.min_interval_secs),
            ("generation.retry_backoff_secs", g.retry_backoff_secs),
            ("generation.quota_backoff_base_secs", g.quota_backoff_base_secs),
            ("generation.quota_backoff_step_secs", g.quota_backoff_step_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(field, &value.to_string()));
            }
        }
        if self.ranking.top_k == 0 {
            return Err(invalid("ranking.top_k", "0"));
        }
        if self.ranking.hashing_dimension == 0 {
            return Err(invalid("ranking.hashing_dimension", "0"));
        }
        if self.persona.char_budget == 0 {
            return Err(invalid("persona.char_budget", "0"));
        }
        if self.persona.num_clusters == 0 {
            return Err(invalid("persona.num_clusters", "0"));
        }
        if self.storage.comments_table.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "storage.comments_table must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Reads a secret from the environment variable named `var_name`.
pub fn require_secret(var_name: &str) -> Result<String, ConfigError> {
    match std::env::var(var_name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingEnvironmentVariable {
            var_name: var_name.to_string(),
        }),
    }
}

fn parse_env<T: std::str::FromStr>(field: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| invalid(field, value))
}

fn invalid(field: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
}

//! Turns persona seeds into structured personas with one model call each.

use llm_interface::{GenerationEngine, GenerationOutcome};
use personasim_core::{
    CoreError, ErrorExt, Persona, PersonaSeed, PersonaSequence, PersonaSettings, SchemaSetting,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const REGIONS: &[&str] = &["NA", "EU", "EAS", "SEA", "SA", "ME", "AF", "LATAM", "OCE"];
pub const AGE_BANDS: &[&str] = &["teen", "20s", "30s", "40s", "50+", "unknown"];
pub const GENDERS: &[&str] = &["male", "female", "non-binary", "unknown"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersonaSchema {
    /// `{interests, personality_traits, likely_demographics}`
    Basic,
    /// Basic plus enumerated `region`, `age` and `gender`.
    Strict,
}

impl From<SchemaSetting> for PersonaSchema {
    fn from(setting: SchemaSetting) -> Self {
        match setting {
            SchemaSetting::Basic => PersonaSchema::Basic,
            SchemaSetting::Strict => PersonaSchema::Strict,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawPersona {
    interests: Vec<String>,
    #[serde(alias = "traits")]
    personality_traits: Vec<String>,
    #[serde(default)]
    likely_demographics: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    age: Option<String>,
    #[serde(default)]
    gender: Option<String>,
}

/// Validated model output, before an id is assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonaFields {
    pub interests: Vec<String>,
    pub personality_traits: Vec<String>,
    pub demographics: String,
    pub region: Option<String>,
    pub age: Option<String>,
    pub gender: Option<String>,
}

/// Parses and validates a persona object against `schema`. Any error string makes the
/// engine treat the response as malformed.
pub fn parse_persona(text: &str, schema: PersonaSchema) -> Result<PersonaFields, String> {
    let raw: RawPersona = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let interests = dedup_preserving_order(raw.interests);
    let personality_traits = dedup_preserving_order(raw.personality_traits);

    match schema {
        PersonaSchema::Basic => {
            let demographics = raw
                .likely_demographics
                .map(|d| d.trim().to_string())
                .ok_or_else(|| "missing field `likely_demographics`".to_string())?;
            Ok(PersonaFields {
                interests,
                personality_traits,
                demographics,
                region: None,
                age: None,
                gender: None,
            })
        }
        PersonaSchema::Strict => {
            let region = enum_field("region", raw.region, REGIONS)?;
            let age = enum_field("age", raw.age, AGE_BANDS)?;
            let gender = enum_field("gender", raw.gender, GENDERS)?;
            let demographics = match raw.likely_demographics {
                Some(d) if !d.trim().is_empty() => d.trim().to_string(),
                _ => format!("{}, {}, {}", age, gender, region),
            };
            Ok(PersonaFields {
                interests,
                personality_traits,
                demographics,
                region: Some(region),
                age: Some(age),
                gender: Some(gender),
            })
        }
    }
}

fn enum_field(name: &str, value: Option<String>, allowed: &[&str]) -> Result<String, String> {
    let value = value.ok_or_else(|| format!("missing field `{}`", name))?;
    let trimmed = value.trim();
    if allowed.contains(&trimmed) {
        Ok(trimmed.to_string())
    } else {
        Err(format!(
            "`{}` must be one of {}, got '{}'",
            name,
            allowed.join(", "),
            value
        ))
    }
}

fn dedup_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut seen: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        let item = item.trim().to_string();
        if !item.is_empty() && !seen.contains(&item) {
            seen.push(item);
        }
    }
    seen
}

/// Renders seed texts as `- text` lines, cut to `char_budget` characters with `...`
/// appended when anything was dropped.
pub fn build_source_text(texts: &[String], char_budget: usize) -> String {
    let joined = texts
        .iter()
        .map(|t| format!("- {}", t))
        .collect::<Vec<_>>()
        .join("\n");

    if joined.chars().count() > char_budget {
        let mut truncated: String = joined.chars().take(char_budget).collect();
        truncated.push_str("...");
        truncated
    } else {
        joined
    }
}

pub fn persona_prompt(source_text: &str, schema: PersonaSchema) -> String {
    let shape = match schema {
        PersonaSchema::Basic => r#"{
  "interests": ["hobby1", "hobby2"],
  "personality_traits": ["trait1", "trait2"],
  "likely_demographics": "brief desc (<= 50 words)"
}"#
        .to_string(),
        PersonaSchema::Strict => format!(
            r#"{{
  "interests": ["hobby1", "hobby2"],
  "personality_traits": ["trait1", "trait2"],
  "likely_demographics": "brief desc (<= 50 words)",
  "region": "one of: {}",
  "age": "one of: {}",
  "gender": "one of: {}"
}}"#,
            REGIONS.join(", "),
            AGE_BANDS.join(", "),
            GENDERS.join(", ")
        ),
    };

    format!(
        "Create persona from comments. JSON only:\n\n{}\n\nComments:\n{}",
        shape, source_text
    )
}

pub struct PersonaSynthesizer {
    engine: Arc<GenerationEngine>,
    schema: PersonaSchema,
    char_budget: usize,
    min_source_texts: usize,
    max_personas: usize,
}

impl PersonaSynthesizer {
    pub fn new(engine: Arc<GenerationEngine>, settings: &PersonaSettings) -> Self {
        Self {
            engine,
            schema: settings.schema.into(),
            char_budget: settings.char_budget,
            min_source_texts: settings.min_source_texts,
            max_personas: settings.max_personas,
        }
    }

    pub fn max_personas(&self) -> usize {
        self.max_personas
    }

    /// Returns `None` for seeds that are too small (no model call) or when the engine
    /// gives up. Ids are drawn from `sequence` only on success.
    pub async fn synthesize(
        &self,
        seed: &PersonaSeed,
        sequence: &mut PersonaSequence,
    ) -> Option<Persona> {
        if seed.source_texts.len() < self.min_source_texts {
            debug!(
                "Skipping seed {}: {} texts, need {}",
                seed.source_key,
                seed.source_texts.len(),
                self.min_source_texts
            );
            return None;
        }

        let source_text = build_source_text(&seed.source_texts, self.char_budget);
        let prompt = persona_prompt(&source_text, self.schema);
        let label = format!("persona for {}", seed.source_key);
        let schema = self.schema;

        match self
            .engine
            .generate_with(&label, &prompt, |text| parse_persona(text, schema))
            .await
        {
            GenerationOutcome::Succeeded(fields, _) => {
                let persona_id = sequence.next_id();
                info!("Created {} from {}", persona_id, seed.source_key);
                Some(Persona {
                    persona_id,
                    interests: fields.interests,
                    personality_traits: fields.personality_traits,
                    demographics: fields.demographics,
                    region: fields.region,
                    age: fields.age,
                    gender: fields.gender,
                    source_key: seed.source_key.clone(),
                    source_text,
                })
            }
            GenerationOutcome::Exhausted(state) => {
                CoreError::SynthesisFailure {
                    source_key: seed.source_key.to_string(),
                    reason: format!(
                        "no valid persona after {} attempts ({:?})",
                        state.attempt_count, state.last_error_kind
                    ),
                }
                .log_warn();
                None
            }
        }
    }

    /// Synthesizes seeds in order until `max_personas` personas exist.
    pub async fn synthesize_all(
        &self,
        seeds: Vec<PersonaSeed>,
        sequence: &mut PersonaSequence,
    ) -> Vec<Persona> {
        let mut personas = Vec::new();
        let total = seeds.len();

        for (index, seed) in seeds.into_iter().enumerate() {
            if personas.len() >= self.max_personas {
                info!(
                    "Reached {} personas, skipping the remaining {} seeds",
                    self.max_personas,
                    total - index
                );
                break;
            }
            match self.synthesize(&seed, sequence).await {
                Some(persona) => personas.push(persona),
                None => warn!("No persona for {}", seed.source_key),
            }
        }

        info!("Generated {} personas from {} seeds", personas.len(), total);
        personas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{engine_with, ScriptedProvider};
    use personasim_core::SourceKey;

    const BASIC_REPLY: &str = r#"{"interests": ["gaming", "hardware", "gaming"],
        "personality_traits": ["frugal"], "likely_demographics": "college student"}"#;

    fn seed(count: usize) -> PersonaSeed {
        PersonaSeed {
            source_texts: (0..count).map(|i| format!("comment {}", i)).collect(),
            source_key: SourceKey::Cluster(0),
        }
    }

    fn settings() -> PersonaSettings {
        PersonaSettings::default()
    }

    #[test]
    fn test_parse_basic_persona_dedups() {
        let fields = parse_persona(BASIC_REPLY, PersonaSchema::Basic).unwrap();
        assert_eq!(fields.interests, vec!["gaming", "hardware"]);
        assert_eq!(fields.demographics, "college student");
        assert!(fields.region.is_none());
    }

    #[test]
    fn test_parse_rejects_missing_keys() {
        assert!(parse_persona(r#"{"interests": ["x"]}"#, PersonaSchema::Basic).is_err());
        assert!(parse_persona(
            r#"{"interests": ["x"], "personality_traits": []}"#,
            PersonaSchema::Basic
        )
        .is_err());
    }

    #[test]
    fn test_parse_strict_accepts_traits_alias() {
        let fields = parse_persona(
            r#"{"interests": ["cars"], "traits": ["blunt"], "region": "EU", "age": "30s", "gender": "unknown"}"#,
            PersonaSchema::Strict,
        )
        .unwrap();
        assert_eq!(fields.personality_traits, vec!["blunt"]);
        assert_eq!(fields.region.as_deref(), Some("EU"));
        assert_eq!(fields.demographics, "30s, unknown, EU");
    }

    #[test]
    fn test_parse_strict_rejects_out_of_enum_values() {
        let result = parse_persona(
            r#"{"interests": ["cars"], "traits": ["blunt"], "region": "Mars", "age": "30s", "gender": "male"}"#,
            PersonaSchema::Strict,
        );
        assert!(result.unwrap_err().contains("region"));

        // Basic-shaped objects do not satisfy the strict schema.
        assert!(parse_persona(BASIC_REPLY, PersonaSchema::Strict).is_err());
    }

    #[test]
    fn test_source_text_truncation() {
        let texts = vec!["a".repeat(30), "b".repeat(30)];
        let full = build_source_text(&texts, 2000);
        assert!(full.starts_with("- aaa"));
        assert!(full.contains("\n- bbb"));
        assert!(!full.ends_with("..."));

        let cut = build_source_text(&texts, 10);
        assert_eq!(cut, format!("- {}...", "a".repeat(8)));
    }

    #[test]
    fn test_strict_prompt_lists_allowed_values() {
        let prompt = persona_prompt("- hi", PersonaSchema::Strict);
        assert!(prompt.contains("LATAM"));
        assert!(prompt.contains("non-binary"));
        assert!(prompt.ends_with("Comments:\n- hi"));
    }

    #[tokio::test]
    async fn test_small_seed_makes_no_model_call() {
        let provider = ScriptedProvider::repeating(BASIC_REPLY);
        let synthesizer = PersonaSynthesizer::new(engine_with(provider.clone()), &settings());
        let mut sequence = PersonaSequence::new();

        assert!(synthesizer.synthesize(&seed(4), &mut sequence).await.is_none());
        assert_eq!(provider.calls(), 0);
        assert_eq!(sequence.issued(), 0);
    }

    #[tokio::test]
    async fn test_synthesize_assigns_sequential_ids() {
        let provider = ScriptedProvider::repeating(BASIC_REPLY);
        let synthesizer = PersonaSynthesizer::new(engine_with(provider.clone()), &settings());
        let mut sequence = PersonaSequence::new();

        let first = synthesizer.synthesize(&seed(5), &mut sequence).await.unwrap();
        let second = synthesizer.synthesize(&seed(6), &mut sequence).await.unwrap();
        assert_eq!(first.persona_id.to_string(), "persona_1");
        assert_eq!(second.persona_id.to_string(), "persona_2");
        assert_eq!(first.source_key, SourceKey::Cluster(0));
        assert!(first.source_text.starts_with("- comment 0"));
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_malformed_persona_is_dropped_without_id() {
        let provider = ScriptedProvider::repeating(r#"{"interests": ["x"]}"#);
        let synthesizer = PersonaSynthesizer::new(engine_with(provider.clone()), &settings());
        let mut sequence = PersonaSequence::new();

        assert!(synthesizer.synthesize(&seed(5), &mut sequence).await.is_none());
        assert_eq!(provider.calls(), 3);
        assert_eq!(sequence.issued(), 0);
    }

    #[tokio::test]
    async fn test_synthesize_all_respects_cap() {
        let provider = ScriptedProvider::repeating(BASIC_REPLY);
        let settings = PersonaSettings {
            max_personas: 2,
            ..settings()
        };
        let synthesizer = PersonaSynthesizer::new(engine_with(provider.clone()), &settings);
        let mut sequence = PersonaSequence::new();

        let seeds = vec![seed(5), seed(1), seed(5), seed(5), seed(5)];
        let personas = synthesizer.synthesize_all(seeds, &mut sequence).await;

        assert_eq!(personas.len(), 2);
        assert_eq!(provider.calls(), 2);
    }
}

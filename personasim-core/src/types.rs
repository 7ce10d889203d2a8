use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// The submission synthetic replies are generated for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetPost {
    pub id: i64,
    pub title: String,
    pub body: String,
    pub category: String,
    pub flair: Option<String>,
    pub nsfw: bool,
}

impl TargetPost {
    pub fn comparison_text(&self) -> String {
        comparison_text(&self.title, &self.body)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentRecord {
    pub author: String,
    pub body: String,
    pub score: i64,
}

/// A fetched post considered for similarity ranking against the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePost {
    pub id: String,
    pub title: String,
    pub body: String,
    pub score: i64,
    pub flair: Option<String>,
    pub nsfw: bool,
    pub url: String,
    #[serde(default)]
    pub comments: Vec<CommentRecord>,
    /// Only set once the post has been ranked.
    #[serde(default)]
    pub similarity_score: Option<f32>,
}

impl CandidatePost {
    pub fn comparison_text(&self) -> String {
        comparison_text(&self.title, &self.body)
    }
}

fn comparison_text(title: &str, body: &str) -> String {
    if body.trim().is_empty() {
        title.to_string()
    } else {
        format!("{} {}", title, body)
    }
}

/// Where the texts of a persona seed came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SourceKey {
    Author(String),
    Cluster(usize),
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKey::Author(name) => write!(f, "author:{}", name),
            SourceKey::Cluster(id) => write!(f, "cluster:{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersonaSeed {
    pub source_texts: Vec<String>,
    pub source_key: SourceKey,
}

/// Run-local persona identifier, rendered as `persona_<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PersonaId(u32);

impl PersonaId {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PersonaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "persona_{}", self.0)
    }
}

impl From<PersonaId> for String {
    fn from(id: PersonaId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for PersonaId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value
            .strip_prefix("persona_")
            .and_then(|n| n.parse::<u32>().ok())
            .map(PersonaId)
            .ok_or_else(|| format!("invalid persona id: {}", value))
    }
}

/// Hands out dense persona ids starting at `persona_1`.
#[derive(Debug, Default)]
pub struct PersonaSequence {
    issued: u32,
}

impl PersonaSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> PersonaId {
        self.issued += 1;
        PersonaId(self.issued)
    }

    pub fn issued(&self) -> u32 {
        self.issued
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub persona_id: PersonaId,
    pub interests: Vec<String>,
    pub personality_traits: Vec<String>,
    pub demographics: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    pub source_key: SourceKey,
    /// Possibly truncated text the persona was synthesized from.
    pub source_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedComment {
    pub submission_id: i64,
    pub author: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_id: Option<PersonaId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteFailureKind {
    DuplicateKey,
    ForeignKey,
    Other,
}

impl fmt::Display for RemoteFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteFailureKind::DuplicateKey => write!(f, "duplicate key"),
            RemoteFailureKind::ForeignKey => write!(f, "foreign key"),
            RemoteFailureKind::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub kind: RemoteFailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistenceOutcome {
    pub backup_written: bool,
    pub remote_written: bool,
    pub backup_path: Option<PathBuf>,
    pub remote_failure: Option<RemoteFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_personas: usize,
    pub total_comments: usize,
    /// Percentage of personas that received a comment.
    pub success_rate: f64,
}

impl RunSummary {
    pub fn from_counts(total_personas: usize, total_comments: usize) -> Self {
        let success_rate = if total_personas == 0 {
            0.0
        } else {
            total_comments as f64 / total_personas as f64 * 100.0
        };
        Self {
            total_personas,
            total_comments,
            success_rate,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub personas: Vec<Persona>,
    pub comments: Vec<GeneratedComment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence: Option<PersistenceOutcome>,
}

impl PipelineResult {
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self {
            abort_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_reason.is_some()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary::from_counts(self.personas.len(), self.comments.len())
    }

    /// Personas that ended the run without a comment.
    pub fn personas_without_comments(&self) -> Vec<&Persona> {
        self.personas
            .iter()
            .filter(|p| {
                !self
                    .comments
                    .iter()
                    .any(|c| c.persona_id == Some(p.persona_id))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comparison_text_falls_back_to_title() {
        let target = TargetPost {
            id: 1,
            title: "Best budget laptop?".to_string(),
            body: "   ".to_string(),
            category: "pcmasterrace".to_string(),
            flair: None,
            nsfw: false,
        };
        assert_eq!(target.comparison_text(), "Best budget laptop?");
    }

    #[test]
    fn test_persona_sequence_is_dense() {
        let mut seq = PersonaSequence::new();
        assert_eq!(seq.next_id().to_string(), "persona_1");
        assert_eq!(seq.next_id().to_string(), "persona_2");
        assert_eq!(seq.issued(), 2);
    }

    #[test]
    fn test_persona_id_serializes_as_string() {
        let id = PersonaId::new(3);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"persona_3\"");

        let back: PersonaId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<PersonaId>("\"user_3\"").is_err());
    }

    #[test]
    fn test_summary_success_rate() {
        let persona = Persona {
            persona_id: PersonaId::new(1),
            interests: vec!["gaming".to_string()],
            personality_traits: vec![],
            demographics: String::new(),
            region: None,
            age: None,
            gender: None,
            source_key: SourceKey::Cluster(0),
            source_text: String::new(),
        };
        let mut second = persona.clone();
        second.persona_id = PersonaId::new(2);

        let result = PipelineResult {
            personas: vec![persona, second],
            comments: vec![GeneratedComment {
                submission_id: 7,
                author: "a".to_string(),
                content: "b".to_string(),
                persona_id: Some(PersonaId::new(1)),
            }],
            ..Default::default()
        };

        let summary = result.summary();
        assert_eq!(summary.total_personas, 2);
        assert_eq!(summary.success_rate, 50.0);
        let missing = result.personas_without_comments();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].persona_id, PersonaId::new(2));
    }
}

use llm_interface::{GenerationEngine, GenerationOutcome};
use personasim_core::{CoreError, ErrorExt, GeneratedComment, Persona, TargetPost};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

const TITLE_LIMIT: usize = 100;
const BODY_LIMIT: usize = 200;
const PERSONA_DETAIL_LIMIT: usize = 2;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommentReply {
    pub author: String,
    pub content: String,
}

pub fn parse_comment(text: &str) -> Result<CommentReply, String> {
    let reply: CommentReply = serde_json::from_str(text).map_err(|e| e.to_string())?;
    if reply.author.trim().is_empty() {
        return Err("empty `author`".to_string());
    }
    if reply.content.trim().is_empty() {
        return Err("empty `content`".to_string());
    }
    Ok(CommentReply {
        author: reply.author.trim().to_string(),
        content: reply.content.trim().to_string(),
    })
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

pub fn comment_prompt(persona: &Persona, target: &TargetPost) -> String {
    let interests = persona
        .interests
        .iter()
        .take(PERSONA_DETAIL_LIMIT)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    let traits = persona
        .personality_traits
        .iter()
        .take(PERSONA_DETAIL_LIMIT)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "Role-play as the persona: interests [{}], traits [{}]\n\n\
         Write a tailored Reddit comment with distinct writing styles based on the persona for:\n\
         Title: {}\n\
         Content: {}\n\n\
         JSON only: {{\"author\": \"username\", \"content\": \"comment\"}}",
        interests,
        traits,
        truncate_chars(&target.title, TITLE_LIMIT),
        truncate_chars(&target.body, BODY_LIMIT)
    )
}

/// Produces at most one comment per persona through the shared engine.
pub struct CommentGenerator {
    engine: Arc<GenerationEngine>,
}

impl CommentGenerator {
    pub fn new(engine: Arc<GenerationEngine>) -> Self {
        Self { engine }
    }

    pub async fn generate(&self, persona: &Persona, target: &TargetPost) -> Option<GeneratedComment> {
        let prompt = comment_prompt(persona, target);
        let label = format!("comment for {}", persona.persona_id);

        match self.engine.generate_with(&label, &prompt, parse_comment).await {
            GenerationOutcome::Succeeded(reply, _) => {
                info!("Generated comment by {} for {}", reply.author, persona.persona_id);
                Some(GeneratedComment {
                    submission_id: target.id,
                    author: reply.author,
                    content: reply.content,
                    persona_id: Some(persona.persona_id),
                })
            }
            GenerationOutcome::Exhausted(state) => {
                CoreError::GenerationExhausted {
                    persona_id: persona.persona_id.to_string(),
                    attempts: state.attempt_count,
                }
                .log_warn();
                None
            }
        }
    }
}

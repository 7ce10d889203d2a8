use personasim_core::{
    CoreError, GeneratedComment, Persona, PersonaId, PersonaSequence, PipelineResult,
};
use std::collections::HashSet;

/// Collects one run's personas and comments and keeps them consistent: ids come from
/// the owned sequence, and each persona gets at most one comment.
#[derive(Debug)]
pub struct ResultAssembler {
    submission_id: i64,
    sequence: PersonaSequence,
    personas: Vec<Persona>,
    comments: Vec<GeneratedComment>,
    commented: HashSet<PersonaId>,
}

impl ResultAssembler {
    pub fn new(submission_id: i64) -> Self {
        Self {
            submission_id,
            sequence: PersonaSequence::new(),
            personas: Vec::new(),
            comments: Vec::new(),
            commented: HashSet::new(),
        }
    }

    /// Lent to the synthesizer while personas are created.
    pub fn sequence_mut(&mut self) -> &mut PersonaSequence {
        &mut self.sequence
    }

    pub fn personas(&self) -> &[Persona] {
        &self.personas
    }

    pub fn comments(&self) -> &[GeneratedComment] {
        &self.comments
    }

    pub fn add_persona(&mut self, persona: Persona) -> Result<(), CoreError> {
        if persona.persona_id.value() == 0 || persona.persona_id.value() > self.sequence.issued() {
            return Err(invalid(format!(
                "{} was not issued by this run",
                persona.persona_id
            )));
        }
        if self
            .personas
            .iter()
            .any(|p| p.persona_id == persona.persona_id)
        {
            return Err(invalid(format!("{} already added", persona.persona_id)));
        }
        self.personas.push(persona);
        Ok(())
    }

    pub fn add_comment(&mut self, comment: GeneratedComment) -> Result<(), CoreError> {
        let persona_id = comment
            .persona_id
            .ok_or_else(|| invalid("comment has no persona".to_string()))?;
        if comment.submission_id != self.submission_id {
            return Err(invalid(format!(
                "comment targets submission {}, run is for {}",
                comment.submission_id, self.submission_id
            )));
        }
        if !self.personas.iter().any(|p| p.persona_id == persona_id) {
            return Err(invalid(format!("{} is not part of this run", persona_id)));
        }
        if !self.commented.insert(persona_id) {
            return Err(invalid(format!("{} already has a comment", persona_id)));
        }
        self.comments.push(comment);
        Ok(())
    }

    pub fn finish(self) -> PipelineResult {
        PipelineResult {
            personas: self.personas,
            comments: self.comments,
            abort_reason: None,
            persistence: None,
        }
    }
}

fn invalid(message: String) -> CoreError {
    CoreError::InvalidInput { message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use personasim_core::SourceKey;

    fn persona(id: PersonaId) -> Persona {
        Persona {
            persona_id: id,
            interests: vec!["gaming".to_string()],
            personality_traits: vec![],
            demographics: String::new(),
            region: None,
            age: None,
            gender: None,
            source_key: SourceKey::Cluster(0),
            source_text: String::new(),
        }
    }

    fn comment(submission_id: i64, persona_id: Option<PersonaId>) -> GeneratedComment {
        GeneratedComment {
            submission_id,
            author: "someone".to_string(),
            content: "hello".to_string(),
            persona_id,
        }
    }

    #[test]
    fn test_only_issued_ids_are_accepted() {
        let mut assembler = ResultAssembler::new(7);
        assert!(assembler.add_persona(persona(PersonaId::new(1))).is_err());

        let id = assembler.sequence_mut().next_id();
        assembler.add_persona(persona(id)).unwrap();
        assert!(assembler.add_persona(persona(id)).is_err());
        assert_eq!(assembler.personas().len(), 1);
    }

    #[test]
    fn test_one_comment_per_persona() {
        let mut assembler = ResultAssembler::new(7);
        let id = assembler.sequence_mut().next_id();
        assembler.add_persona(persona(id)).unwrap();

        assembler.add_comment(comment(7, Some(id))).unwrap();
        assert!(assembler.add_comment(comment(7, Some(id))).is_err());
        assert_eq!(assembler.comments().len(), 1);
    }

    #[test]
    fn test_rejects_foreign_comments() {
        let mut assembler = ResultAssembler::new(7);
        let id = assembler.sequence_mut().next_id();
        assembler.add_persona(persona(id)).unwrap();

        assert!(assembler.add_comment(comment(7, None)).is_err());
        assert!(assembler.add_comment(comment(8, Some(id))).is_err());
        assert!(assembler
            .add_comment(comment(7, Some(PersonaId::new(2))))
            .is_err());

        let result = assembler.finish();
        assert!(result.comments.is_empty());
        assert_eq!(result.summary().total_personas, 1);
        assert!(!result.is_aborted());
    }
}

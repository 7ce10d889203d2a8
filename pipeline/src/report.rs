use personasim_core::PipelineResult;
use std::fmt::Write;

/// Human-readable listing of every persona, its comment, and the run summary.
pub fn format_results(result: &PipelineResult) -> String {
    let mut out = String::new();
    let rule = "=".repeat(80);

    if let Some(reason) = &result.abort_reason {
        let _ = writeln!(out, "Run aborted: {}", reason);
        return out;
    }

    let _ = writeln!(out, "{}\nGENERATED PERSONAS AND COMMENTS\n{}", rule, rule);
    for comment in &result.comments {
        let persona = comment
            .persona_id
            .and_then(|id| result.personas.iter().find(|p| p.persona_id == id));
        let Some(persona) = persona else {
            continue;
        };
        let _ = writeln!(out, "\nPERSONA: {} ({})", persona.persona_id, persona.source_key);
        let _ = writeln!(out, "   Interests: {}", persona.interests.join(", "));
        let _ = writeln!(out, "   Personality: {}", persona.personality_traits.join(", "));
        let _ = writeln!(out, "   Demographics: {}", persona.demographics);
        let _ = writeln!(out, "COMMENT ({}): {}", comment.author, comment.content);
        let _ = writeln!(out, "{}", "-".repeat(80));
    }

    let missing = result.personas_without_comments();
    if !missing.is_empty() {
        let _ = writeln!(out, "\nPERSONAS WITHOUT COMMENTS: {}", missing.len());
        for persona in missing {
            let _ = writeln!(out, "   - {}", persona.persona_id);
        }
    }

    let summary = result.summary();
    let _ = writeln!(
        out,
        "\nGenerated {} out of {} comments ({:.1}% success)",
        summary.total_comments, summary.total_personas, summary.success_rate
    );

    if let Some(persistence) = &result.persistence {
        if let Some(path) = &persistence.backup_path {
            let _ = writeln!(out, "Backup: {}", path.display());
        }
        match &persistence.remote_failure {
            Some(failure) => {
                let _ = writeln!(out, "Remote write failed ({}): {}", failure.kind, failure.message);
            }
            None if persistence.remote_written => {
                let _ = writeln!(out, "Saved {} comments to the database", result.comments.len());
            }
            None => {}
        }
    }
    out
}

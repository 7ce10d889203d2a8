use crate::backup::BackupWriter;
use crate::DurableStore;
use personasim_core::{
    DatabaseError, ErrorExt, GeneratedComment, Persona, PersistenceOutcome, RemoteFailure,
    RemoteFailureKind,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Writes the local backup first, then the remote store. The backup is the source of
/// truth; remote failures are classified and reported but never retried.
pub struct SafePersister {
    backup: BackupWriter,
    store: Option<Arc<dyn DurableStore>>,
    table: String,
}

impl SafePersister {
    pub fn new(backup: BackupWriter, store: Arc<dyn DurableStore>, table: impl Into<String>) -> Self {
        Self {
            backup,
            store: Some(store),
            table: table.into(),
        }
    }

    /// Writes backups only; used for dry runs.
    pub fn backup_only(backup: BackupWriter) -> Self {
        Self {
            backup,
            store: None,
            table: String::new(),
        }
    }

    pub async fn persist(
        &self,
        submission_id: i64,
        personas: &[Persona],
        comments: &[GeneratedComment],
    ) -> PersistenceOutcome {
        let mut outcome = PersistenceOutcome::default();

        match self.backup.write(submission_id, personas, comments) {
            Ok(path) => {
                outcome.backup_written = true;
                outcome.backup_path = Some(path);
            }
            Err(e) => {
                error!("Failed to write local backup: {}", e);
                e.log_error();
            }
        }

        if comments.is_empty() {
            info!("No comments to save, skipping remote write");
            return outcome;
        }

        let Some(store) = &self.store else {
            info!("No remote store configured, kept {} comments in backup", comments.len());
            return outcome;
        };

        let records = remote_records(comments);
        match store.insert(&self.table, &records).await {
            Ok(()) => {
                outcome.remote_written = true;
                info!(
                    "Successfully saved {} comments to {}",
                    records.len(),
                    self.table
                );
            }
            Err(e) => {
                let failure = classify_remote_failure(&e, submission_id);
                e.log_warn();
                match &outcome.backup_path {
                    Some(path) => error!(
                        "Remote write failed ({}): {}. Comments available in backup: {}",
                        failure.kind,
                        failure.message,
                        path.display()
                    ),
                    None => error!(
                        "Remote write failed ({}): {}. No backup was written either",
                        failure.kind, failure.message
                    ),
                }
                outcome.remote_failure = Some(failure);
            }
        }

        outcome
    }
}

/// Remote rows carry only `submission_id`, `author` and `content`.
pub fn remote_records(comments: &[GeneratedComment]) -> Vec<Value> {
    comments
        .iter()
        .map(|c| {
            json!({
                "submission_id": c.submission_id,
                "author": c.author,
                "content": c.content,
            })
        })
        .collect()
}

pub fn classify_remote_failure(error: &DatabaseError, submission_id: i64) -> RemoteFailure {
    match error {
        DatabaseError::DuplicateKey { detail } => RemoteFailure {
            kind: RemoteFailureKind::DuplicateKey,
            message: format!(
                "comments for submission {} already exist ({}); remove them before re-running",
                submission_id, detail
            ),
        },
        DatabaseError::ForeignKeyViolation { detail } => RemoteFailure {
            kind: RemoteFailureKind::ForeignKey,
            message: format!(
                "submission {} is missing from the submissions table ({})",
                submission_id, detail
            ),
        },
        other => {
            if other.is_retryable() {
                warn!("Remote failure looks transient; not retrying automatically");
            }
            RemoteFailure {
                kind: RemoteFailureKind::Other,
                message: other.to_string(),
            }
        }
    }
}

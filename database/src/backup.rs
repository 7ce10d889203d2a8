use chrono::{DateTime, Utc};
use personasim_core::{CoreError, GeneratedComment, Persona, RunSummary};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Everything a run produced, written locally before any remote write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupDocument {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub submission_id: i64,
    pub summary: RunSummary,
    pub personas: Vec<Persona>,
    pub comments: Vec<GeneratedComment>,
}

#[derive(Debug, Clone)]
pub struct BackupWriter {
    dir: PathBuf,
}

impl BackupWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes the document to a temp file, syncs it, then renames it into place so a
    /// crash never leaves a partial backup behind.
    pub fn write(
        &self,
        submission_id: i64,
        personas: &[Persona],
        comments: &[GeneratedComment],
    ) -> Result<PathBuf, CoreError> {
        let summary = RunSummary::from_counts(personas.len(), comments.len());

        let document = BackupDocument {
            run_id: Uuid::new_v4(),
            created_at: Utc::now(),
            submission_id,
            summary,
            personas: personas.to_vec(),
            comments: comments.to_vec(),
        };

        fs::create_dir_all(&self.dir)?;
        let file_name = format!(
            "run_{}_{}.json",
            document.created_at.format("%Y%m%dT%H%M%SZ"),
            document.run_id.simple()
        );
        let final_path = self.dir.join(&file_name);
        let temp_path = self.dir.join(format!(".{}.tmp", file_name));

        let bytes = serde_json::to_vec_pretty(&document)?;
        write_atomically(&temp_path, &final_path, &bytes)?;

        debug!("Wrote {} bytes to {}", bytes.len(), final_path.display());
        info!(
            "Backup saved: {} ({} personas, {} comments)",
            final_path.display(),
            personas.len(),
            comments.len()
        );
        Ok(final_path)
    }

    pub fn read(path: &Path) -> Result<BackupDocument, CoreError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Write, sync, rename. The temp file is removed whichever step fails.
pub(crate) fn write_atomically(temp_path: &Path, final_path: &Path, bytes: &[u8]) -> io::Result<()> {
    let result = File::create(temp_path)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .and_then(|_| fs::rename(temp_path, final_path));
    if result.is_err() {
        let _ = fs::remove_file(temp_path);
    }
    result
}

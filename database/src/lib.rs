//! Storage: the submissions/comments store, local run backups, and the persister that
//! writes a run to both.

use async_trait::async_trait;
use personasim_core::{CoreError, DatabaseError, TargetPost};

pub mod backup;
pub mod persister;
pub mod store;


pub use backup::{BackupDocument, BackupWriter};
pub use persister::SafePersister;
pub use store::{classify_sqlx_error, NewSubmission, SqliteStore};

/// A table-oriented store that accepts JSON records.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Inserts all records into `table` atomically.
    async fn insert(&self, table: &str, records: &[serde_json::Value]) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait TargetSource: Send + Sync {
    /// The most recently created submission, if any.
    async fn get_latest_target(&self) -> Result<Option<TargetPost>, CoreError>;
}

use crate::{DurableStore, TargetSource};
use async_trait::async_trait;
use personasim_core::{CoreError, DatabaseError, TargetPost};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite};
use std::str::FromStr;
use tracing::{debug, info};

/// Input for a new row in `submissions`; the id is assigned by the database.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubmission {
    pub title: String,
    pub body: String,
    pub category: String,
    pub flair: Option<String>,
    pub nsfw: bool,
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self, DatabaseError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| DatabaseError::ConnectionFailed {
                reason: e.to_string(),
            })?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed {
                reason: e.to_string(),
            })?;

        info!("Connected to database at {}", database_url);
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DatabaseError::MigrationFailed {
                migration: e.to_string(),
            })?;
        debug!("Database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert_target(&self, submission: &NewSubmission) -> Result<TargetPost, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO submissions (subreddit, submission_flair, is_nsfw, title, content)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&submission.category)
        .bind(&submission.flair)
        .bind(submission.nsfw)
        .bind(&submission.title)
        .bind(&submission.body)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        let id = result.last_insert_rowid();
        info!("Stored submission {} for r/{}", id, submission.category);
        Ok(TargetPost {
            id,
            title: submission.title.clone(),
            body: submission.body.clone(),
            category: submission.category.clone(),
            flair: submission.flair.clone(),
            nsfw: submission.nsfw,
        })
    }

    pub async fn count_rows(&self, table: &str) -> Result<i64, DatabaseError> {
        let table = checked_identifier(table, table)?;
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", table))
            .fetch_one(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(row.try_get("n")?)
    }

    async fn insert_records(&self, table: &str, records: &[Value]) -> Result<(), DatabaseError> {
        let table = checked_identifier(table, table)?;
        let mut tx = self.pool.begin().await.map_err(classify_sqlx_error)?;

        for record in records {
            let object = record.as_object().ok_or_else(|| DatabaseError::InvalidRecord {
                table: table.to_string(),
                reason: "record is not a JSON object".to_string(),
            })?;
            let sql = insert_statement(table, object)?;

            let mut query = sqlx::query::<Sqlite>(&sql);
            for value in object.values() {
                query = match value {
                    Value::Null => query.bind(None::<String>),
                    Value::Bool(b) => query.bind(*b),
                    Value::Number(n) if n.is_i64() => query.bind(n.as_i64()),
                    Value::Number(n) => query.bind(n.as_f64()),
                    Value::String(s) => query.bind(s.clone()),
                    other => query.bind(other.to_string()),
                };
            }
            query.execute(&mut *tx).await.map_err(classify_sqlx_error)?;
        }

        tx.commit().await.map_err(classify_sqlx_error)?;
        Ok(())
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn insert(&self, table: &str, records: &[Value]) -> Result<(), DatabaseError> {
        if records.is_empty() {
            return Ok(());
        }
        self.insert_records(table, records).await?;
        info!("Inserted {} records into {}", records.len(), table);
        Ok(())
    }
}

#[async_trait]
impl TargetSource for SqliteStore {
    async fn get_latest_target(&self) -> Result<Option<TargetPost>, CoreError> {
        let row = sqlx::query(
            "SELECT id, subreddit, submission_flair, is_nsfw, title, content
             FROM submissions ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let target = TargetPost {
            id: row.try_get("id").map_err(DatabaseError::from)?,
            category: row.try_get("subreddit").map_err(DatabaseError::from)?,
            flair: row.try_get("submission_flair").map_err(DatabaseError::from)?,
            nsfw: row.try_get("is_nsfw").map_err(DatabaseError::from)?,
            title: row.try_get("title").map_err(DatabaseError::from)?,
            body: row.try_get("content").map_err(DatabaseError::from)?,
        };
        debug!("Latest submission is {} ({})", target.id, target.title);
        Ok(Some(target))
    }
}

/// Builds `INSERT INTO table (k1, k2) VALUES (?, ?)` in the object's key order.
fn insert_statement(table: &str, object: &Map<String, Value>) -> Result<String, DatabaseError> {
    if object.is_empty() {
        return Err(DatabaseError::InvalidRecord {
            table: table.to_string(),
            reason: "record has no columns".to_string(),
        });
    }
    let columns = object
        .keys()
        .map(|k| checked_identifier(table, k))
        .collect::<Result<Vec<_>, _>>()?;
    let placeholders = vec!["?"; columns.len()].join(", ");
    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        placeholders
    ))
}

fn checked_identifier<'a>(table: &str, name: &'a str) -> Result<&'a str, DatabaseError> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(name)
    } else {
        Err(DatabaseError::InvalidRecord {
            table: table.to_string(),
            reason: format!("invalid identifier '{}'", name),
        })
    }
}

/// Maps constraint failures to their dedicated variants.
pub fn classify_sqlx_error(error: sqlx::Error) -> DatabaseError {
    if let sqlx::Error::Database(db_error) = &error {
        let message = db_error.message().to_string();
        let lowered = message.to_lowercase();
        if db_error.is_unique_violation() || lowered.contains("unique constraint") {
            return DatabaseError::DuplicateKey { detail: message };
        }
        if db_error.is_foreign_key_violation() || lowered.contains("foreign key constraint") {
            return DatabaseError::ForeignKeyViolation { detail: message };
        }
        if db_error.is_check_violation() || lowered.contains("constraint failed") {
            return DatabaseError::ConstraintViolation { constraint: message };
        }
        if lowered.contains("database is locked") {
            return DatabaseError::DatabaseLocked;
        }
    }
    DatabaseError::Sql(error)
}

use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use tracing::debug;

use shared::domain::{CounterField, CounterRecord, SessionUser, UserId};

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("user {0:?} does not exist")]
    UnknownUser(UserId),
    #[error("username cannot be empty")]
    EmptyUsername,
    #[error("stored counter field {0:?} is not a valid field name")]
    CorruptField(String),
    #[error("failed to create parent directory '{path}' for database url '{database_url}': {source}")]
    CreateParentDir {
        path: PathBuf,
        database_url: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    /// Registers `username`, or refreshes the profile of an existing user with that name.
    pub async fn create_user(
        &self,
        username: &str,
        display_name: Option<&str>,
        email: Option<&str>,
    ) -> Result<UserId> {
        let username = username.trim();
        if username.is_empty() {
            return Err(StorageError::EmptyUsername);
        }
        let rec = sqlx::query(
            "INSERT INTO users (username, display_name, email, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(username) DO UPDATE SET
                display_name = COALESCE(excluded.display_name, users.display_name),
                email = COALESCE(excluded.email, users.email)
             RETURNING id",
        )
        .bind(username)
        .bind(display_name)
        .bind(email)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn load_user(&self, user_id: UserId) -> Result<Option<SessionUser>> {
        let row = sqlx::query("SELECT id, display_name, email FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| SessionUser {
            user_id: UserId(r.get::<i64, _>(0)),
            display_name: r.get::<Option<String>, _>(1),
            email: r.get::<Option<String>, _>(2),
        }))
    }

    pub async fn load_record(&self, user_id: UserId) -> Result<Option<CounterRecord>> {
        let rows = sqlx::query(
            "SELECT r.user_id, r.updated_at, v.field, v.value
             FROM counter_records r
             LEFT JOIN counter_values v ON v.user_id = r.user_id
             WHERE r.user_id = ?",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        let mut records = group_record_rows(rows)?;
        Ok(records.pop())
    }

    /// Full snapshot of every record, highest `order_by` value first.
    pub async fn list_records(&self, order_by: &CounterField) -> Result<Vec<CounterRecord>> {
        let rows = sqlx::query(
            "SELECT r.user_id, r.updated_at, v.field, v.value
             FROM counter_records r
             LEFT JOIN counter_values o ON o.user_id = r.user_id AND o.field = ?
             LEFT JOIN counter_values v ON v.user_id = r.user_id
             ORDER BY COALESCE(o.value, 0) DESC, r.user_id ASC, v.field ASC",
        )
        .bind(order_by.as_str())
        .fetch_all(&self.pool)
        .await?;
        group_record_rows(rows)
    }

    /// Applies `field += delta` on the user's record, creating the record and the field
    /// on first use. Returns the new value.
    pub async fn atomic_increment(
        &self,
        user_id: UserId,
        field: &CounterField,
        delta: i64,
    ) -> Result<i64> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Must stay the first statement: the transaction holds the write lock from here on.
        let touched = sqlx::query(
            "INSERT INTO counter_records (user_id, created_at, updated_at)
             SELECT id, ?, ? FROM users WHERE id = ?
             ON CONFLICT(user_id) DO UPDATE SET updated_at = excluded.updated_at",
        )
        .bind(now)
        .bind(now)
        .bind(user_id.0)
        .execute(&mut *tx)
        .await?;
        if touched.rows_affected() == 0 {
            return Err(StorageError::UnknownUser(user_id));
        }

        let value: i64 = sqlx::query_scalar(
            "INSERT INTO counter_values (user_id, field, value) VALUES (?, ?, ?)
             ON CONFLICT(user_id, field) DO UPDATE SET value = counter_values.value + excluded.value
             RETURNING value",
        )
        .bind(user_id.0)
        .bind(field.as_str())
        .bind(delta)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(user_id = user_id.0, %field, delta, value, "counter incremented");
        Ok(value)
    }
}

/// Folds `(user_id, updated_at, field?, value?)` rows into records, keeping the row order
/// of each record's first appearance.
fn group_record_rows(rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<CounterRecord>> {
    let mut records: Vec<CounterRecord> = Vec::new();
    for row in rows {
        let user_id = UserId(row.get::<i64, _>(0));
        let updated_at: DateTime<Utc> = row.get(1);
        let field: Option<String> = row.get(2);
        let value: Option<i64> = row.get(3);

        let needs_new = records.last().map(|r| r.user_id) != Some(user_id);
        if needs_new {
            records.push(CounterRecord {
                user_id,
                values: BTreeMap::new(),
                updated_at,
            });
        }
        let Some(record) = records.last_mut() else {
            continue;
        };
        if let (Some(field), Some(value)) = (field, value) {
            let field =
                CounterField::parse(&field).map_err(|_| StorageError::CorruptField(field.clone()))?;
            record.values.insert(field, value);
        }
    }
    Ok(records)
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(parent).map_err(|source| StorageError::CreateParentDir {
        path: parent.to_path_buf(),
        database_url: database_url.to_string(),
        source,
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() || path == ":memory:" {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

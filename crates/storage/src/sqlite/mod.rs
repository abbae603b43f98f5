use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::ResultExt;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tokio::runtime::{Handle, Runtime};

use super::error::{
    CreateDirectorySnafu, InvariantViolationSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu,
    SqliteMigrateSnafu, SqliteQuerySnafu, SqliteRuntimeInitSnafu, StorageError, StorageResult,
};
use super::{KeyValueStore, validate_key};

const IN_MEMORY_DATABASE_URL: &str = "sqlite::memory:";

/// Key-value store persisted in a SQLite `kv_entries` table.
///
/// The pool lives on a dedicated runtime so the sync store calls can block on it from
/// inside any other runtime, and pooled connections outlive a single call.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    database_url: String,
    runtime: Arc<DbRuntime>,
}

#[derive(Debug)]
struct DbRuntime {
    handle: Handle,
    runtime: Option<Runtime>,
}

impl DbRuntime {
    fn new() -> StorageResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("parlor-sqlite")
            .enable_all()
            .build()
            .context(SqliteRuntimeInitSnafu {
                stage: "sqlite-runtime-build",
            })?;
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }
}

impl Drop for DbRuntime {
    fn drop(&mut self) {
        // The last store handle may be dropped inside an async context.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl SqliteStore {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let mut connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(5_000));
        if database_url != IN_MEMORY_DATABASE_URL {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }

        let runtime = Arc::new(DbRuntime::new()?);
        let url = database_url.clone();
        let pool = runtime
            .handle
            .spawn(async move {
                // One connection that never idles out; an in-memory database lives on it.
                let pool = SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(connect_options)
                    .await
                    .context(SqliteConnectSnafu {
                        stage: "sqlite-open-connect",
                        database_url: url,
                    })?;

                sqlx::migrate!("./migrations")
                    .run(&pool)
                    .await
                    .context(SqliteMigrateSnafu {
                        stage: "sqlite-open-migrate",
                    })?;
                Ok::<_, StorageError>(pool)
            })
            .await
            .map_err(|error| {
                InvariantViolationSnafu {
                    stage: "sqlite-open-join",
                    details: error.to_string(),
                }
                .build()
            })??;

        tracing::debug!(database_url = %database_url, "opened sqlite key-value store");
        Ok(Self {
            pool,
            database_url,
            runtime,
        })
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.runtime.handle.spawn(async move {
            let _ = reply_tx.send(op.await);
        });

        match reply_rx.recv() {
            Ok(result) => result,
            Err(_) => InvariantViolationSnafu {
                stage,
                details: format!(
                    "sqlite call on {} ended without a result",
                    self.database_url
                ),
            }
            .fail(),
        }
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        validate_key(key, "sqlite-kv-get")?;
        let pool = self.pool.clone();
        let key = key.to_string();
        self.run_db_call("sqlite-kv-get", async move {
            sqlx::query_scalar::<_, String>("SELECT value FROM kv_entries WHERE key = ?")
                .bind(key)
                .fetch_optional(&pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "sqlite-kv-get-select",
                })
        })
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        validate_key(key, "sqlite-kv-set")?;
        let pool = self.pool.clone();
        let key = key.to_string();
        let value = value.to_string();
        self.run_db_call("sqlite-kv-set", async move {
            sqlx::query(
                "INSERT INTO kv_entries (key, value, updated_at) VALUES (?, ?, ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            )
            .bind(key)
            .bind(value)
            .bind(unix_timestamp_seconds())
            .execute(&pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "sqlite-kv-set-upsert",
            })?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key, "sqlite-kv-delete")?;
        let pool = self.pool.clone();
        let key = key.to_string();
        self.run_db_call("sqlite-kv-delete", async move {
            sqlx::query("DELETE FROM kv_entries WHERE key = ?")
                .bind(key)
                .execute(&pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "sqlite-kv-delete",
                })?;
            Ok(())
        })
    }
}

fn unix_timestamp_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs() as i64)
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return IN_MEMORY_DATABASE_URL.to_string();
    }

    format!("sqlite://{database_location}")
}

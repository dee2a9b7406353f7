//! Database initialization
//!
//! Startup protocol: resolve the storage location, create parent directories,
//! open with WAL journaling and a bounded busy timeout, then apply migrations.
//! Any failure here is fatal to the caller: there is no degraded mode without a store.

use crate::config::{StorageConfig, StorageMode};
use crate::db::migrations::run_migrations;
use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Open message store
///
/// Owns the connection pool. Ephemeral stores delete their files on [`Database::close`].
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    path: PathBuf,
    ephemeral: bool,
}

impl Database {
    /// Open (creating if needed) and migrate the store described by `config`
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        let path = config.resolved_path()?;
        let ephemeral = config.mode == StorageMode::Ephemeral;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if ephemeral {
            // A leftover file from a crashed run with a recycled pid is not ours to replay
            remove_db_files(&path);
        }
        let newly_created = !path.exists();

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(config.busy_timeout());

        let pragmas = Arc::new(config.extra_pragmas()?);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .after_connect(move |conn, _meta| {
                let pragmas = Arc::clone(&pragmas);
                Box::pin(async move {
                    for (key, value) in pragmas.iter() {
                        sqlx::query(&format!("PRAGMA {} = {}", key, value))
                            .execute(&mut *conn)
                            .await?;
                    }
                    Ok(())
                })
            })
            .connect_with(options)
            .await?;

        if newly_created {
            info!("Initialized new database: {}", path.display());
        } else {
            info!("Opened existing database: {}", path.display());
        }

        run_migrations(&pool).await?;

        Ok(Self {
            pool,
            path,
            ephemeral,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Close the pool; ephemeral stores also remove their database files
    pub async fn close(self) -> Result<()> {
        self.pool.close().await;
        if self.ephemeral {
            remove_db_files(&self.path);
            info!("Removed ephemeral database: {}", self.path.display());
        }
        Ok(())
    }
}

/// Remove the database file along with its WAL and shared-memory siblings
fn remove_db_files(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut target = path.as_os_str().to_owned();
        target.push(suffix);
        let target = PathBuf::from(target);
        match std::fs::remove_file(&target) {
            Ok(()) => debug!("Removed {}", target.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", target.display(), e),
        }
    }
}

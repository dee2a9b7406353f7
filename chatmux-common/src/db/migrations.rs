//! Database schema migrations
//!
//! Each migration has a version number, runs inside its own `BEGIN IMMEDIATE`
//! transaction and is recorded in `schema_migrations` when it commits. The write
//! lock is taken up front and the version re-checked under it, so two processes
//! opening the same store at once apply each migration exactly once.
//! Re-running against a migrated store skips every recorded version.
//!
//! # Migration Guidelines
//!
//! 1. **Never modify existing migrations** - stores in the field have already recorded them
//! 2. **Always add new migrations** - append a new entry to [`MIGRATIONS`]
//! 3. **Guard schema changes** - other writers (harvesters writing the same file) may
//!    have created tables or columns first, so use `IF NOT EXISTS` or [`Step::AddColumn`]

use crate::Result;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{info, warn};

/// One schema change inside a migration
enum Step {
    Sql(&'static str),
    /// `ALTER TABLE .. ADD COLUMN`, skipped when the column already exists
    AddColumn {
        table: &'static str,
        column: &'static str,
        definition: &'static str,
    },
}

struct Migration {
    version: i64,
    name: &'static str,
    steps: &'static [Step],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create messages",
        steps: &[
            Step::Sql(
                r#"
                CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY,
                    ts INTEGER NOT NULL,
                    username TEXT NOT NULL DEFAULT '',
                    platform TEXT NOT NULL DEFAULT '',
                    text TEXT NOT NULL DEFAULT '',
                    emotes_json TEXT NOT NULL DEFAULT '[]',
                    raw_json TEXT NOT NULL DEFAULT ''
                )
                "#,
            ),
            // Index entries carry the rowid, so (ts, rowid) scans in both directions use it
            Step::Sql("CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages(ts)"),
        ],
    },
    Migration {
        version: 2,
        name: "create sessions",
        steps: &[
            Step::Sql(
                r#"
                CREATE TABLE IF NOT EXISTS sessions (
                    token TEXT PRIMARY KEY,
                    service TEXT NOT NULL,
                    data_json TEXT NOT NULL DEFAULT '{}',
                    token_expiry INTEGER,
                    updated_at INTEGER NOT NULL
                )
                "#,
            ),
            Step::Sql(
                "CREATE INDEX IF NOT EXISTS idx_sessions_service_updated ON sessions(service, updated_at)",
            ),
        ],
    },
    Migration {
        version: 3,
        name: "add message badges",
        steps: &[Step::AddColumn {
            table: "messages",
            column: "badges_json",
            definition: "TEXT NOT NULL DEFAULT '[]'",
        }],
    },
];

/// Latest schema version known to this build
pub fn latest_version() -> i64 {
    MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0)
}

/// Versions recorded in `schema_migrations`, ascending
pub async fn applied_versions(pool: &SqlitePool) -> Result<Vec<i64>> {
    let versions = sqlx::query_scalar("SELECT version FROM schema_migrations ORDER BY version")
        .fetch_all(pool)
        .await?;
    Ok(versions)
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER))
        )
        "#,
    )
    .execute(pool)
    .await?;

    let applied = applied_versions(pool).await?;
    let latest = latest_version();

    if let Some(&newest) = applied.last() {
        if newest > latest {
            warn!(
                "Database schema version ({}) is newer than code version ({})",
                newest, latest
            );
            warn!("This may indicate a downgrade. Proceeding with caution.");
        }
    }

    let pending: Vec<&Migration> = MIGRATIONS
        .iter()
        .filter(|m| !applied.contains(&m.version))
        .collect();

    if pending.is_empty() {
        info!("Database schema is up to date (v{})", latest);
        return Ok(());
    }

    for migration in pending {
        if apply(pool, migration).await? {
            info!("✓ Migration v{} ({}) completed", migration.version, migration.name);
        } else {
            info!("Migration v{} already applied by another process", migration.version);
        }
    }

    Ok(())
}

/// Apply one migration; `false` if it was already recorded
async fn apply(pool: &SqlitePool, migration: &Migration) -> Result<bool> {
    let mut conn = pool.acquire().await?;

    // Deferred transactions fail with SQLITE_BUSY on the read-to-write upgrade
    // instead of waiting out the busy timeout
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

    let outcome = match apply_locked(&mut conn, migration).await {
        Ok(applied) => sqlx::query("COMMIT")
            .execute(&mut *conn)
            .await
            .map(|_| applied)
            .map_err(Into::into),
        Err(e) => Err(e),
    };

    if outcome.is_err() {
        if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
            warn!("Rollback of migration v{} failed: {}", migration.version, e);
        }
    }
    outcome
}

async fn apply_locked(conn: &mut SqliteConnection, migration: &Migration) -> Result<bool> {
    let recorded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations WHERE version = ?")
        .bind(migration.version)
        .fetch_one(&mut *conn)
        .await?;
    if recorded > 0 {
        return Ok(false);
    }

    for step in migration.steps {
        match step {
            Step::Sql(sql) => {
                sqlx::query(sql).execute(&mut *conn).await?;
            }
            Step::AddColumn {
                table,
                column,
                definition,
            } => {
                if column_exists(conn, table, column).await? {
                    info!(
                        "Migration v{}: {}.{} already present, skipping",
                        migration.version, table, column
                    );
                    continue;
                }
                let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, definition);
                sqlx::query(&sql).execute(&mut *conn).await?;
            }
        }
    }

    sqlx::query("INSERT OR IGNORE INTO schema_migrations (version) VALUES (?)")
        .bind(migration.version)
        .execute(&mut *conn)
        .await?;
    Ok(true)
}

async fn column_exists(conn: &mut SqliteConnection, table: &str, column: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?",
    )
    .bind(table)
    .bind(column)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        // One connection: every pooled connection to :memory: would be a separate database
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    async fn column_names(pool: &SqlitePool, table: &str) -> Vec<String> {
        sqlx::query_scalar("SELECT name FROM pragma_table_info(?)")
            .bind(table)
            .fetch_all(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_database_reaches_latest_version() {
        let pool = memory_pool().await;

        run_migrations(&pool).await.unwrap();

        let applied = applied_versions(&pool).await.unwrap();
        assert_eq!(applied, vec![1, 2, 3]);
        assert_eq!(latest_version(), 3);

        let columns = column_names(&pool, "messages").await;
        for expected in ["id", "ts", "username", "platform", "text", "emotes_json", "badges_json", "raw_json"] {
            assert!(columns.iter().any(|c| c == expected), "missing column {}", expected);
        }
        let sessions = column_names(&pool, "sessions").await;
        assert!(sessions.iter().any(|c| c == "token_expiry"));
    }

    #[tokio::test]
    async fn test_rerun_is_noop() {
        let pool = memory_pool().await;

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn test_add_column_tolerates_existing_column() {
        let pool = memory_pool().await;

        // Another writer created the current schema without recording migrations
        sqlx::query(
            r#"
            CREATE TABLE messages (
                id TEXT PRIMARY KEY,
                ts INTEGER NOT NULL,
                username TEXT NOT NULL DEFAULT '',
                platform TEXT NOT NULL DEFAULT '',
                text TEXT NOT NULL DEFAULT '',
                emotes_json TEXT NOT NULL DEFAULT '[]',
                badges_json TEXT NOT NULL DEFAULT '[]',
                raw_json TEXT NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO messages (id, ts) VALUES ('keep-me', 1)")
            .execute(&pool)
            .await
            .unwrap();

        run_migrations(&pool).await.unwrap();

        assert_eq!(applied_versions(&pool).await.unwrap(), vec![1, 2, 3]);
        let kept: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE id = 'keep-me'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(kept, 1);
    }

    #[tokio::test]
    async fn test_partial_history_applies_only_missing() {
        let pool = memory_pool().await;

        sqlx::query(
            "CREATE TABLE schema_migrations (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL DEFAULT 0)",
        )
        .execute(&pool)
        .await
        .unwrap();
        assert!(apply(&pool, &MIGRATIONS[0]).await.unwrap());
        assert!(!apply(&pool, &MIGRATIONS[0]).await.unwrap());

        let columns = column_names(&pool, "messages").await;
        assert!(!columns.iter().any(|c| c == "badges_json"));

        run_migrations(&pool).await.unwrap();

        assert_eq!(applied_versions(&pool).await.unwrap(), vec![1, 2, 3]);
        let columns = column_names(&pool, "messages").await;
        assert!(columns.iter().any(|c| c == "badges_json"));
    }
}

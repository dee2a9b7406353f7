//! Session storage
//!
//! Durable token → session blob with an optional expiry. Used by auth layers that
//! sit in front of the relay; the relay itself only keeps the table healthy.

use crate::db::models::{from_millis, Session};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

/// Insert or replace a session, stamping `updated_at` with the current time
pub async fn upsert_session(
    pool: &SqlitePool,
    token: &str,
    service: &str,
    data_json: &str,
    token_expiry: Option<DateTime<Utc>>,
) -> Result<Session> {
    if token.is_empty() {
        return Err(Error::InvalidInput("session token must not be empty".to_string()));
    }

    let updated_at = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO sessions (token, service, data_json, token_expiry, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(token) DO UPDATE SET
            service = excluded.service,
            data_json = excluded.data_json,
            token_expiry = excluded.token_expiry,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(token)
    .bind(service)
    .bind(data_json)
    .bind(token_expiry.map(|t| t.timestamp_millis()))
    .bind(updated_at.timestamp_millis())
    .execute(pool)
    .await?;

    get_session(pool, token).await
}

/// Fetch a session by token
pub async fn get_session(pool: &SqlitePool, token: &str) -> Result<Session> {
    let row = sqlx::query(
        "SELECT token, service, data_json, token_expiry, updated_at FROM sessions WHERE token = ?",
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => row_to_session(&row),
        None => Err(Error::NotFound(format!("session {}", token))),
    }
}

/// Delete a session; deleting an unknown token is not an error
pub async fn delete_session(pool: &SqlitePool, token: &str) -> Result<()> {
    sqlx::query("DELETE FROM sessions WHERE token = ?")
        .bind(token)
        .execute(pool)
        .await?;
    Ok(())
}

/// Most recently updated session for one service
pub async fn latest_session_by_service(pool: &SqlitePool, service: &str) -> Result<Option<Session>> {
    let row = sqlx::query(
        r#"
        SELECT token, service, data_json, token_expiry, updated_at
        FROM sessions WHERE service = ?
        ORDER BY updated_at DESC, rowid DESC LIMIT 1
        "#,
    )
    .bind(service)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_session).transpose()
}

/// Most recently updated session across all services
pub async fn latest_session(pool: &SqlitePool) -> Result<Option<Session>> {
    let row = sqlx::query(
        r#"
        SELECT token, service, data_json, token_expiry, updated_at
        FROM sessions ORDER BY updated_at DESC, rowid DESC LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_session).transpose()
}

/// Delete sessions whose expiry is at or before `now`
pub async fn purge_expired_sessions(pool: &SqlitePool, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE token_expiry IS NOT NULL AND token_expiry <= ?")
        .bind(now.timestamp_millis())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

fn row_to_session(row: &SqliteRow) -> Result<Session> {
    let expiry: Option<i64> = row.try_get("token_expiry")?;
    Ok(Session {
        token: row.try_get("token")?,
        service: row.try_get("service")?,
        data_json: row.try_get("data_json")?,
        token_expiry: expiry.map(from_millis).transpose()?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

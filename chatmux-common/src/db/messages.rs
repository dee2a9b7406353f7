//! Message log queries
//!
//! Rows are append-only; only the explicit purge operations delete. Scan order is
//! always `(ts, rowid)`, with SQLite's rowid acting as the engine-assigned row sequence.

use crate::db::models::{from_millis, RecentQuery, StoredMessage, TailBatch, TailPosition};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

const MESSAGE_COLUMNS: &str =
    "rowid AS row_seq, id, ts, username, platform, text, emotes_json, badges_json, raw_json";

/// Insert one message
pub async fn insert_message(pool: &SqlitePool, message: &StoredMessage) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO messages (id, ts, username, platform, text, emotes_json, badges_json, raw_json)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&message.id)
    .bind(message.ts_millis())
    .bind(&message.username)
    .bind(&message.platform)
    .bind(&message.text)
    .bind(&message.emotes_json)
    .bind(&message.badges_json)
    .bind(&message.raw_json)
    .execute(pool)
    .await?;

    Ok(())
}

/// Most recent messages, newest first
///
/// `since` and `before` cannot be combined, and a negative limit is rejected.
pub async fn get_recent(pool: &SqlitePool, query: &RecentQuery) -> Result<Vec<StoredMessage>> {
    if query.limit < 0 {
        return Err(Error::InvalidInput(format!("limit must not be negative (got {})", query.limit)));
    }

    let (filter, bound) = match (query.since, query.before) {
        (Some(_), Some(_)) => {
            return Err(Error::InvalidInput(
                "since and before are mutually exclusive".to_string(),
            ))
        }
        (Some(since), None) => (" WHERE ts >= ?", Some(since.timestamp_millis())),
        (None, Some(before)) => (" WHERE ts < ?", Some(before.timestamp_millis())),
        (None, None) => ("", None),
    };

    let mut sql = format!("SELECT {} FROM messages{} ORDER BY ts DESC, rowid DESC", MESSAGE_COLUMNS, filter);
    if query.limit > 0 {
        sql.push_str(" LIMIT ?");
    }

    let mut q = sqlx::query(&sql);
    if let Some(ms) = bound {
        q = q.bind(ms);
    }
    if query.limit > 0 {
        q = q.bind(query.limit);
    }

    let rows = q.fetch_all(pool).await?;
    rows.iter().map(|row| row_to_message(row).map(|(_, m)| m)).collect()
}

/// Position of the newest row, or `(0, 0)` for an empty store
pub async fn tail_head(pool: &SqlitePool) -> Result<TailPosition> {
    let row = sqlx::query("SELECT ts, rowid AS row_seq FROM messages ORDER BY ts DESC, rowid DESC LIMIT 1")
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => Ok(TailPosition::new(row.try_get("ts")?, row.try_get("row_seq")?)),
        None => Ok(TailPosition::default()),
    }
}

/// Up to `limit` rows strictly after `after`, ascending by `(ts, rowid)`
///
/// The returned cursor is the last row's position, or `after` unchanged when
/// nothing new exists.
pub async fn tail_next(pool: &SqlitePool, after: TailPosition, limit: i64) -> Result<TailBatch> {
    if limit <= 0 {
        return Err(Error::InvalidInput(format!("tail batch limit must be positive (got {})", limit)));
    }

    let sql = format!(
        "SELECT {} FROM messages WHERE ts > ? OR (ts = ? AND rowid > ?) ORDER BY ts ASC, rowid ASC LIMIT ?",
        MESSAGE_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(after.ts)
        .bind(after.ts)
        .bind(after.row_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    let mut batch = TailBatch {
        messages: Vec::with_capacity(rows.len()),
        last: after,
    };
    for row in &rows {
        let (position, message) = row_to_message(row)?;
        batch.last = position;
        batch.messages.push(message);
    }

    debug!(
        cursor_ts = after.ts,
        cursor_row = after.row_id,
        fetched = batch.messages.len(),
        "Tail scan"
    );
    Ok(batch)
}

/// Delete messages strictly older than `cutoff`, returning the count removed
pub async fn purge_before(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM messages WHERE ts < ?")
        .bind(cutoff.timestamp_millis())
        .execute(pool)
        .await?;

    info!(deleted = result.rows_affected(), cutoff = %cutoff, "Purged messages before cutoff");
    Ok(result.rows_affected())
}

/// Delete every message and reclaim disk space
pub async fn purge_all(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM messages").execute(pool).await?;
    sqlx::query("VACUUM").execute(pool).await?;

    info!(deleted = result.rows_affected(), "Purged all messages");
    Ok(result.rows_affected())
}

pub async fn count_messages(pool: &SqlitePool) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

fn row_to_message(row: &SqliteRow) -> Result<(TailPosition, StoredMessage)> {
    let ts: i64 = row.try_get("ts")?;
    let position = TailPosition::new(ts, row.try_get("row_seq")?);
    let message = StoredMessage {
        id: row.try_get("id")?,
        timestamp: from_millis(ts)?,
        username: row.try_get("username")?,
        platform: row.try_get("platform")?,
        text: row.try_get("text")?,
        emotes_json: row.try_get("emotes_json")?,
        badges_json: row.try_get("badges_json")?,
        raw_json: row.try_get("raw_json")?,
    };
    Ok((position, message))
}

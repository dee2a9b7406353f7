//! Database models

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable record of one accepted chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    /// Millisecond precision; anything finer is dropped on insert
    pub timestamp: DateTime<Utc>,
    pub username: String,
    pub platform: String,
    pub text: String,
    pub emotes_json: String,
    pub badges_json: String,
    /// Full canonical payload as delivered to viewers
    pub raw_json: String,
}

impl StoredMessage {
    /// New record with a random id stamped at `timestamp` (truncated to milliseconds)
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: truncate_to_millis(timestamp),
            username: String::new(),
            platform: String::new(),
            text: String::new(),
            emotes_json: "[]".to_string(),
            badges_json: "[]".to_string(),
            raw_json: String::new(),
        }
    }

    pub fn ts_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// Tail cursor: everything up to and including `(ts, row_id)` has been delivered
///
/// Ordering is lexicographic on `(ts, row_id)`, matching the store's scan order.
/// Serialized as-is to the tailer offset file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TailPosition {
    pub ts: i64,
    pub row_id: i64,
}

impl TailPosition {
    pub fn new(ts: i64, row_id: i64) -> Self {
        Self { ts, row_id }
    }

    /// A zero cursor means "no position recorded"
    pub fn is_unset(&self) -> bool {
        self.ts == 0 && self.row_id == 0
    }
}

/// Rows returned by one tail scan plus the cursor to resume from
#[derive(Debug, Clone, Default)]
pub struct TailBatch {
    pub messages: Vec<StoredMessage>,
    pub last: TailPosition,
}

/// Options for the most-recent-N query
///
/// `since` (inclusive) and `before` (exclusive) are mutually exclusive.
/// A `limit` of 0 returns every matching row.
#[derive(Debug, Clone, Default)]
pub struct RecentQuery {
    pub limit: i64,
    pub since: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
}

impl RecentQuery {
    pub fn latest(limit: i64) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }
}

/// Auth session blob keyed by token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub service: String,
    pub data_json: String,
    pub token_expiry: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Internal(format!("timestamp {} out of range", ms)))
}

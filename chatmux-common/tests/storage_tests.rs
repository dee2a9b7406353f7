//! Integration tests for the storage engine
//!
//! Covers startup (directory creation, migration idempotence across reopen),
//! recent-message queries, tail cursors, purges and sessions against real files.

use chatmux_common::config::{StorageConfig, StorageMode};
use chatmux_common::db::migrations::{applied_versions, latest_version};
use chatmux_common::db::{messages, sessions, Database, RecentQuery, StoredMessage, TailPosition};
use chatmux_common::Error;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serial_test::serial;
use std::collections::HashSet;
use std::path::Path;
use tempfile::TempDir;

fn persistent_config(path: &Path) -> StorageConfig {
    StorageConfig {
        mode: StorageMode::Persistent,
        path: Some(path.to_path_buf()),
        ..StorageConfig::default()
    }
}

async fn open_temp() -> (TempDir, Database) {
    let dir = TempDir::new().unwrap();
    let db = Database::open(&persistent_config(&dir.path().join("chat.db")))
        .await
        .expect("open store");
    (dir, db)
}

fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).unwrap()
}

fn message(id: &str, ts: DateTime<Utc>) -> StoredMessage {
    let mut m = StoredMessage::new(ts);
    m.id = id.to_string();
    m.username = format!("user-{}", id);
    m.platform = "Twitch".to_string();
    m.text = format!("text {}", id);
    m
}

fn ids(rows: &[StoredMessage]) -> Vec<&str> {
    rows.iter().map(|m| m.id.as_str()).collect()
}

#[tokio::test]
async fn test_open_creates_parent_directories() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("deeper").join("chat.db");

    let db = Database::open(&persistent_config(&path)).await.unwrap();

    assert!(path.exists());
    assert!(!db.is_ephemeral());
    assert_eq!(db.path(), path.as_path());
    db.close().await.unwrap();
    assert!(path.exists(), "persistent store must survive close");
}

#[tokio::test]
async fn test_reopen_applies_migrations_once_and_keeps_rows() {
    let dir = TempDir::new().unwrap();
    let config = persistent_config(&dir.path().join("chat.db"));

    let db = Database::open(&config).await.unwrap();
    messages::insert_message(db.pool(), &message("a", at(1_000))).await.unwrap();
    messages::insert_message(db.pool(), &message("b", at(2_000))).await.unwrap();
    db.close().await.unwrap();

    let db = Database::open(&config).await.unwrap();
    let versions = applied_versions(db.pool()).await.unwrap();
    let expected: Vec<i64> = (1..=latest_version()).collect();
    assert_eq!(versions, expected);
    assert_eq!(messages::count_messages(db.pool()).await.unwrap(), 2);
    db.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_open_of_fresh_store() {
    let expected: Vec<i64> = (1..=latest_version()).collect();

    for round in 0..10 {
        let dir = TempDir::new().unwrap();
        let config = persistent_config(&dir.path().join("chat.db"));

        let (first, second) = tokio::join!(Database::open(&config), Database::open(&config));
        let first = first.unwrap_or_else(|e| panic!("round {}: first open failed: {}", round, e));
        let second = second.unwrap_or_else(|e| panic!("round {}: second open failed: {}", round, e));

        assert_eq!(applied_versions(first.pool()).await.unwrap(), expected);
        messages::insert_message(second.pool(), &message("shared", at(1_000)))
            .await
            .unwrap();
        assert_eq!(messages::count_messages(first.pool()).await.unwrap(), 1);

        first.close().await.unwrap();
        second.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_wal_journal_mode() {
    let (_dir, db) = open_temp().await;
    let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(mode.to_lowercase(), "wal");
}

#[tokio::test]
async fn test_extra_pragmas_applied() {
    let dir = TempDir::new().unwrap();
    let mut config = persistent_config(&dir.path().join("chat.db"));
    config.pragmas = vec!["cache_size=-4096".to_string()];
    config.max_connections = 1;

    let db = Database::open(&config).await.unwrap();
    let cache_size: i64 = sqlx::query_scalar("PRAGMA cache_size")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(cache_size, -4096);
}

#[tokio::test]
#[serial]
async fn test_ephemeral_store_removed_on_close() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("scratch.db");
    let config = StorageConfig {
        mode: StorageMode::Ephemeral,
        path: Some(path.clone()),
        ..StorageConfig::default()
    };

    let db = Database::open(&config).await.unwrap();
    messages::insert_message(db.pool(), &message("x", at(5))).await.unwrap();
    assert!(db.is_ephemeral());
    assert!(path.exists());

    db.close().await.unwrap();
    assert!(!path.exists());
    assert!(!dir.path().join("scratch.db-wal").exists());
}

#[tokio::test]
#[serial]
async fn test_ephemeral_default_path_in_temp_dir() {
    let config = StorageConfig::default();
    let db = Database::open(&config).await.unwrap();
    let path = db.path().to_path_buf();

    assert!(path.starts_with(std::env::temp_dir()));
    assert!(path.to_string_lossy().contains(&std::process::id().to_string()));

    db.close().await.unwrap();
    assert!(!path.exists());
}

#[tokio::test]
async fn test_get_recent_newest_first_with_stable_ties() {
    let (_dir, db) = open_temp().await;
    for (id, ms) in [("a", 1_000), ("b", 2_000), ("c", 2_000), ("d", 3_000)] {
        messages::insert_message(db.pool(), &message(id, at(ms))).await.unwrap();
    }

    let all = messages::get_recent(db.pool(), &RecentQuery::latest(0)).await.unwrap();
    assert_eq!(ids(&all), vec!["d", "c", "b", "a"]);

    let two = messages::get_recent(db.pool(), &RecentQuery::latest(2)).await.unwrap();
    assert_eq!(ids(&two), vec!["d", "c"]);
    assert_eq!(two[0].timestamp, at(3_000));
    assert_eq!(two[0].username, "user-d");
}

#[tokio::test]
async fn test_get_recent_time_filters() {
    let (_dir, db) = open_temp().await;
    for (id, ms) in [("a", 1_000), ("b", 2_000), ("c", 3_000)] {
        messages::insert_message(db.pool(), &message(id, at(ms))).await.unwrap();
    }

    let since = RecentQuery {
        since: Some(at(2_000)),
        ..RecentQuery::default()
    };
    let rows = messages::get_recent(db.pool(), &since).await.unwrap();
    assert_eq!(ids(&rows), vec!["c", "b"]);

    let before = RecentQuery {
        before: Some(at(2_000)),
        ..RecentQuery::default()
    };
    let rows = messages::get_recent(db.pool(), &before).await.unwrap();
    assert_eq!(ids(&rows), vec!["a"]);
}

#[tokio::test]
async fn test_get_recent_rejects_contract_violations() {
    let (_dir, db) = open_temp().await;

    let both = RecentQuery {
        limit: 10,
        since: Some(at(1)),
        before: Some(at(2)),
    };
    let result = messages::get_recent(db.pool(), &both).await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));

    let negative = RecentQuery::latest(-1);
    let result = messages::get_recent(db.pool(), &negative).await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}

#[tokio::test]
async fn test_duplicate_id_rejected() {
    let (_dir, db) = open_temp().await;
    messages::insert_message(db.pool(), &message("same", at(1))).await.unwrap();
    let result = messages::insert_message(db.pool(), &message("same", at(2))).await;
    assert!(matches!(result, Err(Error::Database(_))));
}

#[tokio::test]
async fn test_timestamps_truncated_to_millis() {
    let (_dir, db) = open_temp().await;
    let precise = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
    let m = message("p", precise);
    assert_eq!(m.timestamp.timestamp_subsec_nanos(), 123_000_000);

    messages::insert_message(db.pool(), &m).await.unwrap();
    let rows = messages::get_recent(db.pool(), &RecentQuery::latest(1)).await.unwrap();
    assert_eq!(rows[0], m);
}

#[tokio::test]
async fn test_tail_head() {
    let (_dir, db) = open_temp().await;
    assert_eq!(messages::tail_head(db.pool()).await.unwrap(), TailPosition::default());

    messages::insert_message(db.pool(), &message("a", at(500))).await.unwrap();
    messages::insert_message(db.pool(), &message("b", at(900))).await.unwrap();
    messages::insert_message(db.pool(), &message("c", at(700))).await.unwrap();

    let head = messages::tail_head(db.pool()).await.unwrap();
    assert_eq!(head.ts, 900);
    assert_eq!(head.row_id, 2);
}

#[tokio::test]
async fn test_tail_next_visits_every_row_once_with_shared_timestamps() {
    let (_dir, db) = open_temp().await;

    // 25 rows squeezed into three milliseconds, inserted out of timestamp order
    let mut expected = Vec::new();
    for i in 0..25 {
        let ms = match i % 3 {
            0 => 2_000,
            1 => 1_000,
            _ => 3_000,
        };
        let id = format!("m{:02}", i);
        messages::insert_message(db.pool(), &message(&id, at(ms))).await.unwrap();
        expected.push((ms, i, id));
    }
    expected.sort();

    let mut cursor = TailPosition::default();
    let mut seen = Vec::new();
    loop {
        let batch = messages::tail_next(db.pool(), cursor, 4).await.unwrap();
        if batch.messages.is_empty() {
            assert_eq!(batch.last, cursor);
            break;
        }
        assert!(batch.last > cursor, "cursor must advance");
        assert!(batch.messages.len() <= 4);
        cursor = batch.last;
        seen.extend(batch.messages.into_iter().map(|m| m.id));
    }

    let expected_ids: Vec<String> = expected.into_iter().map(|(_, _, id)| id).collect();
    assert_eq!(seen, expected_ids);
    assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 25);
}

#[tokio::test]
async fn test_tail_next_resumes_after_new_writes() {
    let (_dir, db) = open_temp().await;
    messages::insert_message(db.pool(), &message("a", at(100))).await.unwrap();

    let head = messages::tail_head(db.pool()).await.unwrap();
    let empty = messages::tail_next(db.pool(), head, 10).await.unwrap();
    assert!(empty.messages.is_empty());

    // Same millisecond as the head row, later sequence
    messages::insert_message(db.pool(), &message("b", at(100))).await.unwrap();
    messages::insert_message(db.pool(), &message("c", at(101))).await.unwrap();

    let batch = messages::tail_next(db.pool(), head, 10).await.unwrap();
    assert_eq!(ids(&batch.messages), vec!["b", "c"]);
    assert_eq!(batch.last.ts, 101);
}

#[tokio::test]
async fn test_tail_next_rejects_non_positive_limit() {
    let (_dir, db) = open_temp().await;
    let result = messages::tail_next(db.pool(), TailPosition::default(), 0).await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}

#[tokio::test]
async fn test_purge_before_and_all() {
    let (_dir, db) = open_temp().await;
    for (id, ms) in [("a", 1_000), ("b", 2_000), ("c", 3_000), ("d", 4_000)] {
        messages::insert_message(db.pool(), &message(id, at(ms))).await.unwrap();
    }

    let deleted = messages::purge_before(db.pool(), at(3_000)).await.unwrap();
    assert_eq!(deleted, 2);
    let rest = messages::get_recent(db.pool(), &RecentQuery::latest(0)).await.unwrap();
    assert_eq!(ids(&rest), vec!["d", "c"]);

    let deleted = messages::purge_all(db.pool()).await.unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(messages::count_messages(db.pool()).await.unwrap(), 0);
    assert_eq!(messages::tail_head(db.pool()).await.unwrap(), TailPosition::default());
}

#[tokio::test]
async fn test_sessions_round_trip() {
    let (_dir, db) = open_temp().await;
    let pool = db.pool();

    assert!(sessions::latest_session(pool).await.unwrap().is_none());
    assert!(matches!(
        sessions::get_session(pool, "missing").await,
        Err(Error::NotFound(_))
    ));

    let expiry = Utc::now() + Duration::hours(1);
    let created = sessions::upsert_session(pool, "tok-1", "twitch", r#"{"login":"a"}"#, Some(expiry))
        .await
        .unwrap();
    assert_eq!(created.service, "twitch");
    assert_eq!(
        created.token_expiry.map(|t| t.timestamp_millis()),
        Some(expiry.timestamp_millis())
    );

    let updated = sessions::upsert_session(pool, "tok-1", "twitch", r#"{"login":"b"}"#, None)
        .await
        .unwrap();
    assert_eq!(updated.data_json, r#"{"login":"b"}"#);
    assert!(updated.token_expiry.is_none());

    sessions::upsert_session(pool, "tok-2", "youtube", "{}", None).await.unwrap();

    let latest = sessions::latest_session(pool).await.unwrap().unwrap();
    assert_eq!(latest.token, "tok-2");
    let twitch = sessions::latest_session_by_service(pool, "twitch").await.unwrap().unwrap();
    assert_eq!(twitch.token, "tok-1");
    assert!(sessions::latest_session_by_service(pool, "kick").await.unwrap().is_none());

    sessions::delete_session(pool, "tok-1").await.unwrap();
    sessions::delete_session(pool, "tok-1").await.unwrap();
    assert!(matches!(
        sessions::get_session(pool, "tok-1").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_purge_expired_sessions() {
    let (_dir, db) = open_temp().await;
    let pool = db.pool();
    let now = Utc::now();

    sessions::upsert_session(pool, "old", "twitch", "{}", Some(now - Duration::minutes(5)))
        .await
        .unwrap();
    sessions::upsert_session(pool, "fresh", "twitch", "{}", Some(now + Duration::minutes(5)))
        .await
        .unwrap();
    sessions::upsert_session(pool, "forever", "twitch", "{}", None).await.unwrap();

    assert_eq!(sessions::purge_expired_sessions(pool, now).await.unwrap(), 1);
    assert!(sessions::get_session(pool, "fresh").await.is_ok());
    assert!(sessions::get_session(pool, "forever").await.is_ok());
}

#[tokio::test]
async fn test_empty_session_token_rejected() {
    let (_dir, db) = open_temp().await;
    let result = sessions::upsert_session(db.pool(), "", "twitch", "{}", None).await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}

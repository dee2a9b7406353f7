//! Change tailer
//!
//! Polls the message log for rows written by other processes and broadcasts them.
//! The cursor is the `(ts, rowid)` of the last row seen; on startup it comes from
//! the offset file when one exists, otherwise from the current head of the log,
//! so history written before startup is never re-broadcast.
//!
//! Rows this process wrote itself are recorded in [`SeenIds`] before they are
//! stored, which keeps them from being echoed a second time.

use crate::hub::BroadcastHub;
use crate::Result;
use async_trait::async_trait;
use chatmux_common::chat::{Enricher, Enrichment};
use chatmux_common::config::TailerConfig;
use chatmux_common::db::{messages, Database, TailBatch, TailPosition};
use chrono::Utc;
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Size at which the seen-id set is cleared
pub const SEEN_IDS_CAP: usize = 200_000;

/// Read side of the message log used by the tailer
#[async_trait]
pub trait TailSource: Send + Sync + 'static {
    async fn tail_head(&self) -> chatmux_common::Result<TailPosition>;

    async fn tail_next(&self, after: TailPosition, limit: i64) -> chatmux_common::Result<TailBatch>;
}

#[async_trait]
impl TailSource for Database {
    async fn tail_head(&self) -> chatmux_common::Result<TailPosition> {
        messages::tail_head(self.pool()).await
    }

    async fn tail_next(&self, after: TailPosition, limit: i64) -> chatmux_common::Result<TailBatch> {
        messages::tail_next(self.pool(), after, limit).await
    }
}

/// Message ids already broadcast by this process
///
/// Bounded: once it reaches its cap it is cleared and starts over. A row seen
/// before the clear could in principle be echoed again, but the tailer cursor has
/// long moved past it by then.
#[derive(Debug)]
pub struct SeenIds {
    ids: Mutex<HashSet<String>>,
    cap: usize,
}

impl Default for SeenIds {
    fn default() -> Self {
        Self::with_cap(SEEN_IDS_CAP)
    }
}

impl SeenIds {
    pub fn with_cap(cap: usize) -> Self {
        Self {
            ids: Mutex::new(HashSet::new()),
            cap: cap.max(1),
        }
    }

    /// Record `id`; `false` if it was already present
    pub fn insert(&self, id: &str) -> bool {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        if ids.contains(id) {
            return false;
        }
        if ids.len() >= self.cap {
            debug!(cap = self.cap, "Seen-id set full, clearing");
            ids.clear();
        }
        ids.insert(id.to_string())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.lock().unwrap_or_else(|e| e.into_inner()).contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailerState {
    Idle,
    /// Establishing the starting cursor
    Seeking,
    Polling,
}

/// Read a persisted cursor
///
/// Missing, unreadable, or corrupt files all yield `None`; the tailer then starts
/// from the head of the log.
pub async fn load_offset(path: &Path) -> Option<TailPosition> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read tailer offset");
            return None;
        }
    };

    match serde_json::from_str::<TailPosition>(content.trim()) {
        Ok(position) => Some(position),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring corrupt tailer offset");
            None
        }
    }
}

/// Persist a cursor atomically (write a sibling temp file, then rename over)
pub async fn store_offset(path: &Path, position: TailPosition) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut line = serde_json::to_string(&position)?;
    line.push('\n');

    let tmp = temp_sibling(path);
    tokio::fs::write(&tmp, line).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

/// Handle to a running tailer task
pub struct TailerHandle {
    state: watch::Receiver<TailerState>,
    task: JoinHandle<()>,
}

impl TailerHandle {
    pub fn state(&self) -> TailerState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    pub fn watch_state(&self) -> watch::Receiver<TailerState> {
        self.state.clone()
    }

    /// Wait for the task to end, aborting it after `grace`
    pub async fn join(self, grace: Duration) {
        let abort = self.task.abort_handle();
        match tokio::time::timeout(grace, self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Tailer task ended abnormally"),
            Err(_) => {
                warn!("Tailer did not stop within grace period, aborting");
                abort.abort();
            }
        }
    }
}

pub struct ChangeTailer<S> {
    source: S,
    enricher: Arc<Enricher>,
    hub: Arc<BroadcastHub>,
    seen: Arc<SeenIds>,
    config: TailerConfig,
    position: TailPosition,
    state: watch::Sender<TailerState>,
}

impl<S: TailSource> ChangeTailer<S> {
    pub fn new(
        source: S,
        enricher: Arc<Enricher>,
        hub: Arc<BroadcastHub>,
        seen: Arc<SeenIds>,
        config: TailerConfig,
    ) -> Self {
        let (state, _) = watch::channel(TailerState::Idle);
        Self {
            source,
            enricher,
            hub,
            seen,
            config,
            position: TailPosition::default(),
            state,
        }
    }

    pub fn position(&self) -> TailPosition {
        self.position
    }

    /// Run on a background task until `cancel` fires
    pub fn spawn(self, cancel: CancellationToken) -> TailerHandle {
        let state = self.state.subscribe();
        let task = tokio::spawn(self.run(cancel));
        TailerHandle { state, task }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let interval = self.config.interval();
        info!(
            interval_ms = interval.as_millis() as u64,
            batch = self.config.batch,
            persist = self.config.persist_offsets,
            "Change tailer starting"
        );

        self.set_state(TailerState::Seeking);
        loop {
            match self.seek().await {
                Ok(position) => {
                    self.position = position;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to locate tail head; retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.set_state(TailerState::Idle);
                            return;
                        }
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            }
        }
        info!(ts = self.position.ts, row_id = self.position.row_id, "Tailer cursor established");

        self.set_state(TailerState::Polling);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.poll_once().await {
                warn!(
                    ts = self.position.ts,
                    row_id = self.position.row_id,
                    error = %e,
                    "Tailer poll failed; retrying"
                );
            }
        }

        self.set_state(TailerState::Idle);
        info!("Change tailer stopped");
    }

    /// Fetch and broadcast one batch, returning how many rows were published
    pub async fn poll_once(&mut self) -> Result<usize> {
        let limit = i64::from(self.config.batch.max(1));
        let batch = self.source.tail_next(self.position, limit).await?;
        if batch.messages.is_empty() {
            return Ok(0);
        }

        let mut published = 0;
        for row in &batch.messages {
            if row.id.is_empty() || !self.seen.insert(&row.id) {
                continue;
            }
            match self.enricher.rehydrate(row) {
                Enrichment::Accepted(message) => {
                    self.hub.publish(Arc::from(message.payload_json.as_str()));
                    published += 1;
                }
                Enrichment::Dropped(reason) => {
                    debug!(id = %row.id, %reason, "Skipping tailed row");
                }
            }
        }

        self.position = batch.last;
        if let Some(path) = self.offset_path() {
            if let Err(e) = store_offset(path, self.position).await {
                warn!(path = %path.display(), error = %e, "Failed to persist tailer offset");
            }
        }

        if let (Some(max_lag), Some(newest)) = (self.config.max_lag(), batch.messages.last()) {
            let lag = Utc::now().signed_duration_since(newest.timestamp);
            if lag.num_milliseconds() > max_lag.as_millis() as i64 {
                warn!(lag_ms = lag.num_milliseconds(), "Tailer is lagging behind writers");
            }
        }

        if published > 0 {
            debug!(published, ts = self.position.ts, row_id = self.position.row_id, "Tailed rows broadcast");
        }
        Ok(published)
    }

    async fn seek(&self) -> Result<TailPosition> {
        if let Some(path) = self.offset_path() {
            if let Some(position) = load_offset(path).await {
                if !position.is_unset() {
                    info!(path = %path.display(), "Resuming tailer from persisted offset");
                    return Ok(position);
                }
            }
        }
        Ok(self.source.tail_head().await?)
    }

    fn offset_path(&self) -> Option<&Path> {
        if self.config.persist_offsets {
            self.config.offset_path.as_deref()
        } else {
            None
        }
    }

    fn set_state(&self, state: TailerState) {
        self.state.send_replace(state);
    }
}

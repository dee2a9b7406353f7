//! Ingest-to-viewer path
//!
//! A decoded harvester line is enriched, stored, and broadcast. Storage failures
//! are logged and do not block the live broadcast.

use crate::hub::{BroadcastHub, Payload};
use crate::ingest::LineSink;
use crate::tailer::SeenIds;
use crate::Result;
use async_trait::async_trait;
use chatmux_common::chat::{DropReason, Enricher, Enrichment, Platform};
use chatmux_common::db::{messages, Database, RecentQuery};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened to one incoming message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Published { id: String, stored: bool },
    Dropped(DropReason),
}

pub struct ChatRelay {
    db: Database,
    enricher: Arc<Enricher>,
    hub: Arc<BroadcastHub>,
    local_writes: Arc<SeenIds>,
}

impl ChatRelay {
    /// `local_writes` is shared with the change tailer so our own rows are not echoed
    pub fn new(
        db: Database,
        enricher: Arc<Enricher>,
        hub: Arc<BroadcastHub>,
        local_writes: Arc<SeenIds>,
    ) -> Self {
        Self {
            db,
            enricher,
            hub,
            local_writes,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn enricher(&self) -> &Arc<Enricher> {
        &self.enricher
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// Enrich, store, then broadcast one harvester message
    ///
    /// `origin` is the platform implied by where the line came from; a `source`
    /// field in the payload takes precedence.
    pub async fn accept(&self, value: Value, origin: Option<Platform>) -> Delivery {
        let enriched = match self.enricher.enrich_value(value, origin) {
            Enrichment::Accepted(message) => message,
            Enrichment::Dropped(reason) => {
                debug!(%reason, "Dropping incoming message");
                return Delivery::Dropped(reason);
            }
        };

        let row = enriched.to_stored(Utc::now());
        self.local_writes.insert(&row.id);

        let stored = match messages::insert_message(self.db.pool(), &row).await {
            Ok(()) => true,
            Err(e) => {
                warn!(id = %row.id, error = %e, "Failed to store message; broadcasting anyway");
                false
            }
        };

        let report = self.hub.publish(Arc::from(enriched.payload_json.as_str()));
        debug!(
            id = %row.id,
            author = %enriched.message.author,
            delivered = report.delivered,
            dropped = report.dropped,
            "Message relayed"
        );

        Delivery::Published { id: row.id, stored }
    }

    /// Wire payloads for the latest `limit` messages, oldest first
    pub async fn history(&self, limit: u32) -> Result<Vec<Payload>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = messages::get_recent(self.db.pool(), &RecentQuery::latest(i64::from(limit))).await?;
        let payloads = rows
            .iter()
            .rev()
            .filter_map(|row| match self.enricher.rehydrate(row) {
                Enrichment::Accepted(message) => Some(Payload::from(message.payload_json.as_str())),
                Enrichment::Dropped(reason) => {
                    debug!(id = %row.id, %reason, "Skipping stored row in history");
                    None
                }
            })
            .collect();
        Ok(payloads)
    }
}

#[async_trait]
impl LineSink for ChatRelay {
    async fn deliver(&self, url: &str, line: Value) -> Result<()> {
        self.accept(line, Platform::from_url(url)).await;
        Ok(())
    }
}

//! Probe endpoints

use axum::{extract::State, Json};
use chrono::Utc;
use serde::Serialize;

use crate::api::AppState;
use chatmux_common::config::RelayConfig;

/// GET /healthz
pub async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
pub struct ConfigSnapshot {
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub subscribers: usize,
    pub dropped_payloads: u64,
    pub config: RelayConfig,
}

/// GET /configz
///
/// Effective configuration after file, environment, and flag overrides.
/// Harvester arguments are redacted.
pub async fn configz(State(state): State<AppState>) -> Json<ConfigSnapshot> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let hub = state.relay.hub();

    Json(ConfigSnapshot {
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: uptime.num_seconds().max(0) as u64,
        subscribers: hub.subscriber_count(),
        dropped_payloads: hub.dropped_total(),
        config: state.config.redacted(),
    })
}

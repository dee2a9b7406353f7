//! chatmux-relay library interface
//!
//! Live side of the chat relay: broadcast hub, change tailer, ingest supervisor,
//! and the HTTP/WebSocket surface. Exposed as a library for integration testing.

pub mod api;
pub mod error;
pub mod hub;
pub mod ingest;
pub mod relay;
pub mod tailer;

pub use api::{build_router, AppState};
pub use error::{Error, Result};
pub use hub::BroadcastHub;
pub use relay::ChatRelay;

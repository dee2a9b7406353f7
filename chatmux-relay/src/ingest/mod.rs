//! Harvester ingestion
//!
//! One external harvester process per configured chat URL. Each process writes
//! one JSON object per stdout line; the supervisor decodes those lines and hands
//! them to a [`LineSink`], restarting crashed harvesters with exponential backoff.

pub mod backoff;
pub mod supervisor;

pub use backoff::{next_backoff, Backoff};
pub use supervisor::{IngestSupervisor, LineSink, SourceEvent};

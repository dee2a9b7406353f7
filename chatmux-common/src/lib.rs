//! # chatmux common library
//!
//! Shared code for the chatmux relay:
//! - Storage engine (SQLite message log, sessions, migrations, tail cursor)
//! - Chat model, text-effect tokenizer and enrichment pipeline
//! - Configuration loading
//! - Common error type

pub mod chat;
pub mod config;
pub mod db;
pub mod error;

pub use error::{Error, Result};

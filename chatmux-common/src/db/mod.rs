//! Storage engine: durable message log, sessions and tail cursors

pub mod init;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod sessions;

pub use init::Database;
pub use migrations::run_migrations;
pub use models::*;

//! Chat model, text-effect tokenizer and enrichment pipeline

pub mod colour;
pub mod commands;
pub mod emotes;
pub mod enrich;
pub mod model;
pub mod tokenizer;

pub use colour::ColourPreferences;
pub use commands::CommandParser;
pub use emotes::EmoteCache;
pub use enrich::{DropReason, EnrichOptions, EnrichedMessage, Enricher, Enrichment};
pub use model::{Badge, ChatMessage, Emote, Image, Platform, Token, TokenKind};
pub use tokenizer::{scan_colons, Tokenizer};

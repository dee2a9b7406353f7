//! Message enrichment pipeline
//!
//! Turns a harvester line or a stored row into a canonical [`ChatMessage`]:
//!
//! 1. Decode the loosely-typed payload (bad emote/badge entries dropped one by one)
//! 2. Trim author and text, classify the platform
//! 3. Drop the message if it has neither text nor emotes
//! 4. Merge attached emotes into the shared cache, then tokenize the text
//! 5. Run a leading chat command (live messages only)
//! 6. Resolve the colour: preference, then supplied colour, then palette fallback
//! 7. Encode the storage sub-fields and the wire payload
//!
//! Enrichment never fails on content. Anything undecodable becomes a drop.

use crate::chat::colour::{fallback_colour, ColourPreferences};
use crate::chat::commands::CommandParser;
use crate::chat::emotes::EmoteCache;
use crate::chat::model::{Badge, ChatMessage, IncomingMessage, Platform, TokenKind};
use crate::chat::tokenizer::Tokenizer;
use crate::config::ChatConfig;
use crate::db::models::StoredMessage;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrichOptions {
    pub strip_youtube_at: bool,
    pub show_badges: bool,
}

impl Default for EnrichOptions {
    fn default() -> Self {
        Self {
            strip_youtube_at: true,
            show_badges: true,
        }
    }
}

impl From<&ChatConfig> for EnrichOptions {
    fn from(config: &ChatConfig) -> Self {
        Self {
            strip_youtube_at: config.strip_youtube_at,
            show_badges: config.show_badges,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// No text and no emotes after normalization
    Empty,
    /// Payload could not be decoded at all
    Malformed(String),
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::Empty => f.write_str("empty message"),
            DropReason::Malformed(reason) => write!(f, "malformed payload: {}", reason),
        }
    }
}

/// Canonical message plus its storage-ready encodings
#[derive(Debug, Clone)]
pub struct EnrichedMessage {
    pub message: ChatMessage,
    pub emotes_json: String,
    /// Shorthand badge list: `["id/version", "id"]`
    pub badges_json: String,
    /// Wire payload, also stored as `raw_json`
    pub payload_json: String,
}

impl EnrichedMessage {
    /// Durable record with a fresh id stamped at `timestamp`
    pub fn to_stored(&self, timestamp: DateTime<Utc>) -> StoredMessage {
        let mut stored = StoredMessage::new(timestamp);
        stored.username = self.message.author.clone();
        stored.platform = self.message.source.label().to_string();
        stored.text = self.message.message.clone();
        stored.emotes_json = self.emotes_json.clone();
        stored.badges_json = self.badges_json.clone();
        stored.raw_json = self.payload_json.clone();
        stored
    }
}

#[derive(Debug, Clone)]
pub enum Enrichment {
    Accepted(Box<EnrichedMessage>),
    Dropped(DropReason),
}

impl Enrichment {
    pub fn accepted(self) -> Option<EnrichedMessage> {
        match self {
            Enrichment::Accepted(message) => Some(*message),
            Enrichment::Dropped(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandMode {
    Execute,
    /// Replays and tailed rows: side effects already happened when first ingested
    Skip,
}

/// Enrichment pipeline with its shared caches
#[derive(Debug)]
pub struct Enricher {
    tokenizer: Tokenizer,
    prefs: ColourPreferences,
    commands: CommandParser,
    options: EnrichOptions,
}

impl Enricher {
    pub fn new(
        emotes: EmoteCache,
        prefs: ColourPreferences,
        commands: CommandParser,
        options: EnrichOptions,
    ) -> Self {
        Self {
            tokenizer: Tokenizer::new(emotes),
            prefs,
            commands,
            options,
        }
    }

    /// Pipeline with fresh caches configured from `[chat]`
    pub fn from_config(config: &ChatConfig) -> Self {
        Self::new(
            EmoteCache::new(),
            ColourPreferences::new(),
            CommandParser::new(config.help_cooldown()),
            EnrichOptions::from(config),
        )
    }

    pub fn emotes(&self) -> &EmoteCache {
        self.tokenizer.emotes()
    }

    pub fn preferences(&self) -> &ColourPreferences {
        &self.prefs
    }

    /// Enrich one NDJSON line
    pub fn enrich_line(&self, line: &str, origin: Option<Platform>) -> Enrichment {
        match serde_json::from_str::<Value>(line) {
            Ok(value) => self.enrich_value(value, origin),
            Err(e) => Enrichment::Dropped(DropReason::Malformed(e.to_string())),
        }
    }

    /// Enrich a decoded live payload; `origin` fills in a missing platform label
    pub fn enrich_value(&self, value: Value, origin: Option<Platform>) -> Enrichment {
        match serde_json::from_value::<IncomingMessage>(value) {
            Ok(incoming) => self.enrich_incoming(incoming, origin, CommandMode::Execute),
            Err(e) => Enrichment::Dropped(DropReason::Malformed(e.to_string())),
        }
    }

    /// Rebuild the live payload for a stored row
    ///
    /// Prefers the stored `raw_json`, falling back to the row columns for anything
    /// it lacks. Commands are not re-run.
    pub fn rehydrate(&self, row: &StoredMessage) -> Enrichment {
        let mut incoming = if row.raw_json.trim().is_empty() {
            IncomingMessage::default()
        } else {
            serde_json::from_str::<IncomingMessage>(&row.raw_json).unwrap_or_else(|e| {
                debug!(id = %row.id, error = %e, "Stored payload unreadable, using columns");
                IncomingMessage::default()
            })
        };

        if incoming.author.as_deref().map_or(true, |a| a.trim().is_empty()) {
            incoming.author = Some(row.username.clone());
        }
        if incoming.message.as_deref().map_or(true, |m| m.trim().is_empty()) {
            incoming.message = Some(row.text.clone());
        }
        if incoming.source.as_deref().map_or(true, |s| s.trim().is_empty()) {
            incoming.source = Some(row.platform.clone());
        }
        if incoming.emotes.is_null() {
            incoming.emotes = serde_json::from_str(&row.emotes_json).unwrap_or(Value::Null);
        }
        if incoming.badges.is_null() {
            incoming.badges = serde_json::from_str(&row.badges_json).unwrap_or(Value::Null);
        }

        self.enrich_incoming(incoming, None, CommandMode::Skip)
    }

    fn enrich_incoming(
        &self,
        incoming: IncomingMessage,
        origin: Option<Platform>,
        commands: CommandMode,
    ) -> Enrichment {
        let mut source = incoming
            .source
            .as_deref()
            .map(Platform::from_label)
            .unwrap_or_default();
        if source == Platform::Unknown {
            source = origin.unwrap_or_default();
        }

        let mut author = incoming.author.as_deref().unwrap_or_default().trim().to_string();
        if self.options.strip_youtube_at && source == Platform::YouTube {
            if let Some(stripped) = author.strip_prefix('@') {
                author = stripped.to_string();
            }
        }
        let text = incoming.message.as_deref().unwrap_or_default().trim().to_string();

        let emotes = incoming.decoded_emotes();
        let badges = if self.options.show_badges {
            incoming.decoded_badges()
        } else {
            Vec::new()
        };

        if text.is_empty() && emotes.is_empty() {
            return Enrichment::Dropped(DropReason::Empty);
        }

        self.tokenizer.emotes().insert_all(emotes.iter());
        let fragments = self.tokenizer.tokenize(&text).collect();

        let supplied_colour = incoming
            .colour
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        let mut message = ChatMessage {
            author,
            message: text,
            fragments,
            emotes,
            badges,
            source,
            colour: String::new(),
        };

        let is_command = message
            .fragments
            .first()
            .is_some_and(|t| t.kind == TokenKind::Command);
        if is_command && commands == CommandMode::Execute {
            match self.commands.apply(&mut message, &self.prefs) {
                Ok(outcome) => debug!(author = %message.author, ?outcome, "Chat command applied"),
                Err(e) => warn!(author = %message.author, error = %e, "Chat command failed"),
            }
        }

        message.colour = self
            .prefs
            .get(&message.author)
            .or(supplied_colour)
            .unwrap_or_else(|| fallback_colour(&message.author).to_string());

        encode(message)
    }
}

fn encode(message: ChatMessage) -> Enrichment {
    let shorthand: Vec<String> = message.badges.iter().map(Badge::shorthand).collect();
    let encoded = serde_json::to_string(&message.emotes).and_then(|emotes_json| {
        Ok((
            emotes_json,
            serde_json::to_string(&shorthand)?,
            serde_json::to_string(&message)?,
        ))
    });

    match encoded {
        Ok((emotes_json, badges_json, payload_json)) => Enrichment::Accepted(Box::new(EnrichedMessage {
            message,
            emotes_json,
            badges_json,
            payload_json,
        })),
        Err(e) => Enrichment::Dropped(DropReason::Malformed(e.to_string())),
    }
}

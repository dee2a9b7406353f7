//! Chat message model
//!
//! [`ChatMessage`] is the canonical live wire payload:
//! `{author, message, fragments[], emotes[], badges[], source, colour}`.
//! Collections always serialize as arrays, never `null`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Source platform of a chat message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "&'static str")]
pub enum Platform {
    Twitch,
    YouTube,
    Kick,
    #[default]
    Unknown,
}

impl Platform {
    /// Classify a free-form platform label (case-insensitive)
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "twitch" => Platform::Twitch,
            "youtube" | "yt" => Platform::YouTube,
            "kick" => Platform::Kick,
            _ => Platform::Unknown,
        }
    }

    /// Infer the platform from a harvester source URL
    pub fn from_url(url: &str) -> Option<Self> {
        let url = url.to_ascii_lowercase();
        if url.contains("twitch.tv") {
            Some(Platform::Twitch)
        } else if url.contains("youtube.com") || url.contains("youtu.be") {
            Some(Platform::YouTube)
        } else if url.contains("kick.com") {
            Some(Platform::Kick)
        } else {
            None
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Platform::Twitch => "Twitch",
            Platform::YouTube => "YouTube",
            Platform::Kick => "Kick",
            Platform::Unknown => "Unknown",
        }
    }
}

impl From<String> for Platform {
    fn from(label: String) -> Self {
        Platform::from_label(&label)
    }
}

impl From<Platform> for &'static str {
    fn from(platform: Platform) -> Self {
        platform.label()
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Image {
    pub id: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Emote {
    pub id: String,
    pub name: String,
    pub locations: Vec<String>,
    pub images: Vec<Image>,
}

/// Canonical badge shape
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Badge {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

/// Badge shapes harvesters emit
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum BadgeRepr {
    /// `"id/version"` or bare `"id"`
    Shorthand(String),
    /// Object keyed by one of `id|badge_id|name|slug|_id` plus optional `version|badge_version`
    Structured(Map<String, Value>),
}

const BADGE_ID_KEYS: [&str; 5] = ["id", "badge_id", "name", "slug", "_id"];
const BADGE_VERSION_KEYS: [&str; 2] = ["version", "badge_version"];

impl BadgeRepr {
    /// Canonicalize; entries without an id yield `None`
    pub fn into_badge(self) -> Option<Badge> {
        let badge = match self {
            BadgeRepr::Shorthand(raw) => {
                let raw = raw.trim();
                match raw.split_once('/') {
                    Some((id, version)) => Badge {
                        id: id.trim().to_string(),
                        version: version.trim().to_string(),
                    },
                    None => Badge {
                        id: raw.to_string(),
                        version: String::new(),
                    },
                }
            }
            BadgeRepr::Structured(fields) => Badge {
                id: first_scalar(&fields, &BADGE_ID_KEYS),
                version: first_scalar(&fields, &BADGE_VERSION_KEYS),
            },
        };
        (!badge.id.is_empty()).then_some(badge)
    }
}

/// First non-empty string or number among `keys`
fn first_scalar(fields: &Map<String, Value>, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|key| match fields.get(*key) {
            Some(Value::String(s)) => Some(s.trim().to_string()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .find(|s| !s.is_empty())
        .unwrap_or_default()
}

impl Badge {
    /// Decode one badge entry of any supported shape; malformed entries yield `None`
    pub fn decode(value: Value) -> Option<Badge> {
        serde_json::from_value::<BadgeRepr>(value).ok()?.into_badge()
    }

    /// `"id/version"`, or `"id"` when there is no version
    pub fn shorthand(&self) -> String {
        if self.version.is_empty() {
            self.id.clone()
        } else {
            format!("{}/{}", self.id, self.version)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Text,
    Colour,
    Effect,
    Pattern,
    Emote,
    Command,
}

/// One rendered fragment of message text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    #[serde(rename = "type")]
    pub kind: TokenKind,
    pub text: String,
    /// Resolved emote for [`TokenKind::Emote`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emote: Option<Emote>,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            emote: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(TokenKind::Text, text)
    }

    pub fn emote(text: impl Into<String>, emote: Emote) -> Self {
        Self {
            kind: TokenKind::Emote,
            text: text.into(),
            emote: Some(emote),
        }
    }
}

/// Canonical, display-ready chat message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatMessage {
    pub author: String,
    pub message: String,
    pub fragments: Vec<Token>,
    pub emotes: Vec<Emote>,
    pub badges: Vec<Badge>,
    pub source: Platform,
    pub colour: String,
}

/// Loosely-typed harvester payload before normalization
///
/// Every field is optional; `emotes` and `badges` stay raw so each entry can be
/// decoded (and dropped) on its own.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IncomingMessage {
    #[serde(alias = "Author")]
    pub author: Option<String>,
    #[serde(alias = "Message")]
    pub message: Option<String>,
    #[serde(alias = "Source")]
    pub source: Option<String>,
    #[serde(alias = "color")]
    pub colour: Option<String>,
    pub emotes: Value,
    pub badges: Value,
}

impl IncomingMessage {
    pub fn decoded_emotes(&self) -> Vec<Emote> {
        decode_each(&self.emotes, |v| {
            serde_json::from_value::<Emote>(v)
                .ok()
                .filter(|e| !e.name.trim().is_empty())
        })
    }

    pub fn decoded_badges(&self) -> Vec<Badge> {
        decode_each(&self.badges, Badge::decode)
    }
}

/// Decode each array entry independently, dropping the ones that fail
pub(crate) fn decode_each<T>(value: &Value, decode: impl Fn(Value) -> Option<T>) -> Vec<T> {
    match value {
        Value::Array(items) => items.iter().cloned().filter_map(decode).collect(),
        _ => Vec::new(),
    }
}

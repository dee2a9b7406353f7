//! Text-effect tokenizer
//!
//! Splits chat text into render fragments. Grammar:
//!
//! ```text
//! message  := modifier* body
//! modifier := (colour | effect | "pattern" slots?) ":" whitespace*
//! slots    := 4 two-character slots (8 alphanumerics)
//! body     := word (whitespace word)*
//! ```
//!
//! Body words that name a cached emote become emote fragments. Words containing
//! colons are split by [`scan_colons`] so platform emotes written as `:name:` resolve
//! even when glued to other text. Everything else is merged into text fragments with
//! whitespace collapsed to single spaces. Nothing here fails: unrecognised markup is
//! literal text.

use crate::chat::emotes::EmoteCache;
use crate::chat::model::{Emote, Token, TokenKind};
use std::collections::VecDeque;
use std::str::SplitWhitespace;

pub const COLOURS: [&str; 13] = [
    "yellow", "red", "green", "cyan", "purple", "white", "glow1", "glow2", "glow3", "flash1",
    "flash2", "flash3", "rainbow",
];

pub const EFFECTS: [&str; 5] = ["wave", "wave2", "shake", "scroll", "slide"];

/// Separator ending a modifier and delimiting colon-wrapped emote names
pub const MODIFIER_SEP: char = ':';

/// Leading character of a chat command
pub const COMMAND_PREFIX: char = '!';

const PATTERN_PREFIX: &str = "pattern";
const PATTERN_SLOTS: usize = 4;
const PATTERN_SLOT_WIDTH: usize = 2;

/// Tokenizer bound to a shared emote cache
#[derive(Debug, Clone, Default)]
pub struct Tokenizer {
    emotes: EmoteCache,
}

impl Tokenizer {
    pub fn new(emotes: EmoteCache) -> Self {
        Self { emotes }
    }

    pub fn emotes(&self) -> &EmoteCache {
        &self.emotes
    }

    /// Lazily tokenize `text`
    ///
    /// Each call starts a fresh scan; the returned iterator owns all scan state.
    pub fn tokenize<'a>(&'a self, text: &'a str) -> Tokens<'a> {
        Tokens {
            emotes: &self.emotes,
            stage: Stage::Modifiers(text),
            modifiers_seen: false,
            first_word: true,
            text: String::new(),
            word_gap: false,
            ready: VecDeque::new(),
        }
    }
}

enum Modifier {
    Token(Token),
    /// Consumed without producing a fragment (`pattern:` with no slots)
    Silent,
}

fn classify_modifier(head: &str) -> Option<Modifier> {
    if COLOURS.contains(&head) {
        return Some(Modifier::Token(Token::new(TokenKind::Colour, head)));
    }
    if EFFECTS.contains(&head) {
        return Some(Modifier::Token(Token::new(TokenKind::Effect, head)));
    }
    let slots = head.strip_prefix(PATTERN_PREFIX)?;
    if slots.is_empty() {
        return Some(Modifier::Silent);
    }
    let valid = slots.len() == PATTERN_SLOTS * PATTERN_SLOT_WIDTH
        && slots.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| Modifier::Token(Token::new(TokenKind::Pattern, slots)))
}

fn is_colon_wrapped(segment: &str) -> bool {
    segment.len() >= 3 && segment.starts_with(MODIFIER_SEP) && segment.ends_with(MODIFIER_SEP)
}

#[derive(Clone)]
enum Stage<'a> {
    Modifiers(&'a str),
    Body(SplitWhitespace<'a>),
    Done,
}

/// Lazy token sequence produced by [`Tokenizer::tokenize`]
#[derive(Clone)]
pub struct Tokens<'a> {
    emotes: &'a EmoteCache,
    stage: Stage<'a>,
    modifiers_seen: bool,
    first_word: bool,
    /// Text fragment being accumulated
    text: String,
    /// Set at each new body word so the next text piece is space-separated
    word_gap: bool,
    ready: VecDeque<Token>,
}

impl<'a> Tokens<'a> {
    fn next_modifier(&mut self, rest: &'a str) -> Stage<'a> {
        let rest = rest.trim_start();
        if let Some((head, tail)) = rest.split_once(MODIFIER_SEP) {
            if let Some(modifier) = classify_modifier(head) {
                self.modifiers_seen = true;
                if let Modifier::Token(token) = modifier {
                    self.ready.push_back(token);
                }
                return Stage::Modifiers(tail);
            }
        }
        Stage::Body(rest.split_whitespace())
    }

    fn push_word(&mut self, word: &'a str) {
        self.word_gap = true;
        let first = std::mem::replace(&mut self.first_word, false);

        if first
            && !self.modifiers_seen
            && word.len() > COMMAND_PREFIX.len_utf8()
            && word.starts_with(COMMAND_PREFIX)
        {
            self.ready.push_back(Token::new(TokenKind::Command, word));
            return;
        }

        if let Some(emote) = self.emotes.get(word) {
            self.push_emote(word, emote);
            return;
        }

        if !word.contains(MODIFIER_SEP) {
            self.push_text(word);
            return;
        }

        for segment in scan_colons(word) {
            let emote = if is_colon_wrapped(segment) {
                self.emotes.get(segment)
            } else {
                None
            };
            match emote {
                Some(emote) => self.push_emote(segment, emote),
                None => self.push_text(segment),
            }
        }
    }

    fn push_text(&mut self, piece: &str) {
        if self.word_gap && !self.text.is_empty() {
            self.text.push(' ');
        }
        self.word_gap = false;
        self.text.push_str(piece);
    }

    fn push_emote(&mut self, name: &str, emote: Emote) {
        self.flush_text();
        self.word_gap = false;
        self.ready.push_back(Token::emote(name, emote));
    }

    fn flush_text(&mut self) {
        if !self.text.is_empty() {
            self.ready.push_back(Token::text(std::mem::take(&mut self.text)));
        }
    }
}

impl<'a> Iterator for Tokens<'a> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        loop {
            if let Some(token) = self.ready.pop_front() {
                return Some(token);
            }

            match std::mem::replace(&mut self.stage, Stage::Done) {
                Stage::Modifiers(rest) => {
                    self.stage = self.next_modifier(rest);
                }
                Stage::Body(mut words) => match words.next() {
                    Some(word) => {
                        self.push_word(word);
                        self.stage = Stage::Body(words);
                    }
                    None => self.flush_text(),
                },
                Stage::Done => return None,
            }
        }
    }
}

/// Colon-aware segmentation
///
/// - Text up to the next colon is one segment (the colon is left for the next one).
/// - A colon followed by text and another colon yields the whole `:name:` segment.
/// - A colon directly followed by another colon, or with no closing colon, degrades
///   to a lone `:` (or the unterminated remainder).
pub fn scan_colons(input: &str) -> ColonSegments<'_> {
    ColonSegments { rest: input }
}

#[derive(Debug, Clone)]
pub struct ColonSegments<'a> {
    rest: &'a str,
}

impl<'a> Iterator for ColonSegments<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.rest.is_empty() {
            return None;
        }

        const SEP: usize = MODIFIER_SEP.len_utf8();
        let split_at = match self.rest.strip_prefix(MODIFIER_SEP) {
            Some(after) => match after.find(MODIFIER_SEP) {
                Some(0) => SEP,
                Some(close) => SEP + close + SEP,
                None => self.rest.len(),
            },
            None => self.rest.find(MODIFIER_SEP).unwrap_or(self.rest.len()),
        };

        let (segment, rest) = self.rest.split_at(split_at);
        self.rest = rest;
        Some(segment)
    }
}

//! Chat commands
//!
//! Messages whose first fragment is a command (`!word`) pass through here before
//! they are finalized. Supported:
//!
//! - `!help` replaces the message body with the command list, at most once per cooldown
//! - `!colour <#hex>` / `!color <#hex>` sets the author's display colour
//! - `!colour reset` clears it again

use crate::chat::colour::{is_hex_colour, ColourPreferences};
use crate::chat::model::{ChatMessage, Token, TokenKind};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const HELP_TEXT: &str = "Commands: !help, !colour <#rgb|#rrggbb>, !colour reset";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    Unknown(String),

    #[error("'{0}' needs an argument")]
    MissingArgument(String),

    #[error("'{0}' is not a #rgb or #rrggbb colour")]
    InvalidColour(String),
}

/// What a command did to the message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    HelpShown,
    /// Within the cooldown window; message left untouched
    HelpSuppressed,
    ColourSet(String),
    ColourReset,
}

#[derive(Debug)]
pub struct CommandParser {
    help_cooldown: Duration,
    last_help: Mutex<Option<Instant>>,
}

impl CommandParser {
    pub fn new(help_cooldown: Duration) -> Self {
        Self {
            help_cooldown,
            last_help: Mutex::new(None),
        }
    }

    /// Run the command at the head of `message.fragments`
    ///
    /// Errors leave the message unchanged; the caller logs them and delivers the
    /// message as typed.
    pub fn apply(
        &self,
        message: &mut ChatMessage,
        prefs: &ColourPreferences,
    ) -> Result<CommandOutcome, CommandError> {
        let command = match message.fragments.first() {
            Some(token) if token.kind == TokenKind::Command => token.text.to_lowercase(),
            _ => return Err(CommandError::Unknown(String::new())),
        };
        let argument = message.message.split_whitespace().nth(1).map(str::to_string);

        match command.as_str() {
            "!help" => Ok(self.help(message)),
            "!colour" | "!color" => {
                let value = argument.ok_or_else(|| CommandError::MissingArgument(command.clone()))?;
                if value.eq_ignore_ascii_case("reset") {
                    prefs.clear(&message.author);
                    return Ok(CommandOutcome::ColourReset);
                }
                if !is_hex_colour(&value) {
                    return Err(CommandError::InvalidColour(value));
                }
                let colour = value.to_lowercase();
                prefs.set(&message.author, &colour);
                message.colour = colour.clone();
                Ok(CommandOutcome::ColourSet(colour))
            }
            _ => Err(CommandError::Unknown(command)),
        }
    }

    fn help(&self, message: &mut ChatMessage) -> CommandOutcome {
        let now = Instant::now();
        let mut last = self.last_help.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = *last {
            if now.duration_since(previous) < self.help_cooldown {
                return CommandOutcome::HelpSuppressed;
            }
        }
        *last = Some(now);
        message.fragments = vec![Token::text(HELP_TEXT)];
        CommandOutcome::HelpShown
    }
}

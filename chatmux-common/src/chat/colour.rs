//! Author colours
//!
//! Authors without a supplied colour get a deterministic palette entry picked by
//! hashing their lowercased name. Explicit preferences set through chat commands
//! live in [`ColourPreferences`] and override both.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Fallback palette
pub const PALETTE: [&str; 8] = [
    "#f97316", "#22d3ee", "#c084fc", "#34d399", "#facc15", "#38bdf8", "#f472b6", "#a3e635",
];

/// Colour for messages with no author at all
pub const ANONYMOUS_COLOUR: &str = "#94a3b8";

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a
fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &b| {
        (hash ^ u32::from(b)).wrapping_mul(FNV_PRIME)
    })
}

/// Deterministic palette colour for `name`
pub fn fallback_colour(name: &str) -> &'static str {
    let key = name.trim().to_lowercase();
    if key.is_empty() {
        return ANONYMOUS_COLOUR;
    }
    PALETTE[(fnv1a(key.as_bytes()) % PALETTE.len() as u32) as usize]
}

/// `#rgb` or `#rrggbb`
pub fn is_hex_colour(value: &str) -> bool {
    match value.strip_prefix('#') {
        Some(hex) => (hex.len() == 3 || hex.len() == 6) && hex.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}

/// Username → colour preferences set by chat commands
///
/// Shared by clone; keys are lowercased author names.
#[derive(Debug, Clone, Default)]
pub struct ColourPreferences {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl ColourPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, author: &str) -> Option<String> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(&author.trim().to_lowercase()).cloned()
    }

    pub fn set(&self, author: &str, colour: &str) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.insert(author.trim().to_lowercase(), colour.to_string());
    }

    /// Returns true if a preference was removed
    pub fn clear(&self, author: &str) -> bool {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.remove(&author.trim().to_lowercase()).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_reference_values() {
        assert_eq!(fnv1a(b""), 0x811c9dc5);
        assert_eq!(fnv1a(b"a"), 0xe40c292c);
        assert_eq!(fnv1a(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_fallback_colour_is_case_insensitive_and_stable() {
        let colour = fallback_colour("Dayoman");
        assert!(PALETTE.contains(&colour));
        assert_eq!(colour, fallback_colour("dayoman"));
        assert_eq!(colour, fallback_colour("  DAYOMAN "));
        assert_eq!(fallback_colour(""), ANONYMOUS_COLOUR);
        assert_eq!(fallback_colour("   "), ANONYMOUS_COLOUR);
        // "a" hashes to 0xe40c292c, which is 4 mod 8
        assert_eq!(fallback_colour("a"), PALETTE[4]);
    }

    #[test]
    fn test_hex_colour_validation() {
        assert!(is_hex_colour("#fff"));
        assert!(is_hex_colour("#A1b2C3"));
        assert!(!is_hex_colour("fff"));
        assert!(!is_hex_colour("#ffff"));
        assert!(!is_hex_colour("#ggg"));
    }

    #[test]
    fn test_preferences_shared_between_clones() {
        let prefs = ColourPreferences::new();
        let other = prefs.clone();

        prefs.set("Someone", "#ff0000");
        assert_eq!(other.get("someone").as_deref(), Some("#ff0000"));
        assert_eq!(other.len(), 1);

        assert!(other.clear("SOMEONE"));
        assert!(!prefs.clear("someone"));
        assert!(prefs.is_empty());
    }
}

//! Field normalization applied before any similarity comparison.
//!
//! Every field (title, artist, album) is normalized on its own. Never normalize
//! a concatenation: feature trimming must stop at the field boundary.

use any_ascii::any_ascii;
use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::models::TrackFields;

// ============================================================================
// REGEX PATTERNS
// ============================================================================

/// Featured-artist marker. Case-sensitive: "Feat. " is left alone.
pub static FEATURE_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:feat|ft)\. ").unwrap());

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Keep only the text before the first "feat. " or "ft. ".
/// e.g., "Touch (feat. Paul McCartney)" → "Touch ("
pub fn trim_feature(text: &str) -> &str {
    match FEATURE_MARKER.find(text) {
        Some(m) => &text[..m.start()],
        None => text,
    }
}

/// Check if a character is a Unicode combining mark (diacritical mark).
pub fn is_combining_mark(c: char) -> bool {
    matches!(c as u32, 0x0300..=0x036F | 0x1AB0..=0x1AFF | 0x1DC0..=0x1DFF | 0xFE20..=0xFE2F)
}

/// Fold Unicode text to ASCII by applying NFKD decomposition and removing combining marks.
/// e.g., "Beyoncé" → "beyonce", "Motörhead" → "motorhead"
pub fn fold_to_ascii(s: &str) -> String {
    let stripped: String = s.nfkd().filter(|c| !is_combining_mark(*c)).collect();
    any_ascii(&stripped).to_lowercase()
}

// ============================================================================
// NORMALIZATION FUNCTIONS
// ============================================================================

/// Trim the feature suffix and lowercase.
pub fn normalize(text: &str) -> String {
    trim_feature(text).to_lowercase()
}

/// Normalize an optional field; absent normalizes to "".
pub fn normalize_opt(text: Option<&str>) -> String {
    text.map(normalize).unwrap_or_default()
}

/// Normalization settings shared by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Normalizer {
    /// Also strip diacritics and transliterate to ASCII after trimming
    pub fold_accents: bool,
}

impl Normalizer {
    pub fn new(fold_accents: bool) -> Self {
        Self { fold_accents }
    }

    pub fn field(&self, text: Option<&str>) -> String {
        let Some(text) = text else {
            return String::new();
        };
        if self.fold_accents {
            fold_to_ascii(trim_feature(text))
        } else {
            normalize(text)
        }
    }

    pub fn fields(&self, track: &impl TrackFields) -> NormalizedFields {
        NormalizedFields {
            title: self.field(Some(track.title())),
            artist: self.field(Some(track.artist())),
            album: self.field(track.album()),
        }
    }
}

/// Independently normalized title, artist and album of one track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedFields {
    pub title: String,
    pub artist: String,
    pub album: String,
}

impl NormalizedFields {
    /// Field pairs in comparison order: title, artist, album.
    pub fn pairs<'a>(&'a self, other: &'a NormalizedFields) -> [(&'a str, &'a str); 3] {
        [
            (&self.title, &other.title),
            (&self.artist, &other.artist),
            (&self.album, &other.album),
        ]
    }

    /// `title + artist + album`, no separator. Used for the aggregate ratio.
    pub fn joined(&self) -> String {
        let mut s = String::with_capacity(self.title.len() + self.artist.len() + self.album.len());
        s.push_str(&self.title);
        s.push_str(&self.artist);
        s.push_str(&self.album);
        s
    }
}

// ============================================================================
// TESTS
// ============================================================================

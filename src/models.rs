//! Core data models for scrobble reconciliation.
//!
//! This module contains the track records of both catalogs, the play event
//! record, match outcomes and batch statistics.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

// ============================================================================
// Shared Track Fields
// ============================================================================

/// The three metadata fields both catalogs agree on.
/// Matching compares these pairwise, so both track kinds expose them the same way.
pub trait TrackFields {
    fn title(&self) -> &str;
    fn artist(&self) -> &str;
    fn album(&self) -> Option<&str>;
}

fn label(f: &impl TrackFields) -> String {
    format!("{} / {} -- {}", f.artist(), f.album().unwrap_or("-"), f.title())
}

/// Empty strings from either catalog mean "not set".
pub fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

// ============================================================================
// Remote Catalog
// ============================================================================

/// Track as known to the listening-history service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub external_id: Option<String>, // MusicBrainz recording id
}

impl RemoteTrack {
    /// Build a track, deriving its content-addressed id.
    pub fn new(
        title: impl Into<String>,
        artist: impl Into<String>,
        album: Option<String>,
        external_id: Option<String>,
    ) -> Self {
        let title = title.into();
        let artist = artist.into();
        let album = non_empty(album);
        let external_id = non_empty(external_id);
        let id = derive_track_id(
            external_id.as_deref(),
            &title,
            &artist,
            album.as_deref(),
        );
        Self {
            id,
            title,
            artist,
            album,
            external_id,
        }
    }
}

/// SHA-256 over `external_id || title || artist || album`, absent values as "".
/// Only these four fields feed the digest: URLs, images and streamable flags can change.
pub fn derive_track_id(
    external_id: Option<&str>,
    title: &str,
    artist: &str,
    album: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(external_id.unwrap_or("").as_bytes());
    hasher.update(title.as_bytes());
    hasher.update(artist.as_bytes());
    hasher.update(album.unwrap_or("").as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

impl TrackFields for RemoteTrack {
    fn title(&self) -> &str {
        &self.title
    }
    fn artist(&self) -> &str {
        &self.artist
    }
    fn album(&self) -> Option<&str> {
        self.album.as_deref()
    }
}

impl fmt::Display for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&label(self))
    }
}

/// One play of a remote track, as delivered by the history source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayRecord {
    pub track: RemoteTrack,
    pub timestamp: i64, // seconds since epoch
}

// ============================================================================
// Local Library
// ============================================================================

/// Track as known to the local library. Read-only from our side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub external_id: Option<String>,
}

impl TrackFields for LocalTrack {
    fn title(&self) -> &str {
        &self.title
    }
    fn artist(&self) -> &str {
        &self.artist
    }
    fn album(&self) -> Option<&str> {
        self.album.as_deref()
    }
}

impl fmt::Display for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&label(self))
    }
}

/// A user account in the local library.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LibraryUser {
    pub id: String,
    pub user_name: String,
}

// ============================================================================
// Match Outcomes
// ============================================================================

/// Terminal state of one reconciliation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchStatus {
    Matched,
    NoMatch,
    ChoiceRequired,
}

/// Which signal produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchTier {
    /// Shared MusicBrainz recording id
    Identifier,
    /// Case-insensitive equality of title, artist and album
    Exact,
    /// Aggregate similarity above the auto-accept threshold
    Fuzzy,
    /// Picked by the operator from the ranked candidates
    Operator,
}

/// A fuzzy candidate that survived the field floors, with its aggregate ratio.
#[derive(Clone, Debug, PartialEq)]
pub struct RankedCandidate {
    pub track: RemoteTrack,
    pub ratio: f64,
}

/// Result of reconciling one local track.
#[derive(Clone, Debug, PartialEq)]
pub struct MatchOutcome {
    pub status: MatchStatus,
    pub tier: Option<MatchTier>,
    /// Remote tracks linked by this run (empty unless `Matched`)
    pub accepted: Vec<RemoteTrack>,
    /// Candidates the operator rejected and that are now blacklisted
    pub rejected: Vec<RemoteTrack>,
}

impl MatchOutcome {
    pub fn matched(tier: MatchTier, accepted: Vec<RemoteTrack>) -> Self {
        Self {
            status: MatchStatus::Matched,
            tier: Some(tier),
            accepted,
            rejected: Vec::new(),
        }
    }

    pub fn no_match() -> Self {
        Self {
            status: MatchStatus::NoMatch,
            tier: None,
            accepted: Vec::new(),
            rejected: Vec::new(),
        }
    }

    pub fn rejected(rejected: Vec<RemoteTrack>) -> Self {
        Self {
            status: MatchStatus::NoMatch,
            tier: None,
            accepted: Vec::new(),
            rejected,
        }
    }

    pub fn choice_required() -> Self {
        Self {
            status: MatchStatus::ChoiceRequired,
            tier: None,
            accepted: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Outcome tallies for one batch run over the unmatched local tracks.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub matched: usize,
    pub no_match: usize,
    pub choice_required: usize,
    /// Subset of `no_match` where the operator rejected every candidate
    pub rejected: usize,
    pub errors: usize,
}

impl BatchSummary {
    pub fn record(&mut self, outcome: &MatchOutcome) {
        self.processed += 1;
        match outcome.status {
            MatchStatus::Matched => self.matched += 1,
            MatchStatus::NoMatch => {
                self.no_match += 1;
                if !outcome.rejected.is_empty() {
                    self.rejected += 1;
                }
            }
            MatchStatus::ChoiceRequired => self.choice_required += 1,
        }
    }

    pub fn record_error(&mut self) {
        self.processed += 1;
        self.errors += 1;
    }

    /// Match rate as a percentage of processed tracks
    pub fn match_rate(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            100.0 * self.matched as f64 / self.processed as f64
        }
    }

    /// Write the summary to a JSON file
    pub fn write_to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_id_is_content_addressed() {
        let make = || {
            RemoteTrack::new("Nightcall", "Kavinsky", Some("OutRun".into()), Some("abc".into()))
        };
        let (a, b) = (make(), make());
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 64);

        let c = RemoteTrack::new("Nightcall", "Kavinsky", Some("OutRun".into()), None);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_empty_fields_read_as_absent() {
        let t = RemoteTrack::new("Song", "Artist", Some(String::new()), Some(String::new()));
        assert_eq!(t.album, None);
        assert_eq!(t.external_id, None);
        assert_eq!(t.id, RemoteTrack::new("Song", "Artist", None, None).id);
    }

    #[test]
    fn test_track_id_matches_known_digest() {
        // sha256("")
        assert_eq!(
            derive_track_id(None, "", "", None),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_label_format() {
        let t = RemoteTrack::new("Touch", "Daft Punk", Some("Random Access Memories".into()), None);
        assert_eq!(t.to_string(), "Daft Punk / Random Access Memories -- Touch");
        let t = RemoteTrack::new("Touch", "Daft Punk", None, None);
        assert_eq!(t.to_string(), "Daft Punk / - -- Touch");
    }

    #[test]
    fn test_batch_summary_tallies() {
        let mut s = BatchSummary::default();
        s.record(&MatchOutcome::matched(MatchTier::Exact, vec![]));
        s.record(&MatchOutcome::no_match());
        s.record(&MatchOutcome::rejected(vec![RemoteTrack::new("a", "b", None, None)]));
        s.record(&MatchOutcome::choice_required());
        s.record_error();
        assert_eq!(s.processed, 5);
        assert_eq!(s.matched, 1);
        assert_eq!(s.no_match, 2);
        assert_eq!(s.rejected, 1);
        assert_eq!(s.choice_required, 1);
        assert_eq!(s.errors, 1);
        assert!((s.match_rate() - 20.0).abs() < 1e-9);
    }
}

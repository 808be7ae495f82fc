//! Shared fixtures for unit tests: an in-memory store with a library attached,
//! plus scripted stand-ins for the operator and the history service.

use std::collections::VecDeque;
use std::path::Path;

use crate::decision::{Decision, DecisionSurface};
use crate::error::{Error, Result};
use crate::lastfm::{HistoryPage, HistorySource, UserInfo};
use crate::models::{LocalTrack, PlayRecord, RankedCandidate, RemoteTrack};
use crate::store::CandidateStore;

/// The subset of the library schema the store reads and writes.
pub fn library_schema(schema: &str) -> String {
    format!(
        "CREATE TABLE {schema}.media_file (
             id TEXT PRIMARY KEY,
             title TEXT NOT NULL DEFAULT '',
             artist TEXT NOT NULL DEFAULT '',
             album TEXT NOT NULL DEFAULT '',
             mbz_recording_id TEXT NOT NULL DEFAULT ''
         );
         CREATE TABLE {schema}.user (
             id TEXT PRIMARY KEY,
             user_name TEXT NOT NULL
         );
         CREATE TABLE {schema}.annotation (
             user_id TEXT NOT NULL,
             item_id TEXT NOT NULL,
             item_type TEXT NOT NULL,
             play_count INTEGER DEFAULT 0,
             play_date DATETIME,
             PRIMARY KEY (user_id, item_id, item_type)
         );"
    )
}

pub fn fixture_store() -> CandidateStore {
    let store = CandidateStore::open(Path::new(":memory:"), Path::new(":memory:")).unwrap();
    store.conn().execute_batch(&library_schema("library")).unwrap();
    store
}

pub fn local(
    id: &str,
    title: &str,
    artist: &str,
    album: Option<&str>,
    external_id: Option<&str>,
) -> LocalTrack {
    LocalTrack {
        id: id.into(),
        title: title.into(),
        artist: artist.into(),
        album: album.map(Into::into),
        external_id: external_id.map(Into::into),
    }
}

pub fn remote(
    title: &str,
    artist: &str,
    album: Option<&str>,
    external_id: Option<&str>,
) -> RemoteTrack {
    RemoteTrack::new(title, artist, album.map(Into::into), external_id.map(Into::into))
}

pub fn play(track: RemoteTrack, timestamp: i64) -> PlayRecord {
    PlayRecord { track, timestamp }
}

pub fn add_local(store: &CandidateStore, t: &LocalTrack) {
    store
        .conn()
        .execute(
            "INSERT INTO library.media_file (id, title, artist, album, mbz_recording_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                t.id,
                t.title,
                t.artist,
                t.album.as_deref().unwrap_or(""),
                t.external_id.as_deref().unwrap_or("")
            ],
        )
        .unwrap();
}

pub fn add_user(store: &CandidateStore, id: &str, user_name: &str) {
    store
        .conn()
        .execute(
            "INSERT INTO library.user (id, user_name) VALUES (?1, ?2)",
            [id, user_name],
        )
        .unwrap();
}

/// Add a remote track with a single play at `timestamp`.
pub fn add_remote(store: &CandidateStore, t: &RemoteTrack, timestamp: i64) {
    store.ingest_play(&play(t.clone(), timestamp)).unwrap();
}

// ============================================================================
// Scripted Collaborators
// ============================================================================

/// Answers prompts from a queue and remembers what it was shown.
#[derive(Default)]
pub struct ScriptedSurface {
    answers: VecDeque<Decision>,
    pub shown: Vec<Vec<RankedCandidate>>,
}

impl ScriptedSurface {
    pub fn new(answers: impl IntoIterator<Item = Decision>) -> Self {
        Self {
            answers: answers.into_iter().collect(),
            shown: Vec::new(),
        }
    }
}

impl DecisionSurface for ScriptedSurface {
    fn decide(&mut self, _local: &LocalTrack, candidates: &[RankedCandidate]) -> Result<Decision> {
        self.shown.push(candidates.to_vec());
        Ok(self.answers.pop_front().unwrap_or(Decision::Defer))
    }
}

/// Serves canned history pages; a missing page is an http error.
pub struct ScriptedSource {
    pub pages: Vec<HistoryPage>,
    pub user: UserInfo,
    pub requested: Vec<u32>,
}

impl ScriptedSource {
    pub fn new(pages: Vec<HistoryPage>) -> Self {
        Self {
            pages,
            user: UserInfo {
                name: "listener".into(),
                play_count: 0,
                track_count: 0,
            },
            requested: Vec::new(),
        }
    }
}

impl HistorySource for ScriptedSource {
    fn fetch_page(&mut self, page: u32) -> Result<HistoryPage> {
        self.requested.push(page);
        self.pages
            .iter()
            .find(|p| p.page == page)
            .cloned()
            .ok_or_else(|| Error::Http(format!("no page {page}")))
    }

    fn user_info(&mut self) -> Result<UserInfo> {
        Ok(self.user.clone())
    }
}

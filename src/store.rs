//! Candidate store: the scrobble database plus the attached library database.
//!
//! The scrobble side (`remote_track`, `play_event`, `track_match`, `blacklist`)
//! is owned here. The library side is attached once at open under the
//! `library` schema and is only read, except by [`CandidateStore::sync_play_counts`].

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::cmp::Ordering;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::{non_empty, LibraryUser, LocalTrack, PlayRecord, RemoteTrack};

/// Local tracks fetched per round trip by [`UnmatchedTracks`]
pub const UNMATCHED_PAGE_SIZE: usize = 256;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS remote_track (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        artist TEXT NOT NULL,
        album TEXT,
        external_id TEXT
    );

    CREATE TABLE IF NOT EXISTS play_event (
        track_id TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        FOREIGN KEY (track_id) REFERENCES remote_track(id),
        PRIMARY KEY (track_id, timestamp)
    );

    CREATE TABLE IF NOT EXISTS track_match (
        remote_track_id TEXT NOT NULL,
        local_track_id TEXT NOT NULL,
        FOREIGN KEY (remote_track_id) REFERENCES remote_track(id),
        PRIMARY KEY (remote_track_id, local_track_id)
    );

    CREATE TABLE IF NOT EXISTS blacklist (
        remote_track_id TEXT NOT NULL,
        local_track_id TEXT NOT NULL,
        FOREIGN KEY (remote_track_id) REFERENCES remote_track(id),
        PRIMARY KEY (remote_track_id, local_track_id)
    );

    CREATE INDEX IF NOT EXISTS idx_remote_track_external_id ON remote_track(external_id);
    CREATE INDEX IF NOT EXISTS idx_track_match_local ON track_match(local_track_id);
";

const REMOTE_COLUMNS: &str = "id, title, artist, album, external_id";

/// Case-insensitive collation over full Unicode. SQLite's NOCASE folds ASCII only.
pub const UNICODE_NOCASE: &str = "unicode_nocase";

fn unicode_nocase(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase))
}

/// Which pair relation a write goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairTable {
    Match,
    Blacklist,
}

impl PairTable {
    fn name(self) -> &'static str {
        match self {
            PairTable::Match => "track_match",
            PairTable::Blacklist => "blacklist",
        }
    }
}

/// One annotation row written by the play-count sync.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayCountChange {
    pub local_track_id: String,
    pub play_count: i64,
    pub play_date: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncReport {
    pub changes: Vec<PlayCountChange>,
    pub committed: bool,
}

pub struct CandidateStore {
    conn: Connection,
    library_attached: bool,
}

fn remote_from_row(row: &Row) -> rusqlite::Result<RemoteTrack> {
    Ok(RemoteTrack {
        id: row.get(0)?,
        title: row.get(1)?,
        artist: row.get(2)?,
        album: row.get(3)?,
        external_id: row.get(4)?,
    })
}

fn local_from_row(row: &Row) -> rusqlite::Result<LocalTrack> {
    let title: Option<String> = row.get(1)?;
    let artist: Option<String> = row.get(2)?;
    Ok(LocalTrack {
        id: row.get(0)?,
        title: title.unwrap_or_default(),
        artist: artist.unwrap_or_default(),
        album: non_empty(row.get(3)?),
        external_id: non_empty(row.get(4)?),
    })
}

fn is_memory(path: &Path) -> bool {
    path.as_os_str() == ":memory:"
}

impl CandidateStore {
    /// Open the scrobble database and attach the library database.
    pub fn open(store_path: &Path, library_path: &Path) -> Result<Self> {
        if !is_memory(library_path) && !library_path.exists() {
            return Err(Error::Config(format!(
                "library database not found: {}",
                library_path.display()
            )));
        }
        let mut store = Self::open_history(store_path)?;
        store.conn.execute(
            "ATTACH DATABASE ?1 AS library",
            [library_path.to_string_lossy().into_owned()],
        )?;
        store.library_attached = true;
        info!(library = %library_path.display(), "Attached library database");
        Ok(store)
    }

    /// Open only the scrobble database. Library queries fail with a config error.
    pub fn open_history(store_path: &Path) -> Result<Self> {
        let conn = Connection::open(store_path)?;
        conn.create_collation(UNICODE_NOCASE, unicode_nocase)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        debug!(store = %store_path.display(), "Initialised scrobble database");
        Ok(Self {
            conn,
            library_attached: false,
        })
    }

    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    fn require_library(&self) -> Result<()> {
        if self.library_attached {
            Ok(())
        } else {
            Err(Error::Config("no library database attached".into()))
        }
    }

    fn exists(conn: &Connection, sql: &str, id: &str) -> Result<bool> {
        Ok(conn.query_row(sql, [id], |_| Ok(())).optional()?.is_some())
    }

    fn query_remote(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<RemoteTrack>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, remote_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Save one play. Returns true if the play event was not stored before.
    pub fn ingest_play(&self, record: &PlayRecord) -> Result<bool> {
        let t = &record.track;
        let tx = self.conn.unchecked_transaction()?;
        let added = tx.execute(
            "INSERT OR IGNORE INTO remote_track (id, title, artist, album, external_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![t.id, t.title, t.artist, t.album, t.external_id],
        )?;
        if added > 0 {
            debug!(track = %t, "Added new remote track");
        }
        let new = tx.execute(
            "INSERT OR IGNORE INTO play_event (track_id, timestamp) VALUES (?1, ?2)",
            params![t.id, record.timestamp],
        )? > 0;
        tx.commit()?;
        Ok(new)
    }

    // ========================================================================
    // Candidate Queries
    // ========================================================================

    pub fn find_by_external_id(&self, external_id: &str) -> Result<Vec<RemoteTrack>> {
        self.query_remote(
            &format!(
                "SELECT {REMOTE_COLUMNS} FROM remote_track WHERE external_id = ?1 ORDER BY rowid"
            ),
            [external_id],
        )
    }

    /// Case-insensitive equality on all three fields. Absent albums match each other.
    pub fn find_exact(
        &self,
        title: &str,
        artist: &str,
        album: Option<&str>,
    ) -> Result<Vec<RemoteTrack>> {
        self.query_remote(
            &format!(
                "SELECT {REMOTE_COLUMNS} FROM remote_track
                 WHERE title = ?1 COLLATE {UNICODE_NOCASE}
                   AND artist = ?2 COLLATE {UNICODE_NOCASE}
                   AND album IS ?3 COLLATE {UNICODE_NOCASE}
                 ORDER BY rowid"
            ),
            params![title, artist, album],
        )
    }

    /// Tracks sharing at least one field (case-insensitive). Bounds the fuzzy search.
    pub fn find_by_any_field(
        &self,
        title: &str,
        artist: &str,
        album: Option<&str>,
    ) -> Result<Vec<RemoteTrack>> {
        self.query_remote(
            &format!(
                "SELECT {REMOTE_COLUMNS} FROM remote_track
                 WHERE title = ?1 COLLATE {UNICODE_NOCASE}
                    OR artist = ?2 COLLATE {UNICODE_NOCASE}
                    OR album = ?3 COLLATE {UNICODE_NOCASE}
                 ORDER BY rowid"
            ),
            params![title, artist, album],
        )
    }

    pub fn is_blacklisted(&self, local_id: &str, remote_id: &str) -> Result<bool> {
        Ok(self
            .conn
            .prepare_cached(
                "SELECT 1 FROM blacklist WHERE remote_track_id = ?1 AND local_track_id = ?2",
            )?
            .query_row(params![remote_id, local_id], |_| Ok(()))
            .optional()?
            .is_some())
    }

    // ========================================================================
    // Decisions
    // ========================================================================

    pub fn record_match(&self, local_id: &str, remote_id: &str) -> Result<()> {
        self.write_pairs(PairTable::Match, local_id, &[remote_id]).map(|_| ())
    }

    pub fn record_blacklist(&self, local_id: &str, remote_id: &str) -> Result<()> {
        self.write_pairs(PairTable::Blacklist, local_id, &[remote_id]).map(|_| ())
    }

    /// Link a whole accepted set in one transaction. Returns rows newly inserted.
    pub fn record_matches(&self, local_id: &str, remote_ids: &[&str]) -> Result<usize> {
        self.write_pairs(PairTable::Match, local_id, remote_ids)
    }

    /// Blacklist a whole rejected set in one transaction. Returns rows newly inserted.
    pub fn record_blacklists(&self, local_id: &str, remote_ids: &[&str]) -> Result<usize> {
        self.write_pairs(PairTable::Blacklist, local_id, remote_ids)
    }

    fn write_pairs(&self, table: PairTable, local_id: &str, remote_ids: &[&str]) -> Result<usize> {
        self.require_library()?;
        let tx = self.conn.unchecked_transaction()?;
        if !Self::exists(&tx, "SELECT 1 FROM library.media_file WHERE id = ?1", local_id)? {
            return Err(Error::ConstraintViolation(format!(
                "unknown local track {local_id}"
            )));
        }
        let mut inserted = 0;
        {
            let sql = format!(
                "INSERT OR IGNORE INTO {} (remote_track_id, local_track_id) VALUES (?1, ?2)",
                table.name()
            );
            let mut stmt = tx.prepare_cached(&sql)?;
            for remote_id in remote_ids {
                if !Self::exists(&tx, "SELECT 1 FROM remote_track WHERE id = ?1", remote_id)? {
                    return Err(Error::ConstraintViolation(format!(
                        "unknown remote track {remote_id}"
                    )));
                }
                inserted += stmt.execute(params![remote_id, local_id])?;
            }
        }
        tx.commit()?;
        debug!(table = table.name(), local_id, inserted, "Recorded pairs");
        Ok(inserted)
    }

    // ========================================================================
    // Local Library
    // ========================================================================

    /// Lazily iterate local tracks that have no match yet.
    /// Each page is queried against the current state, so a fresh call restarts cleanly.
    pub fn unmatched_local_tracks(&self) -> UnmatchedTracks<'_> {
        UnmatchedTracks {
            store: self,
            after: None,
            buffer: Vec::new().into_iter(),
            exhausted: false,
        }
    }

    fn unmatched_page(&self, after: Option<&str>, limit: usize) -> Result<Vec<LocalTrack>> {
        self.require_library()?;
        let mut stmt = self.conn.prepare_cached(
            "SELECT t.id, t.title, t.artist, t.album, t.mbz_recording_id
             FROM library.media_file t
             WHERE (?1 IS NULL OR t.id > ?1)
               AND NOT EXISTS (SELECT 1 FROM track_match m WHERE m.local_track_id = t.id)
             ORDER BY t.id
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after, limit as i64], local_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn is_matched(&self, local_id: &str) -> Result<bool> {
        Self::exists(
            &self.conn,
            "SELECT 1 FROM track_match WHERE local_track_id = ?1",
            local_id,
        )
    }

    pub fn local_track(&self, local_id: &str) -> Result<Option<LocalTrack>> {
        self.require_library()?;
        Ok(self
            .conn
            .query_row(
                "SELECT id, title, artist, album, mbz_recording_id
                 FROM library.media_file WHERE id = ?1",
                [local_id],
                local_from_row,
            )
            .optional()?)
    }

    /// Remote tracks currently linked to a local track.
    pub fn matches_for(&self, local_id: &str) -> Result<Vec<RemoteTrack>> {
        self.query_remote(
            "SELECT r.id, r.title, r.artist, r.album, r.external_id
             FROM track_match m JOIN remote_track r ON r.id = m.remote_track_id
             WHERE m.local_track_id = ?1
             ORDER BY r.rowid",
            [local_id],
        )
    }

    /// The library user called `user_name`, or the only user if no name is given.
    pub fn library_user(&self, user_name: Option<&str>) -> Result<LibraryUser> {
        self.require_library()?;
        let mut stmt = self.conn.prepare("SELECT id, user_name FROM library.user")?;
        let users = stmt
            .query_map([], |row| {
                Ok(LibraryUser {
                    id: row.get(0)?,
                    user_name: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut users: Vec<LibraryUser> = match user_name {
            Some(name) => users.into_iter().filter(|u| u.user_name == name).collect(),
            None => users,
        };
        match users.len() {
            0 => Err(Error::Config("no matching user in the library database".into())),
            1 => Ok(users.remove(0)),
            n => Err(Error::Config(format!(
                "{n} library users found, pass --library-user to pick one"
            ))),
        }
    }

    /// Raise library play counts and dates from matched play events.
    ///
    /// All upserts run in one transaction. `confirm` sees the rows that would
    /// change; returning false rolls everything back.
    pub fn sync_play_counts(
        &self,
        user_id: &str,
        confirm: impl FnOnce(&[PlayCountChange]) -> bool,
    ) -> Result<SyncReport> {
        self.require_library()?;
        let tx = self.conn.unchecked_transaction()?;
        let changes = {
            let mut stmt = tx.prepare(
                "INSERT INTO library.annotation (user_id, item_id, item_type, play_count, play_date)
                 SELECT
                     ?1,
                     counted.local_track_id,
                     'media_file',
                     counted.play_count,
                     datetime(counted.last_played, 'unixepoch')
                 FROM (
                     SELECT m.local_track_id AS local_track_id,
                            MAX(p.timestamp) AS last_played,
                            COUNT(*) AS play_count
                     FROM play_event p
                     JOIN track_match m ON p.track_id = m.remote_track_id
                     GROUP BY m.local_track_id
                 ) AS counted
                 WHERE true
                 ON CONFLICT (user_id, item_id, item_type) DO UPDATE
                 SET play_count = excluded.play_count, play_date = excluded.play_date
                 WHERE play_count < excluded.play_count
                    OR unixepoch(play_date) < unixepoch(excluded.play_date)
                 RETURNING item_id, play_count, play_date",
            )?;
            let rows = stmt.query_map([user_id], |row| {
                Ok(PlayCountChange {
                    local_track_id: row.get(0)?,
                    play_count: row.get(1)?,
                    play_date: row.get(2)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        if changes.is_empty() {
            return Ok(SyncReport {
                changes,
                committed: false,
            });
        }
        let committed = confirm(&changes);
        if committed {
            tx.commit()?;
            info!(rows = changes.len(), "Updated library play counts");
        } else {
            tx.rollback()?;
            info!("Play count update aborted");
        }
        Ok(SyncReport { changes, committed })
    }

    // ========================================================================
    // Counts
    // ========================================================================

    fn count(&self, sql: &str) -> Result<usize> {
        let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn count_play_events(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM play_event")
    }

    pub fn count_remote_tracks(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM remote_track")
    }

    pub fn count_matches(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM track_match")
    }

    pub fn count_unmatched(&self) -> Result<usize> {
        self.require_library()?;
        self.count(
            "SELECT COUNT(*) FROM library.media_file t
             WHERE NOT EXISTS (SELECT 1 FROM track_match m WHERE m.local_track_id = t.id)",
        )
    }
}

/// Paged iterator over unmatched local tracks, see [`CandidateStore::unmatched_local_tracks`].
pub struct UnmatchedTracks<'a> {
    store: &'a CandidateStore,
    after: Option<String>,
    buffer: std::vec::IntoIter<LocalTrack>,
    exhausted: bool,
}

impl Iterator for UnmatchedTracks<'_> {
    type Item = Result<LocalTrack>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(track) = self.buffer.next() {
                // Skip tracks matched since this page was read
                match self.store.is_matched(&track.id) {
                    Ok(true) => continue,
                    Ok(false) => return Some(Ok(track)),
                    Err(e) => return Some(Err(e)),
                }
            }
            if self.exhausted {
                return None;
            }
            match self
                .store
                .unmatched_page(self.after.as_deref(), UNMATCHED_PAGE_SIZE)
            {
                Ok(page) => {
                    if page.len() < UNMATCHED_PAGE_SIZE {
                        self.exhausted = true;
                    }
                    match page.last() {
                        Some(last) => self.after = Some(last.id.clone()),
                        None => return None,
                    }
                    self.buffer = page.into_iter();
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

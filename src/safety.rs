//! Safety checks so the scrobble store never lands on the library database.
//!
//! The store is created and written freely; the library is only touched by
//! `update-counts`. Mixing the two up would write our tables into the library.

use anyhow::{bail, Result};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;

/// Table that identifies a library database.
const LIBRARY_MARKER_TABLE: &str = "media_file";

/// File names the library server uses for its own database.
const LIBRARY_FILE_NAMES: [&str; 2] = ["navidrome.db", "navidrome.db-wal"];

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn has_library_tables(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let found: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [LIBRARY_MARKER_TABLE],
        |row| row.get(0),
    )?;
    Ok(found > 0)
}

/// Validates that `store` is safe to use as the scrobble store.
///
/// Checks:
/// - Store cannot be the library database itself
/// - Store file name cannot be the library server's database name
/// - An existing store file must not contain library tables
pub fn validate_store_path(store: &Path, library: Option<&Path>) -> Result<()> {
    if let Some(library) = library {
        if same_file(store, library) {
            bail!(
                "Safety check failed: store '{}' cannot be the library database",
                store.display()
            );
        }
    }

    let store_name = store.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if LIBRARY_FILE_NAMES.contains(&store_name) {
        bail!(
            "Safety check failed: store '{}' matches the library database name",
            store.display()
        );
    }

    if has_library_tables(store)? {
        bail!(
            "Safety check failed: store '{}' contains library tables",
            store.display()
        );
    }

    Ok(())
}

//! SQLite-backed cache index.
//!
//! One table maps a cache-key string to a stable numeric folder id and the
//! hash-list current at the last write:
//!
//! ```sql
//! CREATE TABLE cache (id INTEGER PRIMARY KEY, filesid TEXT UNIQUE, hashlist TEXT)
//! ```
//!
//! The index is append-only with respect to ids: a key keeps its id across
//! processes and time. Concurrent inserts of the same key are resolved by
//! the UNIQUE constraint; losers fall back to the winner's row.

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension};

use super::CacheError;

/// Handle on the cache index database.
pub struct CacheIndex {
    conn: Connection,
}

/// One index row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub id: i64,
    pub hash_list: String,
}

impl CacheIndex {
    /// Open (creating if needed) the index database at `path`.
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        // Writers from concurrent evaluations share this database; let
        // SQLite wait instead of surfacing SQLITE_BUSY immediately.
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS cache (
                id INTEGER PRIMARY KEY,
                filesid TEXT UNIQUE NOT NULL,
                hashlist TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self { conn })
    }

    /// Look up a key string, returning its row when present.
    pub fn lookup(&self, files_id: &str) -> Result<Option<IndexEntry>, CacheError> {
        let entry = self
            .conn
            .query_row(
                "SELECT id, hashlist FROM cache WHERE filesid = ?1",
                [files_id],
                |row| {
                    Ok(IndexEntry {
                        id: row.get(0)?,
                        hash_list: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    /// Insert a key, returning the (possibly pre-existing) row id.
    pub fn insert(&self, files_id: &str, hash_list: &str) -> Result<i64, CacheError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO cache (filesid, hashlist) VALUES (?1, ?2)",
            [files_id, hash_list],
        )?;
        // Re-read: either our insert or a concurrent winner's
        let entry = self.lookup(files_id)?.ok_or_else(|| {
            CacheError::Corrupt(format!("index row vanished for key `{files_id}`"))
        })?;
        Ok(entry.id)
    }

    /// Replace the stored hash-list for a row (cache invalidation path).
    pub fn update_hash_list(&self, id: i64, hash_list: &str) -> Result<(), CacheError> {
        self.conn.execute(
            "UPDATE cache SET hashlist = ?1 WHERE id = ?2",
            rusqlite::params![hash_list, id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_index(temp: &TempDir) -> CacheIndex {
        CacheIndex::open(&temp.path().join("index.sqlite")).unwrap()
    }

    #[test]
    fn insert_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let index = open_index(&temp);

        let id1 = index.insert("cache:compile:sol;file:a:123", "123").unwrap();
        let id2 = index.insert("cache:compile:sol;file:a:123", "123").unwrap();
        assert_eq!(id1, id2);

        let id3 = index.insert("cache:compile:sol;file:a:456", "456").unwrap();
        assert_ne!(id1, id3);
    }

    #[test]
    fn ids_are_stable_across_reopens() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("index.sqlite");
        let id1 = {
            let index = CacheIndex::open(&path).unwrap();
            index.insert("key", "h1").unwrap()
        };
        let index = CacheIndex::open(&path).unwrap();
        assert_eq!(index.lookup("key").unwrap().unwrap().id, id1);
    }

    #[test]
    fn hash_list_update() {
        let temp = TempDir::new().unwrap();
        let index = open_index(&temp);

        let id = index.insert("key", "old").unwrap();
        index.update_hash_list(id, "new").unwrap();
        let entry = index.lookup("key").unwrap().unwrap();
        assert_eq!(entry.id, id);
        assert_eq!(entry.hash_list, "new");
    }

    #[test]
    fn lookup_missing_is_none() {
        let temp = TempDir::new().unwrap();
        let index = open_index(&temp);
        assert!(index.lookup("nope").unwrap().is_none());
    }
}

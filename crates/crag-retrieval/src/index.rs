use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::debug;

use crag_core::error::{CragError, Result};
use crag_core::types::Passage;

use crate::embeddings::cosine_similarity;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS chunks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source TEXT NOT NULL,
        chunk_index INTEGER NOT NULL,
        content TEXT NOT NULL,
        embedding BLOB NOT NULL,
        indexed_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source, chunk_index);

    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );";

/// SQLite-backed embedding index of document chunks.
///
/// Vectors are stored as little-endian `f32` blobs and scanned with cosine
/// similarity; corpora here are small enough that a flat scan is fine.
pub struct VectorIndex {
    conn: Mutex<Connection>,
}

impl VectorIndex {
    /// Open or create an index at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CragError::Database(format!("Failed to create index directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| CragError::Database(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| CragError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| CragError::Database(e.to_string()))?;

        debug!(path = %path.display(), "Vector index opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an existing index read-only; never creates or alters a file.
    pub fn open_existing(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(CragError::IndexUnavailable(format!(
                "no index at {} (run `crag index` first)",
                path.display()
            )));
        }
        let unavailable = |e: rusqlite::Error| CragError::IndexUnavailable(format!("{}: {}", path.display(), e));
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(unavailable)?;

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('chunks', 'meta')",
                [],
                |row| row.get(0),
            )
            .map_err(unavailable)?;
        if tables != 2 {
            return Err(CragError::IndexUnavailable(format!(
                "{} is not a crag index",
                path.display()
            )));
        }

        debug!(path = %path.display(), "Vector index opened read-only");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory index (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| CragError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| CragError::Database(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| CragError::Database(e.to_string()))
    }

    /// Number of indexed chunks.
    pub fn len(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))
            .map_err(|e| CragError::Database(e.to_string()))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Embedding dimensions recorded when the first chunks were written.
    pub fn dimensions(&self) -> Result<Option<usize>> {
        let conn = self.lock()?;
        let value: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'dimensions'", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| CragError::Database(e.to_string()))?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    /// Replace every chunk of `source` with the given (text, embedding) pairs.
    pub fn replace_source(&self, source: &str, chunks: &[(String, Vec<f32>)]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| CragError::Database(e.to_string()))?;

        if let Some((_, first)) = chunks.first() {
            let recorded: Option<String> = tx
                .query_row("SELECT value FROM meta WHERE key = 'dimensions'", [], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(|e| CragError::Database(e.to_string()))?;
            match recorded.and_then(|v| v.parse::<usize>().ok()) {
                Some(dims) if dims != first.len() => {
                    return Err(CragError::Database(format!(
                        "embedding has {} dimensions but the index holds {}",
                        first.len(),
                        dims
                    )));
                }
                Some(_) => {}
                None => {
                    tx.execute(
                        "INSERT INTO meta (key, value) VALUES ('dimensions', ?1)",
                        params![first.len().to_string()],
                    )
                    .map_err(|e| CragError::Database(e.to_string()))?;
                }
            }
        }

        tx.execute("DELETE FROM chunks WHERE source = ?1", params![source])
            .map_err(|e| CragError::Database(e.to_string()))?;

        let now = Utc::now().to_rfc3339();
        for (i, (text, embedding)) in chunks.iter().enumerate() {
            let blob: Vec<u8> = embedding.iter().flat_map(|f| f.to_le_bytes()).collect();
            tx.execute(
                "INSERT INTO chunks (source, chunk_index, content, embedding, indexed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![source, i as i64, text, blob, now],
            )
            .map_err(|e| CragError::Database(e.to_string()))?;
        }

        tx.commit().map_err(|e| CragError::Database(e.to_string()))?;
        debug!(source, chunks = chunks.len(), "Indexed source");
        Ok(chunks.len())
    }

    /// Return the `limit` chunks most similar to `query_vec`, best first.
    pub fn search(&self, query_vec: &[f32], limit: usize) -> Result<Vec<(f32, Passage)>> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare("SELECT embedding, source, content FROM chunks ORDER BY id")
            .map_err(|e| CragError::Database(e.to_string()))?;

        let rows = stmt
            .query_map([], |row| {
                let blob: Vec<u8> = row.get(0)?;
                let source: String = row.get(1)?;
                let content: String = row.get(2)?;
                Ok((blob, source, content))
            })
            .map_err(|e| CragError::Database(e.to_string()))?;

        let mut scored: Vec<(f32, Passage)> = Vec::new();

        for row in rows {
            let (blob, source, content) = row.map_err(|e| CragError::Database(e.to_string()))?;

            let embedding: Vec<f32> = blob
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect();

            let sim = cosine_similarity(query_vec, &embedding);
            scored.push((sim, Passage::local(content, source)));
        }

        // Stable sort keeps insertion order among ties
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_and_search() {
        let index = VectorIndex::in_memory().unwrap();
        index
            .replace_source(
                "agents.md",
                &[
                    ("Agents plan with tools.".into(), vec![1.0, 0.0]),
                    ("Memory for agents.".into(), vec![0.7, 0.7]),
                ],
            )
            .unwrap();
        index
            .replace_source("cooking.md", &[("Boil the pasta.".into(), vec![0.0, 1.0])])
            .unwrap();

        assert_eq!(index.len().unwrap(), 3);
        let hits = index.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].1.text, "Agents plan with tools.");
        assert_eq!(hits[0].1.source, "agents.md");
        assert_eq!(hits[1].1.text, "Memory for agents.");
    }

    #[test]
    fn test_replace_source_drops_old_chunks() {
        let index = VectorIndex::in_memory().unwrap();
        index
            .replace_source("a.md", &[("v1".into(), vec![1.0]), ("v1b".into(), vec![1.0])])
            .unwrap();
        index.replace_source("a.md", &[("v2".into(), vec![1.0])]).unwrap();
        assert_eq!(index.len().unwrap(), 1);
        assert_eq!(index.search(&[1.0], 5).unwrap()[0].1.text, "v2");
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let index = VectorIndex::in_memory().unwrap();
        index.replace_source("a.md", &[("x".into(), vec![1.0, 0.0])]).unwrap();
        assert_eq!(index.dimensions().unwrap(), Some(2));
        let err = index
            .replace_source("b.md", &[("y".into(), vec![1.0, 0.0, 0.0])])
            .unwrap_err();
        assert!(err.to_string().contains("3 dimensions"));
    }

    #[test]
    fn test_open_existing_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = VectorIndex::open_existing(&dir.path().join("missing.db"))
            .err()
            .expect("missing index must fail");
        assert!(matches!(err, CragError::IndexUnavailable(_)));
    }

    #[test]
    fn test_open_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("index.db");
        {
            let index = VectorIndex::open(&path).unwrap();
            index.replace_source("a.md", &[("x".into(), vec![1.0])]).unwrap();
        }
        let reopened = VectorIndex::open_existing(&path).unwrap();
        assert_eq!(reopened.len().unwrap(), 1);
        assert_eq!(reopened.dimensions().unwrap(), Some(1));
        assert!(reopened.replace_source("b.md", &[("y".into(), vec![1.0])]).is_err());
    }

    #[test]
    fn test_open_existing_leaves_foreign_database_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE notes (body TEXT);")
            .unwrap();

        let err = VectorIndex::open_existing(&path)
            .err()
            .expect("foreign database must be rejected");
        assert!(matches!(err, CragError::IndexUnavailable(ref m) if m.contains("not a crag index")));

        let conn = Connection::open(&path).unwrap();
        let chunks: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'chunks'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(chunks, 0);
    }
}

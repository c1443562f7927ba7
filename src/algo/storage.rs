//! SQLite-backed checkpoint store.
//!
//! Each checkpoint is keyed by `(stage, source_fingerprint, config_hash)` and
//! stored as a JSON blob. Upserts run in a single statement, so an
//! interrupted write leaves the previous checkpoint for that key intact.

use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use super::checkpoint::{CheckpointInfo, CheckpointMeta, CheckpointStore, Stage};
use crate::error::{DedupError, Result};

/// SQLite database holding stage checkpoints.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn storage_err(context: &str) -> impl FnOnce(rusqlite::Error) -> DedupError + '_ {
    move |e| DedupError::Storage(format!("{context}: {e}"))
}

impl SqliteStore {
    /// Open (or create) a checkpoint database at the given path.
    pub fn open_or_create(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| DedupError::Storage(format!("Failed to open checkpoint DB at '{path}': {e}")))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(storage_err("Failed to set PRAGMA"))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                stage               TEXT NOT NULL,
                source_fingerprint  INTEGER NOT NULL,
                config_hash         INTEGER NOT NULL,
                doc_count           INTEGER NOT NULL,
                version             TEXT NOT NULL,
                created_at          INTEGER NOT NULL,
                payload             BLOB NOT NULL,
                UNIQUE(stage, source_fingerprint, config_hash)
            );
            CREATE INDEX IF NOT EXISTS idx_checkpoint_lookup
                ON checkpoints(stage, source_fingerprint, config_hash);",
        )
        .map_err(storage_err("Failed to create checkpoint schema"))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| DedupError::Storage("checkpoint connection lock poisoned".into()))
    }

    /// Total size of the database file in bytes (approximate).
    pub fn db_size_bytes(&self) -> Result<u64> {
        let conn = self.conn()?;
        let page_count: i64 = conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))
            .map_err(storage_err("Failed to get page_count"))?;
        let page_size: i64 = conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))
            .map_err(storage_err("Failed to get page_size"))?;
        Ok((page_count * page_size) as u64)
    }
}

impl CheckpointStore for SqliteStore {
    fn get(
        &self,
        stage: Stage,
        source_fingerprint: u64,
        config_hash: u64,
    ) -> Result<Option<(CheckpointMeta, Vec<u8>)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT doc_count, version, created_at, payload
                 FROM checkpoints
                 WHERE stage = ?1 AND source_fingerprint = ?2 AND config_hash = ?3",
            )
            .map_err(storage_err("Failed to prepare SELECT"))?;

        let result = stmt
            .query_row(
                params![stage.as_str(), source_fingerprint as i64, config_hash as i64],
                |row| {
                    let doc_count: i64 = row.get(0)?;
                    let version: String = row.get(1)?;
                    let created_at: i64 = row.get(2)?;
                    let payload: Vec<u8> = row.get(3)?;
                    Ok((doc_count, version, created_at, payload))
                },
            )
            .optional()
            .map_err(storage_err("Failed to query checkpoint"))?;

        Ok(result.map(|(doc_count, version, created_at, payload)| {
            let meta = CheckpointMeta {
                source_fingerprint,
                doc_count: doc_count as usize,
                config_hash,
                version,
                created_at: created_at as u64,
            };
            (meta, payload)
        }))
    }

    fn put(&self, stage: Stage, meta: &CheckpointMeta, payload: &[u8]) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO checkpoints (stage, source_fingerprint, config_hash, doc_count, version, created_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(stage, source_fingerprint, config_hash)
                 DO UPDATE SET doc_count = excluded.doc_count,
                               version = excluded.version,
                               created_at = excluded.created_at,
                               payload = excluded.payload",
                params![
                    stage.as_str(),
                    meta.source_fingerprint as i64,
                    meta.config_hash as i64,
                    meta.doc_count as i64,
                    meta.version,
                    meta.created_at as i64,
                    payload,
                ],
            )
            .map_err(storage_err("Failed to upsert checkpoint"))?;
        Ok(())
    }

    fn invalidate(&self, stage: Option<Stage>) -> Result<usize> {
        let conn = self.conn()?;
        match stage {
            Some(s) => conn
                .execute("DELETE FROM checkpoints WHERE stage = ?1", params![s.as_str()])
                .map_err(storage_err("Failed to invalidate")),
            None => conn
                .execute("DELETE FROM checkpoints", [])
                .map_err(storage_err("Failed to invalidate all")),
        }
    }

    fn info(&self) -> Result<Vec<CheckpointInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT stage, source_fingerprint, config_hash, doc_count, version, created_at, length(payload)
                 FROM checkpoints
                 ORDER BY created_at DESC",
            )
            .map_err(storage_err("Failed to prepare info query"))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(CheckpointInfo {
                    stage: row.get::<_, String>(0)?,
                    source_fingerprint: row.get::<_, i64>(1)? as u64,
                    config_hash: row.get::<_, i64>(2)? as u64,
                    doc_count: row.get::<_, i64>(3)? as usize,
                    version: row.get(4)?,
                    created_at: row.get::<_, i64>(5)? as u64,
                    payload_bytes: row.get::<_, i64>(6)? as usize,
                })
            })
            .map_err(storage_err("Failed to query info"))?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row.map_err(storage_err("Failed to read row"))?);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::checkpoint::{load, save};

    fn test_db() -> SqliteStore {
        SqliteStore::open_or_create(":memory:").unwrap()
    }

    #[test]
    fn open_or_create_in_memory() {
        let db = test_db();
        assert!(db.info().unwrap().is_empty());
    }

    #[test]
    fn put_and_get_roundtrip() {
        let db = test_db();
        let meta = CheckpointMeta::new(111, 50, 222);
        db.put(Stage::Exact, &meta, b"payload").unwrap();

        let (got_meta, got_payload) = db.get(Stage::Exact, 111, 222).unwrap().unwrap();
        assert_eq!(got_meta.source_fingerprint, 111);
        assert_eq!(got_meta.config_hash, 222);
        assert_eq!(got_meta.doc_count, 50);
        assert_eq!(got_payload, b"payload");
    }

    #[test]
    fn get_miss_returns_none() {
        let db = test_db();
        assert!(db.get(Stage::Clusters, 999, 888).unwrap().is_none());
    }

    #[test]
    fn put_upsert_overwrites() {
        let db = test_db();
        db.put(Stage::Exact, &CheckpointMeta::new(111, 50, 222), b"first").unwrap();
        db.put(Stage::Exact, &CheckpointMeta::new(111, 100, 222), b"second").unwrap();

        let (got_meta, got_payload) = db.get(Stage::Exact, 111, 222).unwrap().unwrap();
        assert_eq!(got_meta.doc_count, 100);
        assert_eq!(got_payload, b"second");
    }

    #[test]
    fn invalidate_by_stage() {
        let db = test_db();
        let meta = CheckpointMeta::new(111, 50, 222);
        db.put(Stage::Exact, &meta, b"exact").unwrap();
        db.put(Stage::Signatures, &meta, b"sigs").unwrap();

        assert_eq!(db.invalidate(Some(Stage::Exact)).unwrap(), 1);
        assert!(db.get(Stage::Exact, 111, 222).unwrap().is_none());
        assert!(db.get(Stage::Signatures, 111, 222).unwrap().is_some());
        assert_eq!(db.invalidate(None).unwrap(), 1);
    }

    #[test]
    fn typed_save_load() {
        let db = test_db();
        let meta = CheckpointMeta::new(5, 2, 6);
        save(&db, Stage::Signatures, &meta, &vec![vec![7u64, 8]]).unwrap();
        let got: Option<Vec<Vec<u64>>> = load(&db, Stage::Signatures, 5, 6).unwrap();
        assert_eq!(got, Some(vec![vec![7, 8]]));
    }

    #[test]
    fn info_includes_payload_size() {
        let db = test_db();
        db.put(Stage::Clusters, &CheckpointMeta::new(1, 1, 1), &vec![0u8; 1024]).unwrap();
        let info = db.info().unwrap();
        assert_eq!(info[0].payload_bytes, 1024);
        assert_eq!(info[0].stage, "clusters");
        assert!(db.db_size_bytes().unwrap() > 0);
    }
}

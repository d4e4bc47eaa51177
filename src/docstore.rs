//! Relational store for files and parent chunks.
//!
//! Files and the parent chunks derived from them live in SQLite; child
//! vectors live in the vector index and point back here via
//! `(source, parent_id)`. Deleting a file cascades to its parents; the
//! caller is responsible for also clearing the vector index so the two
//! stores stay in sync.

use anyhow::Result;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::models::{FileRecord, ParentChunk, RetrievedParent, ScoredPoint};

pub struct Docstore {
    pool: SqlitePool,
}

impl Docstore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a transaction for staging ingestion writes. Rows staged
    /// through the `*_in` methods stay invisible until the caller commits.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Insert a file record, or refresh it if the name already exists.
    /// Returns the row id.
    pub async fn upsert_file(
        &self,
        name: &str,
        storage_json: &str,
        collection: &str,
    ) -> Result<i64> {
        let mut tx = self.begin().await?;
        let id = Self::upsert_file_in(&mut tx, name, storage_json, collection).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Transaction-scoped variant of [`upsert_file`](Self::upsert_file).
    pub async fn upsert_file_in(
        tx: &mut Transaction<'_, Sqlite>,
        name: &str,
        storage_json: &str,
        collection: &str,
    ) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let row = sqlx::query(
            r#"
            INSERT INTO files (name, storage_json, collection, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                storage_json = excluded.storage_json,
                collection = excluded.collection
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(storage_json)
        .bind(collection)
        .bind(now)
        .fetch_one(&mut **tx)
        .await?;

        Ok(row.get::<i64, _>("id"))
    }

    pub async fn get_file(&self, name: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query(
            "SELECT id, name, storage_json, collection, created_at FROM files WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(file_from_row))
    }

    pub async fn list_files(&self) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query(
            "SELECT id, name, storage_json, collection, created_at FROM files ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(file_from_row).collect())
    }

    /// Delete a file and (via cascade) its parent chunks. Returns the
    /// deleted record, or `None` if no such file exists.
    pub async fn delete_file(&self, name: &str) -> Result<Option<FileRecord>> {
        let Some(record) = self.get_file(name).await? else {
            return Ok(None);
        };

        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(record.id)
            .execute(&self.pool)
            .await?;

        Ok(Some(record))
    }

    /// Store the full set of parent chunks for a file. Any previously
    /// stored chunks for `source` are removed first, so a shrunk document
    /// never leaves stale rows at higher sequence ids.
    pub async fn replace_parents(
        &self,
        file_id: i64,
        source: &str,
        parents: &[ParentChunk],
    ) -> Result<()> {
        let mut tx = self.begin().await?;
        Self::replace_parents_in(&mut tx, file_id, source, parents).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Transaction-scoped variant of [`replace_parents`](Self::replace_parents).
    pub async fn replace_parents_in(
        tx: &mut Transaction<'_, Sqlite>,
        file_id: i64,
        source: &str,
        parents: &[ParentChunk],
    ) -> Result<()> {
        sqlx::query("DELETE FROM parents WHERE source = ?")
            .bind(source)
            .execute(&mut **tx)
            .await?;
        for parent in parents {
            sqlx::query("INSERT INTO parents (file_id, source, seq, text) VALUES (?, ?, ?, ?)")
                .bind(file_id)
                .bind(&parent.source)
                .bind(parent.seq)
                .bind(&parent.text)
                .execute(&mut **tx)
                .await?;
        }

        tracing::debug!(count = parents.len(), source, "parent chunks staged");
        Ok(())
    }

    pub async fn get_parent(&self, source: &str, seq: i64) -> Result<Option<ParentChunk>> {
        let row = sqlx::query("SELECT source, seq, text FROM parents WHERE source = ? AND seq = ?")
            .bind(source)
            .bind(seq)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| ParentChunk {
            source: r.get("source"),
            seq: r.get("seq"),
            text: r.get("text"),
        }))
    }

    pub async fn count_parents(&self, source: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM parents WHERE source = ?")
            .bind(source)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Map child hits to their parent chunks.
    ///
    /// Hits sharing a parent are collapsed to one entry at the first hit's
    /// rank; hits whose parent is missing from the store are dropped.
    pub async fn resolve_parents(&self, hits: &[ScoredPoint]) -> Result<Vec<RetrievedParent>> {
        let mut seen: Vec<(String, i64)> = Vec::new();
        let mut parents = Vec::new();

        for hit in hits {
            let key = (hit.payload.source.clone(), hit.payload.parent_id);
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);

            if let Some(parent) = self
                .get_parent(&hit.payload.source, hit.payload.parent_id)
                .await?
            {
                parents.push(RetrievedParent {
                    source: parent.source,
                    seq: parent.seq,
                    text: parent.text,
                    rerank_score: None,
                });
            }
        }

        Ok(parents)
    }

    /// Widen a parent to include its immediate neighbors: the texts of
    /// sequence ids `seq-1`, `seq`, `seq+1` (those that exist) joined with
    /// a single space, in ascending sequence order.
    pub async fn expand_neighbors(&self, source: &str, seq: i64) -> Result<String> {
        let rows = sqlx::query(
            "SELECT text FROM parents WHERE source = ? AND seq BETWEEN ? AND ? ORDER BY seq",
        )
        .bind(source)
        .bind(seq - 1)
        .bind(seq + 1)
        .fetch_all(&self.pool)
        .await?;

        let texts: Vec<String> = rows.into_iter().map(|r| r.get("text")).collect();
        Ok(texts.join(" "))
    }
}

fn file_from_row(row: sqlx::sqlite::SqliteRow) -> FileRecord {
    FileRecord {
        id: row.get("id"),
        name: row.get("name"),
        storage_json: row.get("storage_json"),
        collection: row.get("collection"),
        created_at: row.get("created_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::ChildPayload;

    async fn store() -> Docstore {
        let pool = db::connect_memory().await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        Docstore::new(pool)
    }

    fn parent(source: &str, seq: i64, text: &str) -> ParentChunk {
        ParentChunk {
            source: source.to_string(),
            seq,
            text: text.to_string(),
        }
    }

    fn hit(source: &str, parent_id: i64) -> ScoredPoint {
        ScoredPoint {
            id: parent_id as u64,
            score: 1.0,
            payload: ChildPayload {
                text: String::new(),
                source: source.to_string(),
                parent_id,
                child_id: 0,
            },
        }
    }

    #[tokio::test]
    async fn test_upsert_file_idempotent() {
        let store = store().await;
        let id1 = store.upsert_file("a.txt", "{}", "docs").await.unwrap();
        let id2 = store.upsert_file("a.txt", "{}", "docs").await.unwrap();
        assert_eq!(id1, id2);
        assert_eq!(store.list_files().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_file_cascades_to_parents() {
        let store = store().await;
        let id = store.upsert_file("a.txt", "{}", "docs").await.unwrap();
        store
            .replace_parents(id, "a.txt", &[parent("a.txt", 0, "p0"), parent("a.txt", 1, "p1")])
            .await
            .unwrap();
        assert_eq!(store.count_parents("a.txt").await.unwrap(), 2);

        let deleted = store.delete_file("a.txt").await.unwrap();
        assert!(deleted.is_some());
        assert_eq!(store.count_parents("a.txt").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_missing_file() {
        let store = store().await;
        assert!(store.delete_file("nope.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reingest_replaces_parent_text() {
        let store = store().await;
        let id = store.upsert_file("a.txt", "{}", "docs").await.unwrap();
        store
            .replace_parents(id, "a.txt", &[parent("a.txt", 0, "old")])
            .await
            .unwrap();
        store
            .replace_parents(id, "a.txt", &[parent("a.txt", 0, "new")])
            .await
            .unwrap();

        let p = store.get_parent("a.txt", 0).await.unwrap().unwrap();
        assert_eq!(p.text, "new");
        assert_eq!(store.count_parents("a.txt").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_replace_with_fewer_parents_drops_stale_rows() {
        let store = store().await;
        let id = store.upsert_file("a.txt", "{}", "docs").await.unwrap();
        store
            .replace_parents(
                id,
                "a.txt",
                &[
                    parent("a.txt", 0, "zero"),
                    parent("a.txt", 1, "one"),
                    parent("a.txt", 2, "two"),
                ],
            )
            .await
            .unwrap();
        store
            .replace_parents(id, "a.txt", &[parent("a.txt", 0, "fresh")])
            .await
            .unwrap();

        assert_eq!(store.count_parents("a.txt").await.unwrap(), 1);
        assert!(store.get_parent("a.txt", 2).await.unwrap().is_none());
        assert_eq!(store.expand_neighbors("a.txt", 0).await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_resolve_parents_dedupes_in_hit_order() {
        let store = store().await;
        let id = store.upsert_file("a.txt", "{}", "docs").await.unwrap();
        store
            .replace_parents(
                id,
                "a.txt",
                &[parent("a.txt", 0, "p0"), parent("a.txt", 1, "p1")],
            )
            .await
            .unwrap();

        // Parent 1 ranks first, parent 0 second, parent 1 repeated.
        let hits = vec![hit("a.txt", 1), hit("a.txt", 0), hit("a.txt", 1)];
        let parents = store.resolve_parents(&hits).await.unwrap();
        assert_eq!(parents.len(), 2);
        assert_eq!(parents[0].seq, 1);
        assert_eq!(parents[1].seq, 0);
    }

    #[tokio::test]
    async fn test_resolve_parents_drops_missing() {
        let store = store().await;
        let id = store.upsert_file("a.txt", "{}", "docs").await.unwrap();
        store
            .replace_parents(id, "a.txt", &[parent("a.txt", 0, "p0")])
            .await
            .unwrap();

        let hits = vec![hit("a.txt", 7), hit("a.txt", 0)];
        let parents = store.resolve_parents(&hits).await.unwrap();
        assert_eq!(parents.len(), 1);
        assert_eq!(parents[0].seq, 0);
    }

    #[tokio::test]
    async fn test_expand_neighbors_middle() {
        let store = store().await;
        let id = store.upsert_file("a.txt", "{}", "docs").await.unwrap();
        store
            .replace_parents(
                id,
                "a.txt",
                &[
                    parent("a.txt", 0, "zero"),
                    parent("a.txt", 1, "one"),
                    parent("a.txt", 2, "two"),
                    parent("a.txt", 3, "three"),
                ],
            )
            .await
            .unwrap();

        let text = store.expand_neighbors("a.txt", 1).await.unwrap();
        assert_eq!(text, "zero one two");
    }

    #[tokio::test]
    async fn test_expand_neighbors_at_edges() {
        let store = store().await;
        let id = store.upsert_file("a.txt", "{}", "docs").await.unwrap();
        store
            .replace_parents(
                id,
                "a.txt",
                &[parent("a.txt", 0, "zero"), parent("a.txt", 1, "one")],
            )
            .await
            .unwrap();

        assert_eq!(store.expand_neighbors("a.txt", 0).await.unwrap(), "zero one");
        assert_eq!(store.expand_neighbors("a.txt", 1).await.unwrap(), "zero one");
    }

    #[tokio::test]
    async fn test_expand_neighbors_single_parent() {
        let store = store().await;
        let id = store.upsert_file("a.txt", "{}", "docs").await.unwrap();
        store
            .replace_parents(id, "a.txt", &[parent("a.txt", 0, "only")])
            .await
            .unwrap();

        assert_eq!(store.expand_neighbors("a.txt", 0).await.unwrap(), "only");
    }
}

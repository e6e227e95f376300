//! SQLite search store
//!
//! Documents live in one table keyed by `(index, id)` with their embedding
//! stored as a BLOB. Search is a brute-force similarity scan over the newest
//! candidates of an index. All database work runs on the blocking pool.

use crate::document::Document;
use crate::store::schema::{decode_vector, encode_vector, initialize_schema};
use crate::store::{
    BulkItemResult, BulkResponse, IndexInfo, IndexSchema, SearchHit, SearchStore, Similarity,
    StoreError, StoreResult,
};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

/// SQLite-backed `SearchStore`
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens or creates a store
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStore)` - Successfully opened/created database
    /// * `Err(StoreError)` - Failed to open database
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;
        initialize_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory store
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` with the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn load_schema(conn: &Connection, index: &str) -> StoreResult<Option<IndexSchema>> {
    let row = conn
        .query_row(
            "SELECT dims, similarity FROM indexes WHERE name = ?1",
            params![index],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;

    Ok(row.map(|(dims, similarity)| IndexSchema {
        name: index.to_string(),
        dims: usize::try_from(dims).unwrap_or_default(),
        similarity: Similarity::from_str(&similarity).unwrap_or_default(),
    }))
}

/// Writes one document, or explains why it was rejected
fn upsert_one(
    tx: &rusqlite::Transaction<'_>,
    schemas: &mut HashMap<String, Option<IndexSchema>>,
    document: &Document,
    indexed_at: &str,
) -> Result<(), String> {
    let Some(embedding) = document.embedding.as_ref() else {
        return Err("document has no embedding".to_string());
    };

    if !schemas.contains_key(&document.index) {
        let schema = load_schema(tx, &document.index).map_err(|e| e.to_string())?;
        schemas.insert(document.index.clone(), schema);
    }
    let schema = schemas
        .get(&document.index)
        .and_then(Option::as_ref)
        .ok_or_else(|| format!("index not found: {}", document.index))?;

    if embedding.len() != schema.dims {
        return Err(format!(
            "expected {} dimensions, got {}",
            schema.dims,
            embedding.len()
        ));
    }

    let fields = serde_json::to_string(&document.fields).map_err(|e| e.to_string())?;
    tx.execute(
        "INSERT INTO documents (index_name, id, fields, embedding_text, embedding, indexed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(index_name, id) DO UPDATE SET
            fields = excluded.fields,
            embedding_text = excluded.embedding_text,
            embedding = excluded.embedding,
            indexed_at = excluded.indexed_at",
        params![
            document.index,
            document.id,
            fields,
            document.embedding_text,
            encode_vector(embedding),
            indexed_at
        ],
    )
    .map_err(|e| e.to_string())?;

    Ok(())
}

#[async_trait]
impl SearchStore for SqliteStore {
    async fn create_index(&self, schema: &IndexSchema) -> StoreResult<bool> {
        let schema = schema.clone();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO indexes (name, dims, similarity, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    schema.name,
                    schema.dims as i64,
                    schema.similarity.as_str(),
                    now()
                ],
            )?;
            if inserted > 0 {
                tracing::info!(
                    "Created index {} ({} dims, {})",
                    schema.name,
                    schema.dims,
                    schema.similarity
                );
            }
            Ok(inserted > 0)
        })
        .await
    }

    async fn bulk_upsert(&self, documents: &[Document]) -> StoreResult<BulkResponse> {
        let documents = documents.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let indexed_at = now();
            let mut schemas = HashMap::new();

            let items = documents
                .iter()
                .map(|document| BulkItemResult {
                    id: document.id.clone(),
                    index: document.index.clone(),
                    error: upsert_one(&tx, &mut schemas, document, &indexed_at).err(),
                })
                .collect();

            tx.commit()?;
            Ok(BulkResponse { items })
        })
        .await
    }

    async fn search(
        &self,
        index: &str,
        vector: &[f32],
        k: usize,
        num_candidates: usize,
    ) -> StoreResult<Vec<SearchHit>> {
        let index = index.to_string();
        let query = vector.to_vec();
        self.with_conn(move |conn| {
            let schema =
                load_schema(conn, &index)?.ok_or_else(|| StoreError::IndexNotFound(index.clone()))?;
            if query.len() != schema.dims {
                return Err(StoreError::DimensionMismatch {
                    index,
                    expected: schema.dims,
                    actual: query.len(),
                });
            }

            let mut stmt = conn.prepare(
                "SELECT id, fields, embedding FROM documents
                 WHERE index_name = ?1
                 ORDER BY indexed_at DESC, rowid DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![index, num_candidates as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?;

            let mut hits = Vec::new();
            for row in rows {
                let (id, fields, embedding) = row?;
                let fields: Map<String, Value> = serde_json::from_str(&fields)?;
                let score = schema.similarity.score(&query, &decode_vector(&embedding));
                hits.push(SearchHit {
                    id,
                    index: index.clone(),
                    score,
                    fields,
                });
            }

            hits.sort_by(|a, b| b.score.total_cmp(&a.score));
            hits.truncate(k);
            Ok(hits)
        })
        .await
    }

    async fn count(&self, index: &str) -> StoreResult<u64> {
        let index = index.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM documents WHERE index_name = ?1",
                params![index],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    async fn list_indexes(&self) -> StoreResult<Vec<IndexInfo>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT i.name, i.dims, i.similarity, i.created_at,
                        COUNT(d.id), MAX(d.indexed_at)
                 FROM indexes i
                 LEFT JOIN documents d ON d.index_name = i.name
                 GROUP BY i.name
                 ORDER BY i.name",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(IndexInfo {
                    name: row.get(0)?,
                    dims: usize::try_from(row.get::<_, i64>(1)?).unwrap_or_default(),
                    similarity: Similarity::from_str(&row.get::<_, String>(2)?)
                        .unwrap_or_default(),
                    created_at: row.get(3)?,
                    documents: row.get::<_, i64>(4)? as u64,
                    last_indexed_at: row.get(5)?,
                })
            })?;

            let mut indexes = Vec::new();
            for row in rows {
                indexes.push(row?);
            }
            Ok(indexes)
        })
        .await
    }
}

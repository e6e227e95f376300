//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the Siphon store.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- One row per index; every document in it has `dims` dimensions
CREATE TABLE IF NOT EXISTS indexes (
    name TEXT PRIMARY KEY,
    dims INTEGER NOT NULL,
    similarity TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Indexed documents; the embedding is little-endian f32
CREATE TABLE IF NOT EXISTS documents (
    index_name TEXT NOT NULL REFERENCES indexes(name),
    id TEXT NOT NULL,
    fields TEXT NOT NULL,
    embedding_text TEXT NOT NULL,
    embedding BLOB NOT NULL,
    indexed_at TEXT NOT NULL,
    PRIMARY KEY (index_name, id)
);

CREATE INDEX IF NOT EXISTS idx_documents_indexed_at ON documents(index_name, indexed_at);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

/// Encodes a vector as a BLOB
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|x| x.to_le_bytes()).collect()
}

/// Decodes a BLOB written by `encode_vector`; trailing partial values are ignored
pub fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

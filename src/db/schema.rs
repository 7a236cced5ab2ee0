//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL)
        .execute(pool)
        .await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Upload sessions (one row per file transfer)
CREATE TABLE IF NOT EXISTS upload_sessions (
    id TEXT PRIMARY KEY,
    filename TEXT NOT NULL,
    total_size INTEGER NOT NULL CHECK (total_size > 0),
    chunk_size INTEGER NOT NULL CHECK (chunk_size > 0),
    total_chunk_count INTEGER NOT NULL CHECK (total_chunk_count > 0),
    status TEXT NOT NULL DEFAULT 'uploading'
        CHECK (status IN ('uploading', 'processing', 'completed', 'failed')),
    final_digest TEXT,
    -- JSON array of top-level archive entry names
    archive_entries TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    CHECK ((status = 'completed') = (final_digest IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS idx_upload_sessions_status ON upload_sessions(status);

-- Chunk slots (one row per byte range of a session)
CREATE TABLE IF NOT EXISTS chunk_slots (
    session_id TEXT NOT NULL REFERENCES upload_sessions(id) ON DELETE CASCADE,
    chunk_index INTEGER NOT NULL CHECK (chunk_index >= 0),
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'received')),
    received_at TEXT,

    PRIMARY KEY (session_id, chunk_index)
);

CREATE INDEX IF NOT EXISTS idx_chunk_slots_status ON chunk_slots(session_id, status);
"#;

//! Upload Registry
//!
//! Durable session and chunk-slot state in SQLite. Nothing is cached in
//! memory: every call reads the tables, so any number of server instances
//! sharing the database see the same state.

use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};

use super::types::{ChunkStatus, SessionStatus, UploadError, UploadSession};

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    id: String,
    filename: String,
    total_size: i64,
    chunk_size: i64,
    total_chunk_count: i64,
    status: SessionStatus,
    final_digest: Option<String>,
    archive_entries: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<SessionRow> for UploadSession {
    type Error = UploadError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let archive_entries = row
            .archive_entries
            .as_deref()
            .map(serde_json::from_str::<Vec<String>>)
            .transpose()
            .map_err(|e| UploadError::Internal(format!("Corrupt archive_entries: {}", e)))?;

        Ok(UploadSession {
            id: row.id,
            filename: row.filename,
            total_size: to_u64(row.total_size)?,
            chunk_size: to_u64(row.chunk_size)?,
            total_chunk_count: to_u64(row.total_chunk_count)?,
            status: row.status,
            final_digest: row.final_digest,
            archive_entries,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SESSION_COLUMNS: &str = "id, filename, total_size, chunk_size, total_chunk_count, \
     status, final_digest, archive_entries, created_at, updated_at";

/// Values needed to create a session
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: String,
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunk_count: u64,
}

// ============================================================================
// Registry
// ============================================================================

/// Registry over a SQLite pool
///
/// Pool connections and transactions are scoped: a handle dropped on any exit
/// path returns to the pool, and an uncommitted transaction rolls back.
#[derive(Clone)]
pub struct UploadRegistry {
    pool: SqlitePool,
}

impl UploadRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a transaction
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, UploadError> {
        Ok(self.pool.begin().await?)
    }

    /// Insert a session and all of its pending slots on `conn`.
    ///
    /// Meant to run inside a transaction so the session never exists without
    /// its full set of slots.
    pub async fn insert_session(
        conn: &mut SqliteConnection,
        session: &NewSession,
    ) -> Result<(), UploadError> {
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO upload_sessions
                (id, filename, total_size, chunk_size, total_chunk_count, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'uploading', ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.filename)
        .bind(to_i64(session.total_size)?)
        .bind(to_i64(session.chunk_size)?)
        .bind(to_i64(session.total_chunk_count)?)
        .bind(&now)
        .bind(&now)
        .execute(&mut *conn)
        .await?;

        let inserted = sqlx::query(
            r#"
            WITH RECURSIVE seq(i) AS (
                SELECT 0
                UNION ALL
                SELECT i + 1 FROM seq WHERE i + 1 < ?
            )
            INSERT INTO chunk_slots (session_id, chunk_index, status)
            SELECT ?, i, 'pending' FROM seq
            "#,
        )
        .bind(to_i64(session.total_chunk_count)?)
        .bind(&session.id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if inserted != session.total_chunk_count {
            return Err(UploadError::Internal(format!(
                "Inserted {} chunk slots, expected {}",
                inserted, session.total_chunk_count
            )));
        }

        Ok(())
    }

    /// Get a session by ID
    pub async fn get_session(&self, id: &str) -> Result<Option<UploadSession>, UploadError> {
        fetch_session(&self.pool, id).await
    }

    /// Status of one slot, `None` if the pair does not exist
    pub async fn slot_status(
        &self,
        session_id: &str,
        chunk_index: u64,
    ) -> Result<Option<ChunkStatus>, UploadError> {
        let Ok(index) = i64::try_from(chunk_index) else {
            return Ok(None);
        };

        let status = sqlx::query_scalar::<_, ChunkStatus>(
            "SELECT status FROM chunk_slots WHERE session_id = ? AND chunk_index = ?",
        )
        .bind(session_id)
        .bind(index)
        .fetch_optional(&self.pool)
        .await?;

        Ok(status)
    }

    /// Flip a slot to received while its session is still `uploading`.
    ///
    /// Returns `false` if nothing changed: the slot was already received or
    /// the session has left `uploading`.
    pub async fn mark_received(
        &self,
        session_id: &str,
        chunk_index: u64,
    ) -> Result<bool, UploadError> {
        let result = sqlx::query(
            r#"
            UPDATE chunk_slots
            SET status = 'received', received_at = ?
            WHERE session_id = ? AND chunk_index = ? AND status = 'pending'
              AND EXISTS (
                  SELECT 1 FROM upload_sessions
                  WHERE id = ? AND status = 'uploading'
              )
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(session_id)
        .bind(to_i64(chunk_index)?)
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Received chunk indices in ascending order
    pub async fn received_indices(&self, session_id: &str) -> Result<Vec<u64>, UploadError> {
        indices_with_status(&self.pool, session_id, ChunkStatus::Received).await
    }

    /// Take the session's write lock.
    ///
    /// SQLite locks the whole database for writing, which is at least as strong
    /// as a row lock. The lock is taken with a no-op update so it is held
    /// before anything is read. Returns `None` for an unknown session.
    pub async fn lock_session(&self, id: &str) -> Result<Option<SessionLock>, UploadError> {
        let mut tx = self.pool.begin().await?;

        let touched = sqlx::query("UPDATE upload_sessions SET updated_at = updated_at WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if touched == 0 {
            return Ok(None);
        }

        let session = fetch_session(&mut *tx, id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(id.to_string()))?;

        Ok(Some(SessionLock { tx, session }))
    }

    /// Seal a session that is being processed.
    ///
    /// Returns `false` if the session was no longer `processing`.
    pub async fn complete(
        &self,
        id: &str,
        digest: &str,
        archive_entries: &[String],
    ) -> Result<bool, UploadError> {
        let entries = serde_json::to_string(archive_entries)
            .map_err(|e| UploadError::Internal(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET status = 'completed', final_digest = ?, archive_entries = ?, updated_at = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(digest)
        .bind(entries)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a session; its slots go with it
    pub async fn delete_session(&self, id: &str) -> Result<bool, UploadError> {
        let result = sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

// ============================================================================
// Session Lock
// ============================================================================

/// Exclusive hold on one session, released on commit or drop (rollback)
pub struct SessionLock {
    tx: Transaction<'static, Sqlite>,
    session: UploadSession,
}

impl SessionLock {
    /// Session as read under the lock
    pub fn session(&self) -> &UploadSession {
        &self.session
    }

    /// Pending chunk indices in ascending order
    pub async fn pending_indices(&mut self) -> Result<Vec<u64>, UploadError> {
        indices_with_status(&mut *self.tx, &self.session.id, ChunkStatus::Pending).await
    }

    /// Change the session status (visible to others after commit)
    pub async fn set_status(&mut self, status: SessionStatus) -> Result<(), UploadError> {
        let now = Utc::now().to_rfc3339();

        sqlx::query("UPDATE upload_sessions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(&now)
            .bind(&self.session.id)
            .execute(&mut *self.tx)
            .await?;

        self.session.status = status;
        self.session.updated_at = now;
        Ok(())
    }

    /// Commit and release the lock
    pub async fn commit(self) -> Result<(), UploadError> {
        self.tx.commit().await?;
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn fetch_session<'e, E>(executor: E, id: &str) -> Result<Option<UploadSession>, UploadError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let query = format!("SELECT {} FROM upload_sessions WHERE id = ?", SESSION_COLUMNS);
    let row = sqlx::query_as::<_, SessionRow>(&query)
        .bind(id)
        .fetch_optional(executor)
        .await?;

    row.map(UploadSession::try_from).transpose()
}

async fn indices_with_status<'e, E>(
    executor: E,
    session_id: &str,
    status: ChunkStatus,
) -> Result<Vec<u64>, UploadError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let indices = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT chunk_index FROM chunk_slots
        WHERE session_id = ? AND status = ?
        ORDER BY chunk_index ASC
        "#,
    )
    .bind(session_id)
    .bind(status)
    .fetch_all(executor)
    .await?;

    indices.into_iter().map(to_u64).collect()
}

/// Parse a stored RFC 3339 timestamp
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, UploadError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| UploadError::Internal(format!("Bad timestamp {:?}: {}", value, e)))
}

fn to_i64(value: u64) -> Result<i64, UploadError> {
    i64::try_from(value)
        .map_err(|_| UploadError::InvalidRequest(format!("Value {} is out of range", value)))
}

fn to_u64(value: i64) -> Result<u64, UploadError> {
    u64::try_from(value)
        .map_err(|_| UploadError::Internal(format!("Negative value {} in registry", value)))
}

// ============================================================================
// Tests
// ============================================================================

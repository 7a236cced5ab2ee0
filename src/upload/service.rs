//! Upload Service
//!
//! The three protocol operations (handshake, chunk receipt, finalize) plus
//! status and abort. State lives in the [`UploadRegistry`] and the
//! [`BackingStore`]; the service itself only holds in-process single-flight
//! locks that sit on top of the registry's own locking.

use std::sync::Arc;

use axum::body::Bytes;
use chrono::Utc;
use futures::Stream;
use uuid::Uuid;

use crate::config::UploadConfig;

use super::archive::{ArchiveInspector, ZipInspector};
use super::backing_store::{drain, BackingStore};
use super::digest::hash_reader;
use super::registry::{parse_timestamp, NewSession, UploadRegistry};
use super::single_flight::KeyedMutex;
use super::types::{
    ChunkLayout, ChunkOutcome, ChunkReceipt, ChunkStatus, FinalizeOutcome, HandshakeRequest,
    HandshakeResponse, SessionStatus, SessionView, UploadError,
};

// ============================================================================
// Upload Service
// ============================================================================

/// Coordinates sessions, chunk writes and finalization
#[derive(Clone)]
pub struct UploadService {
    inner: Arc<UploadServiceInner>,
}

struct UploadServiceInner {
    registry: UploadRegistry,
    store: BackingStore,
    inspector: Box<dyn ArchiveInspector>,
    config: UploadConfig,

    /// Serializes finalize per session id
    finalize_locks: KeyedMutex<String>,

    /// Serializes writes per (session id, chunk index)
    chunk_locks: KeyedMutex<(String, u64)>,
}

impl UploadService {
    /// Create a service with ZIP archive inspection
    pub fn new(registry: UploadRegistry, config: UploadConfig) -> Self {
        Self::with_inspector(registry, config, Box::new(ZipInspector))
    }

    /// Create a service with a custom archive inspector
    pub fn with_inspector(
        registry: UploadRegistry,
        config: UploadConfig,
        inspector: Box<dyn ArchiveInspector>,
    ) -> Self {
        let store = BackingStore::new(config.storage_dir.clone());
        Self {
            inner: Arc::new(UploadServiceInner {
                registry,
                store,
                inspector,
                config,
                finalize_locks: KeyedMutex::new(),
                chunk_locks: KeyedMutex::new(),
            }),
        }
    }

    pub fn registry(&self) -> &UploadRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &BackingStore {
        &self.inner.store
    }

    // ========================================================================
    // Handshake
    // ========================================================================

    /// Create a new session, its slots and its backing file as one unit
    pub async fn handshake(
        &self,
        request: &HandshakeRequest,
    ) -> Result<HandshakeResponse, UploadError> {
        let session = self.validate_handshake(request)?;

        let mut tx = self.inner.registry.begin().await?;
        UploadRegistry::insert_session(&mut tx, &session).await?;

        // Uncommitted rows roll back when `tx` drops on the error path
        self.inner
            .store
            .allocate(&session.id, session.total_size)
            .await?;

        if let Err(e) = tx.commit().await {
            self.remove_backing_file(&session.id).await;
            return Err(e.into());
        }

        tracing::info!(
            session_id = %session.id,
            filename = %session.filename,
            total_size = session.total_size,
            chunk_size = session.chunk_size,
            chunks = session.total_chunk_count,
            "Created upload session"
        );

        Ok(HandshakeResponse {
            id: session.id,
            total_chunk_count: session.total_chunk_count,
            received_chunk_indices: Vec::new(),
        })
    }

    fn validate_handshake(&self, request: &HandshakeRequest) -> Result<NewSession, UploadError> {
        let config = &self.inner.config;

        let filename = request.filename.trim();
        if filename.is_empty() {
            return Err(UploadError::InvalidRequest(
                "filename must not be empty".to_string(),
            ));
        }

        let layout = ChunkLayout::new(request.total_size, request.chunk_size)?;

        if layout.total_size > config.max_file_size {
            return Err(UploadError::InvalidRequest(format!(
                "total_size {} exceeds the maximum of {}",
                layout.total_size, config.max_file_size
            )));
        }
        if layout.chunk_size > config.max_chunk_size {
            return Err(UploadError::InvalidRequest(format!(
                "chunk_size {} exceeds the maximum of {}",
                layout.chunk_size, config.max_chunk_size
            )));
        }

        let total_chunk_count = layout.chunk_count();
        if total_chunk_count > config.max_chunk_count {
            return Err(UploadError::InvalidRequest(format!(
                "{} chunks exceeds the maximum of {}; use a larger chunk_size",
                total_chunk_count, config.max_chunk_count
            )));
        }

        Ok(NewSession {
            id: Uuid::new_v4().to_string(),
            filename: filename.to_string(),
            total_size: layout.total_size,
            chunk_size: layout.chunk_size,
            total_chunk_count,
        })
    }

    // ========================================================================
    // Chunk Receipt
    // ========================================================================

    /// Write one chunk at its offset and mark it received.
    ///
    /// A chunk that was already received is acknowledged without touching
    /// storage, but its body is still read to the end.
    pub async fn receive_chunk<S>(
        &self,
        session_id: &str,
        chunk_index: u64,
        body: S,
    ) -> Result<ChunkReceipt, UploadError>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Unpin,
    {
        let _guard = self
            .inner
            .chunk_locks
            .lock((session_id.to_string(), chunk_index))
            .await;

        let slot = self
            .inner
            .registry
            .slot_status(session_id, chunk_index)
            .await?
            .ok_or_else(|| UploadError::ChunkNotFound {
                session_id: session_id.to_string(),
                index: chunk_index,
            })?;

        if slot == ChunkStatus::Received {
            let discarded = drain(body).await;
            tracing::debug!(
                session_id = %session_id,
                chunk_index = chunk_index,
                discarded = discarded,
                "Chunk already received, body discarded"
            );
            return Ok(ChunkReceipt {
                chunk_index,
                outcome: ChunkOutcome::AlreadyReceived,
            });
        }

        let session = self
            .inner
            .registry
            .get_session(session_id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;

        if session.status != SessionStatus::Uploading {
            return Err(UploadError::SessionClosed {
                status: session.status,
            });
        }

        let layout = session.layout();
        let expected_len = layout
            .chunk_len(chunk_index)
            .ok_or_else(|| UploadError::ChunkNotFound {
                session_id: session_id.to_string(),
                index: chunk_index,
            })?;

        // An abort can land anywhere from here on: it removes the file and
        // moves the session out of `uploading`.
        let written = self
            .inner
            .store
            .write_chunk(
                session_id,
                chunk_index,
                layout.offset(chunk_index),
                expected_len,
                body,
            )
            .await;

        match written {
            Ok(()) => {}
            Err(UploadError::Storage(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                self.ensure_uploading(session_id).await?;
                return Err(UploadError::Storage(e));
            }
            Err(e) => return Err(e),
        }

        let newly_received = self
            .inner
            .registry
            .mark_received(session_id, chunk_index)
            .await?;

        // Same-index writers are serialized above, so a refused flip means
        // the session closed while the bytes were being written.
        if !newly_received {
            self.ensure_uploading(session_id).await?;
        }

        tracing::debug!(
            session_id = %session_id,
            chunk_index = chunk_index,
            bytes = expected_len,
            newly_received = newly_received,
            "Chunk written"
        );

        Ok(ChunkReceipt {
            chunk_index,
            outcome: ChunkOutcome::Written,
        })
    }

    /// Fail with `SessionClosed` unless the session is still `uploading`
    async fn ensure_uploading(&self, session_id: &str) -> Result<(), UploadError> {
        let session = self
            .inner
            .registry
            .get_session(session_id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;

        if session.status != SessionStatus::Uploading {
            tracing::debug!(
                session_id = %session_id,
                status = ?session.status,
                "Session closed during chunk write"
            );
            return Err(UploadError::SessionClosed {
                status: session.status,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Finalize
    // ========================================================================

    /// Verify completeness, digest the file, inspect it and seal the session
    pub async fn finalize(&self, session_id: &str) -> Result<FinalizeOutcome, UploadError> {
        let _guard = self
            .inner
            .finalize_locks
            .lock(session_id.to_string())
            .await;

        let mut lock = self
            .inner
            .registry
            .lock_session(session_id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;

        let session = lock.session().clone();
        match session.status {
            SessionStatus::Completed => {
                let final_digest = session.final_digest.ok_or_else(|| {
                    UploadError::Internal(format!("Completed session {} has no digest", session_id))
                })?;
                return Ok(FinalizeOutcome::AlreadyCompleted { final_digest });
            }
            SessionStatus::Failed => {
                return Err(UploadError::SessionClosed {
                    status: session.status,
                });
            }
            SessionStatus::Processing => {
                let claimed_at = parse_timestamp(&session.updated_at)?;
                let stale_after = chrono::Duration::from_std(
                    self.inner.config.processing_stale_after(),
                )
                .map_err(|e| UploadError::Internal(e.to_string()))?;

                if Utc::now() - claimed_at < stale_after {
                    return Err(UploadError::FinalizeInProgress(session_id.to_string()));
                }
                tracing::warn!(
                    session_id = %session_id,
                    claimed_at = %session.updated_at,
                    "Reclaiming stale finalize"
                );
            }
            SessionStatus::Uploading => {}
        }

        let missing = lock.pending_indices().await?;
        if !missing.is_empty() {
            tracing::debug!(
                session_id = %session_id,
                missing = missing.len(),
                "Finalize requested before all chunks arrived"
            );
            return Err(UploadError::IncompleteUpload { missing });
        }

        lock.set_status(SessionStatus::Processing).await?;
        lock.commit().await?;

        tracing::info!(session_id = %session_id, "Finalizing upload");

        let reader = self.inner.store.open_read(session_id).await?;
        let digest = hash_reader(reader).await?;
        let archive_top_level_entries = self.inspect(session_id).await;

        if !self
            .inner
            .registry
            .complete(session_id, &digest, &archive_top_level_entries)
            .await?
        {
            return Err(UploadError::Internal(format!(
                "Session {} left processing while being finalized",
                session_id
            )));
        }

        tracing::info!(
            session_id = %session_id,
            digest = %digest,
            archive_entries = archive_top_level_entries.len(),
            "Upload completed"
        );

        Ok(FinalizeOutcome::Completed {
            digest,
            archive_top_level_entries,
        })
    }

    /// Run the archive inspector on a blocking thread; never fails
    async fn inspect(&self, session_id: &str) -> Vec<String> {
        let path = self.inner.store.path(session_id);
        let service = self.clone();

        let entries = tokio::task::spawn_blocking(move || {
            service.inner.inspector.top_level_entries(&path)
        })
        .await;

        match entries {
            Ok(entries) => entries.into_iter().collect(),
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Archive inspection task failed");
                Vec::new()
            }
        }
    }

    // ========================================================================
    // Status & Abort
    // ========================================================================

    /// Current session state with the indices received so far
    pub async fn status(&self, session_id: &str) -> Result<SessionView, UploadError> {
        let session = self
            .inner
            .registry
            .get_session(session_id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;

        let received_chunk_indices = self.inner.registry.received_indices(session_id).await?;

        Ok(SessionView {
            session,
            received_chunk_indices,
        })
    }

    /// Abandon an upload that has not been finalized.
    ///
    /// The session moves to `failed` and its backing file is removed. Aborting
    /// an already failed session succeeds without doing anything.
    pub async fn abort(&self, session_id: &str) -> Result<(), UploadError> {
        let _guard = self
            .inner
            .finalize_locks
            .lock(session_id.to_string())
            .await;

        let mut lock = self
            .inner
            .registry
            .lock_session(session_id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;

        match lock.session().status {
            SessionStatus::Failed => return Ok(()),
            SessionStatus::Uploading => {}
            status => return Err(UploadError::SessionClosed { status }),
        }

        lock.set_status(SessionStatus::Failed).await?;
        lock.commit().await?;

        self.remove_backing_file(session_id).await;

        tracing::info!(session_id = %session_id, "Upload session aborted");
        Ok(())
    }

    async fn remove_backing_file(&self, session_id: &str) {
        if let Err(e) = self.inner.store.remove(session_id).await {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to remove backing file");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Backing Store
//!
//! Local filesystem storage for in-flight uploads. Each session owns one file,
//! allocated to its full size at handshake and then written in place at chunk
//! offsets. Files are never grown or truncated after allocation.

use std::io::SeekFrom;
use std::path::PathBuf;

use axum::body::Bytes;
use futures::{Stream, StreamExt};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::types::UploadError;

/// Filesystem store rooted at a configured directory
#[derive(Debug, Clone)]
pub struct BackingStore {
    root: PathBuf,
}

impl BackingStore {
    /// Create a store rooted at `root` (created lazily on first allocation)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of a session's backing file
    pub fn path(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{}.part", session_id))
    }

    /// Create the session file with exactly `len` bytes.
    ///
    /// The file must not exist yet. On failure nothing is left behind.
    pub async fn allocate(&self, session_id: &str, len: u64) -> Result<(), UploadError> {
        tokio::fs::create_dir_all(&self.root).await?;

        let path = self.path(session_id);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        let sized = async {
            file.set_len(len).await?;
            file.sync_all().await
        }
        .await;

        if let Err(e) = sized {
            drop(file);
            if let Err(cleanup) = tokio::fs::remove_file(&path).await {
                tracing::warn!(
                    session_id = %session_id,
                    path = %path.display(),
                    error = %cleanup,
                    "Failed to remove partially allocated file"
                );
            }
            return Err(e.into());
        }

        tracing::debug!(session_id = %session_id, len = len, path = %path.display(), "Allocated backing file");
        Ok(())
    }

    /// Stream one chunk into the session file at `offset`.
    ///
    /// The body must carry exactly `expected_len` bytes. A frame that would run
    /// past the chunk's range is rejected before it touches the file, so a bad
    /// request can never clobber a neighbouring chunk. Returns only after the
    /// data has been synced to disk.
    pub async fn write_chunk<S>(
        &self,
        session_id: &str,
        chunk_index: u64,
        offset: u64,
        expected_len: u64,
        mut body: S,
    ) -> Result<(), UploadError>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Unpin,
    {
        let mut file = OpenOptions::new()
            .write(true)
            .open(self.path(session_id))
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut written: u64 = 0;
        while let Some(frame) = body.next().await {
            let frame = frame.map_err(|e| {
                UploadError::InvalidRequest(format!("Failed to read chunk body: {}", e))
            })?;

            let next = written + frame.len() as u64;
            if next > expected_len {
                return Err(UploadError::ChunkSizeMismatch {
                    index: chunk_index,
                    expected: expected_len,
                    actual: next,
                });
            }

            file.write_all(&frame).await?;
            written = next;
        }

        if written != expected_len {
            return Err(UploadError::ChunkSizeMismatch {
                index: chunk_index,
                expected: expected_len,
                actual: written,
            });
        }

        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Open a session file for sequential reading
    pub async fn open_read(&self, session_id: &str) -> Result<File, UploadError> {
        Ok(File::open(self.path(session_id)).await?)
    }

    /// Remove a session file; a missing file is not an error
    pub async fn remove(&self, session_id: &str) -> Result<(), UploadError> {
        match tokio::fs::remove_file(self.path(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Consume a body without storing it
///
/// Read errors end the drain early; the caller has already decided the
/// outcome of the request.
pub async fn drain<S>(mut body: S) -> u64
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
{
    let mut discarded = 0u64;
    while let Some(frame) = body.next().await {
        match frame {
            Ok(frame) => discarded += frame.len() as u64,
            Err(e) => {
                tracing::debug!(error = %e, "Body ended with error while draining");
                break;
            }
        }
    }
    discarded
}

// ============================================================================
// Tests
// ============================================================================

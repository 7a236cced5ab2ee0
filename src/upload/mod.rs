//! Resumable Chunked Upload Module
//!
//! Implements reliable large file uploads with:
//! - Fixed-size chunks written in place into a pre-allocated file
//! - Idempotent, order-independent chunk submission with resume support
//! - SHA-256 sealing and best-effort archive inspection at finalize
//!
//! Protocol Flow:
//! 1. Client sends handshake with file name, total size and chunk size
//! 2. Server creates the session, its chunk slots and the backing file
//! 3. Client uploads chunks in any order, retrying any that fail
//! 4. Client finalizes; server verifies completeness and returns the digest

pub mod archive;
pub mod backing_store;
pub mod digest;
pub mod registry;
pub mod service;
pub mod single_flight;
pub mod types;

pub use archive::{ArchiveInspector, ZipInspector};
pub use backing_store::BackingStore;
pub use digest::{compute_hash, hash_reader};
pub use registry::{SessionLock, UploadRegistry};
pub use service::UploadService;
pub use single_flight::KeyedMutex;
pub use types::*;

//! Resumable Upload Server Library
//!
//! A client moves a large file to the server in independently retriable
//! chunks, resumes after interruption, and gets back a SHA-256 digest of the
//! reassembled file. The main server binary is in main.rs.
//!
//! # Modules
//!
//! - `upload`: Session registry, chunk storage and the protocol operations
//! - `routes`: HTTP surface (axum)
//! - `db`: SQLite pool and schema

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod upload;

//! Configuration management

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::upload::{
    DEFAULT_MAX_CHUNK_COUNT, DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MAX_FILE_SIZE,
    DEFAULT_PROCESSING_STALE_SECS,
};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Directory holding one backing file per session
    pub storage_dir: PathBuf,
    /// Largest `total_size` accepted at handshake
    pub max_file_size: u64,
    /// Largest `chunk_size` accepted at handshake
    pub max_chunk_size: u64,
    /// Largest number of chunks a single session may have
    pub max_chunk_count: u64,
    /// A `processing` claim older than this may be taken over by a new finalize
    pub processing_stale_secs: i64,
}

impl UploadConfig {
    pub fn processing_stale_after(&self) -> Duration {
        Duration::from_secs(self.processing_stale_secs.max(0) as u64)
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            storage_dir: PathBuf::from("./data/uploads"),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_chunk_count: DEFAULT_MAX_CHUNK_COUNT,
            processing_stale_secs: DEFAULT_PROCESSING_STALE_SECS,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                url: "sqlite:./uploads.db".to_string(),
                max_connections: 5,
            },
            upload: UploadConfig::default(),
        }
    }
}

impl Config {
    /// Read configuration from the environment, falling back to defaults for
    /// unset variables. Set but unparsable values are an error.
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port)?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
                max_connections: parse_var(
                    "DATABASE_MAX_CONNECTIONS",
                    defaults.database.max_connections,
                )?,
            },
            upload: UploadConfig {
                storage_dir: env::var("UPLOAD_STORAGE_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.upload.storage_dir),
                max_file_size: parse_var("UPLOAD_MAX_FILE_SIZE", defaults.upload.max_file_size)?,
                max_chunk_size: parse_var("UPLOAD_MAX_CHUNK_SIZE", defaults.upload.max_chunk_size)?,
                max_chunk_count: parse_var(
                    "UPLOAD_MAX_CHUNK_COUNT",
                    defaults.upload.max_chunk_count,
                )?,
                processing_stale_secs: parse_var(
                    "UPLOAD_PROCESSING_STALE_SECS",
                    defaults.upload.processing_stale_secs,
                )?,
            },
        })
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{} has an invalid value: {:?}", name, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var_defaults_when_unset() {
        let value: u16 = parse_var("RESUMABLE_UPLOAD_TEST_UNSET_VAR", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        env::set_var("RESUMABLE_UPLOAD_TEST_BAD_PORT", "not-a-port");
        let result: Result<u16> = parse_var("RESUMABLE_UPLOAD_TEST_BAD_PORT", 3000);
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_default_limits() {
        let config = Config::default();
        assert_eq!(config.upload.max_chunk_size, 64 * 1024 * 1024);
        assert_eq!(config.upload.processing_stale_after(), Duration::from_secs(900));
    }
}

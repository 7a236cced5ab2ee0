//! Content hashing
//!
//! Streams a byte source through SHA-256 with a fixed-size buffer, so files of
//! any size are digested without being loaded into memory.

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Read buffer size used while hashing
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Compute the hex SHA-256 digest of everything `reader` yields
pub async fn hash_reader<R>(mut reader: R) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA-256 hash of in-memory data
pub fn compute_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_streaming_matches_one_shot() {
        // Spans several buffer fills
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let streamed = hash_reader(&data[..]).await.unwrap();
        assert_eq!(streamed, compute_hash(&data));
    }

    #[tokio::test]
    async fn test_known_vector() {
        let hash = hash_reader(&b"abc"[..]).await.unwrap();
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}

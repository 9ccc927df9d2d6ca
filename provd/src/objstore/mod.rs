//! Object-store access.
//!
//! The pipeline only needs two remote operations: list the bucket and fetch
//! a single object to a local file. They sit behind the [`ObjectStore`]
//! trait so tests can substitute an in-memory bucket; production uses
//! [`HttpBucket`], an anonymous HTTPS client.

mod http;

pub use http::HttpBucket;

use std::path::Path;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use provd_shared::errors::{ProvdError, ProvdResult};

/// One object in a bucket listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub size: i64,
    /// Opaque remote identity, compared exact-string (quotes included).
    pub etag: String,
}

/// A bucket listing in its natural (remote) order.
#[derive(Debug, Clone, Default)]
pub struct BucketListing {
    pub contents: Vec<RemoteObject>,
}

/// Remote object store as seen by the fetch step.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List every object in the bucket.
    async fn list(&self, cancel: &CancellationToken) -> ProvdResult<BucketListing>;

    /// Stream one object into `dest`, replacing any partial file.
    async fn fetch_object(
        &self,
        key: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> ProvdResult<()>;
}

/// Hex SHA-256 of a file's bytes.
///
/// Blocking; call from `spawn_blocking` in async contexts.
pub fn compute_file_digest(path: &Path) -> ProvdResult<String> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        ProvdError::Fetch(format!("failed to open {} for hashing: {}", path.display(), e))
    })?;

    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .map_err(|e| ProvdError::Fetch(format!("failed to hash {}: {}", path.display(), e)))?;

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_matches_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"abc").unwrap();

        let digest = compute_file_digest(&path).unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn digest_of_missing_file_is_fetch_error() {
        let err = compute_file_digest(Path::new("/no/such/blob")).unwrap_err();
        assert!(matches!(err, ProvdError::Fetch(_)));
    }
}

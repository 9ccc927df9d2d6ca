//! Anonymous HTTPS bucket client.
//!
//! The store speaks the plain S3 listing protocol: a GET on the bucket root
//! returns a `ListBucketResult` XML document, and individual objects are
//! fetched by key on the same host. No request signing.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use provd_shared::errors::{ProvdError, ProvdResult};

use super::{BucketListing, ObjectStore, RemoteObject};

const REGION_HOST: &str = "s3.us-east-1.amazonaws.com";

/// Anonymous HTTPS client for a single public bucket.
pub struct HttpBucket {
    client: reqwest::Client,
    bucket: String,
}

impl HttpBucket {
    pub fn new(bucket: &str) -> ProvdResult<Self> {
        // No overall request timeout: object downloads are streamed and may
        // legitimately run long. Connection establishment is bounded.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            bucket: bucket.to_string(),
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("https://{}.{}/{}", self.bucket, REGION_HOST, key)
    }

    fn root_url(&self) -> String {
        format!("https://{}.{}/", self.bucket, REGION_HOST)
    }
}

#[async_trait]
impl ObjectStore for HttpBucket {
    async fn list(&self, cancel: &CancellationToken) -> ProvdResult<BucketListing> {
        let url = self.root_url();
        tracing::debug!(%url, "fetching bucket listing");

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProvdError::Cancelled),
            r = self.client.get(&url).send() => r?,
        };
        let response = response.error_for_status()?;

        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(ProvdError::Cancelled),
            b = response.text() => b?,
        };

        parse_listing(&body)
    }

    async fn fetch_object(
        &self,
        key: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> ProvdResult<()> {
        let url = self.object_url(key);
        tracing::info!(key, dest = %dest.display(), "downloading object");

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProvdError::Cancelled),
            r = self.client.get(&url).send() => r?,
        };
        let response = response.error_for_status()?;

        let mut file = tokio::fs::File::create(dest).await.map_err(|e| {
            ProvdError::Fetch(format!("failed to create {}: {}", dest.display(), e))
        })?;

        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(ProvdError::Cancelled),
                c = stream.next() => c,
            };
            match chunk {
                Some(chunk) => {
                    let chunk = chunk?;
                    file.write_all(&chunk).await.map_err(|e| {
                        ProvdError::Fetch(format!("failed to write {}: {}", dest.display(), e))
                    })?;
                }
                None => break,
            }
        }

        file.flush().await.map_err(|e| {
            ProvdError::Fetch(format!("failed to flush {}: {}", dest.display(), e))
        })?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// XML listing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListBucketResult {
    #[serde(default, rename = "Contents")]
    contents: Vec<ListedObject>,
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Size")]
    size: i64,
    #[serde(rename = "ETag")]
    etag: String,
}

fn parse_listing(body: &str) -> ProvdResult<BucketListing> {
    let parsed: ListBucketResult = quick_xml::de::from_str(body)
        .map_err(|e| ProvdError::Fetch(format!("failed to parse bucket listing: {}", e)))?;

    Ok(BucketListing {
        contents: parsed
            .contents
            .into_iter()
            .map(|o| RemoteObject {
                key: o.key,
                size: o.size,
                etag: o.etag,
            })
            .collect(),
    })
}

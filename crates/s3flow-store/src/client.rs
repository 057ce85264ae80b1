use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Bucket existence check must come back quickly or the caller should treat
/// the bucket as unreachable.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
/// A full `list_objects_v2` sweep (all continuation pages) of one bucket.
const POLL_BUCKET_TIMEOUT: Duration = Duration::from_secs(120);
/// A single object download.
const DOWNLOAD_OBJECT_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a presigned GET stays valid for callers of [`StoreClient::generate_signed_url`].
pub const SIGNED_URL_LIFETIME: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Metadata about a single listed object, as returned by a bucket listing.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub key: String,
    pub size: i64,
    pub last_modified: chrono::DateTime<chrono::Utc>,
}

/// Object-storage operations the ingestion pipeline depends on. Separated
/// from [`StoreClient`] so object sources and the bucket cache can be
/// exercised against a mock instead of a live endpoint.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError>;
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError>;
    async fn download_object(
        &self,
        bucket: &str,
        key: &str,
        dest_path: &std::path::Path,
    ) -> Result<(), StoreError>;
    async fn generate_signed_url(&self, bucket: &str, key: &str) -> Result<String, StoreError>;
}

/// Thin wrapper around `aws-sdk-s3` carrying only the operations the
/// ingestion pipeline needs: existence checks, full listings, downloads and
/// presigned URLs. Does not know about image groups, selectors or products.
#[derive(Clone)]
pub struct StoreClient {
    client: Client,
}

impl StoreClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a client from the workspace-standard `aws-config` resolution
    /// chain, pointed at the configured S3-compatible endpoint.
    pub async fn from_endpoint(
        endpoint: &str,
        region: &str,
        access_key_id: &str,
        secret_access_key: &str,
        force_path_style: bool,
    ) -> Self {
        let creds = aws_sdk_s3::config::Credentials::new(
            access_key_id,
            secret_access_key,
            None,
            None,
            "s3flow-static",
        );
        let shared_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region.to_string()))
            .credentials_provider(creds)
            .load()
            .await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared_config)
            .endpoint_url(endpoint)
            .force_path_style(force_path_style)
            .build();
        Self::new(Client::from_conf(s3_config))
    }
}

#[async_trait]
impl ObjectStore for StoreClient {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError> {
        let fut = self.client.head_bucket().bucket(bucket).send();
        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, fut).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(err)) => {
                if err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(StoreError::BucketUnavailable {
                        bucket: bucket.to_string(),
                        message: err.to_string(),
                    })
                }
            }
            Err(_) => Err(StoreError::BucketUnavailable {
                bucket: bucket.to_string(),
                message: "timed out checking bucket existence".to_string(),
            }),
        }
    }

    /// Lists every object under `prefix` in `bucket`, paging through
    /// continuation tokens, bounded by [`POLL_BUCKET_TIMEOUT`] for the whole
    /// sweep. Retries transient failures per page up to [`MAX_RETRIES`]
    /// times with a fixed backoff before giving up on the listing.
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectMeta>, StoreError> {
        let sweep = async {
            let mut out = Vec::new();
            let mut continuation_token: Option<String> = None;

            loop {
                let mut attempt = 0;
                let page = loop {
                    let mut req = self
                        .client
                        .list_objects_v2()
                        .bucket(bucket)
                        .prefix(prefix);
                    if let Some(token) = &continuation_token {
                        req = req.continuation_token(token);
                    }

                    match req.send().await {
                        Ok(page) => break page,
                        Err(err) if attempt < MAX_RETRIES => {
                            attempt += 1;
                            warn!(
                                bucket,
                                attempt, "list_objects_v2 failed, retrying: {}", err
                            );
                            tokio::time::sleep(RETRY_BACKOFF).await;
                        }
                        Err(err) => {
                            return Err(StoreError::ListFailed {
                                bucket: bucket.to_string(),
                                message: err.to_string(),
                            })
                        }
                    }
                };

                for obj in page.contents() {
                    let (Some(key), Some(last_modified)) = (obj.key(), obj.last_modified())
                    else {
                        continue;
                    };
                    out.push(ObjectMeta {
                        key: key.to_string(),
                        size: obj.size().unwrap_or(0),
                        last_modified: chrono::DateTime::from_timestamp(
                            last_modified.secs(),
                            0,
                        )
                        .unwrap_or_else(chrono::Utc::now),
                    });
                }

                continuation_token = page.next_continuation_token().map(str::to_string);
                if continuation_token.is_none() {
                    break;
                }
            }

            Ok(out)
        };

        match tokio::time::timeout(POLL_BUCKET_TIMEOUT, sweep).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::ListFailed {
                bucket: bucket.to_string(),
                message: "listing timed out".to_string(),
            }),
        }
    }

    /// Downloads `key` from `bucket` to `dest_path`, bounded by
    /// [`DOWNLOAD_OBJECT_TIMEOUT`]. Retries transient failures up to
    /// [`MAX_RETRIES`] times before giving up.
    async fn download_object(
        &self,
        bucket: &str,
        key: &str,
        dest_path: &std::path::Path,
    ) -> Result<(), StoreError> {
        let download = async {
            let mut attempt = 0;
            let resp = loop {
                match self.client.get_object().bucket(bucket).key(key).send().await {
                    Ok(resp) => break resp,
                    Err(err) if attempt < MAX_RETRIES => {
                        attempt += 1;
                        warn!(bucket, key, attempt, "get_object failed, retrying: {}", err);
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                    Err(err) => {
                        return Err(StoreError::DownloadFailed {
                            bucket: bucket.to_string(),
                            key: key.to_string(),
                            message: err.to_string(),
                        })
                    }
                }
            };

            let data = resp.body.collect().await.map_err(|err| StoreError::DownloadFailed {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: err.to_string(),
            })?;

            if let Some(parent) = dest_path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|source| StoreError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
            }

            tokio::fs::write(dest_path, data.into_bytes())
                .await
                .map_err(|source| StoreError::Io {
                    path: dest_path.display().to_string(),
                    source,
                })
        };

        match tokio::time::timeout(DOWNLOAD_OBJECT_TIMEOUT, download).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::DownloadFailed {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: "download timed out".to_string(),
            }),
        }
    }

    /// Generates a presigned GET URL valid for [`SIGNED_URL_LIFETIME`].
    /// Callers needing the `fullProductSignedURL` extra query parameters
    /// append them after presigning, since the expression manager that
    /// produces them has no dependency on this crate.
    async fn generate_signed_url(&self, bucket: &str, key: &str) -> Result<String, StoreError> {
        let presign_config = PresigningConfig::expires_in(SIGNED_URL_LIFETIME).map_err(|err| {
            StoreError::PresignFailed {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: err.to_string(),
            }
        })?;

        let presigned = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presign_config)
            .await
            .map_err(|err| StoreError::PresignFailed {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: err.to_string(),
            })?;

        debug!(bucket, key, "generated signed url");
        Ok(presigned.uri().to_string())
    }
}

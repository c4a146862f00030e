use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument};

use super::backend::{with_deadline, with_timeout, ByteStream, ObjectUri, StorageBackend};
use super::{DEFAULT_READ_TIMEOUT, DEFAULT_SIZE_TIMEOUT};
use crate::error::StorageError;

/// Google Cloud Storage XML endpoint, which speaks the S3 protocol.
pub const GCS_ENDPOINT: &str = "https://storage.googleapis.com";

/// S3-backed implementation of StorageBackend.
///
/// Serves `s3://` URIs from AWS S3 or S3-compatible storage (MinIO, etc.),
/// and `gs://` URIs from Google Cloud Storage through its interoperability
/// endpoint. The client is built once and shared by every call.
#[derive(Clone)]
pub struct S3Backend {
    client: Client,
    scheme: String,
    size_timeout: Duration,
    read_timeout: Duration,
}

impl S3Backend {
    /// Create a backend serving the `s3` scheme.
    pub fn new(client: Client) -> Self {
        Self::with_scheme(client, "s3")
    }

    /// Create a backend serving the `gs` scheme.
    ///
    /// The client should point at [`GCS_ENDPOINT`] with HMAC credentials;
    /// see [`create_gcs_client`].
    pub fn gcs(client: Client) -> Self {
        Self::with_scheme(client, "gs")
    }

    /// Create a backend serving an arbitrary scheme.
    pub fn with_scheme(client: Client, scheme: impl Into<String>) -> Self {
        Self {
            client,
            scheme: scheme.into(),
            size_timeout: DEFAULT_SIZE_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Override the per-call timeouts.
    ///
    /// # Arguments
    /// * `size_timeout` - Bound on a HEAD request
    /// * `read_timeout` - Bound on a range read, body included
    pub fn with_timeouts(mut self, size_timeout: Duration, read_timeout: Duration) -> Self {
        self.size_timeout = size_timeout;
        self.read_timeout = read_timeout;
        self
    }

    /// Get the underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Map an SDK failure onto the storage taxonomy.
///
/// Missing objects surface in several shapes depending on the provider, so
/// the modeled service error, the raw status and the message are all checked.
fn classify_error(
    uri: &ObjectUri,
    service_not_found: bool,
    status: Option<u16>,
    message: String,
) -> StorageError {
    if service_not_found || status == Some(404) {
        return StorageError::NotFound(uri.to_string());
    }

    // Match error codes only, never bare status numbers
    if message.contains("NotFound") || message.contains("NoSuchKey") {
        return StorageError::NotFound(uri.to_string());
    }

    StorageError::Transient(format!("{}: {}", uri, message))
}

/// Object size from a HEAD response. A missing length is a provider fault,
/// not an empty object.
fn object_size(uri: &ObjectUri, content_length: Option<i64>) -> Result<u64, StorageError> {
    match content_length {
        Some(len) if len >= 0 => Ok(len as u64),
        Some(len) => Err(StorageError::Transient(format!(
            "{}: invalid content length {}",
            uri, len
        ))),
        None => Err(StorageError::Transient(format!(
            "{}: size query returned no content length",
            uri
        ))),
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    #[instrument(skip(self), fields(backend = %self.scheme, uri = %uri))]
    async fn file_size(&self, uri: &ObjectUri) -> Result<u64, StorageError> {
        let request = async {
            let head = self
                .client
                .head_object()
                .bucket(uri.bucket())
                .key(uri.key())
                .send()
                .await
                .map_err(|e| {
                    let service_not_found = e
                        .as_service_error()
                        .map(|se| se.is_not_found())
                        .unwrap_or(false);
                    let status = e.raw_response().map(|r| r.status().as_u16());
                    classify_error(uri, service_not_found, status, e.to_string())
                })?;

            object_size(uri, head.content_length())
        };

        let size = with_timeout(self.size_timeout, "size query", uri, request).await?;
        debug!(size, "object size resolved");
        Ok(size)
    }

    #[instrument(skip(self), fields(backend = %self.scheme, uri = %uri))]
    async fn range_reader(
        &self,
        uri: &ObjectUri,
        start: u64,
        end_inclusive: u64,
    ) -> Result<ByteStream, StorageError> {
        if end_inclusive < start {
            return Err(StorageError::RangeOutOfBounds {
                offset: start,
                requested: 0,
                size: 0,
            });
        }

        let deadline = Instant::now() + self.read_timeout;

        // Build range header: "bytes=start-end" (inclusive on both ends)
        let range = format!("bytes={}-{}", start, end_inclusive);

        let request = async {
            self.client
                .get_object()
                .bucket(uri.bucket())
                .key(uri.key())
                .range(range)
                .send()
                .await
                .map_err(|e| {
                    let service_not_found = e
                        .as_service_error()
                        .map(|se| se.is_no_such_key())
                        .unwrap_or(false);
                    let status = e.raw_response().map(|r| r.status().as_u16());
                    classify_error(uri, service_not_found, status, e.to_string())
                })
        };

        let output = with_timeout(self.read_timeout, "range read", uri, request).await?;

        let identifier = uri.to_string();
        let body_uri = identifier.clone();
        let stream = ReaderStream::new(output.body.into_async_read()).map(move |chunk| {
            chunk.map_err(|e| StorageError::Transient(format!("{}: {}", body_uri, e)))
        });

        Ok(with_deadline(Box::pin(stream), deadline, identifier))
    }
}

/// Create an S3 client with optional custom endpoint and region.
///
/// Use a custom endpoint for S3-compatible services like MinIO:
/// ```ignore
/// let client = create_s3_client(Some("http://localhost:9000"), "us-east-1").await;
/// ```
///
/// For AWS S3, pass `None` to use the default endpoint:
/// ```ignore
/// let client = create_s3_client(None, "us-east-1").await;
/// ```
pub async fn create_s3_client(endpoint_url: Option<&str>, region: &str) -> Client {
    let region = aws_config::Region::new(region.to_string());
    let mut config_loader =
        aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region);

    if let Some(endpoint) = endpoint_url {
        config_loader = config_loader.endpoint_url(endpoint);
    }

    let sdk_config = config_loader.load().await;

    // S3-compatible services generally need path-style addressing
    let s3_config = if endpoint_url.is_some() {
        aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build()
    } else {
        aws_sdk_s3::config::Builder::from(&sdk_config).build()
    };

    Client::from_conf(s3_config)
}

/// Create a client for Google Cloud Storage's S3-interoperable endpoint.
///
/// Credentials come from the usual AWS provider chain and must be GCS HMAC
/// keys. `endpoint_url` defaults to [`GCS_ENDPOINT`].
pub async fn create_gcs_client(endpoint_url: Option<&str>, region: &str) -> Client {
    create_s3_client(Some(endpoint_url.unwrap_or(GCS_ENDPOINT)), region).await
}

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::time::Instant;

use crate::error::StorageError;

/// A boxed stream of bytes produced by a range read.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StorageError>> + Send>>;

/// Default timeout for object size queries (HEAD requests).
pub const DEFAULT_SIZE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for a complete range read, body included.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(50);

// =============================================================================
// Object URI
// =============================================================================

/// Location of an object in a named store: `{scheme}://{bucket}/{key}`.
///
/// Objects are treated as immutable for the lifetime of any handle opened
/// against them, so the rendered URI doubles as the object's identity in
/// the chunk cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectUri {
    scheme: String,
    bucket: String,
    key: String,
}

impl ObjectUri {
    /// Create a URI from its parts.
    pub fn new(
        scheme: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parse `scheme://bucket/key`.
    ///
    /// The key keeps any inner slashes; an empty scheme, bucket or key is
    /// rejected.
    pub fn parse(uri: &str) -> Result<Self, StorageError> {
        let invalid = |reason: &str| StorageError::InvalidUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme separator"))?;

        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        {
            return Err(invalid("invalid scheme"));
        }

        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| invalid("missing object key"))?;

        if bucket.is_empty() {
            return Err(invalid("empty bucket"));
        }
        if key.is_empty() {
            return Err(invalid("empty object key"));
        }

        Ok(Self::new(scheme, bucket, key))
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
    }
}

// =============================================================================
// StorageBackend Trait
// =============================================================================

/// Uniform interface to a named object store.
///
/// Implementations are constructed once and shared; they must reuse their
/// underlying clients across calls. Each call is bounded by a timeout and
/// reports an elapsed timeout as [`StorageError::Transient`].
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// URI scheme served by this backend (e.g. `s3`).
    fn scheme(&self) -> &str;

    /// Committed length of the object in bytes.
    ///
    /// Fails with [`StorageError::NotFound`] when the object does not exist.
    async fn file_size(&self, uri: &ObjectUri) -> Result<u64, StorageError>;

    /// Stream the inclusive byte range `start..=end_inclusive`.
    ///
    /// Callers must not request bytes past the end of the object; providers
    /// are not assumed to clamp.
    async fn range_reader(
        &self,
        uri: &ObjectUri,
        start: u64,
        end_inclusive: u64,
    ) -> Result<ByteStream, StorageError>;
}

// =============================================================================
// Backend Registry
// =============================================================================

/// Backends keyed by the URI scheme they serve.
///
/// Dispatch happens once per open, by scheme string.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn StorageBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a backend, replacing any backend already registered for its scheme.
    pub fn register(&mut self, backend: Arc<dyn StorageBackend>) {
        self.backends.insert(backend.scheme().to_string(), backend);
    }

    /// Builder-style variant of [`register`](Self::register).
    pub fn with_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.register(backend);
        self
    }

    /// Look up the backend for a scheme.
    pub fn get(&self, scheme: &str) -> Result<Arc<dyn StorageBackend>, StorageError> {
        self.backends
            .get(scheme)
            .cloned()
            .ok_or_else(|| StorageError::UnsupportedScheme(scheme.to_string()))
    }

    /// Parse a URI and select the backend serving its scheme.
    pub fn resolve(
        &self,
        uri: &str,
    ) -> Result<(Arc<dyn StorageBackend>, ObjectUri), StorageError> {
        let parsed = ObjectUri::parse(uri)?;
        let backend = self.get(parsed.scheme())?;
        Ok((backend, parsed))
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}

// =============================================================================
// Timeout Helpers
// =============================================================================

/// Run a backend operation under a timeout.
pub(crate) async fn with_timeout<T, F>(
    timeout: Duration,
    operation: &str,
    uri: &ObjectUri,
    fut: F,
) -> Result<T, StorageError>
where
    F: std::future::Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Transient(format!(
            "{} of {} timed out after {:?}",
            operation, uri, timeout
        ))),
    }
}

/// Bound the body of a range read by a deadline.
///
/// The stream ends with a [`StorageError::Transient`] item if the deadline
/// passes before the provider finishes sending.
pub(crate) fn with_deadline(stream: ByteStream, deadline: Instant, uri: String) -> ByteStream {
    Box::pin(futures::stream::unfold(Some(stream), move |state| {
        let uri = uri.clone();
        async move {
            let mut stream = state?;
            match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(Some(item)) => Some((item, Some(stream))),
                Ok(None) => None,
                Err(_) => Some((
                    Err(StorageError::Transient(format!(
                        "range read of {} timed out",
                        uri
                    ))),
                    None,
                )),
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    #[test]
    fn test_parse_uri() {
        let uri = ObjectUri::parse("s3://tiles-bucket/tilesets/parks.mbtiles").unwrap();
        assert_eq!(uri.scheme(), "s3");
        assert_eq!(uri.bucket(), "tiles-bucket");
        assert_eq!(uri.key(), "tilesets/parks.mbtiles");
        assert_eq!(uri.to_string(), "s3://tiles-bucket/tilesets/parks.mbtiles");
    }

    #[test]
    fn test_parse_uri_rejects_malformed() {
        for bad in [
            "tiles-bucket/parks.mbtiles",
            "://bucket/key",
            "s3://bucket",
            "s3:///key",
            "s3://bucket/",
            "s 3://bucket/key",
        ] {
            assert!(
                matches!(ObjectUri::parse(bad), Err(StorageError::InvalidUri { .. })),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_registry_resolves_by_scheme() {
        let registry = BackendRegistry::new().with_backend(Arc::new(MemoryBackend::new()));

        let (backend, uri) = registry.resolve("mem://bucket/a/b.mbtiles").unwrap();
        assert_eq!(backend.scheme(), "mem");
        assert_eq!(uri.key(), "a/b.mbtiles");
        assert_eq!(registry.schemes(), vec!["mem"]);
    }

    #[test]
    fn test_registry_unknown_scheme() {
        let registry = BackendRegistry::new().with_backend(Arc::new(MemoryBackend::new()));

        let result = registry.resolve("ftp://bucket/key");
        assert!(matches!(result, Err(StorageError::UnsupportedScheme(s)) if s == "ftp"));
    }

    #[tokio::test]
    async fn test_with_timeout_maps_elapsed_to_transient() {
        let uri = ObjectUri::new("mem", "bucket", "slow");
        let result: Result<(), StorageError> =
            with_timeout(Duration::from_millis(10), "size query", &uri, async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(StorageError::Transient(_))));
    }

    #[tokio::test]
    async fn test_with_deadline_ends_stalled_stream() {
        let stalled: ByteStream = Box::pin(futures::stream::pending());
        let mut stream = with_deadline(
            stalled,
            Instant::now() + Duration::from_millis(10),
            "mem://bucket/stalled".to_string(),
        );

        let first = stream.next().await;
        assert!(matches!(first, Some(Err(StorageError::Transient(_)))));
        assert!(stream.next().await.is_none());
    }
}

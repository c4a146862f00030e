use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::Instant;
use tokio_util::io::ReaderStream;
use tracing::instrument;

use super::backend::{with_deadline, with_timeout, ByteStream, ObjectUri, StorageBackend};
use super::{DEFAULT_READ_TIMEOUT, DEFAULT_SIZE_TIMEOUT};
use crate::error::StorageError;

/// Local directory implementation of StorageBackend.
///
/// `file://{bucket}/{key}` resolves to `{root}/{bucket}/{key}`. Useful for
/// development against tilesets on disk without an object store.
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
    size_timeout: Duration,
    read_timeout: Duration,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            size_timeout: DEFAULT_SIZE_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Override the per-call timeouts.
    pub fn with_timeouts(mut self, size_timeout: Duration, read_timeout: Duration) -> Self {
        self.size_timeout = size_timeout;
        self.read_timeout = read_timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a URI onto a path under the root, refusing anything that would
    /// escape it.
    fn path_for(&self, uri: &ObjectUri) -> Result<PathBuf, StorageError> {
        let relative = Path::new(uri.bucket()).join(uri.key());
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));

        if escapes {
            return Err(StorageError::InvalidUri {
                uri: uri.to_string(),
                reason: "path escapes the storage root".to_string(),
            });
        }

        Ok(self.root.join(relative))
    }

    fn map_io_error(uri: &ObjectUri, err: std::io::Error) -> StorageError {
        if err.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(uri.to_string())
        } else {
            StorageError::Transient(format!("{}: {}", uri, err))
        }
    }
}

#[async_trait]
impl StorageBackend for FsBackend {
    fn scheme(&self) -> &str {
        "file"
    }

    #[instrument(skip(self), fields(backend = "file", uri = %uri))]
    async fn file_size(&self, uri: &ObjectUri) -> Result<u64, StorageError> {
        let path = self.path_for(uri)?;

        with_timeout(self.size_timeout, "size query", uri, async {
            let metadata = tokio::fs::metadata(&path)
                .await
                .map_err(|e| Self::map_io_error(uri, e))?;

            if !metadata.is_file() {
                return Err(StorageError::NotFound(uri.to_string()));
            }

            Ok(metadata.len())
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "file", uri = %uri))]
    async fn range_reader(
        &self,
        uri: &ObjectUri,
        start: u64,
        end_inclusive: u64,
    ) -> Result<ByteStream, StorageError> {
        let path = self.path_for(uri)?;
        let deadline = Instant::now() + self.read_timeout;

        let file = with_timeout(self.read_timeout, "range read", uri, async {
            let mut file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| Self::map_io_error(uri, e))?;
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|e| Self::map_io_error(uri, e))?;
            Ok(file)
        })
        .await?;

        let len = end_inclusive.saturating_sub(start) + 1;
        let identifier = uri.to_string();
        let body_uri = identifier.clone();
        let stream = ReaderStream::new(file.take(len)).map(move |chunk| {
            chunk.map_err(|e| StorageError::Transient(format!("{}: {}", body_uri, e)))
        });

        Ok(with_deadline(Box::pin(stream), deadline, identifier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    async fn collect(stream: ByteStream) -> Vec<u8> {
        let mut out = BytesMut::new();
        let mut stream = stream;
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out.to_vec()
    }

    fn setup() -> (tempfile::TempDir, FsBackend) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("bucket/tilesets")).unwrap();
        let data: Vec<u8> = (0..1000).map(|i| (i % 256) as u8).collect();
        std::fs::write(dir.path().join("bucket/tilesets/parks.mbtiles"), data).unwrap();
        let backend = FsBackend::new(dir.path());
        (dir, backend)
    }

    #[tokio::test]
    async fn test_file_size() {
        let (_dir, backend) = setup();
        let uri = ObjectUri::new("file", "bucket", "tilesets/parks.mbtiles");
        assert_eq!(backend.file_size(&uri).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let (_dir, backend) = setup();
        let uri = ObjectUri::new("file", "bucket", "tilesets/missing.mbtiles");
        assert!(backend.file_size(&uri).await.unwrap_err().is_not_found());
        assert!(backend.range_reader(&uri, 0, 9).await.is_err());
    }

    #[tokio::test]
    async fn test_directory_is_not_found() {
        let (_dir, backend) = setup();
        let uri = ObjectUri::new("file", "bucket", "tilesets");
        assert!(backend.file_size(&uri).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_range_read() {
        let (_dir, backend) = setup();
        let uri = ObjectUri::new("file", "bucket", "tilesets/parks.mbtiles");

        let bytes = collect(backend.range_reader(&uri, 10, 19).await.unwrap()).await;
        let expected: Vec<u8> = (10..20).map(|i| i as u8).collect();
        assert_eq!(bytes, expected);
    }

    #[tokio::test]
    async fn test_rejects_parent_components() {
        let (_dir, backend) = setup();
        let uri = ObjectUri::new("file", "bucket", "../outside.mbtiles");
        assert!(matches!(
            backend.file_size(&uri).await,
            Err(StorageError::InvalidUri { .. })
        ));
    }
}

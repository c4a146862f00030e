use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::backend::{ByteStream, ObjectUri, StorageBackend};
use super::chunk_cache::{ChunkCache, ChunkKey};
use crate::error::StorageError;

/// Read-only random-access file over a storage backend.
///
/// Arbitrary-offset reads are translated into aligned chunk fetches that go
/// through the shared [`ChunkCache`]. The object's length is queried at most
/// once per handle. Mutating operations always fail; locking is a no-op
/// because the underlying object never changes while it is open.
pub struct RemoteFile {
    uri: ObjectUri,
    identity: Arc<str>,
    backend: Arc<dyn StorageBackend>,
    cache: Arc<ChunkCache>,
    chunk_size: u64,
    size: OnceCell<u64>,
}

impl RemoteFile {
    /// Create a handle for `uri`.
    ///
    /// # Arguments
    /// * `uri` - Object to read
    /// * `backend` - Backend serving the URI's scheme
    /// * `cache` - Chunk cache shared with other handles
    /// * `chunk_size` - Fetch granularity in bytes, a multiple of 4096
    pub fn new(
        uri: ObjectUri,
        backend: Arc<dyn StorageBackend>,
        cache: Arc<ChunkCache>,
        chunk_size: usize,
    ) -> Self {
        let identity: Arc<str> = Arc::from(uri.to_string());
        Self {
            uri,
            identity,
            backend,
            cache,
            chunk_size: chunk_size.max(1) as u64,
            size: OnceCell::new(),
        }
    }

    /// Seed the memoized length, skipping the first size query.
    pub fn with_known_size(self, size: u64) -> Self {
        let _ = self.size.set(size);
        self
    }

    pub fn uri(&self) -> &ObjectUri {
        &self.uri
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size as usize
    }

    /// Length of the object, fetched on first use.
    pub async fn file_size(&self) -> Result<u64, StorageError> {
        self.size
            .get_or_try_init(|| self.backend.file_size(&self.uri))
            .await
            .copied()
    }

    /// Fill `buf` with bytes starting at `offset`.
    ///
    /// Returns the number of bytes copied, which is `buf.len()` unless the
    /// read runs past the end of the object. Errors are returned as-is and
    /// never retried.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, StorageError> {
        let mut copied = 0;

        while copied < buf.len() {
            let position = offset + copied as u64;
            let chunk_start = position / self.chunk_size * self.chunk_size;
            let in_chunk = (position - chunk_start) as usize;

            let chunk = self.chunk(chunk_start).await?;
            if in_chunk >= chunk.len() {
                break;
            }

            let n = (chunk.len() - in_chunk).min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&chunk[in_chunk..in_chunk + n]);
            copied += n;

            // A short chunk is the last one in the object
            if (chunk.len() as u64) < self.chunk_size {
                break;
            }
        }

        Ok(copied)
    }

    /// Get the chunk starting at `chunk_start`; empty at or past end-of-object.
    async fn chunk(&self, chunk_start: u64) -> Result<Bytes, StorageError> {
        if let Some(&size) = self.size.get() {
            if chunk_start >= size {
                return Ok(Bytes::new());
            }
        }

        let key = ChunkKey::new(self.identity.clone(), chunk_start);
        self.cache
            .get_or_fetch(key, || async move {
                let size = self.file_size().await?;
                if chunk_start >= size {
                    return Ok(Bytes::new());
                }
                let len = self.chunk_size.min(size - chunk_start);
                self.fetch(chunk_start, len).await
            })
            .await
    }

    /// Fetch exactly `len` bytes at `start` from the backend.
    async fn fetch(&self, start: u64, len: u64) -> Result<Bytes, StorageError> {
        debug!(uri = %self.uri, start, len, "chunk miss");
        let stream = self
            .backend
            .range_reader(&self.uri, start, start + len - 1)
            .await?;

        collect_exact(stream, &self.uri, start, len)
            .await
            .inspect_err(|err| {
                if let StorageError::TruncatedRead { actual, .. } = err {
                    warn!(uri = %self.uri, start, expected = len, actual, "truncated range read");
                }
            })
    }

    /// Always fails: the file is read-only.
    pub fn write_at(&self, _buf: &[u8], _offset: u64) -> Result<usize, StorageError> {
        Err(StorageError::ReadOnlyViolation("write"))
    }

    /// Always fails: the file is read-only.
    pub fn truncate(&self, _size: u64) -> Result<(), StorageError> {
        Err(StorageError::ReadOnlyViolation("truncate"))
    }

    /// Nothing to flush.
    pub fn sync(&self) -> Result<(), StorageError> {
        Ok(())
    }

    pub fn lock(&self) -> Result<(), StorageError> {
        Ok(())
    }

    pub fn unlock(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// No other process can hold a reserved lock on an immutable object.
    pub fn check_reserved_lock(&self) -> Result<bool, StorageError> {
        Ok(false)
    }

    /// The content never changes while the handle is open.
    pub fn is_immutable(&self) -> bool {
        true
    }
}

impl fmt::Debug for RemoteFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFile")
            .field("uri", &self.uri)
            .field("chunk_size", &self.chunk_size)
            .field("size", &self.size.get())
            .finish()
    }
}

/// Drain a range stream that must deliver exactly `len` bytes.
///
/// A short stream is reported as [`StorageError::TruncatedRead`]; bytes past
/// `len` are discarded.
async fn collect_exact(
    mut stream: ByteStream,
    uri: &ObjectUri,
    start: u64,
    len: u64,
) -> Result<Bytes, StorageError> {
    let mut data = BytesMut::with_capacity(len as usize);

    while let Some(piece) = stream.next().await {
        data.extend_from_slice(&piece?);
        if data.len() as u64 >= len {
            break;
        }
    }

    if (data.len() as u64) < len {
        return Err(StorageError::TruncatedRead {
            uri: uri.to_string(),
            offset: start,
            expected: len,
            actual: data.len() as u64,
        });
    }

    data.truncate(len as usize);
    Ok(data.freeze())
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::backend::{ByteStream, ObjectUri, StorageBackend};
use crate::error::StorageError;

/// Size of the pieces a range read is split into.
const DEFAULT_PIECE_SIZE: usize = 8 * 1024;

/// In-process implementation of StorageBackend.
///
/// Objects live in a map keyed by `bucket/key`. Every call is counted and
/// every requested range recorded, which makes this backend the workhorse
/// of the test suite. Latency and truncated responses can be injected.
pub struct MemoryBackend {
    scheme: String,
    objects: RwLock<HashMap<String, Bytes>>,
    piece_size: usize,
    latency: Mutex<Option<Duration>>,
    response_limit: Mutex<Option<usize>>,
    file_size_calls: AtomicUsize,
    range_calls: AtomicUsize,
    ranges: Mutex<Vec<(u64, u64)>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty backend serving the `mem` scheme.
    pub fn new() -> Self {
        Self::with_scheme("mem")
    }

    /// Create an empty backend serving an arbitrary scheme.
    pub fn with_scheme(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            objects: RwLock::new(HashMap::new()),
            piece_size: DEFAULT_PIECE_SIZE,
            latency: Mutex::new(None),
            response_limit: Mutex::new(None),
            file_size_calls: AtomicUsize::new(0),
            range_calls: AtomicUsize::new(0),
            ranges: Mutex::new(Vec::new()),
        }
    }

    fn object_key(bucket: &str, key: &str) -> String {
        format!("{}/{}", bucket, key)
    }

    /// Store an object, replacing any previous content.
    pub fn put(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(Self::object_key(bucket, key), data.into());
    }

    /// Remove an object. Returns whether it existed.
    pub fn remove(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&Self::object_key(bucket, key))
            .is_some()
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Cap the number of bytes any range read delivers, simulating a
    /// provider that closes the connection early.
    pub fn set_response_limit(&self, limit: Option<usize>) {
        *self
            .response_limit
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = limit;
    }

    /// Number of `file_size` calls served.
    pub fn file_size_calls(&self) -> usize {
        self.file_size_calls.load(Ordering::SeqCst)
    }

    /// Number of `range_reader` calls served.
    pub fn range_calls(&self) -> usize {
        self.range_calls.load(Ordering::SeqCst)
    }

    /// Inclusive ranges requested so far, in call order.
    pub fn requested_ranges(&self) -> Vec<(u64, u64)> {
        self.ranges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Zero the call counters and forget recorded ranges.
    pub fn reset_counters(&self) {
        self.file_size_calls.store(0, Ordering::SeqCst);
        self.range_calls.store(0, Ordering::SeqCst);
        self.ranges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn lookup(&self, uri: &ObjectUri) -> Result<Bytes, StorageError> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&Self::object_key(uri.bucket(), uri.key()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(uri.to_string()))
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    async fn file_size(&self, uri: &ObjectUri) -> Result<u64, StorageError> {
        self.file_size_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        Ok(self.lookup(uri)?.len() as u64)
    }

    async fn range_reader(
        &self,
        uri: &ObjectUri,
        start: u64,
        end_inclusive: u64,
    ) -> Result<ByteStream, StorageError> {
        self.range_calls.fetch_add(1, Ordering::SeqCst);
        self.ranges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((start, end_inclusive));
        self.simulate_latency().await;

        let data = self.lookup(uri)?;
        let size = data.len() as u64;
        if end_inclusive < start || end_inclusive >= size {
            return Err(StorageError::RangeOutOfBounds {
                offset: start,
                requested: (end_inclusive + 1).saturating_sub(start),
                size,
            });
        }

        let mut body = data.slice(start as usize..=end_inclusive as usize);
        let limit = *self
            .response_limit
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(limit) = limit {
            body.truncate(limit);
        }

        let mut pieces = Vec::new();
        while !body.is_empty() {
            let n = body.len().min(self.piece_size);
            pieces.push(Ok(body.split_to(n)));
        }

        Ok(Box::pin(futures::stream::iter(pieces)))
    }
}

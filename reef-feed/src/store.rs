//! Abstraction over the block layer.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use reef_base::Hash;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Content-addressed put/get of opaque byte blobs.
///
/// The store is shared by all pods of all users and never mutates existing
/// chunks. Besides the plain content-addressed `put`, feeds need `put_at`:
/// a single-owner slot whose address is derived from `(topic, owner, epoch)`
/// instead of the chunk content, so readers can probe for an update with one
/// fetch.
#[async_trait]
pub trait ChunkStore: std::fmt::Debug + Send + Sync + 'static {
    /// Store `data` under its content address. Idempotent.
    async fn put(&self, data: Bytes) -> Result<Hash>;

    /// Store `data` under the externally derived address `addr`.
    ///
    /// Storing the same bytes twice is a no-op; storing different bytes at
    /// an occupied address fails with [`Error::Conflict`].
    async fn put_at(&self, addr: Hash, data: Bytes) -> Result<()>;

    /// Fetch the chunk at `addr`, or [`Error::NotFound`].
    async fn get(&self, addr: &Hash) -> Result<Bytes>;
}

/// In-process chunk store backed by a hash map.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    chunks: Arc<RwLock<HashMap<Hash, Bytes>>>,
}

impl MemStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunks currently stored.
    pub fn len(&self) -> usize {
        self.chunks.read().len()
    }

    /// Whether the store holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.chunks.read().is_empty()
    }
}

#[async_trait]
impl ChunkStore for MemStore {
    async fn put(&self, data: Bytes) -> Result<Hash> {
        let hash = Hash::new(&data);
        self.chunks.write().entry(hash).or_insert(data);
        Ok(hash)
    }

    async fn put_at(&self, addr: Hash, data: Bytes) -> Result<()> {
        let mut chunks = self.chunks.write();
        match chunks.get(&addr) {
            Some(existing) if *existing == data => Ok(()),
            Some(_) => Err(Error::Conflict),
            None => {
                chunks.insert(addr, data);
                Ok(())
            }
        }
    }

    async fn get(&self, addr: &Hash) -> Result<Bytes> {
        self.chunks
            .read()
            .get(addr)
            .cloned()
            .ok_or(Error::NotFound)
    }
}

/// Backoff schedule for transient block layer failures.
const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(400),
    Duration::from_millis(1600),
];

/// Wraps a [`ChunkStore`] and retries transiently failing reads.
///
/// Misses are not transient and are returned immediately; only
/// [`Error::ChunkUnavailable`] triggers the backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryingStore<S> {
    inner: S,
}

impl<S: ChunkStore> RetryingStore<S> {
    /// Wrap `inner`.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: ChunkStore> ChunkStore for RetryingStore<S> {
    async fn put(&self, data: Bytes) -> Result<Hash> {
        self.inner.put(data).await
    }

    async fn put_at(&self, addr: Hash, data: Bytes) -> Result<()> {
        self.inner.put_at(addr, data).await
    }

    async fn get(&self, addr: &Hash) -> Result<Bytes> {
        for (attempt, backoff) in RETRY_BACKOFF.iter().enumerate() {
            match self.inner.get(addr).await {
                Ok(data) => return Ok(data),
                Err(Error::ChunkUnavailable(hash)) => {
                    debug!(%hash, attempt, "chunk fetch failed, backing off {backoff:?}");
                    tokio::time::sleep(*backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
        self.inner.get(addr).await.map_err(|err| {
            if let Error::ChunkUnavailable(hash) = &err {
                warn!(%hash, "chunk unavailable after retries");
            }
            err
        })
    }
}

//! The engine and its pod handles.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use reef_base::Owner;
use reef_collection::{
    DocBatch, DocStore, Error, IndexKind, KvStore, Registry, TableDescriptor,
};
use reef_feed::{ChunkStore, Clock, Feed, PodKey, SystemClock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Config, Result};

/// The storage engine: a chunk store, a clock and the pods opened on top.
///
/// One engine value per process (or per test); there is no global state.
/// Lifecycle is `new → operations → shutdown`.
#[derive(Debug)]
pub struct Engine<S> {
    config: Config,
    feed: Feed<S>,
    pods: RwLock<HashMap<String, Arc<Pod<S>>>>,
    shutdown: CancellationToken,
}

impl<S: ChunkStore> Engine<S> {
    /// Create an engine over `store` using the wall clock.
    pub fn new(config: Config, store: Arc<S>) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Create an engine with an explicit clock; tests inject a manual one.
    pub fn with_clock(config: Config, store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Engine {
            config,
            feed: Feed::new(store, clock),
            pods: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Open (or retrieve) the pod `name`, deriving its key from
    /// `password`. The owner address comes from the external account
    /// provider.
    pub fn open_pod(&self, name: &str, owner: Owner, password: &str) -> Result<Arc<Pod<S>>> {
        self.check_running()?;
        let key = PodKey::derive(password);
        if let Some(pod) = self.pods.read().get(name) {
            if pod.pod_key != key || pod.owner != owner {
                return Err(Error::Invalid(format!(
                    "pod {name} is already open with different credentials"
                )));
            }
            return Ok(pod.clone());
        }
        let pod = Arc::new(Pod {
            name: name.to_string(),
            owner,
            pod_key: key.clone(),
            registry: Registry::new(name, owner, key, self.feed.clone()),
            config: self.config.clone(),
        });
        self.pods.write().insert(name.to_string(), pod.clone());
        debug!(pod = %name, "pod opened");
        Ok(pod)
    }

    /// Drop the handle of pod `name`.
    pub fn close_pod(&self, name: &str) -> Result<()> {
        match self.pods.write().remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::NotOpen(name.to_string())),
        }
    }

    /// Whether the pod is open on this engine.
    pub fn is_pod_open(&self, name: &str) -> bool {
        self.pods.read().contains_key(name)
    }

    /// Refuse further work and drop every pod handle. The chunk store is
    /// untouched; a new engine over the same store sees all committed
    /// state.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.pods.write().clear();
        debug!("engine shut down");
    }

    fn check_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Invalid("engine is shut down".to_string()));
        }
        Ok(())
    }
}

/// A password-keyed namespace holding tables.
#[derive(Debug)]
pub struct Pod<S> {
    name: String,
    owner: Owner,
    pod_key: PodKey,
    registry: Registry<S>,
    config: Config,
}

impl<S: ChunkStore> Pod<S> {
    /// The pod name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pod's owner address.
    pub fn owner(&self) -> Owner {
        self.owner
    }

    /// The pod's table catalog.
    pub fn registry(&self) -> &Registry<S> {
        &self.registry
    }

    /// Declare a mutable KV table keyed by `kind`.
    pub async fn create_kv_table(
        &self,
        name: &str,
        kind: IndexKind,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.registry
            .create_table(TableDescriptor::kv(name, kind), cancel)
            .await
    }

    /// Declare a doc table with the given secondary index columns.
    pub async fn create_doc_table(
        &self,
        name: &str,
        mutable: bool,
        columns: &[(&str, IndexKind)],
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.registry
            .create_table(TableDescriptor::doc(name, mutable, columns), cancel)
            .await
    }

    /// Open a declared table.
    pub async fn open_table(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        self.registry.open_table(name, cancel).await
    }

    /// Release a table's handles.
    pub fn close_table(&self, name: &str) -> Result<()> {
        self.registry.close_table(name)
    }

    /// Remove a closed table from the catalog.
    pub async fn delete_table(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        self.registry.delete_table(name, cancel).await
    }

    /// Descriptors of every table in the pod.
    pub async fn list_tables(&self, cancel: &CancellationToken) -> Result<Vec<TableDescriptor>> {
        self.registry.list_tables(cancel).await
    }

    /// The open KV table `name`.
    pub fn kv(&self, name: &str) -> Result<KvStore<S>> {
        self.registry.kv(name)
    }

    /// The open doc table `name`.
    pub fn doc(&self, name: &str) -> Result<DocStore<S>> {
        self.registry.doc(name)
    }

    /// Start a document batch against the open doc table `name`, bounded
    /// by the engine's batch memory limit.
    pub fn doc_batch(&self, name: &str) -> Result<DocBatch<S>> {
        let store = self.registry.doc(name)?;
        Ok(DocBatch::with_memory_limit(
            store,
            self.config.batch_memory_limit,
        ))
    }
}

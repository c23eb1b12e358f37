//! The per-pod table catalog.
//!
//! Persisted state is minimal: one index on the pod's registry topic maps
//! `table_name → hash(descriptor)`, and each descriptor is the payload of
//! the table's schema feed. Everything else (open handles, writer-lock
//! tokens) is in-memory per registry instance.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use parking_lot::{Mutex as SyncMutex, RwLock};
use reef_base::{Hash, Owner, Topic};
use reef_feed::{ChunkStore, Feed, PodKey};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    doc::{DocStore, Secondary, PRIMARY_COLUMN},
    index::Index,
    keys::IndexKind,
    kv::KvStore,
    Error, Result,
};

/// What a table stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    /// Key-value rows behind a single typed index.
    Kv,
    /// JSON documents with secondary indexes.
    Doc,
}

/// One declared index column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// The document field (or the key, for KV tables).
    pub column: String,
    /// Key kind of the index.
    #[serde(rename = "type")]
    pub kind: IndexKind,
    /// Whether a key may hold several values.
    #[serde(default)]
    pub multi: bool,
}

/// The persisted description of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Table name, unique inside the pod.
    pub name: String,
    /// KV or doc.
    pub kind: TableKind,
    /// Whether point writes are allowed after creation.
    pub mutable: bool,
    /// The table's indexes; the first one is primary.
    pub indexes: Vec<IndexSpec>,
}

impl TableDescriptor {
    /// Descriptor of a mutable KV table keyed by `kind`.
    pub fn kv(name: &str, kind: IndexKind) -> Self {
        TableDescriptor {
            name: name.to_string(),
            kind: TableKind::Kv,
            mutable: true,
            indexes: vec![IndexSpec {
                column: PRIMARY_COLUMN.to_string(),
                kind,
                multi: false,
            }],
        }
    }

    /// Descriptor of a doc table with the given secondary columns. The
    /// primary `id` index is implied; secondaries hold value lists because
    /// any number of documents can share one field value.
    pub fn doc(name: &str, mutable: bool, columns: &[(&str, IndexKind)]) -> Self {
        let mut indexes = vec![IndexSpec {
            column: PRIMARY_COLUMN.to_string(),
            kind: IndexKind::String,
            multi: false,
        }];
        indexes.extend(columns.iter().map(|(column, kind)| IndexSpec {
            column: column.to_string(),
            kind: *kind,
            multi: true,
        }));
        TableDescriptor {
            name: name.to_string(),
            kind: TableKind::Doc,
            mutable,
            indexes,
        }
    }

    /// Serialize to the wire JSON.
    pub fn encode(&self) -> Result<Bytes> {
        let bytes =
            serde_json::to_vec(self).map_err(|err| Error::invalid(format!("descriptor: {err}")))?;
        Ok(Bytes::from(bytes))
    }

    /// Parse the wire JSON.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let desc: TableDescriptor =
            serde_json::from_slice(data).map_err(|_| Error::Corrupt("bad table descriptor"))?;
        desc.validate()?;
        Ok(desc)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::invalid("table name must not be empty"));
        }
        let Some(primary) = self.indexes.first() else {
            return Err(Error::invalid("table without an index"));
        };
        if primary.column != PRIMARY_COLUMN || primary.multi {
            return Err(Error::invalid("the first index must be the primary id"));
        }
        match self.kind {
            TableKind::Kv => {
                if self.indexes.len() != 1 {
                    return Err(Error::invalid("kv tables have exactly one index"));
                }
            }
            TableKind::Doc => {
                if primary.kind != IndexKind::String {
                    return Err(Error::invalid("doc tables key documents by string id"));
                }
            }
        }
        let mut columns: Vec<&str> = self.indexes.iter().map(|i| i.column.as_str()).collect();
        columns.sort_unstable();
        columns.dedup();
        if columns.len() != self.indexes.len() {
            return Err(Error::invalid("duplicate index column"));
        }
        Ok(())
    }
}

/// An open table handle.
#[derive(Debug)]
enum OpenTable<S> {
    Kv(KvStore<S>),
    Doc(DocStore<S>),
}

/// The catalog of one pod's tables.
#[derive(Debug)]
pub struct Registry<S> {
    pod: String,
    owner: Owner,
    pod_key: PodKey,
    feed: Feed<S>,
    catalog: Index<S>,
    open: RwLock<HashMap<String, OpenTable<S>>>,
    /// Writer-lock tokens per `(table, column)`; every handle to the same
    /// index must share its token.
    locks: SyncMutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl<S: ChunkStore> Registry<S> {
    /// Open the registry of `pod`.
    pub fn new(pod: &str, owner: Owner, pod_key: PodKey, feed: Feed<S>) -> Self {
        let catalog = Index::with_topic(
            Topic::registry(pod),
            pod,
            "registry",
            false,
            owner,
            pod_key.clone(),
            feed.clone(),
            Arc::new(Mutex::new(())),
        );
        Registry {
            pod: pod.to_string(),
            owner,
            pod_key,
            feed,
            catalog,
            open: RwLock::new(HashMap::new()),
            locks: SyncMutex::new(HashMap::new()),
        }
    }

    /// The pod this registry belongs to.
    pub fn pod(&self) -> &str {
        &self.pod
    }

    fn lock_for(&self, table: &str, column: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry((table.to_string(), column.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn index_for(&self, table: &str, spec: &IndexSpec) -> Index<S> {
        Index::new(
            table,
            &spec.column,
            spec.multi,
            self.owner,
            self.pod_key.clone(),
            self.feed.clone(),
            self.lock_for(table, &spec.column),
        )
    }

    /// Declare a table: publish its descriptor and register it in the
    /// catalog. The new table starts out closed.
    pub async fn create_table(
        &self,
        desc: TableDescriptor,
        cancel: &CancellationToken,
    ) -> Result<()> {
        desc.validate()?;
        match self.catalog.get(desc.name.as_bytes(), cancel).await {
            Ok(_) => return Err(Error::AlreadyExists(desc.name)),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        let payload = desc.encode()?;
        let descriptor_hash = Hash::new(&payload);
        let topic = Topic::schema(&desc.name);
        match self
            .feed
            .create(&topic, &self.owner, payload.clone(), &self.pod_key, cancel)
            .await
        {
            Ok(_) => {}
            Err(reef_feed::Error::AlreadyExists) => {
                // the name was declared once and deleted since: the schema
                // feed survives, the catalog is the source of truth
                self.feed
                    .update(&topic, &self.owner, payload, &self.pod_key, cancel)
                    .await?;
            }
            Err(err) => return Err(err.into()),
        }
        self.catalog
            .put(
                desc.name.as_bytes(),
                Bytes::copy_from_slice(descriptor_hash.as_bytes()),
                cancel,
            )
            .await?;
        debug!(pod = %self.pod, table = %desc.name, "table created");
        Ok(())
    }

    /// Load a declared table's descriptor, verifying it against the hash
    /// registered in the catalog.
    pub async fn descriptor(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<TableDescriptor> {
        let registered = self.catalog.get(name.as_bytes(), cancel).await?;
        let update = self
            .feed
            .get(&Topic::schema(name), &self.owner, &self.pod_key, cancel)
            .await?;
        if Hash::new(&update.payload).as_bytes() != registered.as_ref() {
            return Err(Error::Corrupt("descriptor does not match the catalog"));
        }
        TableDescriptor::decode(&update.payload)
    }

    /// Open a table, constructing and caching its index handles.
    pub async fn open_table(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        if self.open.read().contains_key(name) {
            return Ok(());
        }
        let desc = self.descriptor(name, cancel).await?;
        let handle = match desc.kind {
            TableKind::Kv => {
                let spec = &desc.indexes[0];
                OpenTable::Kv(KvStore::open(
                    name,
                    spec.kind,
                    self.index_for(name, spec),
                )?)
            }
            TableKind::Doc => {
                let primary = self.index_for(name, &desc.indexes[0]);
                let secondaries = desc.indexes[1..]
                    .iter()
                    .map(|spec| Secondary {
                        column: spec.column.clone(),
                        kind: spec.kind,
                        index: self.index_for(name, spec),
                    })
                    .collect();
                OpenTable::Doc(DocStore::open(name, desc.mutable, primary, secondaries))
            }
        };
        self.open.write().insert(name.to_string(), handle);
        debug!(pod = %self.pod, table = %name, "table opened");
        Ok(())
    }

    /// Whether the table is open on this registry.
    pub fn is_open(&self, name: &str) -> bool {
        self.open.read().contains_key(name)
    }

    /// Release a table's handles.
    pub fn close_table(&self, name: &str) -> Result<()> {
        match self.open.write().remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::NotOpen(name.to_string())),
        }
    }

    /// Remove a table from the catalog. Its chunks are orphaned, not
    /// reclaimed; the block layer is append-only. Open tables cannot be
    /// deleted.
    pub async fn delete_table(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        if self.is_open(name) {
            return Err(Error::invalid(format!(
                "table {name} is open; close it before deleting"
            )));
        }
        self.catalog.del(name.as_bytes(), cancel).await?;
        debug!(pod = %self.pod, table = %name, "table deleted");
        Ok(())
    }

    /// Descriptors of every declared table.
    pub async fn list_tables(&self, cancel: &CancellationToken) -> Result<Vec<TableDescriptor>> {
        let mut cursor = self.catalog.scan(Vec::new(), None, None);
        let mut out = Vec::new();
        while let Some((name, _)) = cursor.next(cancel).await? {
            let name = String::from_utf8(name)
                .map_err(|_| Error::Corrupt("non-utf8 table name in catalog"))?;
            out.push(self.descriptor(&name, cancel).await?);
        }
        Ok(out)
    }

    /// The open KV table `name`.
    pub fn kv(&self, name: &str) -> Result<KvStore<S>> {
        match self.open.read().get(name) {
            Some(OpenTable::Kv(store)) => Ok(store.clone()),
            Some(OpenTable::Doc(_)) => {
                Err(Error::invalid(format!("table {name} is a doc table")))
            }
            None => Err(Error::NotOpen(name.to_string())),
        }
    }

    /// The open doc table `name`.
    pub fn doc(&self, name: &str) -> Result<DocStore<S>> {
        match self.open.read().get(name) {
            Some(OpenTable::Doc(store)) => Ok(store.clone()),
            Some(OpenTable::Kv(_)) => {
                Err(Error::invalid(format!("table {name} is a kv table")))
            }
            None => Err(Error::NotOpen(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::{bytes, test_feed, test_owner};

    use super::*;

    fn registry() -> Registry<reef_feed::MemStore> {
        Registry::new("home", test_owner(), PodKey::derive("pw"), test_feed())
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let desc = TableDescriptor::doc(
            "users",
            true,
            &[("name", IndexKind::String), ("tags", IndexKind::List)],
        );
        let encoded = desc.encode().unwrap();
        let decoded = TableDescriptor::decode(&encoded).unwrap();
        assert_eq!(decoded, desc);

        // the wire names match the documented JSON shape
        let json: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(json["kind"], "doc");
        assert_eq!(json["indexes"][0]["column"], "id");
        assert_eq!(json["indexes"][2]["type"], "list");
    }

    #[test]
    fn test_descriptor_validation() {
        let mut desc = TableDescriptor::kv("t", IndexKind::String);
        desc.indexes[0].column = "other".to_string();
        assert!(TableDescriptor::decode(&serde_json::to_vec(&desc).unwrap()).is_err());

        let mut desc = TableDescriptor::doc("t", true, &[("a", IndexKind::String)]);
        desc.indexes.push(desc.indexes[1].clone());
        assert!(desc.validate().is_err());
    }

    #[tokio::test]
    async fn test_create_open_use() -> anyhow::Result<()> {
        let registry = registry();
        let cancel = CancellationToken::new();

        registry
            .create_table(TableDescriptor::kv("t", IndexKind::String), &cancel)
            .await?;
        assert!(!registry.is_open("t"));
        assert!(matches!(registry.kv("t"), Err(Error::NotOpen(_))));

        registry.open_table("t", &cancel).await?;
        let store = registry.kv("t")?;
        store.put("alpha", bytes("1"), &cancel).await?;
        assert_eq!(&store.get("alpha", &cancel).await?[..], b"1");
        Ok(())
    }

    #[tokio::test]
    async fn test_create_duplicate_fails() -> anyhow::Result<()> {
        let registry = registry();
        let cancel = CancellationToken::new();
        registry
            .create_table(TableDescriptor::kv("t", IndexKind::String), &cancel)
            .await?;
        let err = registry
            .create_table(TableDescriptor::kv("t", IndexKind::Number), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_open_missing_table() {
        let registry = registry();
        let cancel = CancellationToken::new();
        let err = registry.open_table("ghost", &cancel).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_kind_mismatch_on_access() -> anyhow::Result<()> {
        let registry = registry();
        let cancel = CancellationToken::new();
        registry
            .create_table(TableDescriptor::kv("t", IndexKind::String), &cancel)
            .await?;
        registry.open_table("t", &cancel).await?;
        assert!(matches!(registry.doc("t"), Err(Error::Invalid(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_refuses_open_tables() -> anyhow::Result<()> {
        let registry = registry();
        let cancel = CancellationToken::new();
        registry
            .create_table(TableDescriptor::kv("t", IndexKind::String), &cancel)
            .await?;
        registry.open_table("t", &cancel).await?;
        assert!(matches!(
            registry.delete_table("t", &cancel).await.unwrap_err(),
            Error::Invalid(_)
        ));

        registry.close_table("t")?;
        registry.delete_table("t", &cancel).await?;
        assert!(registry.open_table("t", &cancel).await.unwrap_err().is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_recreate_after_delete() -> anyhow::Result<()> {
        let registry = registry();
        let cancel = CancellationToken::new();
        registry
            .create_table(TableDescriptor::kv("t", IndexKind::String), &cancel)
            .await?;
        registry.delete_table("t", &cancel).await?;
        // the schema feed survives the delete; declaring the name again
        // publishes the new descriptor over it
        registry
            .create_table(TableDescriptor::kv("t", IndexKind::Number), &cancel)
            .await?;
        let desc = registry.descriptor("t", &cancel).await?;
        assert_eq!(desc.indexes[0].kind, IndexKind::Number);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_tables() -> anyhow::Result<()> {
        let registry = registry();
        let cancel = CancellationToken::new();
        registry
            .create_table(TableDescriptor::kv("beta", IndexKind::Number), &cancel)
            .await?;
        registry
            .create_table(
                TableDescriptor::doc("alpha", true, &[("name", IndexKind::String)]),
                &cancel,
            )
            .await?;
        let tables = registry.list_tables(&cancel).await?;
        let names: Vec<_> = tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["alpha", "beta"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_same_writer_lock_shared_between_opens() -> anyhow::Result<()> {
        // two handles to one table share writer locks; concurrent puts
        // serialize instead of corrupting the tree
        let registry = registry();
        let cancel = CancellationToken::new();
        registry
            .create_table(TableDescriptor::kv("t", IndexKind::String), &cancel)
            .await?;
        registry.open_table("t", &cancel).await?;
        let a = registry.kv("t")?;
        let b = registry.kv("t")?;

        let cancel2 = cancel.clone();
        let writes = tokio::join!(
            a.put("k1", bytes("1"), &cancel),
            b.put("k2", bytes("2"), &cancel2),
        );
        writes.0?;
        writes.1?;
        assert_eq!(a.count(&cancel).await?, 2);
        Ok(())
    }
}

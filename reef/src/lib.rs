//! A decentralized personal data engine.
//!
//! reef layers mutable, queryable state on top of two primitives: a
//! content-addressed chunk store and single-writer feeds placed on an
//! epoch grid. Pods are password-keyed namespaces; inside a pod, a
//! [`Registry`] declares key-value and document tables whose indexes are
//! copy-on-write manifest trees committed through feed updates.
//!
//! The [`Engine`] is the explicit entry point: construct it over a chunk
//! store, open pods, operate on tables, shut it down. Nothing is process
//! global, so tests can run any number of engines against in-memory
//! stores and fixed clocks.
//!
//! ```
//! use std::sync::Arc;
//!
//! use bytes::Bytes;
//! use reef::{Config, Engine, IndexKind, MemStore, Owner};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! let engine = Engine::new(Config::default(), Arc::new(MemStore::new()));
//! let pod = engine.open_pod("home", Owner::from_bytes([1; 20]), "password")?;
//! let cancel = CancellationToken::new();
//!
//! pod.create_kv_table("notes", IndexKind::String, &cancel).await?;
//! pod.open_table("notes", &cancel).await?;
//! let notes = pod.kv("notes")?;
//! notes.put("today", Bytes::from("buy kelp"), &cancel).await?;
//! assert_eq!(&notes.get("today", &cancel).await?[..], b"buy kelp");
//!
//! engine.shutdown();
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

mod config;
mod engine;

pub use self::config::Config;
pub use self::engine::{Engine, Pod};

pub use reef_base::{Hash, Owner, Topic};
pub use reef_collection::{
    Batch, Cursor, DocBatch, DocStore, Error, Expr, IndexKind, IngestReport, IndexSpec, KvCursor,
    KvKey, KvStore, Registry, TableDescriptor, TableKind, CSV_HEADER_KEY,
};
pub use reef_feed::{
    ChunkStore, Clock, Epoch, Feed, ManualClock, MemStore, PodKey, RetryingStore, SystemClock,
    Update,
};

/// Result alias for engine operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

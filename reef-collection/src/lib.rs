//! Ordered indexes and the tables built on them.
//!
//! An [`Index`] is an ordered `key → value` map persisted as a
//! copy-on-write manifest tree of content-addressed chunks, with its root
//! published through a feed. [`KvStore`] is a single-index table,
//! [`DocStore`] a multi-index table over JSON documents, and the
//! [`Registry`] is the per-pod catalog that declares them, all sharing the
//! same index primitive.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

mod batch;
mod cursor;
mod doc;
mod error;
mod expr;
mod index;
mod keys;
mod kv;
mod manifest;
mod registry;
#[cfg(test)]
pub(crate) mod testutil;

pub use self::batch::Batch;
pub use self::cursor::Cursor;
pub use self::doc::{DocBatch, DocStore};
pub use self::error::Error;
pub use self::expr::{Expr, Op, Term};
pub use self::index::Index;
pub use self::keys::{IndexKind, MAX_KEY_LEN};
pub use self::kv::{IngestReport, KvCursor, KvKey, KvStore, CSV_HEADER_KEY};
pub use self::manifest::{Entry, Node, Ref};
pub use self::registry::{IndexSpec, Registry, TableDescriptor, TableKind};

/// Result alias for collection operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

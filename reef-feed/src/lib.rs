//! Mutable single-writer feeds over a content-addressed chunk store.
//!
//! A feed is identified by a `(topic, owner)` pair. Updates to it are
//! immutable chunks placed at [epochs](Epoch): time intervals of
//! exponentially growing width. The placement rule and the time-addressed
//! lookup walk together guarantee that the most recent update not younger
//! than a requested timestamp can be found without any global indexing, by
//! probing a logarithmic number of candidate chunk addresses.
//!
//! Feed payloads are encrypted with a [pod key](PodKey) derived from the pod
//! password; the chunk store only ever sees ciphertext.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

mod crypto;
mod epoch;
mod error;
mod feed;
mod lookup;
mod store;

pub use self::crypto::PodKey;
pub use self::epoch::{Clock, Epoch, ManualClock, SystemClock, HIGHEST_LEVEL, LOWEST_LEVEL};
pub use self::error::Error;
pub use self::feed::{Feed, Update};
pub use self::store::{ChunkStore, MemStore, RetryingStore};

/// Result alias for feed operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

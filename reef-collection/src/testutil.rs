//! Shared fixtures for the crate's tests.

use std::sync::Arc;

use bytes::Bytes;
use reef_base::Owner;
use reef_feed::{Feed, ManualClock, MemStore, PodKey};
use tokio::sync::Mutex;

use crate::Index;

pub(crate) fn test_feed() -> Feed<MemStore> {
    let clock = Arc::new(ManualClock::new(1_000_000));
    Feed::new(Arc::new(MemStore::new()), clock)
}

pub(crate) fn test_owner() -> Owner {
    Owner::from_bytes([9; 20])
}

pub(crate) fn test_index(multi: bool) -> Index<MemStore> {
    Index::new(
        "t",
        "id",
        multi,
        test_owner(),
        PodKey::derive("pw"),
        test_feed(),
        Arc::new(Mutex::new(())),
    )
}

pub(crate) fn bytes(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

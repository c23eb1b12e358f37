//! The mutable single-writer log.

use std::{collections::HashMap, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use reef_base::{Hash, Owner, Topic};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    crypto::{PodKey, TAG_LEN},
    epoch::{Clock, Epoch},
    lookup::lookup,
    store::ChunkStore,
    Error, Result,
};

/// `FDSF`
const MAGIC: [u8; 4] = [0x46, 0x44, 0x53, 0x46];
const VERSION: u8 = 1;

/// magic + version + epoch time + level + payload length
const HEADER_LEN: usize = 4 + 1 + 8 + 1 + 4;

/// A decoded feed update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    /// The epoch the update was committed at; `time` is the exact write
    /// time, `level` the slot granularity.
    pub epoch: Epoch,
    /// Decrypted payload.
    pub payload: Bytes,
}

/// A mutable log per `(topic, owner)` pair, stored as one immutable chunk
/// per epoch slot.
///
/// The feed is the linearization point of everything built on top of it:
/// an update is either fully committed (its chunk exists at the slot
/// address) or absent. The handle keeps a tip cache per pair, used as a
/// lookup hint; it is only an optimization and can be stale or empty.
#[derive(Debug)]
pub struct Feed<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    tips: Arc<RwLock<HashMap<(Topic, Owner), Epoch>>>,
}

impl<S> Clone for Feed<S> {
    fn clone(&self) -> Self {
        Feed {
            store: self.store.clone(),
            clock: self.clock.clone(),
            tips: self.tips.clone(),
        }
    }
}

impl<S: ChunkStore> Feed<S> {
    /// Create a feed handle over `store` using `clock` for placement.
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Feed {
            store,
            clock,
            tips: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The chunk store this feed writes through.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Address of the update slot for `(topic, owner)` at `epoch`.
    pub fn update_address(topic: &Topic, owner: &Owner, epoch: &Epoch) -> Hash {
        Hash::from_parts([
            topic.as_bytes().as_slice(),
            owner.as_bytes().as_slice(),
            &epoch.base().to_le_bytes(),
            &[epoch.level],
        ])
    }

    /// Start a feed. Fails with [`Error::AlreadyExists`] if any update for
    /// the pair is discoverable.
    pub async fn create(
        &self,
        topic: &Topic,
        owner: &Owner,
        payload: Bytes,
        key: &PodKey,
        cancel: &CancellationToken,
    ) -> Result<Hash> {
        let now = self.clock.now();
        if self.lookup_update(topic, owner, now, key, cancel).await?.is_some() {
            return Err(Error::AlreadyExists);
        }
        let epoch = Epoch::first(now);
        self.commit(topic, owner, epoch, payload, key, cancel).await
    }

    /// Append an update. Fails with [`Error::NotFound`] if the feed has
    /// never been created.
    pub async fn update(
        &self,
        topic: &Topic,
        owner: &Owner,
        payload: Bytes,
        key: &PodKey,
        cancel: &CancellationToken,
    ) -> Result<Hash> {
        let now = self.clock.now();
        let (last, _) = self
            .lookup_update(topic, owner, now, key, cancel)
            .await?
            .ok_or(Error::NotFound)?;

        let epoch = last.next(now);
        match self
            .commit(topic, owner, epoch, payload.clone(), key, cancel)
            .await
        {
            Err(Error::Conflict) => {
                // someone placed an update in this slot since the lookup;
                // recompute the placement once and retry
                let epoch = epoch.next(now);
                self.commit(topic, owner, epoch, payload, key, cancel).await
            }
            res => res,
        }
    }

    /// The update with the highest recorded time at or before the clock's
    /// `now`, or [`Error::NotFound`].
    pub async fn get(
        &self,
        topic: &Topic,
        owner: &Owner,
        key: &PodKey,
        cancel: &CancellationToken,
    ) -> Result<Update> {
        let now = self.clock.now();
        let found = self
            .lookup_update(topic, owner, now, key, cancel)
            .await?
            .ok_or(Error::NotFound)?;
        let (slot, update) = found;
        self.tips.write().insert((*topic, *owner), slot);
        Ok(update)
    }

    async fn lookup_update(
        &self,
        topic: &Topic,
        owner: &Owner,
        now: u64,
        key: &PodKey,
        cancel: &CancellationToken,
    ) -> Result<Option<(Epoch, Update)>> {
        let hint = self.tips.read().get(&(*topic, *owner)).copied();
        let found = lookup(now, hint, cancel, |epoch| {
            let addr = Self::update_address(topic, owner, &epoch);
            let store = self.store.clone();
            let key = key.clone();
            async move {
                match store.get(&addr).await {
                    Ok(chunk) => {
                        let update = decode_update(&chunk, &addr, &key)?;
                        Ok(Some((update.epoch.time, update)))
                    }
                    Err(Error::NotFound) => Ok(None),
                    Err(err) => Err(err),
                }
            }
        })
        .await?;
        Ok(found.map(|(slot, _, update)| (slot, update)))
    }

    async fn commit(
        &self,
        topic: &Topic,
        owner: &Owner,
        epoch: Epoch,
        payload: Bytes,
        key: &PodKey,
        cancel: &CancellationToken,
    ) -> Result<Hash> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let addr = Self::update_address(topic, owner, &epoch);
        let chunk = encode_update(&epoch, &payload, &addr, key);
        self.store.put_at(addr, chunk).await?;
        self.tips.write().insert((*topic, *owner), epoch);
        debug!(%addr, epoch = %epoch, len = payload.len(), "feed update committed");
        Ok(addr)
    }
}

/// Serialize and encrypt an update for the slot at `addr`.
///
/// Layout: `magic:4 | version:1 | epoch_time:8 le | epoch_level:1 |
/// payload_len:4 le | ciphertext | tag:32`. The tag authenticates the
/// header and the ciphertext.
fn encode_update(epoch: &Epoch, payload: &Bytes, addr: &Hash, key: &PodKey) -> Bytes {
    let mut ciphertext = payload.to_vec();
    let nonce = payload_nonce(addr);
    key.apply_keystream(&nonce, &mut ciphertext);

    let mut buf = BytesMut::with_capacity(HEADER_LEN + ciphertext.len() + TAG_LEN);
    buf.put_slice(&MAGIC);
    buf.put_u8(VERSION);
    buf.put_u64_le(epoch.time);
    buf.put_u8(epoch.level);
    buf.put_u32_le(ciphertext.len() as u32);
    buf.put_slice(&ciphertext);
    let tag = key.tag(&buf);
    buf.put_slice(&tag);
    buf.freeze()
}

/// Decode, authenticate and decrypt the update chunk stored at `addr`.
fn decode_update(chunk: &[u8], addr: &Hash, key: &PodKey) -> Result<Update> {
    if chunk.len() < HEADER_LEN + TAG_LEN {
        return Err(Error::Corrupt("feed update too short"));
    }
    if chunk[..4] != MAGIC {
        return Err(Error::Corrupt("bad feed magic"));
    }
    if chunk[4] != VERSION {
        return Err(Error::Corrupt("unsupported feed version"));
    }
    let time = u64::from_le_bytes(chunk[5..13].try_into().expect("sliced 8 bytes"));
    let level = chunk[13];
    if level > crate::epoch::HIGHEST_LEVEL {
        return Err(Error::Corrupt("epoch level out of range"));
    }
    let payload_len =
        u32::from_le_bytes(chunk[14..18].try_into().expect("sliced 4 bytes")) as usize;
    if chunk.len() != HEADER_LEN + payload_len + TAG_LEN {
        return Err(Error::Corrupt("feed update length mismatch"));
    }
    let (body, tag) = chunk.split_at(HEADER_LEN + payload_len);
    if !key.verify_tag(body, tag) {
        return Err(Error::Corrupt("feed update authentication failed"));
    }
    let mut payload = body[HEADER_LEN..].to_vec();
    key.apply_keystream(&payload_nonce(addr), &mut payload);
    Ok(Update {
        epoch: Epoch::new(time, level),
        payload: payload.into(),
    })
}

/// CTR nonce: the first 16 bytes of the slot address.
fn payload_nonce(addr: &Hash) -> [u8; 16] {
    addr.as_bytes()[..16].try_into().expect("sliced 16 bytes")
}

#[cfg(test)]
mod tests {
    use crate::{epoch::ManualClock, store::MemStore};

    use super::*;

    fn fixture() -> (Feed<MemStore>, Arc<ManualClock>, Topic, Owner, PodKey) {
        let clock = Arc::new(ManualClock::new(1000));
        let feed = Feed::new(Arc::new(MemStore::new()), clock.clone());
        let topic = Topic::new("test:feed");
        let owner = Owner::from_bytes([1; 20]);
        let key = PodKey::derive("secret");
        (feed, clock, topic, owner, key)
    }

    #[tokio::test]
    async fn test_encode_decode_roundtrip() {
        let key = PodKey::derive("pw");
        let addr = Hash::new(b"slot");
        let epoch = Epoch::new(1234, 7);
        let chunk = encode_update(&epoch, &Bytes::from_static(b"hello"), &addr, &key);
        let update = decode_update(&chunk, &addr, &key).unwrap();
        assert_eq!(update.epoch, epoch);
        assert_eq!(&update.payload[..], b"hello");
    }

    #[tokio::test]
    async fn test_decode_rejects_tampering() {
        let key = PodKey::derive("pw");
        let addr = Hash::new(b"slot");
        let chunk = encode_update(&Epoch::new(1, 0), &Bytes::from_static(b"hello"), &addr, &key);

        let mut bad = chunk.to_vec();
        let last = bad.len() - TAG_LEN - 1;
        bad[last] ^= 1;
        assert!(matches!(
            decode_update(&bad, &addr, &key),
            Err(Error::Corrupt(_))
        ));

        // wrong pod key fails authentication
        assert!(matches!(
            decode_update(&chunk, &addr, &PodKey::derive("other")),
            Err(Error::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_create_get_update() -> anyhow::Result<()> {
        let (feed, clock, topic, owner, key) = fixture();
        let cancel = CancellationToken::new();

        feed.create(&topic, &owner, Bytes::from_static(b"v1"), &key, &cancel)
            .await?;
        let update = feed.get(&topic, &owner, &key, &cancel).await?;
        assert_eq!(&update.payload[..], b"v1");
        assert_eq!(update.epoch.time, 1000);

        clock.set(1010);
        feed.update(&topic, &owner, Bytes::from_static(b"v2"), &key, &cancel)
            .await?;
        let update = feed.get(&topic, &owner, &key, &cancel).await?;
        assert_eq!(&update.payload[..], b"v2");
        assert_eq!(update.epoch.time, 1010);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_twice_fails() -> anyhow::Result<()> {
        let (feed, _clock, topic, owner, key) = fixture();
        let cancel = CancellationToken::new();

        feed.create(&topic, &owner, Bytes::from_static(b"v1"), &key, &cancel)
            .await?;
        let err = feed
            .create(&topic, &owner, Bytes::from_static(b"v2"), &key, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists));
        Ok(())
    }

    #[tokio::test]
    async fn test_update_without_create_fails() {
        let (feed, _clock, topic, owner, key) = fixture();
        let cancel = CancellationToken::new();
        let err = feed
            .update(&topic, &owner, Bytes::from_static(b"v"), &key, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_lookup_across_epochs_via_feed() -> anyhow::Result<()> {
        let (feed, clock, topic, owner, key) = fixture();
        let cancel = CancellationToken::new();

        for (i, t) in [1000u64, 1010, 1100, 2000].into_iter().enumerate() {
            clock.set(t);
            let payload = Bytes::from(format!("p{i}"));
            if i == 0 {
                feed.create(&topic, &owner, payload, &key, &cancel).await?;
            } else {
                feed.update(&topic, &owner, payload, &key, &cancel).await?;
            }
        }

        // drop the tip cache so the walk starts cold
        let cold = Feed::new(feed.store().clone(), clock.clone());

        clock.set(1050);
        let update = cold.get(&topic, &owner, &key, &cancel).await?;
        assert_eq!(&update.payload[..], b"p1");
        assert_eq!(update.epoch.time, 1010);

        clock.set(999);
        let err = cold.get(&topic, &owner, &key, &cancel).await.unwrap_err();
        assert!(err.is_not_found());

        clock.set(2000);
        let update = cold.get(&topic, &owner, &key, &cancel).await?;
        assert_eq!(update.epoch.time, 2000);
        Ok(())
    }

    #[tokio::test]
    async fn test_same_second_writes_conflict_then_place() -> anyhow::Result<()> {
        let (feed, _clock, topic, owner, key) = fixture();
        let cancel = CancellationToken::new();

        feed.create(&topic, &owner, Bytes::from_static(b"v1"), &key, &cancel)
            .await?;
        // same second: placement drops one level and the write still lands
        feed.update(&topic, &owner, Bytes::from_static(b"v2"), &key, &cancel)
            .await?;
        feed.update(&topic, &owner, Bytes::from_static(b"v3"), &key, &cancel)
            .await?;
        let update = feed.get(&topic, &owner, &key, &cancel).await?;
        assert_eq!(&update.payload[..], b"v3");
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_write_leaves_tip_unchanged() -> anyhow::Result<()> {
        let (feed, clock, topic, owner, key) = fixture();
        let cancel = CancellationToken::new();

        feed.create(&topic, &owner, Bytes::from_static(b"v1"), &key, &cancel)
            .await?;

        clock.set(1010);
        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = feed
            .update(&topic, &owner, Bytes::from_static(b"v2"), &key, &cancelled)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        let update = feed.get(&topic, &owner, &key, &cancel).await?;
        assert_eq!(&update.payload[..], b"v1");
        Ok(())
    }
}

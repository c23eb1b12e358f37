//! The ordered index: a copy-on-write radix tree of manifest nodes.
//!
//! The root node's hash is the tip payload of the index's feed topic, which
//! makes the feed update the single linearization point of every mutation:
//! readers capture a root and see a consistent snapshot, writers produce
//! new nodes bottom-up and only then publish the new root. Partially
//! written trees are unreachable orphans, never corruption.

use std::sync::Arc;

use bytes::Bytes;
use reef_base::{Hash, Owner, Topic};
use reef_feed::{ChunkStore, Feed, PodKey};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    cursor::Cursor,
    keys::validate_key,
    manifest::{decode_value_list, encode_value_list, Entry, Node, Ref, INLINE_VALUE_LEN},
    Error, Result,
};

/// How a mutation treats an existing value under the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    /// Overwrite; non-multi semantics.
    Replace,
    /// Append to the key's value list; multi semantics.
    Append,
}

/// Where a key lands inside one node.
pub(crate) enum Slot {
    /// Entry `idx` is a leaf for exactly this key.
    Exact(usize),
    /// Entry `idx` is a child covering this key.
    Descend(usize),
    /// Entry `idx` shares the first `common` suffix bytes with the key and
    /// has to be split to make room.
    Split(usize, usize),
    /// No entry relates to the key; insert at `idx` to keep order.
    Missing(usize),
}

/// Length of the longest common prefix of two byte strings.
pub(crate) fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Find the slot for `rem` (the key with the node prefix stripped).
///
/// Sibling suffixes never share a first byte, so at most one entry can
/// relate to the key.
pub(crate) fn locate(node: &Node, rem: &[u8]) -> Slot {
    for (idx, entry) in node.entries.iter().enumerate() {
        if entry.leaf {
            if entry.suffix == rem {
                return Slot::Exact(idx);
            }
        } else if !entry.suffix.is_empty() && rem.starts_with(&entry.suffix) {
            return Slot::Descend(idx);
        }
        let common = common_prefix_len(&entry.suffix, rem);
        if common > 0 && (entry.leaf || common < entry.suffix.len()) {
            return Slot::Split(idx, common);
        }
    }
    Slot::Missing(
        node.entries
            .partition_point(|entry| entry.suffix.as_slice() < rem),
    )
}

/// An ordered `key → value` map persisted over one feed topic.
///
/// Readers are lock-free; writers serialize on the index's writer lock,
/// handed out by the registry so every handle to the same index shares it.
#[derive(Debug)]
pub struct Index<S> {
    table: String,
    column: String,
    topic: Topic,
    owner: Owner,
    multi: bool,
    pod_key: PodKey,
    feed: Feed<S>,
    write_lock: Arc<Mutex<()>>,
}

impl<S> Clone for Index<S> {
    fn clone(&self) -> Self {
        Index {
            table: self.table.clone(),
            column: self.column.clone(),
            topic: self.topic,
            owner: self.owner,
            multi: self.multi,
            pod_key: self.pod_key.clone(),
            feed: self.feed.clone(),
            write_lock: self.write_lock.clone(),
        }
    }
}

impl<S: ChunkStore> Index<S> {
    /// Open a handle on the index of `column` in `table`.
    pub fn new(
        table: &str,
        column: &str,
        multi: bool,
        owner: Owner,
        pod_key: PodKey,
        feed: Feed<S>,
        write_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self::with_topic(
            Topic::index(table, column),
            table,
            column,
            multi,
            owner,
            pod_key,
            feed,
            write_lock,
        )
    }

    /// Open a handle on an index living under an explicit feed topic; the
    /// table and column names only label traces.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn with_topic(
        topic: Topic,
        table: &str,
        column: &str,
        multi: bool,
        owner: Owner,
        pod_key: PodKey,
        feed: Feed<S>,
        write_lock: Arc<Mutex<()>>,
    ) -> Self {
        Index {
            table: table.to_string(),
            column: column.to_string(),
            topic,
            owner,
            multi,
            pod_key,
            feed,
            write_lock,
        }
    }

    /// Whether the index keeps a value list per key.
    pub fn is_multi(&self) -> bool {
        self.multi
    }

    pub(crate) fn store(&self) -> &Arc<S> {
        self.feed.store()
    }

    pub(crate) fn write_lock(&self) -> &Arc<Mutex<()>> {
        &self.write_lock
    }

    /// Load one manifest node. A missing chunk below a committed root
    /// violates the snapshot invariant and is reported as corruption.
    pub(crate) async fn load_node(&self, hash: &Hash) -> Result<Node> {
        let chunk = self.store().get(hash).await.map_err(|err| match err {
            reef_feed::Error::NotFound => Error::Corrupt("dangling manifest reference"),
            other => Error::Feed(other),
        })?;
        Node::decode(&chunk)
    }

    /// The current root, or `None` for an index that has never been
    /// written to.
    pub(crate) async fn load_root(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<(Hash, Node)>> {
        match self
            .feed
            .get(&self.topic, &self.owner, &self.pod_key, cancel)
            .await
        {
            Ok(update) => {
                let bytes: [u8; 32] = update
                    .payload
                    .as_ref()
                    .try_into()
                    .map_err(|_| Error::Corrupt("index root payload is not a hash"))?;
                let hash = Hash::from_bytes(bytes);
                let node = self.load_node(&hash).await?;
                Ok(Some((hash, node)))
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Publish `root` as the new tip of the index feed. This is the only
    /// point at which a mutation becomes visible.
    pub(crate) async fn publish_root(
        &self,
        root: Hash,
        existed: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let payload = Bytes::copy_from_slice(root.as_bytes());
        if existed {
            self.feed
                .update(&self.topic, &self.owner, payload, &self.pod_key, cancel)
                .await?;
        } else {
            self.feed
                .create(&self.topic, &self.owner, payload, &self.pod_key, cancel)
                .await?;
        }
        debug!(table = %self.table, column = %self.column, %root, "index root committed");
        Ok(())
    }

    /// Store `value` inline or as its own chunk.
    pub(crate) async fn make_value_ref(&self, value: &Bytes) -> Result<Ref> {
        if value.len() <= INLINE_VALUE_LEN {
            Ok(Ref::Inline(value.to_vec()))
        } else {
            Ok(Ref::Chunk(self.store().put(value.clone()).await?))
        }
    }

    /// Fetch the raw stored bytes behind a leaf target.
    pub(crate) async fn resolve_value(&self, target: &Ref) -> Result<Bytes> {
        match target {
            Ref::Inline(value) => Ok(Bytes::copy_from_slice(value)),
            Ref::Chunk(hash) => self.store().get(hash).await.map_err(|err| match err {
                reef_feed::Error::NotFound => Error::Corrupt("dangling value reference"),
                other => Error::Feed(other),
            }),
            Ref::Null => Ok(Bytes::new()),
        }
    }

    /// The stored bytes for a fresh key: the value itself, or a singleton
    /// value list on multi indexes.
    fn initial_stored(&self, value: &Bytes) -> Result<Bytes> {
        if self.multi {
            encode_value_list(std::slice::from_ref(value))
        } else {
            Ok(value.clone())
        }
    }

    /// Insert or overwrite `key`. Returns the previous value, if any.
    pub async fn put(
        &self,
        key: &[u8],
        value: Bytes,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>> {
        self.write(key, value, WriteMode::Replace, cancel).await
    }

    /// Append `value` to the key's value list. Multi indexes only.
    pub(crate) async fn append(
        &self,
        key: &[u8],
        value: Bytes,
        cancel: &CancellationToken,
    ) -> Result<()> {
        debug_assert!(self.multi);
        self.write(key, value, WriteMode::Append, cancel).await?;
        Ok(())
    }

    async fn write(
        &self,
        key: &[u8],
        value: Bytes,
        mode: WriteMode,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>> {
        validate_key(key)?;
        let _guard = self.write_lock.lock().await;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let Some((root_hash, root_node)) = self.load_root(cancel).await? else {
            // first write: a single-leaf tree
            let stored = self.initial_stored(&value)?;
            let target = self.make_value_ref(&stored).await?;
            let node = Node {
                prefix: key.to_vec(),
                entries: vec![Entry::leaf(Vec::new(), target)],
            };
            let root = self.store().put(node.encode()?).await?;
            self.publish_root(root, false, cancel).await?;
            return Ok(None);
        };

        if !key.starts_with(&root_node.prefix) {
            // the key diverges from the root prefix; only the root can
            // need this because child prefixes are checked on descent
            let common = common_prefix_len(key, &root_node.prefix);
            let stored = self.initial_stored(&value)?;
            let target = self.make_value_ref(&stored).await?;
            let mut entries = vec![
                Entry::child(root_node.prefix[common..].to_vec(), root_hash),
                Entry::leaf(key[common..].to_vec(), target),
            ];
            entries.sort_by(|a, b| a.suffix.cmp(&b.suffix));
            let node = Node {
                prefix: key[..common].to_vec(),
                entries,
            };
            let root = self.store().put(node.encode()?).await?;
            self.publish_root(root, true, cancel).await?;
            return Ok(None);
        }

        let mut path: Vec<(Node, usize)> = Vec::new();
        let mut node = root_node;
        let prev = loop {
            let rem = key[node.prefix.len()..].to_vec();
            match locate(&node, &rem) {
                Slot::Exact(idx) => {
                    let raw = self.resolve_value(&node.entries[idx].target).await?;
                    let (stored, prev) = match (self.multi, mode) {
                        (true, WriteMode::Append) => {
                            let mut list = decode_value_list(&raw)?;
                            list.push(value.clone());
                            (encode_value_list(&list)?, None)
                        }
                        (true, WriteMode::Replace) => {
                            (encode_value_list(std::slice::from_ref(&value))?, None)
                        }
                        (false, _) => (value.clone(), Some(raw)),
                    };
                    node.entries[idx].target = self.make_value_ref(&stored).await?;
                    break prev;
                }
                Slot::Descend(idx) => {
                    let hash = node.entries[idx].child_hash()?;
                    let child = self.load_node(&hash).await?;
                    path.push((node, idx));
                    node = child;
                }
                Slot::Split(idx, common) => {
                    let mut old = node.entries[idx].clone();
                    old.suffix = old.suffix[common..].to_vec();
                    let stored = self.initial_stored(&value)?;
                    let target = self.make_value_ref(&stored).await?;
                    let mut entries = vec![old, Entry::leaf(rem[common..].to_vec(), target)];
                    entries.sort_by(|a, b| a.suffix.cmp(&b.suffix));
                    let inter = Node {
                        prefix: [node.prefix.as_slice(), &rem[..common]].concat(),
                        entries,
                    };
                    let hash = self.store().put(inter.encode()?).await?;
                    node.entries[idx] = Entry::child(rem[..common].to_vec(), hash);
                    break None;
                }
                Slot::Missing(pos) => {
                    let stored = self.initial_stored(&value)?;
                    let target = self.make_value_ref(&stored).await?;
                    node.entries.insert(pos, Entry::leaf(rem, target));
                    break None;
                }
            }
        };

        let root = self.rebuild(node, path).await?;
        self.publish_root(root, true, cancel).await?;
        Ok(prev)
    }

    /// Write the mutated node and its path back, bottom-up.
    async fn rebuild(&self, node: Node, mut path: Vec<(Node, usize)>) -> Result<Hash> {
        let mut hash = self.store().put(node.encode()?).await?;
        while let Some((mut parent, idx)) = path.pop() {
            parent.entries[idx].target = Ref::Chunk(hash);
            hash = self.store().put(parent.encode()?).await?;
        }
        Ok(hash)
    }

    /// Look up a key. The raw stored bytes are returned: on a multi index
    /// that is the encoded value list.
    pub async fn get(&self, key: &[u8], cancel: &CancellationToken) -> Result<Bytes> {
        validate_key(key)?;
        let Some((_, mut node)) = self.load_root(cancel).await? else {
            return Err(Error::NotFound);
        };
        if !key.starts_with(&node.prefix) {
            return Err(Error::NotFound);
        }
        loop {
            let rem = &key[node.prefix.len()..];
            match locate(&node, rem) {
                Slot::Exact(idx) => return self.resolve_value(&node.entries[idx].target).await,
                Slot::Descend(idx) => {
                    let hash = node.entries[idx].child_hash()?;
                    node = self.load_node(&hash).await?;
                }
                _ => return Err(Error::NotFound),
            }
        }
    }

    /// Look up the value list of a key on a multi index.
    pub(crate) async fn get_values(
        &self,
        key: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Vec<Bytes>> {
        debug_assert!(self.multi);
        let raw = self.get(key, cancel).await?;
        decode_value_list(&raw)
    }

    /// Remove a key. Returns the removed raw value, or [`Error::NotFound`].
    pub async fn del(&self, key: &[u8], cancel: &CancellationToken) -> Result<Bytes> {
        validate_key(key)?;
        let _guard = self.write_lock.lock().await;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let (node, path, prev) = self.take_leaf(key, cancel, None).await?;
        let (node, path) = prune(node, path);
        let root = self.rebuild(node, path).await?;
        self.publish_root(root, true, cancel).await?;
        Ok(prev)
    }

    /// Remove one `value` from a key. On a multi index the value is taken
    /// out of the list; the key disappears with its last value. On other
    /// indexes the whole key is removed. A missing key or value is ignored.
    pub(crate) async fn remove_value(
        &self,
        key: &[u8],
        value: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        validate_key(key)?;
        let _guard = self.write_lock.lock().await;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let taken = if self.multi {
            self.take_leaf(key, cancel, Some(value)).await
        } else {
            self.take_leaf(key, cancel, None).await
        };
        match taken {
            Ok((node, path, _)) => {
                let (node, path) = prune(node, path);
                let root = self.rebuild(node, path).await?;
                self.publish_root(root, true, cancel).await?;
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Walk to the leaf for `key` and remove it, or remove `only_value`
    /// from its value list. Returns the mutated node, the path above it
    /// and the removed raw value.
    async fn take_leaf(
        &self,
        key: &[u8],
        cancel: &CancellationToken,
        only_value: Option<&[u8]>,
    ) -> Result<(Node, Vec<(Node, usize)>, Bytes)> {
        let Some((_, root_node)) = self.load_root(cancel).await? else {
            return Err(Error::NotFound);
        };
        if !key.starts_with(&root_node.prefix) {
            return Err(Error::NotFound);
        }
        let mut path = Vec::new();
        let mut node = root_node;
        loop {
            let rem = key[node.prefix.len()..].to_vec();
            match locate(&node, &rem) {
                Slot::Exact(idx) => {
                    let raw = self.resolve_value(&node.entries[idx].target).await?;
                    match only_value {
                        Some(value) => {
                            let mut list = decode_value_list(&raw)?;
                            let Some(pos) = list.iter().position(|v| v == value) else {
                                return Err(Error::NotFound);
                            };
                            list.remove(pos);
                            if list.is_empty() {
                                node.entries.remove(idx);
                            } else {
                                let stored = encode_value_list(&list)?;
                                node.entries[idx].target = self.make_value_ref(&stored).await?;
                            }
                        }
                        None => {
                            node.entries.remove(idx);
                        }
                    }
                    return Ok((node, path, raw));
                }
                Slot::Descend(idx) => {
                    let hash = node.entries[idx].child_hash()?;
                    let child = self.load_node(&hash).await?;
                    path.push((node, idx));
                    node = child;
                }
                _ => return Err(Error::NotFound),
            }
        }
    }

    /// Cursor over `[start, end]` (end inclusive), yielding at most
    /// `limit` entries.
    pub async fn seek(
        &self,
        start: &[u8],
        end: Option<&[u8]>,
        limit: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Cursor<S>> {
        if let Some(end) = end {
            if start > end {
                return Err(Error::InvalidRange);
            }
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(Cursor::new(
            self.clone(),
            start.to_vec(),
            end.map(|e| (e.to_vec(), true)),
            limit,
        ))
    }

    /// Cursor with explicit bounds; range scans from expressions.
    pub(crate) fn scan(
        &self,
        start: Vec<u8>,
        end: Option<(Vec<u8>, bool)>,
        limit: Option<u64>,
    ) -> Cursor<S> {
        Cursor::new(self.clone(), start, end, limit)
    }

    /// Cursor with an exclusive lower bound.
    pub(crate) fn scan_after(
        &self,
        start_exclusive: &[u8],
        end: Option<(Vec<u8>, bool)>,
        limit: Option<u64>,
    ) -> Cursor<S> {
        // the first key past `start` in byte order is `start ++ 0x00`
        let mut start = start_exclusive.to_vec();
        start.push(0);
        self.scan(start, end, limit)
    }

    /// Number of stored values: list elements count individually on a
    /// multi index.
    pub async fn count(&self, cancel: &CancellationToken) -> Result<u64> {
        let mut cursor = self.seek(&[], None, None, cancel).await?;
        let mut n = 0u64;
        while let Some((_, raw)) = cursor.next(cancel).await? {
            n += if self.multi {
                decode_value_list(&raw)?.len() as u64
            } else {
                1
            };
        }
        Ok(n)
    }
}

/// Drop now-empty nodes bottom-up; an empty root is kept as the tree's
/// anchor.
fn prune(mut node: Node, mut path: Vec<(Node, usize)>) -> (Node, Vec<(Node, usize)>) {
    while node.entries.is_empty() {
        match path.pop() {
            Some((mut parent, idx)) => {
                parent.entries.remove(idx);
                node = parent;
            }
            None => break,
        }
    }
    (node, path)
}

#[cfg(test)]
mod tests {
    use crate::testutil::{bytes, test_index};

    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() -> anyhow::Result<()> {
        let index = test_index(false);
        let cancel = CancellationToken::new();

        assert!(index.put(b"alpha", bytes("1"), &cancel).await?.is_none());
        assert_eq!(&index.get(b"alpha", &cancel).await?[..], b"1");

        // overwrite returns the previous value
        let prev = index.put(b"alpha", bytes("2"), &cancel).await?;
        assert_eq!(&prev.unwrap()[..], b"1");
        assert_eq!(&index.get(b"alpha", &cancel).await?[..], b"2");
        Ok(())
    }

    #[tokio::test]
    async fn test_get_missing() {
        let index = test_index(false);
        let cancel = CancellationToken::new();
        assert!(index.get(b"nope", &cancel).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let index = test_index(false);
        let cancel = CancellationToken::new();
        let err = index.put(b"", bytes("v"), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
        let err = index.get(b"", &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[tokio::test]
    async fn test_prefix_splits() -> anyhow::Result<()> {
        let index = test_index(false);
        let cancel = CancellationToken::new();

        // exercise every split shape: divergence, extension, shortening
        let keys = ["a", "ab", "abc", "abd", "b", "ba", "c"];
        for (i, key) in keys.iter().enumerate() {
            index
                .put(key.as_bytes(), bytes(&i.to_string()), &cancel)
                .await?;
        }
        for (i, key) in keys.iter().enumerate() {
            let got = index.get(key.as_bytes(), &cancel).await?;
            assert_eq!(&got[..], i.to_string().as_bytes(), "key {key}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_large_values_are_chunked() -> anyhow::Result<()> {
        let index = test_index(false);
        let cancel = CancellationToken::new();
        let big = Bytes::from(vec![7u8; 1000]);
        index.put(b"big", big.clone(), &cancel).await?;
        index.put(b"small", bytes("x"), &cancel).await?;
        assert_eq!(index.get(b"big", &cancel).await?, big);
        Ok(())
    }

    #[tokio::test]
    async fn test_del_returns_previous() -> anyhow::Result<()> {
        let index = test_index(false);
        let cancel = CancellationToken::new();

        index.put(b"alpha", bytes("1"), &cancel).await?;
        index.put(b"bravo", bytes("2"), &cancel).await?;
        let prev = index.del(b"bravo", &cancel).await?;
        assert_eq!(&prev[..], b"2");
        assert!(index.get(b"bravo", &cancel).await.unwrap_err().is_not_found());
        assert!(index.del(b"bravo", &cancel).await.unwrap_err().is_not_found());
        // the sibling is untouched
        assert_eq!(&index.get(b"alpha", &cancel).await?[..], b"1");
        Ok(())
    }

    #[tokio::test]
    async fn test_del_last_key_leaves_empty_index() -> anyhow::Result<()> {
        let index = test_index(false);
        let cancel = CancellationToken::new();
        index.put(b"only", bytes("1"), &cancel).await?;
        index.del(b"only", &cancel).await?;
        assert!(index.get(b"only", &cancel).await.unwrap_err().is_not_found());
        assert_eq!(index.count(&cancel).await?, 0);
        // and the index accepts new writes
        index.put(b"only", bytes("2"), &cancel).await?;
        assert_eq!(&index.get(b"only", &cancel).await?[..], b"2");
        Ok(())
    }

    #[tokio::test]
    async fn test_multi_appends_preserve_order() -> anyhow::Result<()> {
        let index = test_index(true);
        let cancel = CancellationToken::new();

        index.append(b"b", bytes("u1"), &cancel).await?;
        index.append(b"b", bytes("u2"), &cancel).await?;
        index.append(b"b", bytes("u1"), &cancel).await?;
        let values = index.get_values(b"b", &cancel).await?;
        assert_eq!(values, vec![bytes("u1"), bytes("u2"), bytes("u1")]);
        assert_eq!(index.count(&cancel).await?, 3);

        // removing one value keeps the rest in order
        index.remove_value(b"b", b"u1", &cancel).await?;
        let values = index.get_values(b"b", &cancel).await?;
        assert_eq!(values, vec![bytes("u2"), bytes("u1")]);

        // the key disappears with its last value
        index.remove_value(b"b", b"u2", &cancel).await?;
        index.remove_value(b"b", b"u1", &cancel).await?;
        assert!(index.get(b"b", &cancel).await.unwrap_err().is_not_found());
        // removing from a gone key is not an error
        index.remove_value(b"b", b"u1", &cancel).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_replay_is_deterministic() -> anyhow::Result<()> {
        let cancel = CancellationToken::new();
        let mut roots = Vec::new();
        for _ in 0..2 {
            let index = test_index(false);
            index.put(b"alpha", bytes("1"), &cancel).await?;
            index.put(b"bravo", bytes("2"), &cancel).await?;
            index.put(b"alps", bytes("3"), &cancel).await?;
            index.del(b"bravo", &cancel).await?;
            let (root, _) = index.load_root(&cancel).await?.unwrap();
            roots.push(root);
        }
        assert_eq!(roots[0], roots[1]);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_write_keeps_old_root() -> anyhow::Result<()> {
        let index = test_index(false);
        let cancel = CancellationToken::new();
        index.put(b"alpha", bytes("1"), &cancel).await?;
        let (before, _) = index.load_root(&cancel).await?.unwrap();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = index.put(b"beta", bytes("2"), &cancelled).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        let (after, _) = index.load_root(&cancel).await?.unwrap();
        assert_eq!(before, after);
        assert!(index.get(b"beta", &cancel).await.unwrap_err().is_not_found());
        Ok(())
    }
}

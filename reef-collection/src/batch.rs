//! Staged index mutations that commit as one feed update.

use std::collections::BTreeMap;

use bytes::Bytes;
use reef_base::Hash;
use reef_feed::ChunkStore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    index::{common_prefix_len, Index},
    keys::validate_key,
    manifest::{decode_value_list, encode_value_list, Entry, Node, Ref, INLINE_VALUE_LEN},
    Error, Result,
};

/// Default bound on memory held by staged values before they spill.
pub(crate) const DEFAULT_MEMORY_LIMIT: usize = 4 * 1024 * 1024;

/// One staged operation against a key.
#[derive(Debug)]
enum Staged {
    Del,
    /// Overwrite the stored value; non-multi.
    Replace(Value),
    /// Extend the key's value list; multi.
    Append(Vec<Value>),
    /// Drop the stored list, then append; multi `del` followed by `put`.
    Reset(Vec<Value>),
}

/// A staged value, either buffered or already spilled to the chunk store.
#[derive(Debug)]
enum Value {
    Raw(Bytes),
    Spilled(Hash),
}

/// An accumulator of `put`/`del` operations against one index.
///
/// Nothing staged is visible to readers until [`write`](Batch::write),
/// which merges the staged operations with the persisted tree, emits the
/// new manifest nodes in one pass and publishes a single feed update.
/// When the buffered values outgrow the memory bound, further large values
/// are spilled to the chunk store eagerly and only their hashes kept.
#[derive(Debug)]
pub struct Batch<S> {
    index: Index<S>,
    staged: BTreeMap<Vec<u8>, Staged>,
    buffered: usize,
    memory_limit: usize,
}

impl<S: ChunkStore> Batch<S> {
    /// Start a batch against `index` with the default memory bound.
    pub fn new(index: Index<S>) -> Self {
        Self::with_memory_limit(index, DEFAULT_MEMORY_LIMIT)
    }

    /// Start a batch with an explicit memory bound in bytes.
    pub fn with_memory_limit(index: Index<S>, memory_limit: usize) -> Self {
        Batch {
            index,
            staged: BTreeMap::new(),
            buffered: 0,
            memory_limit,
        }
    }

    /// Number of staged operations.
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    /// Whether the batch has nothing staged.
    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Stage an insert or overwrite.
    pub async fn put(&mut self, key: &[u8], value: Bytes) -> Result<()> {
        use std::collections::btree_map::Entry as MapEntry;

        validate_key(key)?;
        let value = self.admit(value).await?;
        if !self.index.is_multi() {
            self.staged.insert(key.to_vec(), Staged::Replace(value));
            return Ok(());
        }
        match self.staged.entry(key.to_vec()) {
            MapEntry::Vacant(slot) => {
                slot.insert(Staged::Append(vec![value]));
            }
            MapEntry::Occupied(mut slot) => match slot.get_mut() {
                Staged::Append(values) | Staged::Reset(values) => values.push(value),
                other => *other = Staged::Reset(vec![value]),
            },
        }
        Ok(())
    }

    /// Stage a removal.
    pub fn del(&mut self, key: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.staged.insert(key.to_vec(), Staged::Del);
        Ok(())
    }

    /// Buffer `value`, spilling it to the chunk store when the batch is
    /// over its memory bound and the value would become a chunk anyway.
    async fn admit(&mut self, value: Bytes) -> Result<Value> {
        if self.buffered + value.len() > self.memory_limit && value.len() > INLINE_VALUE_LEN {
            let hash = self.index.store().put(value).await?;
            return Ok(Value::Spilled(hash));
        }
        self.buffered += value.len();
        Ok(Value::Raw(value))
    }

    /// Merge, rebuild and commit. Exactly one feed update is emitted; on
    /// cancellation before the commit the index is untouched.
    pub async fn write(self, cancel: &CancellationToken) -> Result<()> {
        let Batch { index, staged, .. } = self;
        if staged.is_empty() {
            return Ok(());
        }
        let lock = index.write_lock().clone();
        let _guard = lock.lock().await;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // snapshot the persisted entries
        let existed = index.load_root(cancel).await?.is_some();
        let mut merged: BTreeMap<Vec<u8>, Bytes> = BTreeMap::new();
        if existed {
            let mut cursor = index.seek(&[], None, None, cancel).await?;
            while let Some((key, raw)) = cursor.next(cancel).await? {
                merged.insert(key, raw);
            }
        }

        // apply the staged operations
        for (key, op) in staged {
            match op {
                Staged::Del => {
                    merged.remove(&key);
                }
                Staged::Replace(value) => {
                    let value = resolve(&index, value).await?;
                    merged.insert(key, value);
                }
                Staged::Append(values) => {
                    let mut list = match merged.get(&key) {
                        Some(raw) => decode_value_list(raw)?,
                        None => Vec::new(),
                    };
                    for value in values {
                        list.push(resolve(&index, value).await?);
                    }
                    merged.insert(key, encode_value_list(&list)?);
                }
                Staged::Reset(values) => {
                    let mut list = Vec::with_capacity(values.len());
                    for value in values {
                        list.push(resolve(&index, value).await?);
                    }
                    merged.insert(key, encode_value_list(&list)?);
                }
            }
        }

        // rebuild the tree in one pass and emit nodes in post-order
        let items: Vec<(Vec<u8>, Bytes)> = merged.into_iter().collect();
        let root = if items.is_empty() {
            index.store().put(Node::empty().encode()?).await?
        } else {
            let mut arena = Vec::new();
            build(&items, 0, &mut arena);
            emit(&index, arena).await?
        };
        debug!(entries = items.len(), "batch rebuilt index");
        index.publish_root(root, existed, cancel).await
    }
}

async fn resolve<S: ChunkStore>(index: &Index<S>, value: Value) -> Result<Bytes> {
    match value {
        Value::Raw(value) => Ok(value),
        Value::Spilled(hash) => index.resolve_value(&Ref::Chunk(hash)).await,
    }
}

/// A node under construction, keyed by its position in the arena. Children
/// always precede their parent, so iterating the arena in order emits the
/// tree bottom-up.
#[derive(Debug)]
struct ArenaNode {
    prefix: Vec<u8>,
    entries: Vec<(Vec<u8>, ArenaRef)>,
}

#[derive(Debug)]
enum ArenaRef {
    Value(Bytes),
    Child(usize),
}

/// Build the radix tree over `items` (sorted, unique keys sharing a prefix
/// of at least `from` bytes). Returns the arena id of the subtree root.
fn build(items: &[(Vec<u8>, Bytes)], from: usize, arena: &mut Vec<ArenaNode>) -> usize {
    // extend the shared prefix as far as it goes
    let first = items[0].0.as_slice();
    let mut lcp = first.len();
    for (key, _) in &items[1..] {
        lcp = lcp.min(common_prefix_len(first, key));
    }
    debug_assert!(lcp >= from);

    let mut entries: Vec<(Vec<u8>, ArenaRef)> = Vec::new();
    let mut rest = items;
    if rest[0].0.len() == lcp {
        // a key equal to the prefix itself becomes the empty-suffix leaf
        entries.push((Vec::new(), ArenaRef::Value(rest[0].1.clone())));
        rest = &rest[1..];
    }
    while !rest.is_empty() {
        let byte = rest[0].0[lcp];
        let group_len = rest
            .iter()
            .take_while(|(key, _)| key[lcp] == byte)
            .count();
        let (group, tail) = rest.split_at(group_len);
        if group_len == 1 {
            entries.push((group[0].0[lcp..].to_vec(), ArenaRef::Value(group[0].1.clone())));
        } else {
            let child = build(group, lcp + 1, arena);
            let suffix = arena[child].prefix[lcp..].to_vec();
            entries.push((suffix, ArenaRef::Child(child)));
        }
        rest = tail;
    }

    arena.push(ArenaNode {
        prefix: items[0].0[..lcp].to_vec(),
        entries,
    });
    arena.len() - 1
}

/// Encode and store every arena node, children first. Returns the root
/// hash (the last node emitted).
async fn emit<S: ChunkStore>(index: &Index<S>, arena: Vec<ArenaNode>) -> Result<Hash> {
    let mut hashes = Vec::with_capacity(arena.len());
    for built in arena {
        let mut entries = Vec::with_capacity(built.entries.len());
        for (suffix, target) in built.entries {
            let entry = match target {
                ArenaRef::Value(value) => {
                    Entry::leaf(suffix, index.make_value_ref(&value).await?)
                }
                ArenaRef::Child(id) => Entry::child(suffix, hashes[id]),
            };
            entries.push(entry);
        }
        let node = Node {
            prefix: built.prefix,
            entries,
        };
        let hash = index.store().put(node.encode()?).await?;
        hashes.push(hash);
    }
    Ok(*hashes.last().expect("emit called with a non-empty arena"))
}

//! The manifest node codec.
//!
//! A manifest node is one chunk of an index tree: a shared key prefix plus
//! sorted entries, each entry either a leaf carrying a value reference or a
//! pointer to a child node. The layout is length-prefixed throughout:
//!
//! ```text
//! node  := prefix_len:2 | prefix | n_entries:2 | [ entry ]
//! entry := suffix_len:2 | suffix | flags:1 | ref_len:1 | ref [| meta:4]
//! flags := bit0 leaf, bit1 inline, bit2 has_value_meta
//! meta  := content_type:1 | reserved:3
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use reef_base::Hash;

use crate::{Error, Result};

const FLAG_LEAF: u8 = 1 << 0;
const FLAG_INLINE: u8 = 1 << 1;
const FLAG_META: u8 = 1 << 2;

/// Values up to this length are stored inline in the node.
pub(crate) const INLINE_VALUE_LEN: usize = 32;

/// Reference from a manifest entry to its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ref {
    /// A chunk in the block layer: a child node, or a value too large to
    /// inline.
    Chunk(Hash),
    /// A small value stored inside the node itself.
    Inline(Vec<u8>),
    /// No target.
    Null,
}

/// One slot of a manifest node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Key bytes below the node's prefix.
    pub suffix: Vec<u8>,
    /// Leaf entries carry values; internal entries point at child nodes.
    pub leaf: bool,
    /// The entry's target.
    pub target: Ref,
    /// Optional content type tag for the value.
    pub content_type: Option<u8>,
}

impl Entry {
    /// A leaf entry holding `target` as its value.
    pub fn leaf(suffix: Vec<u8>, target: Ref) -> Self {
        Entry {
            suffix,
            leaf: true,
            target,
            content_type: None,
        }
    }

    /// An internal entry pointing at the child node `hash`.
    pub fn child(suffix: Vec<u8>, hash: Hash) -> Self {
        Entry {
            suffix,
            leaf: false,
            target: Ref::Chunk(hash),
            content_type: None,
        }
    }

    /// The child hash of an internal entry.
    pub(crate) fn child_hash(&self) -> Result<Hash> {
        match (&self.target, self.leaf) {
            (Ref::Chunk(hash), false) => Ok(*hash),
            _ => Err(Error::Corrupt("internal entry without child chunk")),
        }
    }
}

/// A decoded manifest node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    /// Key prefix shared by everything below this node. The prefix is
    /// absolute: concatenated with an entry suffix it forms a full key
    /// (leaf) or the prefix of a child (internal).
    pub prefix: Vec<u8>,
    /// Slots, sorted by suffix.
    pub entries: Vec<Entry>,
}

impl Node {
    /// A node with no entries.
    pub fn empty() -> Self {
        Node::default()
    }

    /// Serialize the node.
    pub fn encode(&self) -> Result<Bytes> {
        if self.prefix.len() > u16::MAX as usize {
            return Err(Error::invalid("manifest prefix too long"));
        }
        if self.entries.len() > u16::MAX as usize {
            return Err(Error::invalid("too many manifest entries"));
        }
        let mut buf = BytesMut::new();
        buf.put_u16(self.prefix.len() as u16);
        buf.put_slice(&self.prefix);
        buf.put_u16(self.entries.len() as u16);
        for entry in &self.entries {
            if entry.suffix.len() > u16::MAX as usize {
                return Err(Error::invalid("manifest suffix too long"));
            }
            buf.put_u16(entry.suffix.len() as u16);
            buf.put_slice(&entry.suffix);
            let mut flags = 0u8;
            if entry.leaf {
                flags |= FLAG_LEAF;
            }
            if matches!(entry.target, Ref::Inline(_)) {
                flags |= FLAG_INLINE;
            }
            if entry.content_type.is_some() {
                flags |= FLAG_META;
            }
            buf.put_u8(flags);
            match &entry.target {
                Ref::Chunk(hash) => {
                    buf.put_u8(32);
                    buf.put_slice(hash.as_bytes());
                }
                Ref::Inline(value) => {
                    debug_assert!(value.len() <= INLINE_VALUE_LEN);
                    buf.put_u8(value.len() as u8);
                    buf.put_slice(value);
                }
                Ref::Null => buf.put_u8(0),
            }
            if let Some(content_type) = entry.content_type {
                buf.put_u8(content_type);
                buf.put_slice(&[0, 0, 0]);
            }
        }
        Ok(buf.freeze())
    }

    /// Deserialize a node, validating the format invariants.
    pub fn decode(data: &[u8]) -> Result<Node> {
        let mut r = Reader::new(data);
        let prefix_len = r.u16()? as usize;
        let prefix = r.bytes(prefix_len)?.to_vec();
        let n_entries = r.u16()? as usize;
        let mut entries = Vec::with_capacity(n_entries);
        for _ in 0..n_entries {
            let suffix_len = r.u16()? as usize;
            let suffix = r.bytes(suffix_len)?.to_vec();
            let flags = r.u8()?;
            if flags & !(FLAG_LEAF | FLAG_INLINE | FLAG_META) != 0 {
                return Err(Error::Corrupt("unknown manifest entry flags"));
            }
            let leaf = flags & FLAG_LEAF != 0;
            let ref_len = r.u8()? as usize;
            let target = if flags & FLAG_INLINE != 0 {
                if !leaf {
                    return Err(Error::Corrupt("inline value on internal entry"));
                }
                if ref_len > INLINE_VALUE_LEN {
                    return Err(Error::Corrupt("inline value too long"));
                }
                Ref::Inline(r.bytes(ref_len)?.to_vec())
            } else if ref_len == 0 {
                Ref::Null
            } else if ref_len == 32 {
                let bytes: [u8; 32] = r.bytes(32)?.try_into().expect("sliced 32 bytes");
                Ref::Chunk(Hash::from_bytes(bytes))
            } else {
                return Err(Error::Corrupt("bad manifest ref length"));
            };
            let content_type = if flags & FLAG_META != 0 {
                let content_type = r.u8()?;
                r.bytes(3)?;
                Some(content_type)
            } else {
                None
            };
            if !leaf && !matches!(target, Ref::Chunk(_)) {
                return Err(Error::Corrupt("internal entry without child chunk"));
            }
            entries.push(Entry {
                suffix,
                leaf,
                target,
                content_type,
            });
        }
        if !r.done() {
            return Err(Error::Corrupt("trailing bytes after manifest node"));
        }
        if !entries.windows(2).all(|w| w[0].suffix < w[1].suffix) {
            return Err(Error::Corrupt("manifest entries out of order"));
        }
        Ok(Node { prefix, entries })
    }
}

/// Bounds-checked little reader over a byte slice.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(Error::Corrupt("truncated manifest node"))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn done(&self) -> bool {
        self.pos == self.data.len()
    }
}

/// Encode a multi-index value list, sorted by insertion order.
pub(crate) fn encode_value_list(values: &[Bytes]) -> Result<Bytes> {
    if values.len() > u16::MAX as usize {
        return Err(Error::invalid("too many values for one key"));
    }
    let mut buf = BytesMut::new();
    buf.put_u16(values.len() as u16);
    for value in values {
        if value.len() > u32::MAX as usize {
            return Err(Error::invalid("value too long"));
        }
        buf.put_u32(value.len() as u32);
        buf.put_slice(value);
    }
    Ok(buf.freeze())
}

/// Decode a multi-index value list.
pub(crate) fn decode_value_list(data: &[u8]) -> Result<Vec<Bytes>> {
    let mut r = Reader::new(data);
    let count = r.u16()? as usize;
    let mut values = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let b = r.bytes(4)?;
        let len = u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize;
        values.push(Bytes::copy_from_slice(
            r.bytes(len)
                .map_err(|_| Error::Corrupt("truncated value list"))?,
        ));
    }
    if !r.done() {
        return Err(Error::Corrupt("trailing bytes after value list"));
    }
    Ok(values)
}

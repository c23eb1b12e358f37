//! Range cursors over an index snapshot.

use bytes::Bytes;
use reef_feed::ChunkStore;
use tokio_util::sync::CancellationToken;

use crate::{
    index::Index,
    manifest::Node,
    Error, Result,
};

/// One level of the cursor's descent.
#[derive(Debug)]
struct Frame {
    node: Node,
    next: usize,
}

/// A cursor over a key range of one index.
///
/// The cursor captures the root at its first step and iterates that
/// snapshot; writes committed later are not observed. Entries are yielded
/// in key order as `(key, raw stored value)` pairs.
#[derive(Debug)]
pub struct Cursor<S> {
    index: Index<S>,
    start: Vec<u8>,
    /// Upper bound and whether it is inclusive.
    end: Option<(Vec<u8>, bool)>,
    limit: Option<u64>,
    emitted: u64,
    stack: Vec<Frame>,
    state: State,
}

#[derive(Debug, PartialEq)]
enum State {
    Fresh,
    Walking,
    Done,
}

impl<S: ChunkStore> Cursor<S> {
    pub(crate) fn new(
        index: Index<S>,
        start: Vec<u8>,
        end: Option<(Vec<u8>, bool)>,
        limit: Option<u64>,
    ) -> Self {
        Cursor {
            index,
            start,
            end,
            limit,
            emitted: 0,
            stack: Vec::new(),
            state: State::Fresh,
        }
    }

    /// The next entry in range, or `None` once the range, the limit or the
    /// snapshot is exhausted.
    pub async fn next(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<(Vec<u8>, Bytes)>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(limit) = self.limit {
            if self.emitted >= limit {
                self.state = State::Done;
            }
        }
        match self.state {
            State::Done => return Ok(None),
            State::Fresh => {
                self.position(cancel).await?;
                self.state = State::Walking;
            }
            State::Walking => {}
        }

        loop {
            let Some(frame) = self.stack.last_mut() else {
                self.state = State::Done;
                return Ok(None);
            };
            if frame.next >= frame.node.entries.len() {
                self.stack.pop();
                continue;
            }
            let idx = frame.next;
            frame.next += 1;

            let entry = frame.node.entries[idx].clone();
            let mut key = frame.node.prefix.clone();
            key.extend_from_slice(&entry.suffix);

            if entry.leaf {
                if key.as_slice() < self.start.as_slice() {
                    // the first positioned node can hold earlier keys
                    continue;
                }
                if let Some((end, inclusive)) = &self.end {
                    let in_range = if *inclusive {
                        key.as_slice() <= end.as_slice()
                    } else {
                        key.as_slice() < end.as_slice()
                    };
                    if !in_range {
                        self.state = State::Done;
                        return Ok(None);
                    }
                }
                let value = self.index.resolve_value(&entry.target).await?;
                self.emitted += 1;
                return Ok(Some((key, value)));
            }

            // internal entry: skip subtrees entirely before the range
            if (key.as_slice() < self.start.as_slice()) && !self.start.starts_with(&key) {
                continue;
            }
            let hash = entry.child_hash()?;
            let node = self.index.load_node(&hash).await?;
            self.stack.push(Frame { node, next: 0 });
        }
    }

    /// Collect the remaining entries into a vector.
    pub async fn collect(
        mut self,
        cancel: &CancellationToken,
    ) -> Result<Vec<(Vec<u8>, Bytes)>> {
        let mut out = Vec::new();
        while let Some(item) = self.next(cancel).await? {
            out.push(item);
        }
        Ok(out)
    }

    /// Descend from the root towards `start`, leaving the stack positioned
    /// at the first candidate entry.
    async fn position(&mut self, cancel: &CancellationToken) -> Result<()> {
        let Some((_, root)) = self.index.load_root(cancel).await? else {
            self.state = State::Done;
            return Ok(());
        };
        let mut node = root;
        loop {
            let mut idx = node.entries.len();
            let mut descend = None;
            for (i, entry) in node.entries.iter().enumerate() {
                let mut full = node.prefix.clone();
                full.extend_from_slice(&entry.suffix);
                if entry.leaf {
                    if full.as_slice() >= self.start.as_slice() {
                        idx = i;
                        break;
                    }
                } else if full.as_slice() >= self.start.as_slice() {
                    idx = i;
                    break;
                } else if self.start.starts_with(&full) {
                    // the range starts inside this subtree
                    descend = Some((i, entry.child_hash()?));
                    break;
                }
            }
            match descend {
                Some((i, hash)) => {
                    self.stack.push(Frame { node, next: i + 1 });
                    node = self.index.load_node(&hash).await?;
                }
                None => {
                    self.stack.push(Frame { node, next: idx });
                    return Ok(());
                }
            }
        }
    }
}

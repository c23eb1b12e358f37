//! Single-index key-value tables.

use std::fmt;

use bytes::Bytes;
use reef_feed::ChunkStore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    cursor::Cursor,
    index::Index,
    keys::{decode_number, encode_number, IndexKind},
    Error, Result,
};

/// Reserved key the CSV column header row is stored under.
pub const CSV_HEADER_KEY: &str = "__CSV_HEADER__";

/// A typed key of a KV table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvKey {
    /// UTF-8 string key.
    Str(String),
    /// Signed integer key.
    Num(i64),
    /// Raw byte-string key.
    Bytes(Vec<u8>),
}

impl From<&str> for KvKey {
    fn from(value: &str) -> Self {
        KvKey::Str(value.to_string())
    }
}

impl From<i64> for KvKey {
    fn from(value: i64) -> Self {
        KvKey::Num(value)
    }
}

impl From<&[u8]> for KvKey {
    fn from(value: &[u8]) -> Self {
        KvKey::Bytes(value.to_vec())
    }
}

impl fmt::Display for KvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvKey::Str(s) => write!(f, "{s}"),
            KvKey::Num(n) => write!(f, "{n}"),
            KvKey::Bytes(b) => write!(f, "{}", hex::encode(b)),
        }
    }
}

/// Totals of one bulk ingest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Rows seen, the header included.
    pub rows: u64,
    /// Rows stored.
    pub successes: u64,
    /// Rows dropped; ingest continues past them.
    pub failures: u64,
}

/// A table with a single primary index and typed keys.
#[derive(Debug)]
pub struct KvStore<S> {
    name: String,
    kind: IndexKind,
    index: Index<S>,
}

impl<S> Clone for KvStore<S> {
    fn clone(&self) -> Self {
        KvStore {
            name: self.name.clone(),
            kind: self.kind,
            index: self.index.clone(),
        }
    }
}

impl<S: ChunkStore> KvStore<S> {
    pub(crate) fn open(name: &str, kind: IndexKind, index: Index<S>) -> Result<Self> {
        match kind {
            IndexKind::String | IndexKind::Number | IndexKind::Bytes => Ok(KvStore {
                name: name.to_string(),
                kind,
                index,
            }),
            other => Err(Error::invalid(format!(
                "kv table cannot be keyed by a {other} index"
            ))),
        }
    }

    /// The table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared key kind.
    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    fn encode_key(&self, key: &KvKey) -> Result<Vec<u8>> {
        match (self.kind, key) {
            (IndexKind::String, KvKey::Str(s)) => Ok(s.as_bytes().to_vec()),
            (IndexKind::Number, KvKey::Num(n)) => Ok(encode_number(*n).to_vec()),
            (IndexKind::Bytes, KvKey::Bytes(b)) => Ok(b.clone()),
            // the reserved header key bypasses the declared kind
            (_, KvKey::Str(s)) if s == CSV_HEADER_KEY => Ok(s.as_bytes().to_vec()),
            (kind, key) => Err(Error::invalid(format!(
                "key {key} does not match the {kind} key kind"
            ))),
        }
    }

    fn decode_key(&self, key: &[u8]) -> Result<KvKey> {
        if key == CSV_HEADER_KEY.as_bytes() {
            return Ok(KvKey::Str(CSV_HEADER_KEY.to_string()));
        }
        match self.kind {
            IndexKind::String => Ok(KvKey::Str(
                String::from_utf8(key.to_vec())
                    .map_err(|_| Error::Corrupt("non-utf8 string key"))?,
            )),
            IndexKind::Number => Ok(KvKey::Num(decode_number(key)?)),
            _ => Ok(KvKey::Bytes(key.to_vec())),
        }
    }

    /// Store `value` under `key`.
    pub async fn put(
        &self,
        key: impl Into<KvKey>,
        value: Bytes,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let key = self.encode_key(&key.into())?;
        self.index.put(&key, value, cancel).await?;
        Ok(())
    }

    /// Fetch the value under `key`.
    pub async fn get(&self, key: impl Into<KvKey>, cancel: &CancellationToken) -> Result<Bytes> {
        let key = self.encode_key(&key.into())?;
        self.index.get(&key, cancel).await
    }

    /// Remove `key`, returning its value.
    pub async fn del(&self, key: impl Into<KvKey>, cancel: &CancellationToken) -> Result<Bytes> {
        let key = self.encode_key(&key.into())?;
        self.index.del(&key, cancel).await
    }

    /// Number of stored keys.
    pub async fn count(&self, cancel: &CancellationToken) -> Result<u64> {
        self.index.count(cancel).await
    }

    /// Cursor over `[start, end]`, end inclusive.
    pub async fn seek(
        &self,
        start: impl Into<KvKey>,
        end: Option<KvKey>,
        limit: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<KvCursor<S>> {
        let start = self.encode_key(&start.into())?;
        let end = match &end {
            Some(end) => Some(self.encode_key(end)?),
            None => None,
        };
        let cursor = self
            .index
            .seek(&start, end.as_deref(), limit, cancel)
            .await?;
        Ok(KvCursor {
            table: self.clone(),
            cursor,
        })
    }

    /// Ingest comma-separated rows delimited by `\n` (a trailing `\r` is
    /// stripped). The first row is the column header, stored under
    /// [`CSV_HEADER_KEY`] and counted as a success; every following row is
    /// keyed by its first field. Bad rows count as failures and never
    /// abort the ingest.
    pub async fn load_csv(&self, data: &str, cancel: &CancellationToken) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        let mut lines = data.split('\n');

        let Some(header) = next_row(&mut lines) else {
            return Ok(report);
        };
        report.rows += 1;
        match self
            .put(CSV_HEADER_KEY, Bytes::copy_from_slice(header.as_bytes()), cancel)
            .await
        {
            Ok(()) => report.successes += 1,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(_) => report.failures += 1,
        }

        while let Some(row) = next_row(&mut lines) {
            report.rows += 1;
            let key = row.split(',').next().unwrap_or_default();
            if key.is_empty() {
                report.failures += 1;
                continue;
            }
            match self
                .put(key, Bytes::copy_from_slice(row.as_bytes()), cancel)
                .await
            {
                Ok(()) => report.successes += 1,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(_) => report.failures += 1,
            }
        }
        debug!(table = %self.name, rows = report.rows, failures = report.failures, "csv ingest done");
        Ok(report)
    }
}

/// Skip blank lines and strip a trailing `\r`.
fn next_row<'a>(lines: &mut impl Iterator<Item = &'a str>) -> Option<&'a str> {
    for line in lines {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if !line.is_empty() {
            return Some(line);
        }
    }
    None
}

/// Cursor over a KV table, yielding decoded keys.
#[derive(Debug)]
pub struct KvCursor<S> {
    table: KvStore<S>,
    cursor: Cursor<S>,
}

impl<S: ChunkStore> KvCursor<S> {
    /// The next pair in range.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Result<Option<(KvKey, Bytes)>> {
        match self.cursor.next(cancel).await? {
            Some((key, value)) => Ok(Some((self.table.decode_key(&key)?, value))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::{bytes, test_index};

    use super::*;

    fn kv(kind: IndexKind) -> KvStore<reef_feed::MemStore> {
        KvStore::open("t", kind, test_index(false)).unwrap()
    }

    #[tokio::test]
    async fn test_kv_basic() -> anyhow::Result<()> {
        let store = kv(IndexKind::String);
        let cancel = CancellationToken::new();

        store.put("alpha", bytes("1"), &cancel).await?;
        store.put("bravo", bytes("2"), &cancel).await?;
        store.put("charlie", bytes("3"), &cancel).await?;
        assert_eq!(store.count(&cancel).await?, 3);

        let mut cursor = store
            .seek("alpha", Some("charlie".into()), Some(10), &cancel)
            .await?;
        let mut seen = Vec::new();
        while let Some((key, value)) = cursor.next(&cancel).await? {
            seen.push((key.to_string(), String::from_utf8(value.to_vec())?));
        }
        assert_eq!(
            seen,
            [
                ("alpha".to_string(), "1".to_string()),
                ("bravo".to_string(), "2".to_string()),
                ("charlie".to_string(), "3".to_string()),
            ]
        );

        store.del("bravo", &cancel).await?;
        assert!(store.get("bravo", &cancel).await.unwrap_err().is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_numeric_ordering() -> anyhow::Result<()> {
        let store = kv(IndexKind::Number);
        let cancel = CancellationToken::new();

        store.put(3, bytes("c"), &cancel).await?;
        store.put(1, bytes("a"), &cancel).await?;
        store.put(2, bytes("b"), &cancel).await?;

        let mut cursor = store.seek(0, Some(10.into()), Some(10), &cancel).await?;
        let mut seen = Vec::new();
        while let Some((key, value)) = cursor.next(&cancel).await? {
            seen.push((key, String::from_utf8(value.to_vec())?));
        }
        assert_eq!(
            seen,
            [
                (KvKey::Num(1), "a".to_string()),
                (KvKey::Num(2), "b".to_string()),
                (KvKey::Num(3), "c".to_string()),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_negative_numbers_order_before_positive() -> anyhow::Result<()> {
        let store = kv(IndexKind::Number);
        let cancel = CancellationToken::new();
        for n in [5i64, -3, 0, i64::MIN, i64::MAX] {
            store.put(n, bytes(&n.to_string()), &cancel).await?;
        }
        let mut cursor = store
            .seek(i64::MIN, Some(i64::MAX.into()), None, &cancel)
            .await?;
        let mut seen = Vec::new();
        while let Some((key, _)) = cursor.next(&cancel).await? {
            match key {
                KvKey::Num(n) => seen.push(n),
                other => panic!("unexpected key {other}"),
            }
        }
        assert_eq!(seen, [i64::MIN, -3, 0, 5, i64::MAX]);
        Ok(())
    }

    #[tokio::test]
    async fn test_key_kind_mismatch() {
        let store = kv(IndexKind::String);
        let cancel = CancellationToken::new();
        let err = store.put(7, bytes("x"), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[tokio::test]
    async fn test_csv_ingest() -> anyhow::Result<()> {
        let store = kv(IndexKind::String);
        let cancel = CancellationToken::new();

        let report = store
            .load_csv("name,age\nalice,30\nbob,40\n", &cancel)
            .await?;
        assert_eq!(
            report,
            IngestReport {
                rows: 3,
                successes: 3,
                failures: 0
            }
        );
        assert_eq!(&store.get(CSV_HEADER_KEY, &cancel).await?[..], b"name,age");
        assert_eq!(&store.get("alice", &cancel).await?[..], b"alice,30");
        assert_eq!(&store.get("bob", &cancel).await?[..], b"bob,40");
        Ok(())
    }

    #[tokio::test]
    async fn test_csv_ingest_counts_failures() -> anyhow::Result<()> {
        let store = kv(IndexKind::String);
        let cancel = CancellationToken::new();

        // the long key exceeds the key bound and fails; ingest continues
        let long = "k".repeat(200);
        let data = format!("h1,h2\r\nok,1\r\n{long},2\r\nalso,3\r\n");
        let report = store.load_csv(&data, &cancel).await?;
        assert_eq!(report.rows, 4);
        assert_eq!(report.successes, 3);
        assert_eq!(report.failures, 1);
        assert_eq!(&store.get("also", &cancel).await?[..], b"also,3");
        Ok(())
    }
}

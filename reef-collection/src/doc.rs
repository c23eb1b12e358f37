//! Document tables: JSON objects under a primary id, findable through any
//! number of secondary indexes.

use bytes::Bytes;
use rand::RngCore;
use reef_feed::ChunkStore;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    batch::Batch,
    expr::{Expr, Op, Term},
    index::Index,
    keys::{encode_json_number, encode_number, IndexKind},
    kv::IngestReport,
    manifest::decode_value_list,
    Error, Result,
};

/// Column name of the primary index.
pub(crate) const PRIMARY_COLUMN: &str = "id";

/// Random bytes behind a generated document id (rendered as hex).
const GENERATED_ID_LEN: usize = 12;

/// Attempts at generating a fresh id before giving up.
const GENERATED_ID_RETRIES: usize = 8;

/// One secondary index of a doc table.
#[derive(Debug)]
pub(crate) struct Secondary<S> {
    pub(crate) column: String,
    pub(crate) kind: IndexKind,
    pub(crate) index: Index<S>,
}

impl<S> Clone for Secondary<S> {
    fn clone(&self) -> Self {
        Secondary {
            column: self.column.clone(),
            kind: self.kind,
            index: self.index.clone(),
        }
    }
}

/// A table of JSON documents.
///
/// The primary index maps `id → document bytes`; every declared secondary
/// maps an extracted field value back to the id. Writes touch the
/// secondaries first and the primary last, so a document reachable by id
/// is always reachable through its secondaries as well.
#[derive(Debug)]
pub struct DocStore<S> {
    name: String,
    mutable: bool,
    primary: Index<S>,
    secondaries: Vec<Secondary<S>>,
}

impl<S> Clone for DocStore<S> {
    fn clone(&self) -> Self {
        DocStore {
            name: self.name.clone(),
            mutable: self.mutable,
            primary: self.primary.clone(),
            secondaries: self.secondaries.clone(),
        }
    }
}

impl<S: ChunkStore> DocStore<S> {
    pub(crate) fn open(
        name: &str,
        mutable: bool,
        primary: Index<S>,
        secondaries: Vec<Secondary<S>>,
    ) -> Self {
        DocStore {
            name: name.to_string(),
            mutable,
            primary,
            secondaries,
        }
    }

    /// The table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether point writes are allowed.
    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Insert a JSON document; returns its id. A missing `id` field is
    /// generated. On mutable tables an existing document with the same id
    /// is replaced, its old secondary entries removed first.
    pub async fn put(&self, doc: Bytes, cancel: &CancellationToken) -> Result<String> {
        if !self.mutable {
            return Err(Error::ReadOnly);
        }
        let mut obj = parse_object(&doc)?;
        let (id, generated) = match extract_id(&obj)? {
            Some(id) => (id, false),
            None => (self.generate_id(cancel).await?, true),
        };

        let stored = if generated {
            obj.insert(PRIMARY_COLUMN.to_string(), Value::String(id.clone()));
            Bytes::from(serde_json::to_vec(&obj).expect("serializing a parsed document"))
        } else {
            // replacing a document must first undo its old index entries
            match self.primary.get(id.as_bytes(), cancel).await {
                Ok(old) => self.remove_secondaries(&old, &id, cancel).await?,
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
            doc
        };

        for sec in &self.secondaries {
            for key in extract_entries(sec.kind, &sec.column, &obj)? {
                let id_bytes = Bytes::copy_from_slice(id.as_bytes());
                if sec.index.is_multi() {
                    sec.index.append(&key, id_bytes, cancel).await?;
                } else {
                    sec.index.put(&key, id_bytes, cancel).await?;
                }
            }
        }
        self.primary.put(id.as_bytes(), stored, cancel).await?;
        debug!(table = %self.name, %id, "document stored");
        Ok(id)
    }

    /// Fetch a document by id.
    pub async fn get(&self, id: &str, cancel: &CancellationToken) -> Result<Bytes> {
        self.primary.get(id.as_bytes(), cancel).await
    }

    /// Remove a document and every secondary entry derived from it.
    pub async fn del(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        if !self.mutable {
            return Err(Error::ReadOnly);
        }
        let doc = self.primary.get(id.as_bytes(), cancel).await?;
        self.remove_secondaries(&doc, id, cancel).await?;
        self.primary.del(id.as_bytes(), cancel).await?;
        debug!(table = %self.name, %id, "document removed");
        Ok(())
    }

    /// Number of documents matching `expr`, or all documents.
    pub async fn count(&self, expr: Option<&str>, cancel: &CancellationToken) -> Result<u64> {
        match expr {
            None => self.primary.count(cancel).await,
            Some(expr) => {
                let docs = self.run_find(Expr::parse(expr)?, None, cancel).await?;
                Ok(docs.len() as u64)
            }
        }
    }

    /// Documents matching `expr`, in index iteration order, at most
    /// `limit` of them. A zero limit returns nothing without touching any
    /// index.
    pub async fn find(
        &self,
        expr: &str,
        limit: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<Bytes>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.run_find(Expr::parse(expr)?, Some(limit), cancel).await
    }

    /// Ingest newline-delimited JSON documents through a batch. Bad lines
    /// count as failures and never abort the ingest.
    pub async fn file_index(
        &self,
        data: &str,
        cancel: &CancellationToken,
    ) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        let mut batch = DocBatch::new(self.clone());
        for line in data.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line).trim();
            if line.is_empty() {
                continue;
            }
            report.rows += 1;
            match batch.put(Bytes::copy_from_slice(line.as_bytes()), cancel).await {
                Ok(_) => report.successes += 1,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(_) => report.failures += 1,
            }
        }
        batch.write(cancel).await?;
        debug!(table = %self.name, rows = report.rows, failures = report.failures, "file ingest done");
        Ok(report)
    }

    async fn generate_id(&self, cancel: &CancellationToken) -> Result<String> {
        for _ in 0..GENERATED_ID_RETRIES {
            let mut bytes = [0u8; GENERATED_ID_LEN];
            rand::thread_rng().fill_bytes(&mut bytes);
            let id = hex::encode(bytes);
            match self.primary.get(id.as_bytes(), cancel).await {
                Err(err) if err.is_not_found() => return Ok(id),
                Ok(_) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::invalid("could not allocate a fresh document id"))
    }

    async fn remove_secondaries(
        &self,
        doc: &Bytes,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let obj = parse_object(doc)?;
        for sec in &self.secondaries {
            for key in extract_entries(sec.kind, &sec.column, &obj)? {
                sec.index.remove_value(&key, id.as_bytes(), cancel).await?;
            }
        }
        Ok(())
    }

    fn secondary(&self, column: &str) -> Option<&Secondary<S>> {
        self.secondaries.iter().find(|sec| sec.column == column)
    }

    /// Pick the most selective indexed term, walk its index, and filter
    /// the candidates with the remaining terms.
    async fn run_find(
        &self,
        expr: Expr,
        limit: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Bytes>> {
        let pivot = expr
            .terms
            .iter()
            .filter(|term| {
                term.field == PRIMARY_COLUMN || self.secondary(&term.field).is_some()
            })
            .min_by_key(|term| match term.op {
                Op::Eq | Op::Contains => 0,
                Op::Lt | Op::Le | Op::Gt | Op::Ge => 1,
                Op::Ne => 2,
            });

        let mut out = Vec::new();
        match pivot {
            Some(term) if term.op != Op::Ne => {
                for id in self.candidate_ids(term, cancel).await? {
                    if self.matches(&id, &expr, cancel).await? {
                        out.push(self.get(&id, cancel).await?);
                        if limit.is_some_and(|l| out.len() as u64 >= l) {
                            break;
                        }
                    }
                }
            }
            _ => {
                // no usable index: scan the primary
                let mut cursor = self.primary.scan(Vec::new(), None, None);
                while let Some((_, doc)) = cursor.next(cancel).await? {
                    let obj = parse_object(&doc)?;
                    if expr.terms.iter().all(|term| eval_term(&obj, term)) {
                        out.push(doc);
                        if limit.is_some_and(|l| out.len() as u64 >= l) {
                            break;
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Candidate document ids from one indexed term, in index order.
    async fn candidate_ids(
        &self,
        term: &Term,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let (index, kind) = if term.field == PRIMARY_COLUMN {
            (&self.primary, IndexKind::String)
        } else {
            let sec = self.secondary(&term.field).expect("picked an indexed term");
            (&sec.index, sec.kind)
        };
        let key = term_key(kind, term)?;

        let mut ids = Vec::new();
        match term.op {
            Op::Eq | Op::Contains => {
                if term.field == PRIMARY_COLUMN {
                    // the primary maps id -> doc, the id is the key itself
                    match index.get(&key, cancel).await {
                        Ok(_) => ids.push(term.literal.clone()),
                        Err(err) if err.is_not_found() => {}
                        Err(err) => return Err(err),
                    }
                } else if index.is_multi() {
                    match index.get_values(&key, cancel).await {
                        Ok(values) => {
                            for value in values {
                                ids.push(id_from_bytes(&value)?);
                            }
                        }
                        Err(err) if err.is_not_found() => {}
                        Err(err) => return Err(err),
                    }
                } else {
                    match index.get(&key, cancel).await {
                        Ok(value) => ids.push(id_from_bytes(&value)?),
                        Err(err) if err.is_not_found() => {}
                        Err(err) => return Err(err),
                    }
                }
            }
            Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let mut cursor = match term.op {
                    Op::Gt => index.scan_after(&key, None, None),
                    Op::Ge => index.scan(key.clone(), None, None),
                    Op::Lt => index.scan(Vec::new(), Some((key.clone(), false)), None),
                    _ => index.scan(Vec::new(), Some((key.clone(), true)), None),
                };
                while let Some((stored_key, raw)) = cursor.next(cancel).await? {
                    if term.field == PRIMARY_COLUMN {
                        ids.push(id_from_bytes(&stored_key.into())?);
                    } else if index.is_multi() {
                        for value in decode_value_list(&raw)? {
                            ids.push(id_from_bytes(&value)?);
                        }
                    } else {
                        ids.push(id_from_bytes(&raw)?);
                    }
                }
            }
            Op::Ne => unreachable!("inequality terms never pivot"),
        }
        Ok(ids)
    }

    async fn matches(
        &self,
        id: &str,
        expr: &Expr,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let doc = match self.get(id, cancel).await {
            Ok(doc) => doc,
            // a secondary entry without its document: index drift on a
            // mutable table, skip it
            Err(err) if err.is_not_found() => return Ok(false),
            Err(err) => return Err(err),
        };
        let obj = parse_object(&doc)?;
        Ok(expr.terms.iter().all(|term| eval_term(&obj, term)))
    }
}

/// Accumulates encoded documents and flushes each affected index with one
/// batch write. Secondaries flush before the primary, which is the commit
/// point.
#[derive(Debug)]
pub struct DocBatch<S> {
    store: DocStore<S>,
    primary: Batch<S>,
    secondaries: Vec<Batch<S>>,
}

impl<S: ChunkStore> DocBatch<S> {
    /// Start a batch against `store`.
    pub fn new(store: DocStore<S>) -> Self {
        Self::with_memory_limit(store, crate::batch::DEFAULT_MEMORY_LIMIT)
    }

    /// Start a batch with an explicit memory bound, shared by the staging
    /// buffers of every affected index.
    pub fn with_memory_limit(store: DocStore<S>, memory_limit: usize) -> Self {
        let per_index = memory_limit / (1 + store.secondaries.len());
        let primary = Batch::with_memory_limit(store.primary.clone(), per_index);
        let secondaries = store
            .secondaries
            .iter()
            .map(|sec| Batch::with_memory_limit(sec.index.clone(), per_index))
            .collect();
        DocBatch {
            store,
            primary,
            secondaries,
        }
    }

    /// Stage one document; returns its id.
    pub async fn put(&mut self, doc: Bytes, cancel: &CancellationToken) -> Result<String> {
        let mut obj = parse_object(&doc)?;
        let (id, generated) = match extract_id(&obj)? {
            Some(id) => (id, false),
            None => (self.store.generate_id(cancel).await?, true),
        };
        let stored = if generated {
            obj.insert(PRIMARY_COLUMN.to_string(), Value::String(id.clone()));
            Bytes::from(serde_json::to_vec(&obj).expect("serializing a parsed document"))
        } else {
            doc
        };

        for (sec, batch) in self.store.secondaries.iter().zip(&mut self.secondaries) {
            for key in extract_entries(sec.kind, &sec.column, &obj)? {
                batch.put(&key, Bytes::copy_from_slice(id.as_bytes())).await?;
            }
        }
        self.primary.put(id.as_bytes(), stored).await?;
        Ok(id)
    }

    /// Commit: every secondary index first, the primary last.
    pub async fn write(self, cancel: &CancellationToken) -> Result<()> {
        for batch in self.secondaries {
            batch.write(cancel).await?;
        }
        self.primary.write(cancel).await
    }
}

fn parse_object(doc: &[u8]) -> Result<Map<String, Value>> {
    match serde_json::from_slice::<Value>(doc) {
        Ok(Value::Object(obj)) => Ok(obj),
        Ok(_) => Err(Error::invalid("document is not a JSON object")),
        Err(err) => Err(Error::invalid(format!("bad document JSON: {err}"))),
    }
}

fn extract_id(obj: &Map<String, Value>) -> Result<Option<String>> {
    match obj.get(PRIMARY_COLUMN) {
        None => Ok(None),
        Some(Value::String(id)) if !id.is_empty() => Ok(Some(id.clone())),
        Some(_) => Err(Error::invalid("document id must be a non-empty string")),
    }
}

fn id_from_bytes(value: &Bytes) -> Result<String> {
    String::from_utf8(value.to_vec()).map_err(|_| Error::Corrupt("non-utf8 document id"))
}

/// The index keys one document contributes to a column.
fn extract_entries(
    kind: IndexKind,
    column: &str,
    obj: &Map<String, Value>,
) -> Result<Vec<Vec<u8>>> {
    let Some(value) = field_value(obj, column) else {
        return Ok(Vec::new());
    };
    let mut keys = Vec::new();
    match (kind, value) {
        (IndexKind::String, Value::String(s)) => keys.push(s.as_bytes().to_vec()),
        (IndexKind::Bytes, Value::String(s)) => keys.push(s.as_bytes().to_vec()),
        (IndexKind::Number, Value::Number(n)) => {
            let v = n
                .as_f64()
                .ok_or_else(|| Error::invalid("unrepresentable number"))?;
            keys.push(encode_json_number(v)?.to_vec());
        }
        (IndexKind::Map, Value::Object(map)) => {
            for (map_key, map_value) in map {
                // the key alone serves `contains`, key=value equality
                keys.push(map_key.as_bytes().to_vec());
                if let Some(rendered) = render_scalar(map_value) {
                    keys.push(format!("{map_key}={rendered}").into_bytes());
                }
            }
        }
        (IndexKind::List, Value::Array(items)) => {
            for item in items {
                if let Some(rendered) = render_scalar(item) {
                    keys.push(rendered.into_bytes());
                }
            }
        }
        // a field of the wrong shape contributes nothing
        _ => {}
    }
    Ok(keys)
}

/// Walk a dotted field path through nested objects.
fn field_value<'a>(obj: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    let mut parts = field.split('.');
    let mut cur = obj.get(parts.next()?)?;
    for part in parts {
        cur = cur.as_object()?.get(part)?;
    }
    Some(cur)
}

fn render_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Evaluate one term against a parsed document.
fn eval_term(obj: &Map<String, Value>, term: &Term) -> bool {
    let Some(value) = field_value(obj, &term.field) else {
        return false;
    };
    match term.op {
        Op::Contains => match value {
            Value::Object(map) => map.contains_key(&term.literal),
            Value::Array(items) => items
                .iter()
                .any(|item| render_scalar(item).as_deref() == Some(term.literal.as_str())),
            _ => false,
        },
        Op::Eq => eval_eq(value, &term.literal),
        Op::Ne => !eval_eq(value, &term.literal),
        Op::Lt | Op::Le | Op::Gt | Op::Ge => {
            let ord = match (value, term.literal.parse::<f64>()) {
                (Value::Number(n), Ok(lit)) => n.as_f64().partial_cmp(&Some(lit)),
                _ => render_scalar(value).map(|s| s.as_str().cmp(term.literal.as_str())),
            };
            let Some(ord) = ord else { return false };
            match term.op {
                Op::Lt => ord == std::cmp::Ordering::Less,
                Op::Le => ord != std::cmp::Ordering::Greater,
                Op::Gt => ord == std::cmp::Ordering::Greater,
                _ => ord != std::cmp::Ordering::Less,
            }
        }
    }
}

fn eval_eq(value: &Value, literal: &str) -> bool {
    match value {
        Value::Object(map) => match literal.split_once('=') {
            Some((k, v)) => map
                .get(k)
                .and_then(render_scalar)
                .is_some_and(|rendered| rendered == v),
            None => map.contains_key(literal),
        },
        Value::Array(items) => items
            .iter()
            .any(|item| render_scalar(item).as_deref() == Some(literal)),
        other => render_scalar(other).as_deref() == Some(literal),
    }
}

/// Encode a term's literal as a key of the pivot index.
fn term_key(kind: IndexKind, term: &Term) -> Result<Vec<u8>> {
    match kind {
        IndexKind::Number => {
            let n: i64 = term
                .literal
                .parse()
                .map_err(|_| Error::invalid(format!("{:?} is not an integer", term.literal)))?;
            Ok(encode_number(n).to_vec())
        }
        _ => Ok(term.literal.as_bytes().to_vec()),
    }
}

/**
 * DOCUMENT STORE - durable JSON-lines collections
 *
 * One `<collection>.jsonl` file per collection under the data directory.
 * - insert  = append a new document with a generated UUID
 * - upsert  = append the merged document again; the last line for an id wins on load
 * - query   = filter over the collection, newest first
 *
 * Indexed collections (users, device status, alerts) are loaded into memory
 * at startup and compacted when superseded lines are found. History
 * collections (sensor data) only live on disk: inserts append, reads scan
 * the file. All writes go through one async lock so the file order always
 * matches the in-memory order.
 */

use super::{DocQuery, Document, DocumentStore, SinkError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Collection {
    docs: Vec<Document>,
    index: HashMap<String, usize>,
}

impl Collection {
    fn put(&mut self, doc: Document) {
        match self.index.get(&doc.id) {
            Some(&pos) => self.docs[pos] = doc,
            None => {
                self.index.insert(doc.id.clone(), self.docs.len());
                self.docs.push(doc);
            }
        }
    }

    fn get(&self, id: &str) -> Option<&Document> {
        self.index.get(id).map(|&pos| &self.docs[pos])
    }
}

pub struct JsonLinesStore {
    dir: PathBuf,
    history: HashSet<String>,
    collections: Mutex<HashMap<String, Collection>>,
    writes: tokio::sync::Mutex<()>,
}

impl JsonLinesStore {
    /// Opens (or creates) the store with every collection indexed in memory.
    pub async fn open<P: Into<PathBuf>>(dir: P) -> Result<Self, SinkError> {
        Self::open_with_history(dir, &[]).await
    }

    /// Like [`JsonLinesStore::open`], but `history` collections stay on disk only.
    pub async fn open_with_history<P: Into<PathBuf>>(dir: P, history: &[&str]) -> Result<Self, SinkError> {
        let dir = dir.into();
        let history: HashSet<String> = history.iter().map(|c| c.to_string()).collect();
        fs::create_dir_all(&dir).await?;

        let mut collections = HashMap::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            if history.contains(&name) {
                continue;
            }
            let (collection, lines) = load_collection(&path).await?;
            if lines > collection.docs.len() {
                rewrite(&path, &collection.docs).await?;
                tracing::info!(collection = %name, lines, docs = collection.docs.len(), "compacted collection");
            }
            collections.insert(name, collection);
        }

        tracing::info!(dir = %dir.display(), indexed = collections.len(), history = history.len(), "document store opened");
        Ok(Self { dir, history, collections: Mutex::new(collections), writes: tokio::sync::Mutex::new(()) })
    }

    fn path_of(&self, collection: &str) -> Result<PathBuf, SinkError> {
        let valid = !collection.is_empty()
            && collection.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(SinkError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid collection name {collection:?}"),
            )));
        }
        Ok(self.dir.join(format!("{collection}.jsonl")))
    }

    fn is_history(&self, collection: &str) -> bool {
        self.history.contains(collection)
    }

    async fn append(&self, collection: &str, doc: &Document) -> Result<(), SinkError> {
        let path = self.path_of(collection)?;
        let mut line = serde_json::to_vec(doc)?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    fn remember(&self, collection: &str, doc: Document) {
        if !self.is_history(collection) {
            self.collections.lock().entry(collection.to_string()).or_default().put(doc);
        }
    }

    /// Reads a history collection from disk, latest line per id.
    async fn scan(&self, collection: &str) -> Result<Collection, SinkError> {
        let path = self.path_of(collection)?;
        if !fs::try_exists(&path).await? {
            return Ok(Collection::default());
        }
        Ok(load_collection(&path).await?.0)
    }

    async fn lookup(&self, collection: &str, id: &str) -> Result<Option<Document>, SinkError> {
        if self.is_history(collection) {
            return Ok(self.scan(collection).await?.get(id).cloned());
        }
        Ok(self.collections.lock().get(collection).and_then(|c| c.get(id).cloned()))
    }

    #[cfg(test)]
    fn indexed_docs(&self) -> usize {
        self.collections.lock().values().map(|c| c.docs.len()).sum()
    }
}

async fn load_collection(path: &Path) -> Result<(Collection, usize), SinkError> {
    let content = fs::read_to_string(path).await?;
    let mut collection = Collection::default();
    let mut lines = 0;
    for (n, line) in content.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
        lines += 1;
        match serde_json::from_str::<Document>(line) {
            Ok(doc) => collection.put(doc),
            // A torn last line after a crash is expected; anything else is logged the same way.
            Err(e) => tracing::warn!(path = %path.display(), line = n + 1, error = %e, "skipping unreadable document"),
        }
    }
    Ok((collection, lines))
}

async fn rewrite(path: &Path, docs: &[Document]) -> Result<(), SinkError> {
    let mut out = Vec::new();
    for doc in docs {
        serde_json::to_writer(&mut out, doc)?;
        out.push(b'\n');
    }
    let tmp = path.with_extension("jsonl.tmp");
    fs::write(&tmp, out).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

fn merge(existing: &Value, patch: Value) -> Value {
    match (existing, patch) {
        (Value::Object(old), Value::Object(new)) => {
            let mut merged = old.clone();
            merged.extend(new);
            Value::Object(merged)
        }
        (_, patch) => patch,
    }
}

fn select(docs: &[Document], query: &DocQuery) -> Vec<Document> {
    // Reverse first so equal timestamps keep newest-inserted first after the stable sort.
    let mut results: Vec<Document> = docs
        .iter()
        .rev()
        .filter(|doc| query.filters.iter().all(|f| f.matches(&doc.data)))
        .cloned()
        .collect();
    results.sort_by(|a, b| b.stored_at.cmp(&a.stored_at));
    if let Some(limit) = query.limit {
        results.truncate(limit);
    }
    results
}

#[async_trait]
impl DocumentStore for JsonLinesStore {
    async fn insert(&self, collection: &str, data: Value) -> Result<String, SinkError> {
        let _write = self.writes.lock().await;
        let doc = Document { id: Uuid::new_v4().to_string(), stored_at: OffsetDateTime::now_utc(), data };
        self.append(collection, &doc).await?;
        let id = doc.id.clone();
        self.remember(collection, doc);
        Ok(id)
    }

    async fn upsert(&self, collection: &str, id: &str, data: Value) -> Result<(), SinkError> {
        let _write = self.writes.lock().await;
        let merged = match self.lookup(collection, id).await? {
            Some(old) => merge(&old.data, data),
            None => data,
        };
        let doc = Document { id: id.to_string(), stored_at: OffsetDateTime::now_utc(), data: merged };
        self.append(collection, &doc).await?;
        self.remember(collection, doc);
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, SinkError> {
        self.lookup(collection, id).await
    }

    async fn query(&self, collection: &str, query: &DocQuery) -> Result<Vec<Document>, SinkError> {
        if self.is_history(collection) {
            let scanned = self.scan(collection).await?;
            return Ok(select(&scanned.docs, query));
        }
        let collections = self.collections.lock();
        Ok(collections.get(collection).map(|c| select(&c.docs, query)).unwrap_or_default())
    }
}

//! Document Store Module
//!
//! The seam between the controller and whatever document database backs the
//! local and remote sides. Two implementations ship here: an in-process
//! store for the `memory` adapter and a CouchDB database over HTTP.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::client::Reply;
use crate::config::Adapter;
use crate::storage::Credentials;

/// Default server for the `http` adapter when the local name is not a URL.
const LOCAL_COUCH_URL: &str = "http://localhost:5984/";

/// Result of writing a single document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    pub id: String,
    pub rev: String,
}

/// Documents changed since a checkpoint.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    pub docs: Vec<Value>,
    pub last_seq: String,
}

/// A CouchDB-style document database.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Database name or URL, for logging.
    fn name(&self) -> &str;

    async fn info(&self) -> Result<Value, StoreError>;

    async fn get(&self, id: &str) -> Result<Value, StoreError>;

    /// Write a document; `_rev` must match the current revision when updating.
    async fn put(&self, doc: Value) -> Result<PutResult, StoreError>;

    /// Documents changed after `since` (`"0"` for everything).
    async fn changes(&self, since: &str) -> Result<ChangeBatch, StoreError>;

    /// Write replicated documents, keeping their revisions.
    async fn bulk_docs(&self, docs: Vec<Value>) -> Result<usize, StoreError>;

    async fn close(&self) -> Result<(), StoreError>;

    /// Delete the database and everything in it.
    async fn destroy(&self) -> Result<(), StoreError>;
}

/// Opens local and remote stores.
pub trait StoreFactory: Send + Sync {
    fn open_local(&self, adapter: Adapter, name: &str) -> Result<Arc<dyn DocumentStore>, StoreError>;

    /// Open a remote database without creating it. Inline credentials are
    /// attached to every request when given.
    fn open_remote(
        &self,
        url: &str,
        auth: Option<&Credentials>,
    ) -> Result<Arc<dyn DocumentStore>, StoreError>;
}

/// Production stores sharing the session client's cookie jar.
#[derive(Clone)]
pub struct DefaultStores {
    http: reqwest::Client,
}

impl DefaultStores {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl StoreFactory for DefaultStores {
    fn open_local(&self, adapter: Adapter, name: &str) -> Result<Arc<dyn DocumentStore>, StoreError> {
        if name.is_empty() {
            return Err(StoreError::Config("Local database name not specified".into()));
        }

        info!("Setting up local db {} using {}", name, adapter);
        match adapter {
            Adapter::Memory => Ok(Arc::new(MemoryStore::new(name))),
            Adapter::Http => {
                let url = match Url::parse(name) {
                    Ok(url) => url.to_string(),
                    Err(_) => format!("{}{}", LOCAL_COUCH_URL, name),
                };
                Ok(Arc::new(HttpStore::new(self.http.clone(), &url, None)?))
            }
        }
    }

    fn open_remote(
        &self,
        url: &str,
        auth: Option<&Credentials>,
    ) -> Result<Arc<dyn DocumentStore>, StoreError> {
        info!("Setting up remote db {}", url);
        Ok(Arc::new(HttpStore::new(self.http.clone(), url, auth.cloned())?))
    }
}

fn rev_generation(rev: &str) -> u64 {
    rev.split_once('-')
        .and_then(|(generation, _)| generation.parse().ok())
        .unwrap_or(0)
}

fn doc_id(doc: &Value) -> Option<&str> {
    doc.get("_id").and_then(Value::as_str)
}

fn doc_rev(doc: &Value) -> Option<&str> {
    doc.get("_rev").and_then(Value::as_str)
}

#[derive(Default)]
struct MemoryInner {
    docs: BTreeMap<String, Value>,
    /// seq -> doc id, one entry per document (its latest write).
    by_seq: BTreeMap<u64, String>,
    seq_of: HashMap<String, u64>,
    update_seq: u64,
    closed: bool,
}

impl MemoryInner {
    fn record(&mut self, id: &str, doc: Value) {
        self.update_seq += 1;
        if let Some(old) = self.seq_of.insert(id.to_string(), self.update_seq) {
            self.by_seq.remove(&old);
        }
        self.by_seq.insert(self.update_seq, id.to_string());
        self.docs.insert(id.to_string(), doc);
    }
}

/// In-process document store.
pub struct MemoryStore {
    name: String,
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    fn with_open<T>(
        &self,
        f: impl FnOnce(&mut MemoryInner) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::Closed(self.name.clone()))?;
        if inner.closed {
            return Err(StoreError::Closed(self.name.clone()));
        }
        f(&mut inner)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn info(&self) -> Result<Value, StoreError> {
        self.with_open(|inner| {
            Ok(json!({
                "db_name": self.name,
                "doc_count": inner.docs.len(),
                "update_seq": inner.update_seq.to_string(),
                "adapter": "memory",
            }))
        })
    }

    async fn get(&self, id: &str) -> Result<Value, StoreError> {
        self.with_open(|inner| {
            inner
                .docs
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(id.to_string()))
        })
    }

    async fn put(&self, mut doc: Value) -> Result<PutResult, StoreError> {
        let id = doc_id(&doc)
            .ok_or_else(|| StoreError::Invalid("document is missing _id".into()))?
            .to_string();

        self.with_open(|inner| {
            let current = inner.docs.get(&id).and_then(doc_rev).map(str::to_string);
            if current.as_deref() != doc_rev(&doc) {
                return Err(StoreError::Conflict(id.clone()));
            }

            let generation = current.as_deref().map(rev_generation).unwrap_or(0) + 1;
            let rev = format!("{}-{:016x}", generation, inner.update_seq + 1);
            doc["_rev"] = Value::String(rev.clone());
            inner.record(&id, doc);

            Ok(PutResult { id: id.clone(), rev })
        })
    }

    async fn changes(&self, since: &str) -> Result<ChangeBatch, StoreError> {
        let since: u64 = since.parse().unwrap_or(0);
        self.with_open(|inner| {
            let docs = inner
                .by_seq
                .range(since + 1..)
                .filter_map(|(_, id)| inner.docs.get(id).cloned())
                .collect();
            Ok(ChangeBatch {
                docs,
                last_seq: inner.update_seq.to_string(),
            })
        })
    }

    async fn bulk_docs(&self, docs: Vec<Value>) -> Result<usize, StoreError> {
        self.with_open(|inner| {
            let mut written = 0;
            for doc in docs {
                let (Some(id), Some(rev)) = (doc_id(&doc), doc_rev(&doc)) else {
                    continue;
                };
                let id = id.to_string();
                let incoming = (rev_generation(rev), rev.to_string());

                let newer = match inner.docs.get(&id).and_then(doc_rev) {
                    Some(existing) => incoming > (rev_generation(existing), existing.to_string()),
                    None => true,
                };
                if newer {
                    inner.record(&id, doc);
                    written += 1;
                }
            }
            Ok(written)
        })
    }

    async fn close(&self) -> Result<(), StoreError> {
        if let Ok(mut inner) = self.inner.lock() {
            inner.closed = true;
        }
        debug!("Closed memory store {}", self.name);
        Ok(())
    }

    async fn destroy(&self) -> Result<(), StoreError> {
        if let Ok(mut inner) = self.inner.lock() {
            *inner = MemoryInner {
                closed: true,
                ..MemoryInner::default()
            };
        }
        info!("Destroyed memory store {}", self.name);
        Ok(())
    }
}

#[derive(Deserialize)]
struct ChangesResponse {
    #[serde(default)]
    results: Vec<ChangeRow>,
    last_seq: Value,
}

#[derive(Deserialize)]
struct ChangeRow {
    #[serde(default)]
    doc: Option<Value>,
}

#[derive(Deserialize)]
struct PutReply {
    id: String,
    rev: String,
}

fn seq_string(seq: &Value) -> String {
    match seq {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A CouchDB database reached over HTTP.
pub struct HttpStore {
    url: String,
    base: Url,
    client: reqwest::Client,
    auth: Option<Credentials>,
    closed: AtomicBool,
}

impl HttpStore {
    pub fn new(client: reqwest::Client, url: &str, auth: Option<Credentials>) -> Result<Self, StoreError> {
        let base = Url::parse(url).map_err(|e| StoreError::Config(format!("{}: {}", url, e)))?;
        if base.cannot_be_a_base() {
            return Err(StoreError::Config(format!("{}: not a database url", url)));
        }
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            base,
            client,
            auth,
            closed: AtomicBool::new(false),
        })
    }

    /// Database URL with `segments` appended, each percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Config(format!("{}: not a database url", self.url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, segments: &[&str]) -> Result<reqwest::RequestBuilder, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed(self.url.clone()));
        }

        let builder = self.client.request(method, self.endpoint(segments)?);
        Ok(match &self.auth {
            Some(creds) => builder.basic_auth(&creds.username, Some(&creds.password)),
            None => builder,
        })
    }

    async fn send<T: for<'de> Deserialize<'de>>(&self, builder: reqwest::RequestBuilder) -> Result<T, StoreError> {
        let response = builder
            .send()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;
        let status = response.status();

        let reply = response
            .json::<Reply<T>>()
            .await
            .map_err(|e| StoreError::Parse(format!("{} ({})", e, status)))?;

        reply.into_result().map_err(|err| match err.error.as_str() {
            "not_found" => StoreError::NotFound(err.to_string()),
            "conflict" => StoreError::Conflict(err.to_string()),
            _ => StoreError::Server(err.to_string()),
        })
    }
}

#[async_trait]
impl DocumentStore for HttpStore {
    fn name(&self) -> &str {
        &self.url
    }

    async fn info(&self) -> Result<Value, StoreError> {
        self.send(self.request(reqwest::Method::GET, &[])?).await
    }

    async fn get(&self, id: &str) -> Result<Value, StoreError> {
        self.send(self.request(reqwest::Method::GET, &[id])?).await
    }

    async fn put(&self, doc: Value) -> Result<PutResult, StoreError> {
        let id = doc_id(&doc)
            .ok_or_else(|| StoreError::Invalid("document is missing _id".into()))?
            .to_string();
        let reply: PutReply = self
            .send(self.request(reqwest::Method::PUT, &[&id])?.json(&doc))
            .await?;
        Ok(PutResult {
            id: reply.id,
            rev: reply.rev,
        })
    }

    async fn changes(&self, since: &str) -> Result<ChangeBatch, StoreError> {
        let builder = self
            .request(reqwest::Method::GET, &["_changes"])?
            .query(&[("since", since), ("include_docs", "true")]);
        let response: ChangesResponse = self.send(builder).await?;

        Ok(ChangeBatch {
            docs: response.results.into_iter().filter_map(|row| row.doc).collect(),
            last_seq: seq_string(&response.last_seq),
        })
    }

    async fn bulk_docs(&self, docs: Vec<Value>) -> Result<usize, StoreError> {
        if docs.is_empty() {
            return Ok(0);
        }
        let count = docs.len();
        let builder = self
            .request(reqwest::Method::POST, &["_bulk_docs"])?
            .json(&json!({ "docs": docs, "new_edits": false }));
        let _: Value = self.send(builder).await?;
        Ok(count)
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        debug!("Closed remote store {}", self.url);
        Ok(())
    }

    async fn destroy(&self) -> Result<(), StoreError> {
        let _: Value = self.send(self.request(reqwest::Method::DELETE, &[])?).await?;
        self.closed.store(true, Ordering::SeqCst);
        info!("Destroyed remote store {}", self.url);
        Ok(())
    }
}

/// Document store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Document update conflict: {0}")]
    Conflict(String),

    #[error("Invalid document: {0}")]
    Invalid(String),

    #[error("Store is closed: {0}")]
    Closed(String),

    #[error("Store configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn memory_put_assigns_and_checks_revisions() {
        let store = MemoryStore::new("local");
        let first = store.put(json!({"_id": "todo", "title": "milk"})).await.unwrap();
        assert!(first.rev.starts_with("1-"));

        // Writing without the current revision is a conflict.
        let err = store.put(json!({"_id": "todo", "title": "eggs"})).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let second = store
            .put(json!({"_id": "todo", "_rev": first.rev, "title": "eggs"}))
            .await
            .unwrap();
        assert!(second.rev.starts_with("2-"));
        assert_eq!(store.get("todo").await.unwrap()["title"], "eggs");
    }

    #[tokio::test]
    async fn memory_changes_report_latest_write_once() {
        let store = MemoryStore::new("local");
        let a = store.put(json!({"_id": "a"})).await.unwrap();
        store.put(json!({"_id": "b"})).await.unwrap();
        store.put(json!({"_id": "a", "_rev": a.rev})).await.unwrap();

        let all = store.changes("0").await.unwrap();
        assert_eq!(all.docs.len(), 2);
        assert_eq!(all.last_seq, "3");

        let later = store.changes("2").await.unwrap();
        assert_eq!(later.docs.len(), 1);
        assert_eq!(later.docs[0]["_id"], "a");
    }

    #[tokio::test]
    async fn memory_bulk_docs_keeps_the_newest_revision() {
        let store = MemoryStore::new("local");
        let written = store
            .bulk_docs(vec![
                json!({"_id": "a", "_rev": "2-bb", "v": 2}),
                json!({"_id": "b"}),
            ])
            .await
            .unwrap();
        assert_eq!(written, 1);

        let written = store
            .bulk_docs(vec![json!({"_id": "a", "_rev": "1-aa", "v": 1})])
            .await
            .unwrap();
        assert_eq!(written, 0);
        assert_eq!(store.get("a").await.unwrap()["v"], 2);
    }

    #[tokio::test]
    async fn closed_memory_store_rejects_calls() {
        let store = MemoryStore::new("local");
        store.close().await.unwrap();
        assert!(matches!(store.info().await, Err(StoreError::Closed(_))));
    }

    #[tokio::test]
    async fn http_store_sends_inline_credentials() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/userdb-616c696365"))
            .and(header("authorization", "Basic YWxpY2U6cHcxMjM="))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"db_name": "userdb-616c696365"})))
            .mount(&mock)
            .await;

        let store = HttpStore::new(
            reqwest::Client::new(),
            &format!("{}/userdb-616c696365", mock.uri()),
            Some(Credentials::new("alice", "pw123")),
        )
        .unwrap();

        let info = store.info().await.unwrap();
        assert_eq!(info["db_name"], "userdb-616c696365");
    }

    #[tokio::test]
    async fn http_store_reads_changes_feed() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/db/_changes"))
            .and(query_param("since", "0"))
            .and(query_param("include_docs", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    {"seq": "1-x", "id": "a", "doc": {"_id": "a", "_rev": "1-a"}},
                    {"seq": "2-x", "id": "b", "deleted": true}
                ],
                "last_seq": "2-x"
            })))
            .mount(&mock)
            .await;

        let store = HttpStore::new(reqwest::Client::new(), &format!("{}/db", mock.uri()), None).unwrap();
        let batch = store.changes("0").await.unwrap();
        assert_eq!(batch.docs.len(), 1);
        assert_eq!(batch.last_seq, "2-x");
    }

    #[tokio::test]
    async fn http_store_maps_missing_database() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/db"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": "not_found", "reason": "Database does not exist."
            })))
            .mount(&mock)
            .await;

        let store = HttpStore::new(reqwest::Client::new(), &format!("{}/db", mock.uri()), None).unwrap();
        assert!(matches!(store.info().await, Err(StoreError::NotFound(_))));

        store.close().await.unwrap();
        assert!(matches!(store.info().await, Err(StoreError::Closed(_))));
    }

    #[tokio::test]
    async fn http_store_encodes_document_ids() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/db/notes%2F2024%3Fdraft%23a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_id": "notes/2024?draft#a", "_rev": "1-a"
            })))
            .mount(&mock)
            .await;
        Mock::given(method("PUT"))
            .and(path("/db/notes%2F2024%3Fdraft%23a"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "ok": true, "id": "notes/2024?draft#a", "rev": "2-b"
            })))
            .mount(&mock)
            .await;

        let store = HttpStore::new(reqwest::Client::new(), &format!("{}/db/", mock.uri()), None).unwrap();

        let doc = store.get("notes/2024?draft#a").await.unwrap();
        assert_eq!(doc["_rev"], "1-a");

        let written = store
            .put(json!({"_id": "notes/2024?draft#a", "_rev": "1-a"}))
            .await
            .unwrap();
        assert_eq!(written.rev, "2-b");
    }

    #[test]
    fn memory_adapter_needs_a_name() {
        let stores = DefaultStores::new(reqwest::Client::new());
        assert!(stores.open_local(Adapter::Memory, "").is_err());
        assert!(stores.open_local(Adapter::Memory, "user").is_ok());
        assert!(stores.open_remote("not a url", None).is_err());
    }
}

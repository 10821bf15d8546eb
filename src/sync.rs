//! Sync Module
//!
//! Continuous bidirectional replication between the local store and the
//! user's remote database. The controller only sees [`SyncEngine`] and the
//! [`SyncHandle`] it returns; [`ChangesSync`] is the stock engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::store::{DocumentStore, StoreError};

/// Which way documents moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Push,
    Pull,
}

/// Notifications from a running replication.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Change { direction: Direction, docs: usize },
    /// Both sides are caught up; waiting for new changes.
    Paused,
    Complete,
    Error(String),
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Keep replicating after catching up.
    pub live: bool,
    /// Keep going after errors.
    pub retry: bool,
    pub poll_interval: Duration,
    pub retry_delay: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            live: true,
            retry: true,
            poll_interval: Duration::from_secs(5),
            retry_delay: Duration::from_secs(10),
        }
    }
}

/// A running replication job.
///
/// Dropping the handle cancels the job.
pub struct SyncHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    events: Option<mpsc::UnboundedReceiver<SyncEvent>>,
}

impl SyncHandle {
    pub fn new(
        cancel: CancellationToken,
        task: Option<JoinHandle<()>>,
        events: mpsc::UnboundedReceiver<SyncEvent>,
    ) -> Self {
        Self {
            cancel,
            task,
            events: Some(events),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && self.task.as_ref().map_or(true, |task| !task.is_finished())
    }

    /// Event stream; can be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.events.take()
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Starts replication between two stores.
pub trait SyncEngine: Send + Sync {
    fn sync(
        &self,
        local: Arc<dyn DocumentStore>,
        remote: Arc<dyn DocumentStore>,
        options: SyncOptions,
    ) -> SyncHandle;
}

/// Replicator driven by each side's changes feed.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChangesSync;

impl SyncEngine for ChangesSync {
    fn sync(
        &self,
        local: Arc<dyn DocumentStore>,
        remote: Arc<dyn DocumentStore>,
        options: SyncOptions,
    ) -> SyncHandle {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(local, remote, options, cancel.clone(), tx));
        SyncHandle::new(cancel, Some(task), rx)
    }
}

/// Replication checkpoints and the revisions already moved.
#[derive(Default)]
struct Checkpoint {
    pull_since: String,
    push_since: String,
    /// Latest revision of each document known to exist on both sides.
    seen: HashMap<String, String>,
}

impl Checkpoint {
    fn new() -> Self {
        Self {
            pull_since: "0".into(),
            push_since: "0".into(),
            seen: HashMap::new(),
        }
    }

    /// Documents whose revision the other side does not have yet.
    fn unseen(&self, docs: Vec<Value>) -> Vec<Value> {
        docs.into_iter()
            .filter(|doc| match revision(doc) {
                Some((id, rev)) => self.seen.get(id).map(String::as_str) != Some(rev),
                None => false,
            })
            .collect()
    }

    /// Record revisions once they are written on the other side.
    fn mark(&mut self, moved: Vec<(String, String)>) {
        self.seen.extend(moved);
    }
}

fn revision(doc: &Value) -> Option<(&str, &str)> {
    let id = doc.get("_id").and_then(Value::as_str)?;
    let rev = doc.get("_rev").and_then(Value::as_str)?;
    Some((id, rev))
}

fn revisions(docs: &[Value]) -> Vec<(String, String)> {
    docs.iter()
        .filter_map(revision)
        .map(|(id, rev)| (id.to_string(), rev.to_string()))
        .collect()
}

/// Write `docs` to `target`, marking them seen only if the write succeeds.
async fn transfer(
    target: &dyn DocumentStore,
    docs: Vec<Value>,
    checkpoint: &mut Checkpoint,
) -> Result<usize, StoreError> {
    if docs.is_empty() {
        return Ok(0);
    }
    let moved = revisions(&docs);
    let written = target.bulk_docs(docs).await?;
    checkpoint.mark(moved);
    Ok(written)
}

async fn run(
    local: Arc<dyn DocumentStore>,
    remote: Arc<dyn DocumentStore>,
    options: SyncOptions,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<SyncEvent>,
) {
    let mut checkpoint = Checkpoint::new();
    debug!("Starting sync {} <-> {}", local.name(), remote.name());

    loop {
        let delay = match replicate_once(local.as_ref(), remote.as_ref(), &mut checkpoint, &events).await {
            Ok(0) if !options.live => break,
            Ok(0) => {
                let _ = events.send(SyncEvent::Paused);
                options.poll_interval
            }
            Ok(_) => Duration::ZERO,
            Err(e) => {
                let _ = events.send(SyncEvent::Error(e.to_string()));
                if !options.retry {
                    return;
                }
                options.retry_delay
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let _ = events.send(SyncEvent::Complete);
}

/// One pull pass and one push pass; returns the number of documents moved.
async fn replicate_once(
    local: &dyn DocumentStore,
    remote: &dyn DocumentStore,
    checkpoint: &mut Checkpoint,
    events: &mpsc::UnboundedSender<SyncEvent>,
) -> Result<usize, StoreError> {
    let incoming = remote.changes(&checkpoint.pull_since).await?;
    let pulled = checkpoint.unseen(incoming.docs);
    let pulled = transfer(local, pulled, checkpoint).await?;
    checkpoint.pull_since = incoming.last_seq;
    if pulled > 0 {
        let _ = events.send(SyncEvent::Change {
            direction: Direction::Pull,
            docs: pulled,
        });
    }

    let outgoing = local.changes(&checkpoint.push_since).await?;
    let pushed = checkpoint.unseen(outgoing.docs);
    let pushed = transfer(remote, pushed, checkpoint).await?;
    checkpoint.push_since = outgoing.last_seq;
    if pushed > 0 {
        let _ = events.send(SyncEvent::Change {
            direction: Direction::Push,
            docs: pushed,
        });
    }

    Ok(pulled + pushed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn quick(live: bool) -> SyncOptions {
        SyncOptions {
            live,
            retry: true,
            poll_interval: Duration::from_millis(10),
            retry_delay: Duration::from_millis(10),
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SyncEvent>) -> SyncEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for sync event")
            .expect("sync channel closed")
    }

    #[tokio::test]
    async fn one_shot_sync_moves_documents_both_ways() {
        let local = Arc::new(MemoryStore::new("local"));
        let remote = Arc::new(MemoryStore::new("remote"));
        local.put(json!({"_id": "from-local"})).await.unwrap();
        remote.put(json!({"_id": "from-remote"})).await.unwrap();

        let mut handle = ChangesSync.sync(local.clone(), remote.clone(), quick(false));
        let mut rx = handle.take_events().unwrap();

        loop {
            if next_event(&mut rx).await == SyncEvent::Complete {
                break;
            }
        }

        assert!(local.get("from-remote").await.is_ok());
        assert!(remote.get("from-local").await.is_ok());
    }

    #[tokio::test]
    async fn live_sync_pauses_and_stops_on_cancel() {
        let local = Arc::new(MemoryStore::new("local"));
        let remote = Arc::new(MemoryStore::new("remote"));

        let mut handle = ChangesSync.sync(local, remote, quick(true));
        let mut rx = handle.take_events().unwrap();
        assert!(handle.is_active());

        assert_eq!(next_event(&mut rx).await, SyncEvent::Paused);

        handle.cancel();
        assert!(!handle.is_active());
        loop {
            if next_event(&mut rx).await == SyncEvent::Complete {
                break;
            }
        }
    }

    #[tokio::test]
    async fn errors_are_reported_and_retried() {
        let local = Arc::new(MemoryStore::new("local"));
        let remote = Arc::new(MemoryStore::new("remote"));
        remote.close().await.unwrap();

        let mut handle = ChangesSync.sync(local, remote, quick(true));
        let mut rx = handle.take_events().unwrap();

        assert!(matches!(next_event(&mut rx).await, SyncEvent::Error(_)));
        assert!(matches!(next_event(&mut rx).await, SyncEvent::Error(_)));
        drop(handle);
    }

    #[test]
    fn checkpoint_skips_revisions_already_moved() {
        let mut checkpoint = Checkpoint::new();
        let docs = vec![json!({"_id": "a", "_rev": "1-x"}), json!({"_id": "b"})];

        // Filtering alone does not mark anything as moved.
        assert_eq!(checkpoint.unseen(docs.clone()).len(), 1);
        assert_eq!(checkpoint.unseen(docs.clone()).len(), 1);

        checkpoint.mark(revisions(&docs));
        assert!(checkpoint.unseen(docs).is_empty());

        // A newer revision of the same document is sent again.
        assert_eq!(checkpoint.unseen(vec![json!({"_id": "a", "_rev": "2-y"})]).len(), 1);
    }

    #[test]
    fn checkpoint_keeps_one_entry_per_document() {
        let mut checkpoint = Checkpoint::new();
        checkpoint.mark(vec![("a".into(), "1-x".into())]);
        checkpoint.mark(vec![("a".into(), "2-y".into())]);
        assert_eq!(checkpoint.seen.len(), 1);
        assert_eq!(checkpoint.seen["a"], "2-y");
    }

    /// Memory store whose first bulk write fails.
    struct FlakyStore {
        inner: MemoryStore,
        failed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl DocumentStore for FlakyStore {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn info(&self) -> Result<Value, StoreError> {
            self.inner.info().await
        }

        async fn get(&self, id: &str) -> Result<Value, StoreError> {
            self.inner.get(id).await
        }

        async fn put(&self, doc: Value) -> Result<crate::store::PutResult, StoreError> {
            self.inner.put(doc).await
        }

        async fn changes(&self, since: &str) -> Result<crate::store::ChangeBatch, StoreError> {
            self.inner.changes(since).await
        }

        async fn bulk_docs(&self, docs: Vec<Value>) -> Result<usize, StoreError> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(StoreError::Network("connection reset".into()));
            }
            self.inner.bulk_docs(docs).await
        }

        async fn close(&self) -> Result<(), StoreError> {
            self.inner.close().await
        }

        async fn destroy(&self) -> Result<(), StoreError> {
            self.inner.destroy().await
        }
    }

    #[tokio::test]
    async fn failed_push_is_retried() {
        let local = Arc::new(MemoryStore::new("local"));
        let remote = Arc::new(FlakyStore {
            inner: MemoryStore::new("remote"),
            failed: AtomicBool::new(false),
        });
        local.put(json!({"_id": "doc1", "title": "milk"})).await.unwrap();

        let mut handle = ChangesSync.sync(local, remote.clone(), quick(true));
        let mut rx = handle.take_events().unwrap();

        assert!(matches!(next_event(&mut rx).await, SyncEvent::Error(_)));
        loop {
            if next_event(&mut rx).await == SyncEvent::Paused {
                break;
            }
        }

        assert_eq!(remote.get("doc1").await.unwrap()["title"], "milk");
        drop(handle);
    }
}

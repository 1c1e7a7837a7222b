//! Realtime key-value store access.
//!
//! Values are JSON addressed by `/`-separated paths (`pond-a/feed_kg`,
//! `feed_logs/pond-a/2026-10-14/08:00`). The store offers point reads, full
//! value replacement, a listing of a partition's direct children, and a
//! change stream. Nothing is validated here; callers normalize before writing.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Capacity of the change stream before slow listeners start lagging.
pub const CHANGE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct Change {
    pub path: String,
    pub value: Value,
}

#[async_trait]
pub trait RealtimeStore: Send + Sync {
    /// Point read. `Ok(None)` when nothing is stored at `path`.
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Replace the value at `path` and announce the change.
    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Direct children of `path` as `(key, value)`, ordered by key.
    async fn children(&self, path: &str) -> Result<Vec<(String, Value)>, StoreError>;

    /// Every successful `set`, in the order the store applied them.
    fn changes(&self) -> broadcast::Receiver<Change>;
}

pub type SharedStore = Arc<dyn RealtimeStore>;

/// `changed` is `watched` itself or lies below it.
pub fn is_under(changed: &str, watched: &str) -> bool {
    changed == watched
        || (changed.len() > watched.len()
            && changed.starts_with(watched)
            && changed.as_bytes()[watched.len()] == b'/')
}

/// Direct-child key of `parent` for `path`, if `path` is exactly one level
/// below it.
pub(crate) fn child_key<'a>(path: &'a str, parent: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(parent)?.strip_prefix('/')?;
    (!rest.is_empty() && !rest.contains('/')).then_some(rest)
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// Live listener handle. Dropping it stops delivery.
#[must_use = "dropping a Subscription stops delivery"]
pub struct Subscription {
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn from_tasks(tasks: Vec<JoinHandle<()>>) -> Self {
        Self { tasks }
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for t in &self.tasks {
            t.abort();
        }
    }
}

enum Wake {
    Changed(Change),
    Resync,
    Closed,
}

async fn next_wake(rx: &mut broadcast::Receiver<Change>, path: &str) -> Wake {
    loop {
        match rx.recv().await {
            Ok(c) if is_under(&c.path, path) => return Wake::Changed(c),
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                debug!(path, skipped, "store listener lagged, re-reading");
                return Wake::Resync;
            }
            Err(RecvError::Closed) => return Wake::Closed,
        }
    }
}

/// Deliver the value at `path` now and after every change to it.
/// A stored JSON `null` is delivered as `None`.
pub(crate) fn watch_value<F>(store: SharedStore, path: String, mut on_value: F) -> JoinHandle<()>
where
    F: FnMut(Option<Value>) + Send + 'static,
{
    // Subscribe before the first read so no change slips between them.
    let mut rx = store.changes();
    tokio::spawn(async move {
        let mut resync = true;
        loop {
            if resync {
                match store.get(&path).await {
                    Ok(v) => on_value(v.filter(|v| !v.is_null())),
                    Err(e) => warn!(path = %path, "store read failed: {e}"),
                }
            }
            match next_wake(&mut rx, &path).await {
                Wake::Changed(c) if c.path == path => {
                    resync = false;
                    on_value(Some(c.value).filter(|v| !v.is_null()));
                }
                Wake::Changed(_) | Wake::Resync => resync = true,
                Wake::Closed => break,
            }
        }
    })
}

/// Deliver the children of `path` now and after every change below it.
pub(crate) fn watch_children<F>(
    store: SharedStore,
    path: String,
    mut on_children: F,
) -> JoinHandle<()>
where
    F: FnMut(Vec<(String, Value)>) + Send + 'static,
{
    let mut rx = store.changes();
    tokio::spawn(async move {
        loop {
            match store.children(&path).await {
                Ok(children) => on_children(children),
                Err(e) => warn!(path = %path, "store children read failed: {e}"),
            }
            match next_wake(&mut rx, &path).await {
                Wake::Changed(_) | Wake::Resync => {}
                Wake::Closed => break,
            }
        }
    })
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Volatile store: `DB_URL=memory` and tests. Supports failure injection so
/// callers' error paths can be exercised.
pub struct MemoryStore {
    values: RwLock<BTreeMap<String, Value>>,
    tx: broadcast::Sender<Change>,
    fail_writes: AtomicBool,
    fail_reads: Mutex<HashSet<String>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            values: RwLock::new(BTreeMap::new()),
            tx,
            fail_writes: AtomicBool::new(false),
            fail_reads: Mutex::new(HashSet::new()),
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of successful writes so far.
    #[cfg(test)]
    pub(crate) fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn fail_reads_of(&self, path: &str) {
        self.fail_reads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string());
    }

    fn read_blocked(&self, path: &str) -> bool {
        self.fail_reads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(path)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        if self.read_blocked(path) {
            return Err(StoreError::Backend(format!("read of '{path}' refused")));
        }
        Ok(self.values.read().await.get(path).cloned())
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(format!("write of '{path}' refused")));
        }
        // Broadcast under the lock so announcements follow apply order.
        let mut values = self.values.write().await;
        values.insert(path.to_string(), value.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        // No receivers is fine.
        let _ = self.tx.send(Change {
            path: path.to_string(),
            value,
        });
        drop(values);
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<(String, Value)>, StoreError> {
        if self.read_blocked(path) {
            return Err(StoreError::Backend(format!("read of '{path}' refused")));
        }
        let prefix = format!("{path}/");
        let values = self.values.read().await;
        Ok(values
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, v)| child_key(k, path).map(|key| (key.to_string(), v.clone())))
            .collect())
    }

    fn changes(&self) -> broadcast::Receiver<Change> {
        self.tx.subscribe()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

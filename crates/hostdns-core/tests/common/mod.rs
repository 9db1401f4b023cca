//! Test doubles and common utilities for architecture contract tests
//!
//! The store double keeps a flat map of leaf keys and derives directories
//! from key paths, the way a hierarchical store presents them. Writes are
//! broadcast to every open watch whose prefix overlaps the written key.

#![allow(dead_code)]

use hostdns_core::error::{Error, Result};
use hostdns_core::traits::{
    ChangeEvent, DnsProvider, KvStore, KvTree, NodeId, RecordSet, UpsertResult, WatchStream,
};
use hostdns_core::{EngineConfig, EngineEvent, ReconcileEngine};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;

/// How long a test waits for an expected engine event
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

struct WatchRegistration {
    prefix: String,
    tx: mpsc::UnboundedSender<Result<ChangeEvent>>,
}

struct HeldRead {
    path: String,
    hold: GetHold,
}

/// Handle to a store read that blocks until released
#[derive(Clone, Default)]
pub struct GetHold {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl GetHold {
    /// Wait until the held read has started
    pub async fn entered(&self) {
        tokio::time::timeout(EVENT_TIMEOUT, self.entered.notified())
            .await
            .expect("timed out waiting for the held read");
    }

    /// Let the held read complete
    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Default)]
struct StoreState {
    leaves: BTreeMap<String, String>,
    index: u64,
    watches: Vec<WatchRegistration>,
    failing_gets: usize,
    held_read: Option<HeldRead>,
}

/// In-memory KvStore with controllable writes and failures
#[derive(Clone, Default)]
pub struct MockKvStore {
    state: Arc<Mutex<StoreState>>,
    get_call_count: Arc<AtomicUsize>,
    watch_call_count: Arc<AtomicUsize>,
}

impl MockKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a leaf without notifying watchers
    pub fn seed(&self, key: &str, value: &str) -> &Self {
        let mut state = self.state.lock().unwrap();
        state.leaves.insert(key.to_string(), value.to_string());
        state.index += 1;
        self
    }

    /// Write a leaf and notify watchers
    pub fn set(&self, key: &str, value: &str) {
        let mut state = self.state.lock().unwrap();
        let previous = state.leaves.insert(key.to_string(), value.to_string());
        state.index += 1;
        broadcast(&mut state, ChangeEvent::set(key, value, previous));
    }

    /// Remove a leaf or a whole directory and notify watchers
    pub fn delete(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        let previous = state.leaves.remove(key);
        let dir = format!("{}/", key.trim_end_matches('/'));
        state.leaves.retain(|leaf, _| !leaf.starts_with(&dir));
        state.index += 1;
        broadcast(&mut state, ChangeEvent::delete(key, previous));
    }

    /// Make the next `count` reads fail with a store error
    pub fn fail_next_gets(&self, count: usize) {
        self.state.lock().unwrap().failing_gets = count;
    }

    /// Block the next read of exactly `path` until the returned hold is released
    pub fn hold_next_get(&self, path: &str) -> GetHold {
        let hold = GetHold::default();
        self.state.lock().unwrap().held_read = Some(HeldRead {
            path: path.to_string(),
            hold: hold.clone(),
        });
        hold
    }

    /// End every open watch on exactly `prefix` with an error
    pub fn fail_watches(&self, prefix: &str) {
        let mut state = self.state.lock().unwrap();
        state.watches.retain(|watch| {
            if watch.prefix == prefix {
                let _ = watch.tx.send(Err(Error::watch("injected watch failure")));
                false
            } else {
                true
            }
        });
    }

    /// Number of watches on `prefix` whose consumer is still alive
    pub fn active_watches(&self, prefix: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .watches
            .iter()
            .filter(|watch| watch.prefix == prefix && !watch.tx.is_closed())
            .count()
    }

    /// Number of watches with a live consumer, on any prefix
    pub fn total_active_watches(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.watches.iter().filter(|watch| !watch.tx.is_closed()).count()
    }

    /// Poll until exactly `expected` live watches exist on `prefix`
    pub async fn wait_for_watches(&self, prefix: &str, expected: usize) -> bool {
        let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if self.active_watches(prefix) == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    /// Get the number of times get() was called
    pub fn get_call_count(&self) -> usize {
        self.get_call_count.load(Ordering::SeqCst)
    }

    /// Get the number of times watch() was called
    pub fn watch_call_count(&self) -> usize {
        self.watch_call_count.load(Ordering::SeqCst)
    }
}

fn broadcast(state: &mut StoreState, event: ChangeEvent) {
    state.watches.retain(|watch| {
        if overlaps(&watch.prefix, &event.key) {
            watch.tx.send(Ok(event.clone())).is_ok()
        } else {
            !watch.tx.is_closed()
        }
    });
}

/// Whether `key` lies under `prefix`, or `prefix` lies under a deleted `key`
fn overlaps(prefix: &str, key: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    let key = key.trim_end_matches('/');
    let under = |inner: &str, outer: &str| {
        outer.is_empty() || inner == outer || inner.starts_with(&format!("{}/", outer))
    };
    under(key, prefix) || under(prefix, key)
}

fn build_tree(leaves: &BTreeMap<String, String>, path: &str, index: u64) -> Option<KvTree> {
    let root = path.trim_end_matches('/');
    if let Some(value) = leaves.get(root) {
        return Some(KvTree::leaf(root, value.as_str()).with_index(index));
    }

    let dir_prefix = format!("{}/", root);
    let mut tree = KvTree::dir(root).with_index(index);
    let mut dirs: HashMap<String, NodeId> = HashMap::new();
    let mut found = false;

    for (key, value) in leaves.range(dir_prefix.clone()..) {
        let Some(relative) = key.strip_prefix(&dir_prefix) else {
            break;
        };
        found = true;

        let segments: Vec<&str> = relative.split('/').collect();
        let mut parent = KvTree::ROOT;
        let mut current = root.to_string();
        for segment in &segments[..segments.len() - 1] {
            current = format!("{}/{}", current, segment);
            parent = *dirs
                .entry(current.clone())
                .or_insert_with(|| tree.add_dir(parent, current.clone()));
        }
        tree.add_leaf(parent, key.as_str(), value.as_str());
    }

    found.then_some(tree)
}

#[async_trait::async_trait]
impl KvStore for MockKvStore {
    async fn get(&self, path: &str) -> Result<KvTree> {
        self.get_call_count.fetch_add(1, Ordering::SeqCst);

        let held = {
            let mut state = self.state.lock().unwrap();
            if state.held_read.as_ref().is_some_and(|held| held.path == path) {
                state.held_read.take()
            } else {
                None
            }
        };
        if let Some(HeldRead { hold, .. }) = held {
            hold.entered.notify_one();
            hold.release.notified().await;
        }

        let mut state = self.state.lock().unwrap();
        if state.failing_gets > 0 {
            state.failing_gets -= 1;
            return Err(Error::store("injected read failure"));
        }

        build_tree(&state.leaves, path, state.index)
            .ok_or_else(|| Error::not_found(format!("Key not found: {}", path)))
    }

    fn watch(&self, prefix: &str, _after_index: Option<u64>) -> WatchStream {
        self.watch_call_count.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().watches.push(WatchRegistration {
            prefix: prefix.to_string(),
            tx,
        });

        Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx))
    }

    fn store_name(&self) -> &'static str {
        "mock"
    }
}

/// A mock DnsProvider that records every upsert
#[derive(Clone, Default)]
pub struct MockDnsProvider {
    upserts: Arc<Mutex<Vec<RecordSet>>>,
    fail: Arc<Mutex<bool>>,
}

impl MockDnsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following upsert fail
    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock().unwrap() = failing;
    }

    /// Get the number of times upsert_record() was called
    pub fn upsert_call_count(&self) -> usize {
        self.upserts.lock().unwrap().len()
    }

    /// Poll until at least `expected` upserts were received
    pub async fn wait_for_upserts(&self, expected: usize) -> bool {
        let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if self.upsert_call_count() >= expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    /// The most recent record set received for `name`
    pub fn last_upsert_for(&self, name: &str) -> Option<RecordSet> {
        self.upserts_for(name).pop()
    }

    /// Every record set received for `name`, in call order
    pub fn upserts_for(&self, name: &str) -> Vec<RecordSet> {
        self.upserts
            .lock()
            .unwrap()
            .iter()
            .filter(|set| set.name == name)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl DnsProvider for MockDnsProvider {
    async fn upsert_record(&self, record_set: &RecordSet) -> Result<UpsertResult> {
        if *self.fail.lock().unwrap() {
            return Err(Error::provider("mock", "injected upsert failure"));
        }

        let mut upserts = self.upserts.lock().unwrap();
        let previous = upserts.iter().rev().find(|set| set.name == record_set.name);
        let result = match previous {
            None => UpsertResult::Created,
            Some(previous) if previous.values == record_set.values => UpsertResult::Unchanged,
            Some(previous) => UpsertResult::Updated {
                added: record_set.values.difference(&previous.values).count(),
                removed: previous.values.difference(&record_set.values).count(),
            },
        };
        upserts.push(record_set.clone());

        Ok(result)
    }

    fn provider_name(&self) -> &'static str {
        "mock"
    }
}

/// Engine settings with a short retry delay
pub fn test_config() -> EngineConfig {
    EngineConfig::default().with_watch_retry_delay_ms(50)
}

/// A running engine plus the handles a test needs to drive it
pub struct RunningEngine {
    pub handle: JoinHandle<Result<()>>,
    pub shutdown_tx: oneshot::Sender<()>,
    pub events: mpsc::Receiver<EngineEvent>,
}

impl RunningEngine {
    /// Send the shutdown signal and wait for the engine to return
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        tokio::time::timeout(EVENT_TIMEOUT, self.handle)
            .await
            .expect("engine should stop within the timeout")
            .expect("engine task should not panic")
    }
}

/// Construct and spawn an engine over the given doubles
pub fn start_engine(
    store: &MockKvStore,
    provider: &MockDnsProvider,
    config: EngineConfig,
) -> RunningEngine {
    let (engine, events) = ReconcileEngine::new(
        Arc::new(store.clone()),
        Arc::new(provider.clone()),
        config,
    )
    .expect("engine construction succeeds");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move { engine.run_with_shutdown(Some(shutdown_rx)).await });

    RunningEngine {
        handle,
        shutdown_tx,
        events,
    }
}

/// Receive events until one satisfies `predicate`
///
/// Panics if no such event arrives within [`EVENT_TIMEOUT`].
pub async fn wait_for<F>(events: &mut mpsc::Receiver<EngineEvent>, mut predicate: F) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    let search = async {
        while let Some(event) = events.recv().await {
            if predicate(&event) {
                return Some(event);
            }
        }
        None
    };

    tokio::time::timeout(EVENT_TIMEOUT, search)
        .await
        .expect("timed out waiting for engine event")
        .expect("event channel closed before the expected event")
}

/// Wait until generation `generation` is watching
pub async fn wait_until_watching(events: &mut mpsc::Receiver<EngineEvent>, generation: u64) {
    wait_for(events, |event| {
        matches!(
            event,
            EngineEvent::StateChanged { state: hostdns_core::EngineState::Watching, generation: g }
                if *g == generation
        )
    })
    .await;
}

/// Wait for a successful upsert of `domain`
pub async fn wait_for_upsert(events: &mut mpsc::Receiver<EngineEvent>, domain: &str) -> RecordSet {
    match wait_for(events, |event| {
        matches!(event, EngineEvent::SyncSucceeded { record_set, .. } if record_set.name == domain)
    })
    .await
    {
        EngineEvent::SyncSucceeded { record_set, .. } => record_set,
        _ => unreachable!(),
    }
}

/// Collect the address values of a record set as plain strings
pub fn values(record_set: &RecordSet) -> Vec<&str> {
    record_set.values.iter().map(String::as_str).collect()
}

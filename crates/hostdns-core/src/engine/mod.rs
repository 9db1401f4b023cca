//! Reconciliation engine
//!
//! The ReconcileEngine is responsible for:
//! - Building the domain registry from the configuration prefix
//! - Converging every registered domain once per registry build
//! - Watching the registry's watch prefix and re-syncing affected domains
//! - Rebuilding the registry whenever the configuration changes
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  reload   ┌──────────────────┐
//! │  config watcher  │──────────▶│                  │
//! └──────────────────┘           │  ReconcileEngine │──▶ sync::resolve ──▶ DnsProvider
//! ┌──────────────────┐  changes  │  (single loop)   │      (store.get)     (upsert worker)
//! │  host watcher(g) │──────────▶│                  │
//! └──────────────────┘           └──────────────────┘
//! ```
//!
//! ## States
//!
//! ```text
//! Idle ──▶ BuildingRegistry ──▶ Watching ──(config change)──▶ Superseded ──▶ BuildingRegistry
//!                ▲                  │
//!                └──(watch error)───┘
//! ```
//!
//! ## Supersession
//!
//! Every registry build gets a new generation. The host watcher is tagged
//! with the generation it was started for and stops itself once the
//! generation moves on. A watcher may still deliver one event after that
//! point; the loop drops any event whose generation is not the active one.
//! A pending reload is always taken before queued host events.
//!
//! ## Upserts
//!
//! The loop never waits for the DNS provider. Each record set has its own
//! worker, so upserts of one name are applied in the order they were
//! resolved and only the newest pending set is kept.

mod upsert;

use crate::classifier::{Relevance, classify_all};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::registry::{HostConfig, RegistrySnapshot};
use crate::sync::{self, Resolution, SkipReason};
use crate::traits::{ChangeEvent, DnsProvider, KvStore, RecordSet, UpsertResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};
use upsert::UpsertWorkers;

/// Generation of the registry built at startup
const FIRST_GENERATION: u64 = 1;

/// Reconciliation loop states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not started yet
    Idle,
    /// Reading the configuration and converging all domains
    BuildingRegistry,
    /// Reacting to host changes for the active registry
    Watching,
    /// A configuration change invalidated the active registry
    Superseded,
}

/// Events emitted by the ReconcileEngine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Engine started
    Started,

    /// The loop entered a new state
    StateChanged {
        state: EngineState,
        generation: u64,
    },

    /// A registry was built from the configuration prefix
    RegistryBuilt {
        generation: u64,
        domains: usize,
        watch_prefix: String,
    },

    /// Rebuilding the registry failed (the engine keeps running)
    RegistryBuildFailed {
        generation: u64,
        error: String,
    },

    /// A `set` matched a domain but did not change its value
    ChangeSuppressed {
        domain: String,
        key: String,
    },

    /// An event from a superseded watcher was discarded
    StaleEventDropped {
        generation: u64,
        active_generation: u64,
    },

    /// A domain sync produced nothing to upsert
    SyncSkipped {
        domain: String,
        reason: SkipReason,
    },

    /// A record set upsert succeeded
    SyncSucceeded {
        record_set: RecordSet,
        result: UpsertResult,
    },

    /// Resolving or upserting a domain failed
    SyncFailed {
        domain: String,
        error: String,
    },

    /// Engine stopped
    Stopped {
        reason: String,
    },
}

/// Messages from the configuration watcher
enum ReloadSignal {
    /// Configuration changed, rebuild the registry
    Reload,
    /// The configuration watch failed in strict mode
    Fatal(Error),
}

/// A host watch item tagged with the generation of the watcher that produced it
struct HostWatchEvent {
    generation: u64,
    item: Result<ChangeEvent>,
}

/// Senders owned by the loop and handed to watcher tasks
struct Channels {
    reload: mpsc::Sender<ReloadSignal>,
    host: mpsc::Sender<HostWatchEvent>,
    generation: watch::Sender<u64>,
}

/// Core reconciliation engine
///
/// The engine runs a single loop that owns the active [`RegistrySnapshot`].
/// Configuration reloads and host changes reach it through two separate
/// capacity-1 channels and are handled strictly one at a time.
///
/// ## Lifecycle
///
/// 1. Create with [`ReconcileEngine::new()`]
/// 2. Start with [`ReconcileEngine::run()`]
/// 3. Engine runs until shutdown signal received
///
/// ## Errors
///
/// - Reading the configuration at startup fails → `run()` returns the error
/// - A resolve or upsert for one domain fails → reported, loop continues
/// - The host watch fails → the registry is rebuilt after the retry delay
/// - The configuration watch fails → retried, or fatal in strict mode
pub struct ReconcileEngine {
    /// Key-value store holding configuration and host keys
    store: Arc<dyn KvStore>,

    /// DNS provider receiving the upserts
    provider: Arc<dyn DnsProvider>,

    /// Engine settings
    config: EngineConfig,

    /// Event sender for external monitoring
    event_tx: mpsc::Sender<EngineEvent>,
}

impl ReconcileEngine {
    /// Create a new reconciliation engine
    ///
    /// # Returns
    ///
    /// A tuple of (engine, event_receiver) where event_receiver yields engine events
    pub fn new(
        store: Arc<dyn KvStore>,
        provider: Arc<dyn DnsProvider>,
        config: EngineConfig,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.event_channel_capacity);

        let engine = Self {
            store,
            provider,
            config,
            event_tx: tx,
        };

        Ok((engine, rx))
    }

    /// Run the engine until SIGINT
    ///
    /// # Returns
    ///
    /// - `Ok(())`: Clean shutdown
    /// - `Err(Error)`: Fatal error (startup read failure, strict config watch failure)
    pub async fn run(&self) -> Result<()> {
        self.run_internal(None).await
    }

    /// Run the engine until `shutdown_rx` fires (or its sender is dropped)
    ///
    /// Used by the daemon, which maps its own signal handling onto the
    /// channel, and by tests that need a controlled shutdown.
    pub async fn run_with_shutdown(
        &self,
        shutdown_rx: Option<oneshot::Receiver<()>>,
    ) -> Result<()> {
        self.run_internal(shutdown_rx).await
    }

    async fn run_internal(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        self.emit_event(EngineEvent::Started);
        self.set_state(EngineState::Idle, 0);

        let (reload_tx, mut reload_rx) = mpsc::channel(1);
        let (host_tx, mut host_rx) = mpsc::channel(1);
        let (generation_tx, _) = watch::channel(0u64);
        let channels = Channels {
            reload: reload_tx,
            host: host_tx,
            generation: generation_tx,
        };
        let mut upserts = UpsertWorkers::new(Arc::clone(&self.provider), self.event_tx.clone());

        // Without a correct starting state there is nothing to reconcile
        let mut next_generation = FIRST_GENERATION;
        let mut current = match self.rebuild(next_generation, &channels, &mut upserts).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Failed to build initial registry: {}", e);
                self.emit_event(EngineEvent::Stopped {
                    reason: format!("Initial registry build failed: {}", e),
                });
                return Err(e);
            }
        };

        let config_watcher = self.spawn_config_watcher(current.index(), channels.reload.clone());

        let shutdown = wait_for_shutdown(shutdown_rx);
        tokio::pin!(shutdown);

        // Main event loop
        let result = loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break Ok(());
                }

                Some(signal) = reload_rx.recv() => match signal {
                    ReloadSignal::Reload => {
                        info!("Configuration changed, rebuilding registry");
                        self.set_state(EngineState::Superseded, current.generation());
                        next_generation += 1;
                        let rebuilt = self.try_rebuild(next_generation, &channels, &mut upserts).await;
                        if let Some(snapshot) = rebuilt {
                            current = snapshot;
                        }
                    }
                    ReloadSignal::Fatal(e) => {
                        error!("Configuration watch failed: {}", e);
                        break Err(e);
                    }
                },

                Some(HostWatchEvent { generation, item }) = host_rx.recv() => {
                    let active_generation = *channels.generation.borrow();
                    if generation != active_generation {
                        debug!(
                            "Dropping event from superseded watcher (generation {}, active {})",
                            generation, active_generation
                        );
                        self.emit_event(EngineEvent::StaleEventDropped {
                            generation,
                            active_generation,
                        });
                        continue;
                    }

                    match item {
                        Ok(event) => self.handle_change(&current, &event, &mut upserts).await,
                        Err(e) => {
                            warn!("Host watch failed: {}. Rebuilding registry", e);
                            next_generation += 1;
                            let rebuilt = self.try_rebuild(next_generation, &channels, &mut upserts).await;
                            if let Some(snapshot) = rebuilt {
                                current = snapshot;
                            }
                        }
                    }
                }
            }
        };

        config_watcher.abort();
        let reason = match &result {
            Ok(()) => "Shutdown signal".to_string(),
            Err(e) => e.to_string(),
        };
        self.emit_event(EngineEvent::Stopped { reason });
        info!("Engine stopped");

        // Dropping `channels` closes the generation channel, which stops the host
        // watcher; dropping `upserts` lets each worker finish its last set
        result
    }

    /// Build a registry for `generation`, converge it and start its watcher
    async fn rebuild(
        &self,
        generation: u64,
        channels: &Channels,
        upserts: &mut UpsertWorkers,
    ) -> Result<RegistrySnapshot> {
        channels.generation.send_replace(generation);
        self.set_state(EngineState::BuildingRegistry, generation);

        let snapshot = match self.store.get(&self.config.config_prefix).await {
            Ok(tree) => RegistrySnapshot::from_tree(generation, &tree),
            Err(e) if e.is_not_found() && generation > FIRST_GENERATION => {
                warn!(
                    "Configuration prefix {} was removed, no domains remain registered",
                    self.config.config_prefix
                );
                RegistrySnapshot::from_hosts(generation, Vec::new())
            }
            Err(e) => return Err(e),
        };
        upserts.retain_registered(&snapshot);

        info!(
            "Registry generation {}: {} domain(s), watching {:?}",
            generation,
            snapshot.hosts().len(),
            snapshot.watch_prefix()
        );
        self.emit_event(EngineEvent::RegistryBuilt {
            generation,
            domains: snapshot.hosts().len(),
            watch_prefix: snapshot.watch_prefix().to_string(),
        });

        // Cold-start convergence
        for host in snapshot.hosts() {
            self.sync_host(host, upserts).await;
        }

        if snapshot.is_empty() {
            warn!("No domains registered under {}", self.config.config_prefix);
        } else {
            self.spawn_host_watcher(&snapshot, channels);
        }

        self.set_state(EngineState::Watching, generation);
        Ok(snapshot)
    }

    /// Rebuild after startup: failures are reported and retried later
    async fn try_rebuild(
        &self,
        generation: u64,
        channels: &Channels,
        upserts: &mut UpsertWorkers,
    ) -> Option<RegistrySnapshot> {
        match self.rebuild(generation, channels, upserts).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                error!("Failed to rebuild registry generation {}: {}", generation, e);
                self.emit_event(EngineEvent::RegistryBuildFailed {
                    generation,
                    error: e.to_string(),
                });
                self.schedule_reload(channels.reload.clone());
                None
            }
        }
    }

    /// Apply one host change to every registered domain
    async fn handle_change(
        &self,
        snapshot: &RegistrySnapshot,
        event: &ChangeEvent,
        upserts: &mut UpsertWorkers,
    ) {
        debug!("Store change: {:?} {}", event.action, event.key);

        for (host, relevance) in classify_all(event, snapshot.hosts()) {
            match relevance {
                Relevance::NoOp => {
                    debug!("Nothing changed for {} at {}", host.domain, event.key);
                    self.emit_event(EngineEvent::ChangeSuppressed {
                        domain: host.domain.clone(),
                        key: event.key.clone(),
                    });
                }
                Relevance::Relevant => {
                    info!(
                        "Matched update {}{}/{} ({:?} {})",
                        self.config.config_prefix, host.zone_id, host.domain, event.action, event.key
                    );
                    self.sync_host(host, upserts).await;
                }
                Relevance::Irrelevant => {}
            }
        }
    }

    /// Resolve a domain and hand its upsert off to the domain's worker
    ///
    /// The store read is awaited so the next message sees its effect; the
    /// upsert result is only observed for reporting.
    async fn sync_host(&self, host: &HostConfig, upserts: &mut UpsertWorkers) {
        match sync::resolve(self.store.as_ref(), host, self.config.record_ttl).await {
            Ok(Resolution::Ready(record_set)) => upserts.submit(record_set),
            Ok(Resolution::Skipped(reason)) => {
                info!("Sync of {} skipped: {}", host.domain, reason);
                self.emit_event(EngineEvent::SyncSkipped {
                    domain: host.domain.clone(),
                    reason,
                });
            }
            Err(e) => {
                error!("Failed to resolve addresses for {}: {}", host.domain, e);
                self.emit_event(EngineEvent::SyncFailed {
                    domain: host.domain.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    /// Watch the snapshot's prefix until its generation is superseded
    fn spawn_host_watcher(&self, snapshot: &RegistrySnapshot, channels: &Channels) {
        let store = Arc::clone(&self.store);
        let host_tx = channels.host.clone();
        let mut generation_rx = channels.generation.subscribe();
        let generation = snapshot.generation();
        let prefix = snapshot.watch_prefix().to_string();
        let after_index = (snapshot.index() > 0).then_some(snapshot.index());
        let retry_delay = self.retry_delay();

        tokio::spawn(async move {
            debug!("Host watcher {} started on {}", generation, prefix);
            let mut stream = store.watch(&prefix, after_index);

            loop {
                tokio::select! {
                    changed = generation_rx.changed() => {
                        if changed.is_err() || *generation_rx.borrow() != generation {
                            debug!("Host watcher {} superseded", generation);
                            return;
                        }
                    }

                    item = stream.next() => {
                        let item = item.unwrap_or_else(|| Err(Error::watch("watch stream ended")));
                        let failed = item.is_err();
                        if failed {
                            // the loop rebuilds right away, so pace it here
                            tokio::time::sleep(retry_delay).await;
                        }
                        if host_tx.send(HostWatchEvent { generation, item }).await.is_err() || failed {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Watch the configuration prefix for the lifetime of the engine
    fn spawn_config_watcher(
        &self,
        after_index: u64,
        reload_tx: mpsc::Sender<ReloadSignal>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let prefix = self.config.config_prefix.clone();
        let strict = self.config.strict_config_watch;
        let retry_delay = self.retry_delay();

        tokio::spawn(async move {
            let mut after_index = (after_index > 0).then_some(after_index);
            let mut reconnecting = false;

            loop {
                let mut stream = store.watch(&prefix, after_index.take());
                if reconnecting {
                    // changes made while the watch was down are unknown
                    if reload_tx.send(ReloadSignal::Reload).await.is_err() {
                        return;
                    }
                }

                while let Some(item) = stream.next().await {
                    match item {
                        Ok(event) => {
                            debug!("Configuration change: {:?} {}", event.action, event.key);
                            if reload_tx.send(ReloadSignal::Reload).await.is_err() {
                                return;
                            }
                        }
                        Err(e) if strict => {
                            let _ = reload_tx.send(ReloadSignal::Fatal(e)).await;
                            return;
                        }
                        Err(e) => {
                            warn!("Configuration watch failed: {}. Retrying in {:?}", e, retry_delay);
                            break;
                        }
                    }
                }

                reconnecting = true;
                tokio::time::sleep(retry_delay).await;
            }
        })
    }

    /// Ask the loop to rebuild once the retry delay has passed
    fn schedule_reload(&self, reload_tx: mpsc::Sender<ReloadSignal>) {
        let retry_delay = self.retry_delay();
        tokio::spawn(async move {
            tokio::time::sleep(retry_delay).await;
            let _ = reload_tx.send(ReloadSignal::Reload).await;
        });
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.config.watch_retry_delay_ms)
    }

    fn set_state(&self, state: EngineState, generation: u64) {
        debug!("Engine state -> {:?} (generation {})", state, generation);
        self.emit_event(EngineEvent::StateChanged { state, generation });
    }

    /// Emit an engine event
    fn emit_event(&self, event: EngineEvent) {
        emit(&self.event_tx, event);
    }
}

/// Send an event, logging a warning if the channel is full (backpressure)
fn emit(event_tx: &mpsc::Sender<EngineEvent>, event: EngineEvent) {
    if let Err(TrySendError::Full(_)) = event_tx.try_send(event) {
        warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
    }
}

async fn wait_for_shutdown(shutdown_rx: Option<oneshot::Receiver<()>>) {
    match shutdown_rx {
        Some(rx) => {
            let _ = rx.await;
        }
        None => {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
}

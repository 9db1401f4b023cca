//! Per-record-set upsert workers
//!
//! Every record set (zone + name) gets one worker task that applies its
//! upserts strictly one after another. The worker holds at most one pending
//! record set: a newer set submitted while an upsert is in flight replaces
//! any older one that has not started yet, so the last set submitted is
//! always the last one applied.

use super::{EngineEvent, emit};
use crate::registry::RegistrySnapshot;
use crate::traits::{DnsProvider, RecordSet};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Zone identifier and record name
type RecordKey = (String, String);

/// Upsert workers owned by the reconciliation loop
pub(super) struct UpsertWorkers {
    provider: Arc<dyn DnsProvider>,
    event_tx: mpsc::Sender<EngineEvent>,
    workers: HashMap<RecordKey, watch::Sender<RecordSet>>,
}

impl UpsertWorkers {
    pub(super) fn new(provider: Arc<dyn DnsProvider>, event_tx: mpsc::Sender<EngineEvent>) -> Self {
        Self {
            provider,
            event_tx,
            workers: HashMap::new(),
        }
    }

    /// Hand `record_set` to its worker without waiting for the upsert
    pub(super) fn submit(&mut self, record_set: RecordSet) {
        let key = (record_set.zone_id.clone(), record_set.name.clone());

        if let Some(tx) = self.workers.get(&key) {
            if !tx.is_closed() {
                tx.send_replace(record_set);
                return;
            }
        }

        debug!("Starting upsert worker for {} in zone {}", key.1, key.0);
        let (tx, rx) = watch::channel(record_set);
        tokio::spawn(run_worker(
            Arc::clone(&self.provider),
            self.event_tx.clone(),
            rx,
        ));
        self.workers.insert(key, tx);
    }

    /// Stop the workers of record sets `snapshot` no longer registers
    ///
    /// A stopped worker still applies the set it was last given.
    pub(super) fn retain_registered(&mut self, snapshot: &RegistrySnapshot) {
        self.workers.retain(|(zone_id, name), _| {
            snapshot
                .hosts()
                .iter()
                .any(|host| &host.zone_id == zone_id && &host.domain == name)
        });
    }

    /// Number of live workers
    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.workers.len()
    }
}

async fn run_worker(
    provider: Arc<dyn DnsProvider>,
    event_tx: mpsc::Sender<EngineEvent>,
    mut pending: watch::Receiver<RecordSet>,
) {
    loop {
        let record_set = pending.borrow_and_update().clone();
        upsert(provider.as_ref(), &event_tx, record_set).await;

        // Err once the loop dropped the sender and nothing newer is pending
        if pending.changed().await.is_err() {
            return;
        }
    }
}

async fn upsert(provider: &dyn DnsProvider, event_tx: &mpsc::Sender<EngineEvent>, record_set: RecordSet) {
    match provider.upsert_record(&record_set).await {
        Ok(result) => {
            info!(
                "Upserted {} in zone {} -> {:?} ({:?})",
                record_set.name, record_set.zone_id, record_set.values, result
            );
            emit(event_tx, EngineEvent::SyncSucceeded { record_set, result });
        }
        Err(e) => {
            error!(
                "Failed to upsert {} via {}: {}",
                record_set.name,
                provider.provider_name(),
                e
            );
            emit(
                event_tx,
                EngineEvent::SyncFailed {
                    domain: record_set.name,
                    error: e.to_string(),
                },
            );
        }
    }
}

//! Architectural Contract Test: Shutdown Determinism
//!
//! This test verifies that shutdown is deterministic and complete.
//!
//! Constraints verified:
//! - Engine terminates on shutdown signal
//! - Both watches are released once the engine returns
//! - Shutdown completes while an upsert is in flight
//!
//! If this test fails, someone has added:
//! - Detached background tasks holding store watches
//! - Tasks that ignore cancellation
//! - Blocking operations in shutdown path

mod common;

use common::*;
use hostdns_core::error::Result;
use hostdns_core::traits::{DnsProvider, RecordSet, UpsertResult};
use hostdns_core::{EngineEvent, ReconcileEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

fn seeded_store() -> MockKvStore {
    let store = MockKvStore::new();
    store
        .seed("/hosts/Z1/www.example.com", "/services/www/*")
        .seed("/services/www/1", "10.0.0.1");
    store
}

#[tokio::test]
async fn shutdown_signal_terminates_engine() {
    let store = seeded_store();
    let provider = MockDnsProvider::new();
    let mut engine = start_engine(&store, &provider, test_config());

    wait_until_watching(&mut engine.events, 1).await;

    let RunningEngine {
        handle,
        shutdown_tx,
        mut events,
    } = engine;
    assert!(shutdown_tx.send(()).is_ok(), "shutdown signal send succeeds");

    let result = tokio::time::timeout(EVENT_TIMEOUT, handle).await;
    assert!(result.is_ok(), "Engine should terminate within the timeout");
    assert_ok!(result.unwrap().unwrap());

    let stopped = wait_for(&mut events, |event| matches!(event, EngineEvent::Stopped { .. })).await;
    assert_eq!(
        stopped,
        EngineEvent::Stopped {
            reason: "Shutdown signal".to_string()
        }
    );
}

#[tokio::test]
async fn shutdown_releases_all_watches() {
    let store = seeded_store();
    let provider = MockDnsProvider::new();
    let mut engine = start_engine(&store, &provider, test_config());

    wait_until_watching(&mut engine.events, 1).await;
    assert!(store.wait_for_watches("/services/www/", 1).await);
    assert!(store.wait_for_watches("/hosts/", 1).await);

    assert_ok!(engine.shutdown().await);

    assert!(store.wait_for_watches("/services/www/", 0).await, "host watch released");
    assert!(store.wait_for_watches("/hosts/", 0).await, "config watch released");
    assert_eq!(store.total_active_watches(), 0);
}

#[tokio::test]
async fn dropped_shutdown_sender_stops_engine() {
    let store = seeded_store();
    let provider = MockDnsProvider::new();
    let mut engine = start_engine(&store, &provider, test_config());

    wait_until_watching(&mut engine.events, 1).await;
    drop(engine.shutdown_tx);

    let result = tokio::time::timeout(EVENT_TIMEOUT, engine.handle)
        .await
        .expect("engine should stop when its shutdown sender is gone");
    assert_ok!(result.unwrap());
}

/// A provider whose upserts take longer than the test waits
struct SlowDnsProvider;

#[async_trait::async_trait]
impl DnsProvider for SlowDnsProvider {
    async fn upsert_record(&self, _record_set: &RecordSet) -> Result<UpsertResult> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(UpsertResult::Unchanged)
    }

    fn provider_name(&self) -> &'static str {
        "slow"
    }
}

#[tokio::test]
async fn shutdown_during_upsert() {
    let store = seeded_store();

    let (engine, mut events) = ReconcileEngine::new(
        Arc::new(store.clone()),
        Arc::new(SlowDnsProvider),
        test_config(),
    )
    .expect("engine construction succeeds");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let handle = tokio::spawn(async move { engine.run_with_shutdown(Some(shutdown_rx)).await });

    // The cold-start upsert is now pending in the provider
    wait_until_watching(&mut events, 1).await;

    shutdown_tx.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
    assert!(result.is_ok(), "shutdown must not wait for in-flight upserts");
    assert_ok!(result.unwrap().unwrap());
}

//! DNS sync
//!
//! Resolves a domain's key pattern to its current address set and turns it
//! into a single A record set upsert.
//!
//! ## Flow
//!
//! ```text
//! pattern ──prefix_for_pattern──▶ store.get(prefix) ──▶ KvTree
//!                                                          │
//!                      MatchingLeaves (worklist walk) ◀────┘
//!                                  │
//!                                  ▼
//!                  RecordSet { zone, domain, A, ttl, values }
//!                                  │
//!                                  ▼
//!                        provider.upsert_record()
//! ```
//!
//! Directories are only descended into while they prefix-match the pattern,
//! and only leaves that exactly match contribute a value.
//!
//! ## Skips
//!
//! A prefix that no longer exists, or a subtree without any matching leaf,
//! leaves the record set untouched: no empty upsert is ever issued.

use crate::error::Result;
use crate::pattern::{match_path, match_path_prefix, prefix_for_pattern};
use crate::registry::HostConfig;
use crate::traits::{DnsProvider, KvNode, KvStore, KvTree, NodeId, RecordSet, RecordType, UpsertResult};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info};

/// Leaves of a fetched tree whose keys match a pattern
///
/// Walks the arena with an explicit stack, in store order. The iterator is
/// single-pass: create a new one to walk again.
pub struct MatchingLeaves<'a> {
    tree: &'a KvTree,
    pattern: &'a str,
    stack: Vec<NodeId>,
}

impl<'a> MatchingLeaves<'a> {
    /// Start a walk at the root of `tree`
    pub fn new(tree: &'a KvTree, pattern: &'a str) -> Self {
        Self {
            tree,
            pattern,
            stack: vec![KvTree::ROOT],
        }
    }
}

impl<'a> Iterator for MatchingLeaves<'a> {
    type Item = &'a KvNode;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.stack.pop() {
            let node = self.tree.node(id);
            if node.dir {
                if match_path_prefix(&node.key, self.pattern) {
                    // reversed so children pop in store order
                    self.stack.extend(node.children().iter().rev());
                }
            } else if match_path(&node.key, self.pattern) {
                return Some(node);
            }
        }
        None
    }
}

/// Collect the values of every leaf in `tree` matching `pattern`
pub fn collect_addresses(tree: &KvTree, pattern: &str) -> BTreeSet<String> {
    MatchingLeaves::new(tree, pattern)
        .filter_map(|node| node.value.clone())
        .collect()
}

/// Build the upsert payload for a domain
pub fn record_set_for(host: &HostConfig, addresses: BTreeSet<String>, ttl: u32) -> RecordSet {
    RecordSet {
        zone_id: host.zone_id.clone(),
        name: host.domain.clone(),
        record_type: RecordType::A,
        ttl,
        values: addresses,
    }
}

/// Why a sync did not produce an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The pattern's literal prefix does not exist in the store
    PrefixMissing,
    /// The prefix exists but no leaf matches the pattern
    NoAddresses,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::PrefixMissing => f.write_str("key prefix does not exist"),
            SkipReason::NoAddresses => f.write_str("no address matches the pattern"),
        }
    }
}

/// Result of resolving a domain, before anything is sent to the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The record set to upsert
    Ready(RecordSet),
    /// Nothing to upsert this cycle
    Skipped(SkipReason),
}

/// Resolve a domain's pattern to the record set it should publish
///
/// # Returns
///
/// - `Ok(Resolution::Ready)`: At least one address was found
/// - `Ok(Resolution::Skipped)`: The prefix is gone or holds no match
/// - `Err(Error)`: The store read failed for another reason
pub async fn resolve(store: &dyn KvStore, host: &HostConfig, ttl: u32) -> Result<Resolution> {
    let prefix = prefix_for_pattern(&host.key);
    debug!("Resolving {} from {} (prefix {})", host.domain, host.key, prefix);

    let tree = match store.get(prefix).await {
        Ok(tree) => tree,
        Err(e) if e.is_not_found() => {
            info!("Skipping {}: prefix {} does not exist", host.domain, prefix);
            return Ok(Resolution::Skipped(SkipReason::PrefixMissing));
        }
        Err(e) => return Err(e),
    };

    let addresses = collect_addresses(&tree, &host.key);
    if addresses.is_empty() {
        info!("Skipping {}: nothing under {} matches {}", host.domain, prefix, host.key);
        return Ok(Resolution::Skipped(SkipReason::NoAddresses));
    }

    Ok(Resolution::Ready(record_set_for(host, addresses, ttl)))
}

/// Outcome of a complete sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The record set was sent to the provider
    Upserted {
        /// Payload that was sent
        record_set: RecordSet,
        /// What the provider reported
        result: UpsertResult,
    },
    /// Nothing was sent
    Skipped(SkipReason),
}

/// Resolve a domain and wait for its upsert to finish
pub async fn sync_host(
    store: &dyn KvStore,
    provider: &dyn DnsProvider,
    host: &HostConfig,
    ttl: u32,
) -> Result<SyncOutcome> {
    match resolve(store, host, ttl).await? {
        Resolution::Skipped(reason) => Ok(SyncOutcome::Skipped(reason)),
        Resolution::Ready(record_set) => {
            let result = provider.upsert_record(&record_set).await?;
            info!(
                "Upserted {} in zone {}: {:?} ({:?})",
                record_set.name, record_set.zone_id, record_set.values, result
            );
            Ok(SyncOutcome::Upserted { record_set, result })
        }
    }
}

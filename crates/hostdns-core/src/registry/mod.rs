//! Domain registry
//!
//! Turns the configuration subtree into an immutable [`RegistrySnapshot`]:
//! the ordered list of registered domains plus the single literal prefix
//! that covers every key any of them could read.
//!
//! ## Configuration Layout
//!
//! ```text
//! <config-prefix>/<zone-id>/<domain-name> = <key pattern>
//! ```
//!
//! For example:
//!
//! ```text
//! /hosts/Z1D633PJN98FT9/www.example.com = /services/www/*
//! /hosts/Z1D633PJN98FT9/api.example.com = /services/api/*/ip
//! ```
//!
//! ## Ownership
//!
//! A snapshot is built once per configuration reload and never mutated;
//! the reconciliation loop replaces it as a whole. Cloning a snapshot only
//! clones the handle to its host list.

use crate::pattern::{common_prefix_for_patterns, prefix_for_pattern};
use crate::traits::KvTree;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One registered domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// DNS provider zone identifier
    pub zone_id: String,
    /// Record name to keep in sync
    pub domain: String,
    /// Key pattern under which the domain's addresses are published
    pub key: String,
}

impl HostConfig {
    /// Create a new host configuration
    pub fn new(zone_id: impl Into<String>, domain: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            zone_id: zone_id.into(),
            domain: domain.into(),
            key: key.into(),
        }
    }
}

/// Immutable view of the registered domains
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySnapshot {
    generation: u64,
    hosts: Arc<[HostConfig]>,
    watch_prefix: String,
    index: u64,
}

impl RegistrySnapshot {
    /// Build a snapshot from a list of host configurations
    ///
    /// The watch prefix is the running common prefix of all patterns,
    /// reduced to its literal part. An empty list has an empty prefix.
    pub fn from_hosts(generation: u64, hosts: Vec<HostConfig>) -> Self {
        let mut accumulator: Option<String> = None;
        for host in &hosts {
            accumulator = Some(match accumulator {
                None => host.key.clone(),
                Some(prefix) => common_prefix_for_patterns(&prefix, &host.key),
            });
        }

        let watch_prefix = accumulator
            .map(|prefix| prefix_for_pattern(&prefix).to_string())
            .unwrap_or_default();

        Self {
            generation,
            hosts: hosts.into(),
            watch_prefix,
            index: 0,
        }
    }

    /// Build a snapshot from the configuration subtree
    ///
    /// Every directory directly under the root is a zone; every leaf inside
    /// a zone is a domain whose value is its key pattern. Zone and domain
    /// names are the last segment of their keys. Output order follows the
    /// store's traversal order.
    pub fn from_tree(generation: u64, tree: &KvTree) -> Self {
        let mut hosts = Vec::new();

        for zone in tree.children_of(tree.root()) {
            if !zone.dir {
                warn!("Ignoring non-directory zone entry {}", zone.key);
                continue;
            }
            let zone_id = last_segment(&zone.key);
            info!("Zone {}", zone_id);

            for domain in tree.children_of(zone) {
                let pattern = match (&domain.value, domain.dir) {
                    (Some(pattern), false) => pattern,
                    _ => {
                        warn!("Ignoring directory {} inside zone {}", domain.key, zone_id);
                        continue;
                    }
                };
                let name = last_segment(&domain.key);
                info!("  Register domain: {} -> {}", name, pattern);
                hosts.push(HostConfig::new(zone_id, name, pattern.as_str()));
            }
        }

        let mut snapshot = Self::from_hosts(generation, hosts);
        snapshot.index = tree.index();
        debug!(
            "Registry generation {} built: {} domain(s), watch prefix {:?}",
            generation,
            snapshot.hosts.len(),
            snapshot.watch_prefix
        );
        snapshot
    }

    /// Generation number; increases with every rebuild
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Registered domains in store traversal order
    pub fn hosts(&self) -> &[HostConfig] {
        &self.hosts
    }

    /// Literal prefix covering every registered pattern
    pub fn watch_prefix(&self) -> &str {
        &self.watch_prefix
    }

    /// Store index of the configuration read (0 if unknown)
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Whether no domain is registered
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

fn last_segment(key: &str) -> &str {
    let trimmed = key.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

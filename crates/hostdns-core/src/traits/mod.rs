//! Core traits for the host DNS sync system
//!
//! This module defines the abstract interfaces at both external boundaries.
//!
//! - [`KvStore`]: Read and watch the hierarchical key-value store
//! - [`DnsProvider`]: Upsert DNS record sets via provider APIs

pub mod kv_store;
pub mod dns_provider;

pub use kv_store::{KvStore, KvTree, KvNode, NodeId, ChangeEvent, ChangeAction, WatchStream};
pub use dns_provider::{DnsProvider, RecordSet, RecordType, UpsertResult};

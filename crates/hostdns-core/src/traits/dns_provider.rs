// # DNS Provider Trait
//
// Defines the interface for upserting DNS record sets via provider APIs.
//
// ## Implementations
//
// - Route 53: `hostdns-provider-route53` crate (atomic UPSERT of the whole set)
// - Cloudflare: `hostdns-provider-cloudflare` crate (per-record diff)
//
// ## Usage
//
// ```rust,ignore
// use hostdns_core::DnsProvider;
// use hostdns_core::traits::{RecordSet, RecordType};
//
// #[tokio::main]
// async fn main() -> anyhow::Result<()> {
//     let provider = /* DnsProvider implementation */;
//
//     let record_set = RecordSet::new("zone-id", "www.example.com", RecordType::A, 60)
//         .with_values(["1.2.3.4", "5.6.7.8"]);
//     provider.upsert_record(&record_set).await?;
//
//     Ok(())
// }
// ```

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;

/// DNS record type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    /// A record (IPv4 address set)
    A,
}

impl RecordType {
    /// Wire name of the record type
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::A => "A",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The complete desired state of one record set
///
/// Values are kept ordered so two upserts of the same addresses produce
/// identical payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSet {
    /// Provider zone identifier
    pub zone_id: String,
    /// Record name (e.g. "www.example.com")
    pub name: String,
    /// Record type
    pub record_type: RecordType,
    /// Time-to-live in seconds
    pub ttl: u32,
    /// Record values
    pub values: BTreeSet<String>,
}

impl RecordSet {
    /// Create an empty record set
    pub fn new(
        zone_id: impl Into<String>,
        name: impl Into<String>,
        record_type: RecordType,
        ttl: u32,
    ) -> Self {
        Self {
            zone_id: zone_id.into(),
            name: name.into(),
            record_type,
            ttl,
            values: BTreeSet::new(),
        }
    }

    /// Replace the values of the record set
    pub fn with_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.values = values.into_iter().map(Into::into).collect();
        self
    }
}

/// Result of an upsert operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertResult {
    /// The record set did not exist and was created
    Created,
    /// The record set existed and was changed
    Updated {
        /// Number of values added
        added: usize,
        /// Number of values removed
        removed: usize,
    },
    /// The record set already matched (no-op)
    Unchanged,
}

/// Trait for DNS provider implementations
///
/// This trait defines the interface for replacing a record set.
/// Implementations must handle the specifics of each provider's API.
///
/// # Thread Safety
///
/// Implementations must be thread-safe and usable across async tasks.
///
/// # Responsibilities
///
/// - ✅ Perform API calls to their own endpoints
/// - ✅ Return success or failure
/// - ❌ Retry or back off (a failed upsert is reported and the next relevant
///   change attempts again)
/// - ❌ Decide whether an upsert is needed (owned by the reconciliation loop)
/// - ❌ Cache state beyond a single request
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Make the provider's record set equal to `record_set`
    ///
    /// # Idempotency
    ///
    /// Calling this repeatedly with the same record set must be safe and
    /// result in no additional changes after the first success.
    ///
    /// # Returns
    ///
    /// - `Ok(UpsertResult)`: The result of the upsert
    /// - `Err(Error)`: If the upsert failed
    async fn upsert_record(&self, record_set: &RecordSet) -> Result<UpsertResult, crate::Error>;

    /// Get the provider name (for logging/debugging)
    ///
    /// # Returns
    ///
    /// A static string identifying the provider (e.g., "cloudflare")
    fn provider_name(&self) -> &'static str;
}

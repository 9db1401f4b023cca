// # hostdns-core
//
// Core library for keeping DNS records in sync with host membership data
// published in a hierarchical, watchable key-value store.
//
// ## Architecture Overview
//
// Operators register zones and domains under a configuration prefix:
//
// ```text
// <config-prefix>/<zone-id>/<domain-name> = <key pattern>
// ```
//
// Each key pattern is a slash-delimited glob (`/services/www/*`) pointing at
// the subtree where live host addresses are published. This library:
//
// - **pattern**: Glob matching and literal prefix derivation over key paths
// - **registry**: Builds the host-config list and the single watch prefix
// - **classifier**: Decides which domains a store change affects
// - **sync**: Resolves a pattern to addresses and upserts the A record set
// - **engine**: The reconciliation loop owning both watchers
// - **KvStore** / **DnsProvider**: Traits at the two external boundaries
//
// ## Design Principles
//
// 1. **Store is the source of truth**: Nothing is persisted locally
// 2. **Event-Driven**: Store watches are consumed as async streams
// 3. **Snapshot ownership**: The active registry is owned by the loop and
//    replaced wholesale, never mutated in place
// 4. **Library-First**: The daemon is a thin wiring layer

pub mod traits;
pub mod pattern;
pub mod registry;
pub mod classifier;
pub mod sync;
pub mod engine;
pub mod config;
pub mod error;

// Re-export core types for convenience
pub use traits::{KvStore, DnsProvider};
pub use engine::{ReconcileEngine, EngineEvent, EngineState};
pub use registry::{HostConfig, RegistrySnapshot};
pub use config::{SyncConfig, StoreConfig, ProviderConfig, EngineConfig};
pub use error::{Error, Result};

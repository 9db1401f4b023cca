//! Configuration types for the host DNS sync system
//!
//! This module defines all configuration structures used throughout the crate.

use serde::{Deserialize, Serialize};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Key-value store connection
    pub store: StoreConfig,

    /// DNS provider configuration
    pub provider: ProviderConfig,

    /// Optional engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

impl SyncConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self {
            store: StoreConfig::default(),
            provider: ProviderConfig::default(),
            engine: EngineConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.store.validate()?;
        self.provider.validate()?;
        self.engine.validate()?;

        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Key-value store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store endpoints, tried in order
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Timeout for non-watch requests (in seconds)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl StoreConfig {
    /// Validate the store configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.endpoints.is_empty() {
            return Err(crate::Error::config("At least one store endpoint is required"));
        }

        for endpoint in &self.endpoints {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(crate::Error::config(format!(
                    "Store endpoint must use HTTP or HTTPS scheme. Got: {}",
                    endpoint
                )));
            }
        }

        if self.request_timeout_secs == 0 {
            return Err(crate::Error::config("Store request timeout must be > 0"));
        }

        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// DNS provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// Amazon Route 53 provider
    ///
    /// Credentials come from the standard AWS provider chain.
    Route53 {
        /// AWS region override (Route 53 itself is global)
        #[serde(default)]
        region: Option<String>,
        /// Log intended writes instead of performing them
        #[serde(default)]
        dry_run: bool,
    },

    /// Cloudflare provider
    Cloudflare {
        /// Cloudflare API token
        api_token: String,
        /// Log intended writes instead of performing them
        #[serde(default)]
        dry_run: bool,
    },
}

impl ProviderConfig {
    /// Validate the provider configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            ProviderConfig::Route53 { region, .. } => {
                if region.as_deref().is_some_and(str::is_empty) {
                    return Err(crate::Error::config("Route 53 region cannot be empty"));
                }
                Ok(())
            }
            ProviderConfig::Cloudflare { api_token, .. } => {
                if api_token.is_empty() {
                    return Err(crate::Error::config("Cloudflare API token cannot be empty"));
                }
                Ok(())
            }
        }
    }

    /// Get the provider type name
    pub fn type_name(&self) -> &str {
        match self {
            ProviderConfig::Route53 { .. } => "route53",
            ProviderConfig::Cloudflare { .. } => "cloudflare",
        }
    }

    /// Whether writes are only logged
    pub fn is_dry_run(&self) -> bool {
        match self {
            ProviderConfig::Route53 { dry_run, .. } | ProviderConfig::Cloudflare { dry_run, .. } => {
                *dry_run
            }
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig::Route53 {
            region: None,
            dry_run: false,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Namespace prefix holding `<zone-id>/<domain-name> = <pattern>` entries
    #[serde(default = "default_config_prefix")]
    pub config_prefix: String,

    /// TTL of the upserted A records (in seconds)
    ///
    /// Records track host liveness, so this stays short.
    #[serde(default = "default_record_ttl")]
    pub record_ttl: u32,

    /// Delay before re-establishing a failed watch or retrying a failed rebuild (in milliseconds)
    #[serde(default = "default_watch_retry_delay_ms")]
    pub watch_retry_delay_ms: u64,

    /// Treat a configuration watch error as fatal instead of retrying it
    ///
    /// Without configuration visibility, drift can no longer be detected.
    #[serde(default)]
    pub strict_config_watch: bool,

    /// Capacity of the engine event channel
    ///
    /// When full, new engine events are dropped (with a warning log).
    ///
    /// Default: 1000 events
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl EngineConfig {
    /// Validate the engine configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if !self.config_prefix.starts_with('/') {
            return Err(crate::Error::config(format!(
                "Configuration prefix must be an absolute key path. Got: {}",
                self.config_prefix
            )));
        }
        if self.record_ttl == 0 {
            return Err(crate::Error::config("Record TTL must be > 0"));
        }
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }
        Ok(())
    }

    /// Set the configuration prefix
    pub fn with_config_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config_prefix = prefix.into();
        self
    }

    /// Set the watch retry delay
    pub fn with_watch_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.watch_retry_delay_ms = delay_ms;
        self
    }

    /// Enable or disable strict configuration watching
    pub fn with_strict_config_watch(mut self, strict: bool) -> Self {
        self.strict_config_watch = strict;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            config_prefix: default_config_prefix(),
            record_ttl: default_record_ttl(),
            watch_retry_delay_ms: default_watch_retry_delay_ms(),
            strict_config_watch: false,
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

fn default_endpoints() -> Vec<String> {
    vec![
        "http://127.0.0.1:4001".to_string(),
        "http://127.0.0.1:2379".to_string(),
    ]
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_config_prefix() -> String {
    "/hosts/".to_string()
}

fn default_record_ttl() -> u32 {
    60
}

fn default_watch_retry_delay_ms() -> u64 {
    1000
}

fn default_event_channel_capacity() -> usize {
    1000
}

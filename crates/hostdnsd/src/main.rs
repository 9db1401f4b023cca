// # hostdnsd - Host DNS Sync Daemon
//
// This is a THIN integration layer: all reconciliation logic lives in
// hostdns-core.
//
// The hostdnsd daemon is responsible for:
// 1. Reading configuration from flags and environment variables
// 2. Initializing logging and the runtime
// 3. Creating the etcd store and the selected DNS provider
// 4. Running the reconciliation engine until SIGTERM/SIGINT
//
// ## Configuration
//
// Every flag has an environment override:
//
// - `--etcd-endpoints` / `ETCD_ENDPOINTS`: Comma-separated etcd URLs
// - `--etcd-prefix` / `ETCD_PREFIX`: Configuration prefix (default `/hosts/`)
// - `--provider` / `HOSTDNS_PROVIDER`: `route53` (default) or `cloudflare`
// - `--aws-region`: Route 53 signing region (otherwise the AWS provider chain decides)
// - `--cloudflare-api-token` / `CLOUDFLARE_API_TOKEN`: API token (required for `cloudflare`)
// - `--record-ttl` / `HOSTDNS_RECORD_TTL`: TTL of upserted records
// - `--watch-retry-delay-ms` / `HOSTDNS_WATCH_RETRY_DELAY_MS`: Watch retry delay
// - `--dry-run` / `HOSTDNS_DRY_RUN`: Log DNS writes instead of sending them
// - `--strict-config-watch` / `HOSTDNS_STRICT_CONFIG_WATCH`: Exit when the configuration watch fails
// - `--log-level` / `HOSTDNS_LOG_LEVEL`: trace, debug, info, warn, error
//
// ## Example
//
// ```bash
// export AWS_PROFILE=dns-admin
// etcdctl set /hosts/Z1D633PJN98FT9/www.example.com '/services/www/*'
//
// hostdnsd --etcd-endpoints http://10.0.0.10:2379
// ```
//
// Cloudflare zones use the same layout with Cloudflare zone IDs:
//
// ```bash
// CLOUDFLARE_API_TOKEN=your_token hostdnsd --provider cloudflare
// ```

use anyhow::Result;
use clap::{Parser, ValueEnum};
use hostdns_core::{
    DnsProvider, EngineConfig, EngineEvent, ProviderConfig, ReconcileEngine, StoreConfig,
    SyncConfig,
};
use hostdns_etcd::EtcdKvStore;
use hostdns_provider_cloudflare::CloudflareProvider;
use hostdns_provider_route53::Route53Provider;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{Signal, SignalKind, signal};

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostdnsExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<HostdnsExitCode> for ExitCode {
    fn from(code: HostdnsExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// DNS provider selectable on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProviderKind {
    /// Amazon Route 53
    Route53,
    /// Cloudflare
    Cloudflare,
}

/// Command line arguments
#[derive(Parser)]
#[command(name = "hostdnsd", version)]
#[command(about = "Keep DNS A records in sync with host keys published in etcd", long_about = None)]
struct Cli {
    /// etcd endpoints, tried in order
    #[arg(
        long,
        env = "ETCD_ENDPOINTS",
        value_delimiter = ',',
        default_values = ["http://127.0.0.1:4001", "http://127.0.0.1:2379"]
    )]
    etcd_endpoints: Vec<String>,

    /// Prefix holding `<zone-id>/<domain-name> = <key pattern>` entries
    #[arg(long, env = "ETCD_PREFIX", default_value = "/hosts/")]
    etcd_prefix: String,

    /// DNS provider publishing the records
    #[arg(long, env = "HOSTDNS_PROVIDER", value_enum, default_value_t = ProviderKind::Route53)]
    provider: ProviderKind,

    /// AWS region used to sign Route 53 requests
    #[arg(long)]
    aws_region: Option<String>,

    /// Cloudflare API token with Zone:DNS:Edit permissions
    #[arg(long, env = "CLOUDFLARE_API_TOKEN", hide_env_values = true)]
    cloudflare_api_token: Option<String>,

    /// TTL of the published A records, in seconds
    #[arg(long, env = "HOSTDNS_RECORD_TTL", default_value_t = 60)]
    record_ttl: u32,

    /// Delay before re-establishing a failed watch, in milliseconds
    #[arg(long, env = "HOSTDNS_WATCH_RETRY_DELAY_MS", default_value_t = 1000)]
    watch_retry_delay_ms: u64,

    /// Log intended DNS writes without performing them
    #[arg(long, env = "HOSTDNS_DRY_RUN")]
    dry_run: bool,

    /// Exit when the configuration watch fails instead of retrying
    #[arg(long, env = "HOSTDNS_STRICT_CONFIG_WATCH")]
    strict_config_watch: bool,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, env = "HOSTDNS_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Cli {
    /// Build the library configuration from the parsed arguments
    fn into_config(self) -> SyncConfig {
        SyncConfig {
            store: StoreConfig {
                endpoints: self.etcd_endpoints,
                ..StoreConfig::default()
            },
            provider: match self.provider {
                ProviderKind::Route53 => ProviderConfig::Route53 {
                    region: self.aws_region,
                    dry_run: self.dry_run,
                },
                // a missing token fails validation
                ProviderKind::Cloudflare => ProviderConfig::Cloudflare {
                    api_token: self.cloudflare_api_token.unwrap_or_default(),
                    dry_run: self.dry_run,
                },
            },
            engine: EngineConfig {
                config_prefix: self.etcd_prefix,
                record_ttl: self.record_ttl,
                watch_retry_delay_ms: self.watch_retry_delay_ms,
                strict_config_watch: self.strict_config_watch,
                ..EngineConfig::default()
            },
        }
    }
}

fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => anyhow::bail!(
            "Log level '{}' is not valid. Valid levels: trace, debug, info, warn, error",
            level
        ),
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // --help and --version also end up here
            return if e.use_stderr() {
                HostdnsExitCode::ConfigError.into()
            } else {
                HostdnsExitCode::CleanShutdown.into()
            };
        }
    };

    let log_level = match parse_log_level(&cli.log_level) {
        Ok(level) => level,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return HostdnsExitCode::ConfigError.into();
        }
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return HostdnsExitCode::ConfigError.into();
    }

    let config = cli.into_config();
    if let Err(e) = config.validate() {
        error!("Configuration validation error: {}", e);
        return HostdnsExitCode::ConfigError.into();
    }

    info!("Starting hostdnsd daemon");
    info!(
        "Store endpoints: {}, configuration prefix: {}",
        config.store.endpoints.join(","),
        config.engine.config_prefix
    );

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return HostdnsExitCode::RuntimeError.into();
        }
    };

    rt.block_on(run_daemon(config)).into()
}

/// Wire the components together and run the engine
async fn run_daemon(config: SyncConfig) -> HostdnsExitCode {
    let store = match EtcdKvStore::from_config(&config.store) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to create etcd store: {}", e);
            return HostdnsExitCode::ConfigError;
        }
    };

    let provider = match build_provider(&config.provider).await {
        Ok(provider) => provider,
        Err(e) => {
            error!("Failed to create {} provider: {}", config.provider.type_name(), e);
            return HostdnsExitCode::ConfigError;
        }
    };
    if config.provider.is_dry_run() {
        warn!(
            "{} provider running in DRY-RUN mode - no changes will be made",
            provider.provider_name()
        );
    }

    let (engine, event_rx) =
        match ReconcileEngine::new(Arc::new(store), provider, config.engine) {
            Ok(pair) => pair,
            Err(e) => {
                error!("Failed to create engine: {}", e);
                return HostdnsExitCode::ConfigError;
            }
        };

    let mut signals = match ShutdownSignals::new() {
        Ok(signals) => signals,
        Err(e) => {
            error!("{}", e);
            return HostdnsExitCode::RuntimeError;
        }
    };

    let started = Arc::new(AtomicBool::new(false));
    let monitor = tokio::spawn(monitor_events(event_rx, Arc::clone(&started)));

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let signal_task = tokio::spawn(async move {
        let name = signals.recv().await;
        info!("Received shutdown signal: {}", name);
        let _ = shutdown_tx.send(());
    });

    let result = engine.run_with_shutdown(Some(shutdown_rx)).await;
    signal_task.abort();

    // Dropping the engine closes the event channel; the monitor drains what is left
    drop(engine);
    if let Err(e) = monitor.await {
        warn!("Event monitor ended abnormally: {}", e);
    }

    match result {
        Ok(()) => {
            info!("Shutting down daemon");
            HostdnsExitCode::CleanShutdown
        }
        Err(e) if !started.load(Ordering::SeqCst) => {
            error!("Startup failed: {}", e);
            HostdnsExitCode::ConfigError
        }
        Err(e) => {
            error!("Daemon error: {}", e);
            HostdnsExitCode::RuntimeError
        }
    }
}

/// Create the configured DNS provider
async fn build_provider(config: &ProviderConfig) -> hostdns_core::Result<Arc<dyn DnsProvider>> {
    let provider: Arc<dyn DnsProvider> = match config {
        ProviderConfig::Route53 { .. } => Arc::new(Route53Provider::from_config(config).await?),
        ProviderConfig::Cloudflare { .. } => Arc::new(CloudflareProvider::from_config(config)?),
    };
    info!("Publishing records via {}", provider.provider_name());
    Ok(provider)
}

/// Drain engine events, noting when the first registry has been built
async fn monitor_events(mut events: mpsc::Receiver<EngineEvent>, started: Arc<AtomicBool>) {
    while let Some(event) = events.recv().await {
        if let EngineEvent::RegistryBuilt { generation: 1, .. } = event {
            started.store(true, Ordering::SeqCst);
        }
        debug!("Engine event: {:?}", event);
    }
}

/// SIGTERM and SIGINT listeners, installed before the engine starts
#[cfg(unix)]
struct ShutdownSignals {
    sigterm: Signal,
    sigint: Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn new() -> Result<Self> {
        let sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
        let sigint = signal(SignalKind::interrupt())
            .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;
        Ok(Self { sigterm, sigint })
    }

    /// Wait for either signal and return its name
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigint.recv() => "SIGINT",
        }
    }
}

/// Fallback for non-Unix platforms (SIGINT only)
#[cfg(not(unix))]
struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    fn new() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to wait for CTRL-C: {}", e);
        }
        "SIGINT"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_into_config() {
        let cli = Cli::try_parse_from([
            "hostdnsd",
            "--etcd-endpoints",
            "http://10.0.0.1:2379,http://10.0.0.2:2379",
            "--etcd-prefix",
            "/dns/",
            "--provider",
            "cloudflare",
            "--cloudflare-api-token",
            "token",
            "--record-ttl",
            "120",
            "--dry-run",
            "--strict-config-watch",
        ])
        .unwrap();

        let config = cli.into_config();
        assert_eq!(
            config.store.endpoints,
            vec!["http://10.0.0.1:2379", "http://10.0.0.2:2379"]
        );
        assert_eq!(config.engine.config_prefix, "/dns/");
        assert_eq!(config.engine.record_ttl, 120);
        assert!(config.engine.strict_config_watch);
        assert!(matches!(
            config.provider,
            ProviderConfig::Cloudflare { dry_run: true, .. }
        ));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_route53_is_the_default_provider() {
        let cli = Cli::try_parse_from(["hostdnsd", "--aws-region", "eu-west-1"]).unwrap();
        assert_eq!(cli.provider, ProviderKind::Route53);

        let config = cli.into_config();
        assert!(matches!(
            &config.provider,
            ProviderConfig::Route53 { region: Some(region), dry_run: false } if region == "eu-west-1"
        ));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cloudflare_requires_token() {
        let cli = Cli::try_parse_from(["hostdnsd", "--provider", "cloudflare"]).unwrap();
        assert!(cli.into_config().validate().is_err());
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(parse_log_level("DEBUG").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("warn").unwrap(), Level::WARN);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(HostdnsExitCode::CleanShutdown as u8, 0);
        assert_eq!(HostdnsExitCode::ConfigError as u8, 1);
        assert_eq!(HostdnsExitCode::RuntimeError as u8, 2);
    }
}

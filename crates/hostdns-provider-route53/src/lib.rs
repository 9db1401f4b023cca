// # Route 53 DNS Provider
//
// This crate provides the Amazon Route 53 implementation of `DnsProvider`.
//
// ## Upsert
//
// The whole address set of a name is published with one
// `ChangeResourceRecordSets` call carrying a single `UPSERT` change. Route 53
// applies a change batch atomically, so resolvers see either the old set or
// the new one, never a mix.
//
// Before writing, the current set is read with `ListResourceRecordSets` so an
// already matching set is reported as unchanged and not rewritten.
//
// ## Credentials
//
// Credentials and region come from the standard AWS provider chain
// (environment, shared config/credentials files, SSO, IMDS). Route 53 is a
// global service; the region only selects the signing endpoint.
//
// ## Constraints
//
// - No retry, no backoff beyond the SDK's own: a failed upsert is reported
//   and the next relevant change re-sends the complete set
// - An empty address set is rejected, Route 53 cannot hold an A set without values

use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_route53::Client;
use aws_sdk_route53::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_route53::types::{
    Change, ChangeAction, ChangeBatch, ResourceRecord, ResourceRecordSet, RrType,
};
use hostdns_core::config::ProviderConfig;
use hostdns_core::traits::{DnsProvider, RecordSet, UpsertResult};
use hostdns_core::{Error, Result};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info};

const PROVIDER: &str = "route53";

/// Region used when the provider chain yields none
const DEFAULT_REGION: &str = "us-east-1";

/// Upper bound for one API operation, SDK retries included
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Prefix Route 53 puts in front of hosted zone IDs in some responses
const HOSTED_ZONE_PREFIX: &str = "/hostedzone/";

/// Strip the `/hostedzone/` prefix, if any
fn normalize_zone_id(zone_id: &str) -> &str {
    zone_id.strip_prefix(HOSTED_ZONE_PREFIX).unwrap_or(zone_id)
}

/// Compare a Route 53 record name (fully qualified, lower case) with a configured one
fn same_name(route53_name: &str, name: &str) -> bool {
    route53_name
        .trim_end_matches('.')
        .eq_ignore_ascii_case(name.trim_end_matches('.'))
}

/// Build the single-change `UPSERT` batch publishing `record_set`
fn change_batch(record_set: &RecordSet) -> Result<ChangeBatch> {
    if record_set.values.is_empty() {
        return Err(Error::provider(
            PROVIDER,
            format!("Refusing to publish an empty A record set for {}", record_set.name),
        ));
    }

    let records = record_set
        .values
        .iter()
        .map(|value| ResourceRecord::builder().value(value).build())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| build_error("resource record", e))?;

    let set = ResourceRecordSet::builder()
        .name(&record_set.name)
        .r#type(RrType::A)
        .ttl(i64::from(record_set.ttl))
        .set_resource_records(Some(records))
        .build()
        .map_err(|e| build_error("resource record set", e))?;

    let change = Change::builder()
        .action(ChangeAction::Upsert)
        .resource_record_set(set)
        .build()
        .map_err(|e| build_error("change", e))?;

    ChangeBatch::builder()
        .comment(format!("hostdns upsert of {}", record_set.name))
        .changes(change)
        .build()
        .map_err(|e| build_error("change batch", e))
}

fn build_error(what: &str, e: impl std::fmt::Display) -> Error {
    Error::provider(PROVIDER, format!("Failed to build {}: {}", what, e))
}

/// Classify what an upsert of `desired` does to the `current` set
fn upsert_result(current: Option<&ResourceRecordSet>, desired: &RecordSet) -> UpsertResult {
    let Some(current) = current else {
        return UpsertResult::Created;
    };

    let published: BTreeSet<&str> = current
        .resource_records()
        .iter()
        .map(|record| record.value())
        .collect();
    let added = desired
        .values
        .iter()
        .filter(|value| !published.contains(value.as_str()))
        .count();
    let removed = published
        .iter()
        .filter(|value| !desired.values.contains(**value))
        .count();

    if added == 0 && removed == 0 && current.ttl() == Some(i64::from(desired.ttl)) {
        UpsertResult::Unchanged
    } else {
        UpsertResult::Updated { added, removed }
    }
}

/// Map an AWS error code to the crate's error kinds
fn error_for_code(code: Option<&str>, message: String) -> Error {
    match code {
        Some("Throttling" | "ThrottlingException" | "PriorRequestNotComplete") => {
            Error::rate_limited(message)
        }
        Some(
            "AccessDenied"
            | "AccessDeniedException"
            | "InvalidClientTokenId"
            | "SignatureDoesNotMatch"
            | "ExpiredToken"
            | "UnrecognizedClientException",
        ) => Error::auth(message),
        Some("NoSuchHostedZone") => Error::not_found(message),
        _ => Error::provider(PROVIDER, message),
    }
}

fn sdk_error<E, R>(err: SdkError<E, R>, context: &str) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let message = format!("{}: {}", context, DisplayErrorContext(&err));
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => Error::http(message),
        _ => {
            let code = err.as_service_error().and_then(|e| e.code());
            error_for_code(code, message)
        }
    }
}

/// Route 53 DNS provider
///
/// When `dry_run` is true, the current set is still read, but the change
/// batch is only logged.
#[derive(Debug, Clone)]
pub struct Route53Provider {
    client: Client,
    dry_run: bool,
}

impl Route53Provider {
    /// Wrap an already configured Route 53 client
    pub fn with_client(client: Client, dry_run: bool) -> Self {
        Self { client, dry_run }
    }

    /// Create a provider from the AWS environment
    ///
    /// `region` takes precedence over the provider chain.
    pub async fn from_env(region: Option<String>, dry_run: bool) -> Self {
        let region = RegionProviderChain::first_try(region.map(Region::new))
            .or_default_provider()
            .or_else(Region::new(DEFAULT_REGION));

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region)
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(DEFAULT_OPERATION_TIMEOUT)
                    .build(),
            )
            .load()
            .await;

        debug!("Route 53 client signing for region {:?}", sdk_config.region());
        Self::with_client(Client::new(&sdk_config), dry_run)
    }

    /// Create a provider from the provider configuration
    pub async fn from_config(config: &ProviderConfig) -> Result<Self> {
        match config {
            ProviderConfig::Route53 { region, dry_run } => {
                Ok(Self::from_env(region.clone(), *dry_run).await)
            }
            other => Err(Error::config(format!(
                "Expected route53 provider configuration, got {}",
                other.type_name()
            ))),
        }
    }

    /// Whether writes are only logged
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Read the A set currently published for `name`, if any
    async fn current_set(&self, zone_id: &str, name: &str) -> Result<Option<ResourceRecordSet>> {
        let output = self
            .client
            .list_resource_record_sets()
            .hosted_zone_id(zone_id)
            .start_record_name(name)
            .start_record_type(RrType::A)
            .max_items(1)
            .send()
            .await
            .map_err(|e| sdk_error(e, &format!("List record sets {}", name)))?;

        // Listing starts at `name` but returns the next set when it does not exist
        Ok(output
            .resource_record_sets()
            .iter()
            .find(|set| same_name(set.name(), name) && *set.r#type() == RrType::A)
            .cloned())
    }
}

#[async_trait]
impl DnsProvider for Route53Provider {
    async fn upsert_record(&self, record_set: &RecordSet) -> Result<UpsertResult> {
        info!(
            "Upserting Route 53 record set: {} {} -> {:?} (ttl {}) [mode: {}]",
            record_set.name,
            record_set.record_type,
            record_set.values,
            record_set.ttl,
            if self.dry_run { "DRY-RUN" } else { "LIVE" }
        );

        let zone_id = normalize_zone_id(&record_set.zone_id);
        let batch = change_batch(record_set)?;

        let current = self.current_set(zone_id, &record_set.name).await?;
        let result = upsert_result(current.as_ref(), record_set);

        if result == UpsertResult::Unchanged {
            info!("Record set already up to date: {}", record_set.name);
            return Ok(result);
        }

        if self.dry_run {
            info!(
                "[DRY-RUN] {}: would UPSERT {:?} in zone {} ({:?})",
                record_set.name, record_set.values, zone_id, result
            );
            return Ok(result);
        }

        let output = self
            .client
            .change_resource_record_sets()
            .hosted_zone_id(zone_id)
            .change_batch(batch)
            .send()
            .await
            .map_err(|e| sdk_error(e, &format!("Upsert {}", record_set.name)))?;

        if let Some(change) = output.change_info() {
            debug!(
                "Change {} for {} is {}",
                change.id(),
                record_set.name,
                change.status().as_str()
            );
        }

        info!("Record set updated: {} ({:?})", record_set.name, result);
        Ok(result)
    }

    fn provider_name(&self) -> &'static str {
        PROVIDER
    }
}

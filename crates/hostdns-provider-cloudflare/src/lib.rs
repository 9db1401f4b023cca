// # Cloudflare DNS Provider
//
// This crate provides the Cloudflare implementation of `DnsProvider`.
//
// ## Upsert
//
// A record set upsert is computed against what Cloudflare currently holds:
//
// 1. List the A records for the name
// 2. Create one record per missing address
// 3. Delete records whose address is no longer published (and duplicates)
// 4. Re-`PUT` kept records whose TTL differs
//
// Creates run before deletes, so a name never resolves to nothing while the
// set is being replaced.
//
// ## Constraints
//
// - No retry, no backoff: a failed upsert is reported and the next relevant
//   change re-sends the complete set
// - No caching between upserts
//
// ## Security Requirements
//
// - API token NEVER appears in logs or Debug output
// - Construction fails if the token is empty
//
// ## API Reference
//
// - List DNS Records: GET `/zones/:zone_id/dns_records?type=A&name=...&page=N`
//   (every page is read before diffing)
// - Create DNS Record: POST `/zones/:zone_id/dns_records`
// - Update DNS Record: PUT `/zones/:zone_id/dns_records/:record_id`
// - Delete DNS Record: DELETE `/zones/:zone_id/dns_records/:record_id`

use async_trait::async_trait;
use hostdns_core::config::ProviderConfig;
use hostdns_core::traits::{DnsProvider, RecordSet, UpsertResult};
use hostdns_core::{Error, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info};

/// Cloudflare API base URL
const CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Default HTTP timeout for API requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

const PROVIDER: &str = "cloudflare";

/// Records requested per list page (the API maximum)
const LIST_PAGE_SIZE: u32 = 5000;

/// Envelope of every Cloudflare v4 response
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
    #[serde(default)]
    result_info: Option<ResultInfo>,
}

/// Paging details of a list response
#[derive(Debug, Clone, Copy, Deserialize)]
struct ResultInfo {
    #[serde(default = "first_page")]
    page: u32,
    #[serde(default = "first_page")]
    total_pages: u32,
}

fn first_page() -> u32 {
    1
}

impl ResultInfo {
    /// Page to request after this one, if any
    fn next_page(&self) -> Option<u32> {
        (self.page < self.total_pages).then_some(self.page + 1)
    }
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    code: u64,
    message: String,
}

/// An existing DNS record as listed by Cloudflare
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct DnsRecord {
    id: String,
    content: String,
    ttl: u32,
}

/// Writes needed to turn the listed records into the desired set
#[derive(Debug, Default, PartialEq, Eq)]
struct ChangePlan {
    /// Addresses without a record
    create: Vec<String>,
    /// Records to remove
    delete: Vec<DnsRecord>,
    /// Kept records whose TTL must change
    retune: Vec<DnsRecord>,
}

impl ChangePlan {
    /// Diff existing records against the desired record set
    ///
    /// Only the first record per address is kept; later duplicates are deleted.
    fn between(existing: &[DnsRecord], desired: &RecordSet) -> Self {
        let mut plan = ChangePlan::default();
        let mut kept = BTreeSet::new();

        for record in existing {
            if desired.values.contains(&record.content) && kept.insert(record.content.as_str()) {
                if record.ttl != desired.ttl {
                    plan.retune.push(record.clone());
                }
            } else {
                plan.delete.push(record.clone());
            }
        }

        plan.create = desired
            .values
            .iter()
            .filter(|value| !kept.contains(value.as_str()))
            .cloned()
            .collect();

        plan
    }

    fn is_empty(&self) -> bool {
        self.create.is_empty() && self.delete.is_empty() && self.retune.is_empty()
    }

    fn result(&self, had_records: bool) -> UpsertResult {
        if self.is_empty() {
            UpsertResult::Unchanged
        } else if !had_records {
            UpsertResult::Created
        } else {
            UpsertResult::Updated {
                added: self.create.len(),
                removed: self.delete.len(),
            }
        }
    }
}

/// Map a failed HTTP status onto the error taxonomy
fn status_error(status: StatusCode, body: &str, context: &str) -> Error {
    match status.as_u16() {
        401 | 403 => Error::auth(format!(
            "{}: invalid API token or insufficient permissions ({})",
            context, status
        )),
        404 => Error::not_found(format!("{}: not found ({})", context, status)),
        429 => Error::rate_limited(format!("{}: rate limit exceeded ({})", context, status)),
        500..=599 => Error::provider(
            PROVIDER,
            format!("{}: Cloudflare server error (transient): {} - {}", context, status, body),
        ),
        _ => Error::provider(PROVIDER, format!("{}: {} - {}", context, status, body)),
    }
}

/// Cloudflare DNS provider
///
/// # Dry-Run Mode
///
/// When `dry_run` is true, the provider will:
/// - Perform the list request
/// - Log every intended create, delete and update
/// - **NOT** modify any DNS record
pub struct CloudflareProvider {
    /// Cloudflare API token
    /// ⚠️ NEVER log this value
    api_token: String,

    /// HTTP client for API requests
    client: reqwest::Client,

    /// Dry-run mode: list, but log writes instead of sending them
    dry_run: bool,
}

// Custom Debug implementation that hides the API token
impl std::fmt::Debug for CloudflareProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudflareProvider")
            .field("api_token", &"<REDACTED>")
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl CloudflareProvider {
    /// Create a new Cloudflare provider
    ///
    /// # Parameters
    ///
    /// - `api_token`: Cloudflare API token with Zone:DNS:Edit permissions
    /// - `dry_run`: If true, list records but skip every write
    pub fn new(api_token: impl Into<String>, dry_run: bool) -> Result<Self> {
        let api_token = api_token.into();
        if api_token.is_empty() {
            return Err(Error::config("Cloudflare API token cannot be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_token,
            client,
            dry_run,
        })
    }

    /// Create a provider from the provider configuration
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        match config {
            ProviderConfig::Cloudflare { api_token, dry_run } => {
                Self::new(api_token.clone(), *dry_run)
            }
            other => Err(Error::config(format!(
                "Expected cloudflare provider configuration, got {}",
                other.type_name()
            ))),
        }
    }

    /// Whether writes are only logged
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn records_url(zone_id: &str) -> String {
        format!("{}/zones/{}/dns_records", CLOUDFLARE_API_BASE, zone_id)
    }

    fn record_url(zone_id: &str, record_id: &str) -> String {
        format!("{}/{}", Self::records_url(zone_id), record_id)
    }

    /// Send an authenticated request and return its result
    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        context: &str,
    ) -> Result<Option<T>> {
        Ok(self.execute_envelope(request, context).await?.result)
    }

    /// Send an authenticated request and check the response envelope
    async fn execute_envelope<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        context: &str,
    ) -> Result<ApiResponse<T>> {
        let response = request
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| Error::provider(PROVIDER, format!("{}: HTTP request failed: {}", context, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(status_error(status, &body, context));
        }

        let envelope: ApiResponse<T> = response.json().await.map_err(|e| {
            Error::provider(PROVIDER, format!("{}: failed to parse response: {}", context, e))
        })?;

        if !envelope.success {
            let messages: Vec<String> = envelope
                .errors
                .iter()
                .map(|error| format!("{} ({})", error.message, error.code))
                .collect();
            return Err(Error::provider(
                PROVIDER,
                format!("{}: {}", context, messages.join(", ")),
            ));
        }

        Ok(envelope)
    }

    /// List every A record for `name` in `zone_id`, across all pages
    async fn list_records(&self, zone_id: &str, name: &str) -> Result<Vec<DnsRecord>> {
        let per_page = LIST_PAGE_SIZE.to_string();
        let mut records = Vec::new();
        let mut page = 1;

        loop {
            let page_param = page.to_string();
            let request = self.client.get(Self::records_url(zone_id)).query(&[
                ("type", "A"),
                ("name", name),
                ("per_page", per_page.as_str()),
                ("page", page_param.as_str()),
            ]);

            let envelope: ApiResponse<Vec<DnsRecord>> = self
                .execute_envelope(request, &format!("List records {} (page {})", name, page))
                .await?;
            records.extend(envelope.result.unwrap_or_default());

            match envelope.result_info.and_then(|info| info.next_page()) {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }

        debug!("Listed {} A record(s) for {}", records.len(), name);
        Ok(records)
    }

    fn record_body(record_set: &RecordSet, content: &str) -> serde_json::Value {
        serde_json::json!({
            "type": record_set.record_type.as_str(),
            "name": record_set.name,
            "content": content,
            "ttl": record_set.ttl,
            "proxied": false,
        })
    }

    async fn apply(&self, record_set: &RecordSet, plan: &ChangePlan) -> Result<()> {
        let zone_id = record_set.zone_id.as_str();

        for value in &plan.create {
            let request = self
                .client
                .post(Self::records_url(zone_id))
                .json(&Self::record_body(record_set, value));
            self.execute::<serde_json::Value>(request, &format!("Create {} -> {}", record_set.name, value))
                .await?;
            debug!("Created {} -> {}", record_set.name, value);
        }

        for record in &plan.delete {
            let request = self.client.delete(Self::record_url(zone_id, &record.id));
            self.execute::<serde_json::Value>(
                request,
                &format!("Delete {} -> {}", record_set.name, record.content),
            )
            .await?;
            debug!("Deleted {} -> {}", record_set.name, record.content);
        }

        for record in &plan.retune {
            let request = self
                .client
                .put(Self::record_url(zone_id, &record.id))
                .json(&Self::record_body(record_set, &record.content));
            self.execute::<serde_json::Value>(
                request,
                &format!("Update TTL {} -> {}", record_set.name, record.content),
            )
            .await?;
            debug!("Updated TTL of {} -> {} to {}", record_set.name, record.content, record_set.ttl);
        }

        Ok(())
    }
}

#[async_trait]
impl DnsProvider for CloudflareProvider {
    async fn upsert_record(&self, record_set: &RecordSet) -> Result<UpsertResult> {
        info!(
            "Upserting Cloudflare record set: {} {} -> {:?} (ttl {}) [mode: {}]",
            record_set.name,
            record_set.record_type,
            record_set.values,
            record_set.ttl,
            if self.dry_run { "DRY-RUN" } else { "LIVE" }
        );

        let existing = self.list_records(&record_set.zone_id, &record_set.name).await?;
        let plan = ChangePlan::between(&existing, record_set);
        let result = plan.result(!existing.is_empty());

        if plan.is_empty() {
            info!("Record set already up to date: {}", record_set.name);
            return Ok(result);
        }

        if self.dry_run {
            info!(
                "[DRY-RUN] {}: would create {:?}, delete {:?}, update TTL of {:?}",
                record_set.name,
                plan.create,
                plan.delete.iter().map(|r| r.content.as_str()).collect::<Vec<_>>(),
                plan.retune.iter().map(|r| r.content.as_str()).collect::<Vec<_>>()
            );
            return Ok(result);
        }

        self.apply(record_set, &plan).await?;

        info!("Record set updated: {} ({:?})", record_set.name, result);
        Ok(result)
    }

    fn provider_name(&self) -> &'static str {
        PROVIDER
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostdns_core::traits::RecordType;

    fn record(id: &str, content: &str, ttl: u32) -> DnsRecord {
        DnsRecord {
            id: id.to_string(),
            content: content.to_string(),
            ttl,
        }
    }

    fn desired(values: &[&str]) -> RecordSet {
        RecordSet::new("zone", "www.example.com", RecordType::A, 60).with_values(values.iter().copied())
    }

    #[test]
    fn test_plan_for_new_name() {
        let plan = ChangePlan::between(&[], &desired(&["10.0.0.1", "10.0.0.2"]));

        assert_eq!(plan.create, vec!["10.0.0.1", "10.0.0.2"]);
        assert!(plan.delete.is_empty());
        assert_eq!(plan.result(false), UpsertResult::Created);
    }

    #[test]
    fn test_plan_replaces_changed_values() {
        let existing = [record("a", "10.0.0.1", 60), record("b", "10.0.0.9", 60)];
        let plan = ChangePlan::between(&existing, &desired(&["10.0.0.1", "10.0.0.2"]));

        assert_eq!(plan.create, vec!["10.0.0.2"]);
        assert_eq!(plan.delete, vec![record("b", "10.0.0.9", 60)]);
        assert!(plan.retune.is_empty());
        assert_eq!(plan.result(true), UpsertResult::Updated { added: 1, removed: 1 });
    }

    #[test]
    fn test_plan_is_empty_when_in_sync() {
        let existing = [record("a", "10.0.0.1", 60)];
        let plan = ChangePlan::between(&existing, &desired(&["10.0.0.1"]));

        assert!(plan.is_empty());
        assert_eq!(plan.result(true), UpsertResult::Unchanged);
    }

    #[test]
    fn test_plan_retunes_ttl_and_drops_duplicates() {
        let existing = [record("a", "10.0.0.1", 300), record("b", "10.0.0.1", 60)];
        let plan = ChangePlan::between(&existing, &desired(&["10.0.0.1"]));

        assert!(plan.create.is_empty());
        assert_eq!(plan.retune, vec![record("a", "10.0.0.1", 300)]);
        assert_eq!(plan.delete, vec![record("b", "10.0.0.1", 60)]);
    }

    #[test]
    fn test_status_error_mapping() {
        let auth = status_error(StatusCode::FORBIDDEN, "", "List");
        assert!(matches!(auth, Error::Authentication(_)));

        let unauthorized = status_error(StatusCode::UNAUTHORIZED, "", "List");
        assert!(matches!(unauthorized, Error::Authentication(_)));

        assert!(status_error(StatusCode::NOT_FOUND, "", "List").is_not_found());

        let limited = status_error(StatusCode::TOO_MANY_REQUESTS, "", "List");
        assert!(matches!(limited, Error::RateLimited(_)));

        let server = status_error(StatusCode::BAD_GATEWAY, "oops", "List");
        assert!(matches!(server, Error::Provider { .. }));
    }

    #[test]
    fn test_list_response_parsing() {
        let body = r#"{
            "success": true,
            "errors": [],
            "messages": [],
            "result": [
                {"id": "r1", "type": "A", "name": "www.example.com", "content": "10.0.0.1", "ttl": 60, "proxied": false}
            ]
        }"#;

        let envelope: ApiResponse<Vec<DnsRecord>> = serde_json::from_str(body).unwrap();
        assert!(envelope.success);
        assert_eq!(envelope.result.unwrap(), vec![record("r1", "10.0.0.1", 60)]);

        let failed: ApiResponse<Vec<DnsRecord>> = serde_json::from_str(
            r#"{"success":false,"errors":[{"code":9109,"message":"Invalid access token"}],"result":null}"#,
        )
        .unwrap();
        assert!(!failed.success);
        assert_eq!(failed.errors[0].code, 9109);
    }

    #[test]
    fn test_list_paging() {
        let body = r#"{
            "success": true,
            "errors": [],
            "result": [],
            "result_info": {"page": 1, "per_page": 5000, "count": 5000, "total_count": 5001, "total_pages": 2}
        }"#;
        let envelope: ApiResponse<Vec<DnsRecord>> = serde_json::from_str(body).unwrap();
        let info = envelope.result_info.unwrap();
        assert_eq!(info.next_page(), Some(2));

        let last: ResultInfo = serde_json::from_str(r#"{"page": 2, "total_pages": 2}"#).unwrap();
        assert_eq!(last.next_page(), None);

        // single-page answers may omit the paging details entirely
        let bare: ApiResponse<Vec<DnsRecord>> =
            serde_json::from_str(r#"{"success":true,"errors":[],"result":[]}"#).unwrap();
        assert!(bare.result_info.is_none());
    }

    #[test]
    fn test_empty_token_is_rejected() {
        assert!(CloudflareProvider::new("", false).is_err());

        let config = ProviderConfig::Cloudflare {
            api_token: String::new(),
            dry_run: false,
        };
        assert!(CloudflareProvider::from_config(&config).is_err());
    }

    #[test]
    fn test_other_provider_config_is_rejected() {
        let config = ProviderConfig::Route53 {
            region: None,
            dry_run: false,
        };
        assert!(CloudflareProvider::from_config(&config).is_err());
    }

    #[test]
    fn test_dry_run_from_config() {
        let config = ProviderConfig::Cloudflare {
            api_token: "token".to_string(),
            dry_run: true,
        };
        let provider = CloudflareProvider::from_config(&config).unwrap();

        assert!(provider.is_dry_run());
        assert_eq!(provider.provider_name(), "cloudflare");
    }

    #[test]
    fn test_api_token_not_exposed_in_debug() {
        let provider = CloudflareProvider::new("secret_token_12345", false).unwrap();

        let debug_str = format!("{:?}", provider);
        assert!(!debug_str.contains("secret_token"));
        assert!(debug_str.contains("CloudflareProvider"));
    }

    #[test]
    fn test_record_urls() {
        assert_eq!(
            CloudflareProvider::record_url("zone", "r1"),
            "https://api.cloudflare.com/client/v4/zones/zone/dns_records/r1"
        );
    }
}

//! Remote scraping-actor contract + HTTP implementation.
//!
//! The remote service runs "actors" (scrape jobs). Every run writes its records
//! into a dataset that can be paged while the run is still going.

use std::fmt;

use async_trait::async_trait;
use chrono::NaiveDate;
use leadflow_storage::{ApiRequest, FetchError, HttpClientConfig, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "leadflow-adapters";

pub const DEFAULT_API_BASE: &str = "https://api.apify.com";
pub const DEFAULT_BULK_ACTOR: &str = "igolaizola~facebook-ad-library-scraper";
pub const DEFAULT_PAGES_ACTOR: &str = "api-empire~facebook-pages-scraper";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Ready,
    Running,
    Succeeded,
    Failed,
    TimingOut,
    TimedOut,
    Aborting,
    Aborted,
    Other(String),
}

impl RunStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "READY" => Self::Ready,
            "RUNNING" => Self::Running,
            "SUCCEEDED" => Self::Succeeded,
            "FAILED" => Self::Failed,
            "TIMING-OUT" => Self::TimingOut,
            "TIMED-OUT" => Self::TimedOut,
            "ABORTING" => Self::Aborting,
            "ABORTED" => Self::Aborted,
            _ => Self::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::TimingOut => "TIMING-OUT",
            Self::TimedOut => "TIMED-OUT",
            Self::Aborting => "ABORTING",
            Self::Aborted => "ABORTED",
            Self::Other(raw) => raw,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Aborted
        )
    }

    /// Terminal without producing a usable dataset.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut | Self::Aborted)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub run_id: String,
    pub dataset_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInfo {
    pub status: RunStatus,
    pub item_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub memory_mb: Option<u32>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatasetQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub desc: bool,
    pub clean: Option<bool>,
}

impl DatasetQuery {
    /// Freshest `limit` items, cleaned.
    pub fn head(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            offset: None,
            desc: true,
            clean: Some(true),
        }
    }

    /// Raw page in insertion order.
    pub fn page(offset: usize, limit: usize) -> Self {
        Self {
            limit: Some(limit),
            offset: Some(offset),
            desc: false,
            clean: Some(false),
        }
    }

    pub fn all() -> Self {
        Self::default()
    }
}

#[derive(Debug, Error)]
pub enum ActorError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding {context}: {source}")]
    Decode {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("response missing {0}")]
    MissingField(&'static str),
    #[error("{0}")]
    Message(String),
}

/// Operations the pipeline needs from the remote scraping service.
#[async_trait]
pub trait ActorClient: Send + Sync {
    async fn start_run(
        &self,
        actor_id: &str,
        input: &JsonValue,
        options: &RunOptions,
    ) -> Result<RunHandle, ActorError>;

    async fn run_info(&self, actor_id: &str, run_id: &str) -> Result<RunInfo, ActorError>;

    async fn abort_run(&self, actor_id: &str, run_id: &str) -> Result<(), ActorError>;

    async fn dataset_items(
        &self,
        dataset_id: &str,
        query: &DatasetQuery,
    ) -> Result<Vec<JsonValue>, ActorError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfiguration {
    pub use_apify_proxy: bool,
    pub apify_proxy_groups: Vec<String>,
}

impl Default for ProxyConfiguration {
    fn default() -> Self {
        Self {
            use_apify_proxy: true,
            apify_proxy_groups: vec!["RESIDENTIAL".to_string()],
        }
    }
}

/// Input of one per-keyword ad-library pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkPullInput {
    pub max_items: u32,
    pub query: String,
    pub country: String,
    pub category: String,
    pub media_type: String,
    pub sort_by: String,
    pub active_status: String,
    pub advertisers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_start_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_end_date: Option<NaiveDate>,
    pub proxy_configuration: ProxyConfiguration,
}

impl BulkPullInput {
    pub fn new(keyword: impl Into<String>, country: impl Into<String>) -> Self {
        Self {
            max_items: 100,
            query: keyword.into(),
            country: country.into(),
            category: "all".to_string(),
            media_type: "all".to_string(),
            sort_by: "mostRecent".to_string(),
            active_status: "active".to_string(),
            advertisers: Vec::new(),
            search_start_date: None,
            search_end_date: None,
            proxy_configuration: ProxyConfiguration::default(),
        }
    }
}

/// Input of one page re-scrape batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageScrapeInput {
    pub start_urls: Vec<String>,
    pub proxy_configuration: ProxyConfiguration,
}

impl PageScrapeInput {
    pub fn new(start_urls: Vec<String>) -> Self {
        Self {
            start_urls,
            proxy_configuration: ProxyConfiguration::default(),
        }
    }
}

pub fn to_input_json<T: Serialize>(input: &T) -> Result<JsonValue, ActorError> {
    serde_json::to_value(input).map_err(|source| ActorError::Decode {
        context: "actor input",
        source,
    })
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunData {
    id: Option<String>,
    default_dataset_id: Option<String>,
    status: Option<String>,
    #[serde(default)]
    stats: Option<RunStats>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunStats {
    #[serde(default)]
    item_count: Option<u64>,
}

fn decode_run(body: &[u8], context: &'static str) -> Result<RunData, ActorError> {
    serde_json::from_slice::<Envelope<RunData>>(body)
        .map(|env| env.data)
        .map_err(|source| ActorError::Decode { context, source })
}

pub fn parse_run_handle(body: &[u8]) -> Result<RunHandle, ActorError> {
    let run = decode_run(body, "run creation response")?;
    Ok(RunHandle {
        run_id: run.id.ok_or(ActorError::MissingField("data.id"))?,
        dataset_id: run
            .default_dataset_id
            .ok_or(ActorError::MissingField("data.defaultDatasetId"))?,
    })
}

pub fn parse_run_info(body: &[u8]) -> Result<RunInfo, ActorError> {
    let run = decode_run(body, "run status response")?;
    let status = run.status.ok_or(ActorError::MissingField("data.status"))?;
    Ok(RunInfo {
        status: RunStatus::parse(&status),
        item_count: run.stats.and_then(|s| s.item_count).unwrap_or(0),
    })
}

pub fn parse_dataset_items(body: &[u8]) -> Result<Vec<JsonValue>, ActorError> {
    match serde_json::from_slice::<JsonValue>(body).map_err(|source| ActorError::Decode {
        context: "dataset items",
        source,
    })? {
        JsonValue::Array(items) => Ok(items),
        other => Err(ActorError::Message(format!(
            "dataset items response is not an array (got {})",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// [`ActorClient`] speaking the Apify v2 REST API, directly or through a proxy
/// that mirrors its paths.
#[derive(Debug)]
pub struct ApifyClient {
    http: HttpFetcher,
    base_url: String,
    token: Option<String>,
}

impl ApifyClient {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        http: HttpClientConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(http)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    pub fn runs_url(&self, actor_id: &str) -> String {
        format!("{}/v2/acts/{}/runs", self.base_url, actor_id)
    }

    pub fn run_url(&self, actor_id: &str, run_id: &str) -> String {
        format!("{}/{}", self.runs_url(actor_id), run_id)
    }

    pub fn dataset_items_url(&self, dataset_id: &str) -> String {
        format!("{}/v2/datasets/{}/items", self.base_url, dataset_id)
    }

    fn authed(&self, request: ApiRequest) -> ApiRequest {
        request.bearer(self.token.as_deref())
    }
}

#[async_trait]
impl ActorClient for ApifyClient {
    async fn start_run(
        &self,
        actor_id: &str,
        input: &JsonValue,
        options: &RunOptions,
    ) -> Result<RunHandle, ActorError> {
        let mut request = ApiRequest::post(self.runs_url(actor_id)).json(input.clone());
        if let Some(memory) = options.memory_mb {
            request = request.query("memory", memory);
        }
        if let Some(timeout) = options.timeout_secs {
            request = request.query("timeout", timeout);
        }
        let resp = self.http.send(&self.authed(request)).await?;
        let handle = parse_run_handle(&resp.body)?;
        debug!(actor_id, run_id = %handle.run_id, dataset_id = %handle.dataset_id, "actor run created");
        Ok(handle)
    }

    async fn run_info(&self, actor_id: &str, run_id: &str) -> Result<RunInfo, ActorError> {
        let request = ApiRequest::get(self.run_url(actor_id, run_id));
        let resp = self.http.send(&self.authed(request)).await?;
        parse_run_info(&resp.body)
    }

    async fn abort_run(&self, actor_id: &str, run_id: &str) -> Result<(), ActorError> {
        let request = ApiRequest::post(format!("{}/abort", self.run_url(actor_id, run_id)));
        self.http.send(&self.authed(request)).await?;
        debug!(actor_id, run_id, "actor run abort requested");
        Ok(())
    }

    async fn dataset_items(
        &self,
        dataset_id: &str,
        query: &DatasetQuery,
    ) -> Result<Vec<JsonValue>, ActorError> {
        let mut request = ApiRequest::get(self.dataset_items_url(dataset_id)).query("format", "json");
        if let Some(limit) = query.limit {
            request = request.query("limit", limit);
        }
        if let Some(offset) = query.offset {
            request = request.query("offset", offset);
        }
        if query.desc {
            request = request.query("desc", true);
        }
        if let Some(clean) = query.clean {
            request = request.query("clean", clean);
        }
        let resp = self.http.send(&self.authed(request)).await?;
        parse_dataset_items(&resp.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_handle_reads_id_and_default_dataset() {
        let body = br#"{"data":{"id":"run-1","defaultDatasetId":"ds-1","status":"READY"}}"#;
        let handle = parse_run_handle(body).expect("handle");
        assert_eq!(handle.run_id, "run-1");
        assert_eq!(handle.dataset_id, "ds-1");
    }

    #[test]
    fn run_handle_without_dataset_is_rejected() {
        let body = br#"{"data":{"id":"run-1"}}"#;
        let err = parse_run_handle(body).expect_err("missing dataset");
        assert!(matches!(err, ActorError::MissingField("data.defaultDatasetId")));
    }

    #[test]
    fn run_info_defaults_item_count() {
        let info = parse_run_info(br#"{"data":{"status":"RUNNING"}}"#).expect("info");
        assert_eq!(info.status, RunStatus::Running);
        assert_eq!(info.item_count, 0);

        let info = parse_run_info(br#"{"data":{"status":"TIMED-OUT","stats":{"itemCount":7}}}"#)
            .expect("info");
        assert_eq!(info.status, RunStatus::TimedOut);
        assert!(info.status.is_terminal_failure());
        assert_eq!(info.item_count, 7);
    }

    #[test]
    fn unknown_status_is_preserved_and_not_terminal() {
        let status = RunStatus::parse("PAUSED");
        assert_eq!(status, RunStatus::Other("PAUSED".to_string()));
        assert_eq!(status.as_str(), "PAUSED");
        assert!(!status.is_terminal());
        assert!(RunStatus::parse("succeeded").is_terminal());
    }

    #[test]
    fn dataset_items_must_be_an_array() {
        let items = parse_dataset_items(br#"[{"a":1},{"a":2}]"#).expect("items");
        assert_eq!(items.len(), 2);
        assert!(parse_dataset_items(br#"{"error":"nope"}"#).is_err());
    }

    #[test]
    fn bulk_pull_input_uses_camel_case_wire_names() {
        let mut input = BulkPullInput::new("plumber", "AU");
        input.search_start_date = NaiveDate::from_ymd_opt(2026, 2, 1);
        let value = to_input_json(&input).expect("json");
        assert_eq!(value["query"], "plumber");
        assert_eq!(value["maxItems"], 100);
        assert_eq!(value["sortBy"], "mostRecent");
        assert_eq!(value["searchStartDate"], "2026-02-01");
        assert!(value.get("searchEndDate").is_none());
        assert_eq!(
            value["proxyConfiguration"],
            json!({"useApifyProxy": true, "apifyProxyGroups": ["RESIDENTIAL"]})
        );
    }

    #[test]
    fn page_scrape_input_lists_start_urls() {
        let value = to_input_json(&PageScrapeInput::new(vec![
            "https://facebook.com/a".to_string(),
        ]))
        .expect("json");
        assert_eq!(value["startUrls"], json!(["https://facebook.com/a"]));
    }

    #[test]
    fn client_builds_actor_paths_without_double_slashes() {
        let client = ApifyClient::new("http://localhost:3001/apify/", None, HttpClientConfig::default())
            .expect("client");
        assert_eq!(
            client.run_url(DEFAULT_BULK_ACTOR, "r1"),
            "http://localhost:3001/apify/v2/acts/igolaizola~facebook-ad-library-scraper/runs/r1"
        );
        assert_eq!(
            client.dataset_items_url("ds9"),
            "http://localhost:3001/apify/v2/datasets/ds9/items"
        );
    }
}

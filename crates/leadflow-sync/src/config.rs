//! Environment config, `config/leadflow.yaml` settings and the category
//! allow-list under `rules/`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use leadflow_adapters::{
    BulkPullInput, RunOptions, DEFAULT_API_BASE, DEFAULT_BULK_ACTOR, DEFAULT_PAGES_ACTOR,
};
use leadflow_storage::HttpClientConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::PipelineError;

pub const SETTINGS_FILE: &str = "config/leadflow.yaml";
pub const CATEGORY_RULES_FILE: &str = "rules/categories.yaml";

pub const DEFAULT_DEDUP_COLUMN: &str = "snapshot/page_profile_uri";
pub const DEFAULT_FILTER_COLUMN: &str = "snapshot/page_categories/0";
pub const DEFAULT_URL_COLUMN: &str = "snapshot/page_profile_uri";
pub const DEFAULT_URL_HOST: &str = "facebook.com";

pub const DEFAULT_ALLOWED_COLUMNS: &[&str] = &[
    "ad_archive_id",
    "collation_count",
    "end_date",
    "entity_type",
    "impressions_with_index/impressions_text",
    "page_id",
    "page_name",
    "publisher_platform/0",
    "publisher_platform/1",
    "snapshot/body/text",
    "snapshot/page_categories/0",
    "snapshot/page_like_count",
    "snapshot/page_name",
    "snapshot/page_profile_uri",
    "snapshot/title",
    "start_date",
];

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base: String,
    pub api_token: Option<String>,
    pub bulk_actor: String,
    pub pages_actor: String,
    pub output_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub actor_memory_mb: u32,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            api_base: var("LEADFLOW_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            api_token: var("LEADFLOW_API_TOKEN"),
            bulk_actor: var("LEADFLOW_BULK_ACTOR").unwrap_or_else(|| DEFAULT_BULK_ACTOR.to_string()),
            pages_actor: var("LEADFLOW_PAGES_ACTOR")
                .unwrap_or_else(|| DEFAULT_PAGES_ACTOR.to_string()),
            output_dir: var("LEADFLOW_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./output")),
            user_agent: var("LEADFLOW_USER_AGENT")
                .unwrap_or_else(|| "leadflow-bot/0.1".to_string()),
            http_timeout_secs: var("LEADFLOW_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            actor_memory_mb: var("LEADFLOW_ACTOR_MEMORY_MB")
                .and_then(|v| v.parse().ok())
                .unwrap_or(128),
            workspace_root: var("LEADFLOW_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.workspace_root.join(SETTINGS_FILE)
    }

    pub fn category_rules_path(&self) -> PathBuf {
        self.workspace_root.join(CATEGORY_RULES_FILE)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    Exact,
    #[default]
    Contains,
}

/// Parameters of the per-keyword bulk pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionParams {
    pub country: String,
    pub active_status: String,
    pub min_date: Option<NaiveDate>,
    pub max_date: Option<NaiveDate>,
    pub max_items: u32,
    pub max_concurrency: usize,
    pub max_runtime_minutes: Option<u64>,
    pub violation_guard: bool,
    pub violation_streak_limit: u32,
}

impl Default for AcquisitionParams {
    fn default() -> Self {
        Self {
            country: "AU".to_string(),
            active_status: "active".to_string(),
            min_date: None,
            max_date: None,
            max_items: 100,
            max_concurrency: 100,
            max_runtime_minutes: None,
            violation_guard: true,
            violation_streak_limit: 5,
        }
    }
}

impl AcquisitionParams {
    pub fn require_min_date(&self) -> Result<NaiveDate, PipelineError> {
        self.min_date.ok_or_else(|| {
            PipelineError::Configuration("minimum acquisition date is required".to_string())
        })
    }

    /// The calendar day right before `min_date`; a freshest item dated on it
    /// means the pull has run past the requested window.
    pub fn violation_date(&self) -> Option<NaiveDate> {
        self.min_date.and_then(|d| d.pred_opt())
    }

    pub fn streak_limit(&self) -> u32 {
        self.violation_streak_limit.max(1)
    }

    pub fn concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }

    pub fn bulk_input(&self, keyword: &str) -> BulkPullInput {
        let mut input = BulkPullInput::new(keyword, self.country.clone());
        if self.max_items > 0 {
            input.max_items = self.max_items;
        }
        input.active_status = self.active_status.clone();
        input.search_start_date = self.min_date;
        input.search_end_date = self.max_date;
        input
    }

    pub fn run_options(&self, memory_mb: u32) -> RunOptions {
        RunOptions {
            memory_mb: Some(memory_mb).filter(|m| *m > 0),
            timeout_secs: self.max_runtime_minutes.filter(|m| *m > 0).map(|m| m * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Prefix of exported file names.
    pub source_name: String,
    pub dedup_column: String,
    pub filter_column: String,
    pub url_column: String,
    pub url_host: String,
    pub match_mode: MatchMode,
    pub allowed_columns: Vec<String>,
    pub batch_size: usize,
    pub acquisition: AcquisitionParams,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            source_name: "pipeline".to_string(),
            dedup_column: DEFAULT_DEDUP_COLUMN.to_string(),
            filter_column: DEFAULT_FILTER_COLUMN.to_string(),
            url_column: DEFAULT_URL_COLUMN.to_string(),
            url_host: DEFAULT_URL_HOST.to_string(),
            match_mode: MatchMode::default(),
            allowed_columns: DEFAULT_ALLOWED_COLUMNS.iter().map(|c| c.to_string()).collect(),
            batch_size: crate::batch::DEFAULT_BATCH_SIZE,
            acquisition: AcquisitionParams::default(),
        }
    }
}

impl PipelineSettings {
    /// Missing file means defaults; a present but invalid file is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "settings file not found; using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        serde_yaml::to_string(self).context("serializing settings")
    }

    /// Checks that need no remote call: required columns are exported, the
    /// minimum date is set, batch sizing is sane.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let missing: Vec<&str> = [&self.dedup_column, &self.filter_column, &self.url_column]
            .into_iter()
            .filter(|col| !self.allowed_columns.iter().any(|c| c == *col))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "required column(s) missing from allowed export list: {}",
                missing.join(", ")
            )));
        }
        if self.batch_size == 0 {
            return Err(PipelineError::Configuration(
                "batch_size must be at least 1".to_string(),
            ));
        }
        self.acquisition.require_min_date()?;
        Ok(())
    }
}

/// One keyword per line; blank lines dropped.
pub fn parse_keywords(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CategoryRules {
    pub version: u32,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl CategoryRules {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_lookup_applies_defaults_and_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("LEADFLOW_API_TOKEN", "tok"),
            ("LEADFLOW_HTTP_TIMEOUT_SECS", "45"),
            ("LEADFLOW_ACTOR_MEMORY_MB", "not-a-number"),
            ("LEADFLOW_OUTPUT_DIR", "  "),
        ]);
        let config = SyncConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.api_token.as_deref(), Some("tok"));
        assert_eq!(config.http_timeout_secs, 45);
        assert_eq!(config.actor_memory_mb, 128);
        assert_eq!(config.output_dir, PathBuf::from("./output"));
        assert_eq!(config.bulk_actor, DEFAULT_BULK_ACTOR);
        assert_eq!(config.settings_path(), PathBuf::from("./config/leadflow.yaml"));
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let settings = PipelineSettings::from_yaml_str(
            "match_mode: exact\nacquisition:\n  min_date: 2024-03-01\n  max_concurrency: 4\n",
        )
        .expect("settings");
        assert_eq!(settings.match_mode, MatchMode::Exact);
        assert_eq!(settings.dedup_column, DEFAULT_DEDUP_COLUMN);
        assert_eq!(settings.acquisition.max_concurrency, 4);
        assert_eq!(settings.acquisition.country, "AU");
        assert_eq!(settings.allowed_columns.len(), DEFAULT_ALLOWED_COLUMNS.len());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn validation_rejects_unexported_required_columns() {
        let mut settings = PipelineSettings::default();
        settings.acquisition.min_date = NaiveDate::from_ymd_opt(2024, 3, 1);
        settings.url_column = "snapshot/link_url".to_string();
        let err = settings.validate().expect_err("url column not exported");
        assert!(matches!(err, PipelineError::Configuration(msg) if msg.contains("snapshot/link_url")));
    }

    #[test]
    fn validation_requires_min_date() {
        let err = PipelineSettings::default().validate().expect_err("no min date");
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn violation_date_is_day_before_minimum() {
        let params = AcquisitionParams {
            min_date: NaiveDate::from_ymd_opt(2024, 3, 1),
            ..Default::default()
        };
        assert_eq!(params.violation_date(), NaiveDate::from_ymd_opt(2024, 2, 29));
        assert_eq!(AcquisitionParams::default().violation_date(), None);
    }

    #[test]
    fn bulk_input_carries_window_and_runtime() {
        let params = AcquisitionParams {
            min_date: NaiveDate::from_ymd_opt(2024, 3, 1),
            max_runtime_minutes: Some(3),
            max_items: 0,
            ..Default::default()
        };
        let input = params.bulk_input("electrician");
        assert_eq!(input.query, "electrician");
        assert_eq!(input.max_items, 100);
        assert_eq!(input.search_start_date, params.min_date);
        assert_eq!(input.search_end_date, None);
        let options = params.run_options(256);
        assert_eq!(options.memory_mb, Some(256));
        assert_eq!(options.timeout_secs, Some(180));
    }

    #[test]
    fn keywords_are_trimmed_lines() {
        assert_eq!(
            parse_keywords(" electrician \n\n plumber\r\n  "),
            vec!["electrician", "plumber"]
        );
    }

    #[test]
    fn category_rules_parse() {
        let rules = CategoryRules::from_yaml_str("version: 1\nkeywords:\n  - Electrician\n  - plumber\n")
            .expect("rules");
        assert_eq!(rules.version, 1);
        assert_eq!(rules.keywords, vec!["Electrician", "plumber"]);
    }

    #[test]
    fn shipped_settings_and_rules_load() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let settings = PipelineSettings::load(&root.join(SETTINGS_FILE)).expect("settings");
        assert_eq!(settings, PipelineSettings::default());

        let rules = CategoryRules::load(&root.join(CATEGORY_RULES_FILE)).expect("rules");
        assert!(rules.keywords.iter().any(|k| k == "Electrician"));
        assert!(rules.keywords.iter().any(|k| k == "Demolition & excavation company"));
    }
}

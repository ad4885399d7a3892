//! Row stages: dedup, purify, category filter, URL extraction and the
//! keyword tag merge onto re-scraped records.

use std::collections::HashMap;

use indexmap::{IndexMap, IndexSet};
use leadflow_core::{
    flatten_record, keyword_column_index, keyword_columns, stringify_record, stringify_value,
    PipelineStats, Row,
};
use serde_json::Value as JsonValue;

use crate::config::{MatchMode, PipelineSettings};
use crate::PipelineError;

/// Characters the purifier lets through: ASCII, Latin-1, math alphanumerics,
/// general punctuation through misc symbols/arrows, variation selectors and
/// the emoji planes, plus a few look-alike glyphs seen in page names.
pub fn is_allowed_char(ch: char) -> bool {
    let code = ch as u32;
    code <= 0x7F
        || (0xA0..=0xFF).contains(&code)
        || code == 0xD7
        || code == 0xF7
        || (0x1D400..=0x1D7FF).contains(&code)
        || (0xFFF0..=0xFFFF).contains(&code)
        || code == 0xFF1A
        || code == 0x30B7
        || code == 0x30C4
        || (0x2000..=0x2BFF).contains(&code)
        || (0x2E00..=0x2E7F).contains(&code)
        || (0xFE00..=0xFE0F).contains(&code)
        || (0x1F000..=0x1FFFF).contains(&code)
}

/// True at the first disallowed character. Provenance keyword columns are
/// operator input and are not inspected.
pub fn row_has_foreign_script(row: &Row) -> bool {
    row.iter()
        .filter(|(column, _)| keyword_column_index(column).is_none())
        .any(|(_, value)| value.chars().any(|ch| !is_allowed_char(ch)))
}

#[derive(Debug, Clone)]
pub struct CategoryFilter {
    mode: MatchMode,
    terms: IndexSet<String>,
}

impl CategoryFilter {
    pub fn new<S: AsRef<str>>(mode: MatchMode, terms: impl IntoIterator<Item = S>) -> Self {
        let terms = terms
            .into_iter()
            .map(|t| t.as_ref().trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        Self { mode, terms }
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn matches(&self, value: &str) -> bool {
        let value = value.trim().to_lowercase();
        match self.mode {
            MatchMode::Exact => self.terms.contains(&value),
            MatchMode::Contains => self.terms.iter().any(|term| value.contains(term.as_str())),
        }
    }
}

/// Columns the pipeline exports and the three it depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub allowed: Vec<String>,
    pub dedup: String,
    pub filter: String,
    pub url: String,
}

impl ColumnSpec {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            allowed: settings.allowed_columns.clone(),
            dedup: settings.dedup_column.clone(),
            filter: settings.filter_column.clone(),
            url: settings.url_column.clone(),
        }
    }

    pub fn required(&self) -> [&str; 3] {
        [self.dedup.as_str(), self.filter.as_str(), self.url.as_str()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Kept,
    Duplicate,
    Purified,
    FilteredOut,
}

#[derive(Debug, Clone, Copy)]
enum DedupSlot {
    Survivor(usize),
    Rejected,
}

/// Stages 1-3 over every record of the run. Dedup is run-wide: a key seen
/// once is never admitted again, and duplicates of a surviving row fold their
/// keywords into it.
#[derive(Debug)]
pub struct RowPipeline {
    columns: ColumnSpec,
    filter: CategoryFilter,
    seen: HashMap<String, DedupSlot>,
    rows: Vec<Row>,
    stats: PipelineStats,
    checked_required: bool,
}

impl RowPipeline {
    pub fn new(columns: ColumnSpec, filter: CategoryFilter) -> Self {
        Self {
            columns,
            filter,
            seen: HashMap::new(),
            rows: Vec::new(),
            stats: PipelineStats::default(),
            checked_required: false,
        }
    }

    pub fn columns(&self) -> &ColumnSpec {
        &self.columns
    }

    /// Flatten, project and stamp one remote record, then run it through the
    /// stages. The first record must carry every required column.
    pub fn ingest_record(
        &mut self,
        keyword: &str,
        item: &JsonValue,
    ) -> Result<RowOutcome, PipelineError> {
        let flat = flatten_record(item);
        if !self.checked_required {
            let missing: Vec<&str> = self
                .columns
                .required()
                .into_iter()
                .filter(|col| !flat.contains_column(col))
                .collect();
            if !missing.is_empty() {
                return Err(PipelineError::Configuration(format!(
                    "required column(s) missing from first record: {}",
                    missing.join(", ")
                )));
            }
            self.checked_required = true;
        }

        let mut row = Row::new();
        for column in &self.columns.allowed {
            row.set(column.clone(), single_line(flat.get(column)));
        }
        row.add_keyword(keyword);
        Ok(self.push_row(row))
    }

    pub fn push_row(&mut self, row: Row) -> RowOutcome {
        self.stats.input_rows += 1;
        let key = row.get(&self.columns.dedup).trim().to_string();

        match self.seen.get(&key) {
            Some(DedupSlot::Survivor(idx)) => {
                let idx = *idx;
                self.stats.dedup_removed += 1;
                for keyword in row.keywords() {
                    self.rows[idx].add_keyword(&keyword);
                }
                return RowOutcome::Duplicate;
            }
            Some(DedupSlot::Rejected) => {
                self.stats.dedup_removed += 1;
                return RowOutcome::Duplicate;
            }
            None => {}
        }

        if row_has_foreign_script(&row) {
            self.seen.insert(key, DedupSlot::Rejected);
            self.stats.purifier_removed += 1;
            return RowOutcome::Purified;
        }
        if !self.filter.matches(row.get(&self.columns.filter)) {
            self.seen.insert(key, DedupSlot::Rejected);
            self.stats.category_filter_removed += 1;
            return RowOutcome::FilteredOut;
        }

        self.seen.insert(key, DedupSlot::Survivor(self.rows.len()));
        self.rows.push(row);
        self.stats.filtered_rows = self.rows.len();
        RowOutcome::Kept
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Allowed columns followed by the provenance columns in use.
    pub fn export_headers(&self) -> Vec<String> {
        let mut headers = self.columns.allowed.clone();
        headers.extend(keyword_columns(&self.rows));
        headers
    }

    pub fn into_parts(self) -> (Vec<Row>, PipelineStats) {
        (self.rows, self.stats)
    }
}

fn single_line(value: &str) -> String {
    value.replace("\r\n", " ").replace('\n', " ")
}

/// Absolute http(s) URLs pass through; bare tokens naming `host` get an
/// `https://` scheme. Anything else is not a URL.
pub fn normalize_url(raw: &str, host: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    let has_scheme = lower.starts_with("http://") || lower.starts_with("https://");
    if has_scheme {
        return Some(trimmed.to_string());
    }
    if !host.is_empty() && lower.contains(&host.to_ascii_lowercase()) {
        return Some(format!("https://{}", trimmed.trim_start_matches('/')));
    }
    None
}

/// Split on whitespace and commas, keep what [`normalize_url`] accepts.
pub fn extract_urls(value: &str, host: &str) -> Vec<String> {
    value
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|part| !part.is_empty())
        .filter_map(|part| normalize_url(part, host))
        .collect()
}

/// Normalized URL -> keywords of every filtered row that referenced it.
#[derive(Debug, Clone, Default)]
pub struct UrlKeywordIndex {
    host: String,
    map: IndexMap<String, IndexSet<String>>,
}

impl UrlKeywordIndex {
    pub fn build(rows: &[Row], url_column: &str, host: &str) -> Self {
        let mut map: IndexMap<String, IndexSet<String>> = IndexMap::new();
        for row in rows {
            let urls = extract_urls(row.get(url_column), host);
            if urls.is_empty() {
                continue;
            }
            let keywords = row.keywords();
            for url in urls {
                map.entry(url).or_default().extend(keywords.iter().cloned());
            }
        }
        Self {
            host: host.to_string(),
            map,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Distinct URLs in first-seen order.
    pub fn urls(&self) -> Vec<String> {
        self.map.keys().cloned().collect()
    }

    pub fn keywords_for(&self, url: &str) -> Option<&IndexSet<String>> {
        self.map.get(url)
    }

    /// Indexed URL an enriched record refers to: fields named like `*url*`
    /// first, then any string value mentioning the host.
    pub fn resolve_item_url(&self, item: &JsonValue) -> Option<&str> {
        let JsonValue::Object(fields) = item else {
            return None;
        };
        let by_name = fields
            .iter()
            .filter(|(key, _)| key.to_ascii_lowercase().contains("url"))
            .find_map(|(_, value)| self.lookup(&stringify_value(value)));
        if by_name.is_some() {
            return by_name;
        }
        let host = self.host.to_ascii_lowercase();
        fields.values().find_map(|value| match value {
            JsonValue::String(text) if !host.is_empty() && text.to_ascii_lowercase().contains(&host) => {
                self.lookup(text)
            }
            _ => None,
        })
    }

    fn lookup(&self, raw: &str) -> Option<&str> {
        let normalized = normalize_url(raw, &self.host)?;
        self.map.get_key_value(&normalized).map(|(url, _)| url.as_str())
    }

    /// Stringify an enriched record and stamp the keywords of the URL it
    /// resolves to as `keyword`, `keyword_2`, ...
    pub fn tag_item(&self, item: &JsonValue) -> Row {
        let mut row = stringify_record(item);
        let keywords: Vec<&str> = self
            .resolve_item_url(item)
            .and_then(|url| self.map.get(url))
            .map(|set| set.iter().map(String::as_str).collect())
            .unwrap_or_default();
        row.set_keywords(&keywords);
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> ColumnSpec {
        ColumnSpec {
            allowed: vec!["url".into(), "category".into(), "name".into()],
            dedup: "url".into(),
            filter: "category".into(),
            url: "url".into(),
        }
    }

    fn pipeline(terms: &[&str]) -> RowPipeline {
        RowPipeline::new(spec(), CategoryFilter::new(MatchMode::Contains, terms.iter().copied()))
    }

    fn record(url: &str, category: &str, name: &str) -> JsonValue {
        json!({ "url": url, "category": category, "name": name, "ignored": "x" })
    }

    #[test]
    fn purifier_keeps_latin1_and_drops_cjk() {
        assert!(is_allowed_char('é'));
        assert!(is_allowed_char('😀'));
        assert!(is_allowed_char('—'));
        assert!(!is_allowed_char('安'));
        assert!(!is_allowed_char('д'));

        let mut andre = Row::new();
        andre.set("name", "André");
        assert!(!row_has_foreign_script(&andre));
        let mut cjk = Row::new();
        cjk.set("name", "安德烈");
        assert!(row_has_foreign_script(&cjk));
    }

    #[test]
    fn contains_mode_matches_case_folded_substrings() {
        let filter = CategoryFilter::new(MatchMode::Contains, ["Electrician", " "]);
        assert_eq!(filter.len(), 1);
        assert!(filter.matches("Licensed Electrician Pty Ltd"));
        assert!(!filter.matches("Plumber"));

        let exact = CategoryFilter::new(MatchMode::Exact, ["electrician"]);
        assert!(exact.matches("  ELECTRICIAN "));
        assert!(!exact.matches("Licensed Electrician"));
    }

    #[test]
    fn duplicates_union_keywords_into_survivor() {
        let mut p = pipeline(&["electrician"]);
        let a = record("https://facebook.com/a", "Electrician", "A");
        assert_eq!(p.ingest_record("x", &a).expect("ingest"), RowOutcome::Kept);
        assert_eq!(p.ingest_record("y", &a).expect("ingest"), RowOutcome::Duplicate);
        assert_eq!(p.ingest_record("x", &a).expect("ingest"), RowOutcome::Duplicate);

        assert_eq!(p.rows().len(), 1);
        assert_eq!(p.rows()[0].keywords(), vec!["x", "y"]);
        assert_eq!(p.stats().input_rows, 3);
        assert_eq!(p.stats().dedup_removed, 2);
        assert_eq!(
            p.export_headers(),
            vec!["url", "category", "name", "keyword", "keyword_2"]
        );
    }

    #[test]
    fn rejected_keys_stay_rejected() {
        let mut p = pipeline(&["electrician"]);
        let plumber = record("https://facebook.com/p", "Plumber", "P");
        assert_eq!(p.ingest_record("x", &plumber).expect("ingest"), RowOutcome::FilteredOut);
        let same_key = record("https://facebook.com/p", "Electrician", "P");
        assert_eq!(p.ingest_record("y", &same_key).expect("ingest"), RowOutcome::Duplicate);
        assert!(p.rows().is_empty());
        assert_eq!(p.stats().category_filter_removed, 1);
        assert_eq!(p.stats().dedup_removed, 1);
    }

    #[test]
    fn stages_count_and_project() {
        let mut p = pipeline(&["electrician"]);
        let foreign = record("https://facebook.com/f", "Electrician", "安德烈");
        assert_eq!(p.ingest_record("x", &foreign).expect("ingest"), RowOutcome::Purified);
        let multi_line = record(" https://facebook.com/m ", "Electrician", "line1\r\nline2\nline3");
        assert_eq!(p.ingest_record("x", &multi_line).expect("ingest"), RowOutcome::Kept);

        let row = &p.rows()[0];
        assert_eq!(row.get("name"), "line1 line2 line3");
        assert!(!row.contains_column("ignored"));
        assert_eq!(p.stats().purifier_removed, 1);
        assert_eq!(p.stats().filtered_rows, 1);
    }

    #[test]
    fn first_record_must_carry_required_columns() {
        let mut p = pipeline(&["electrician"]);
        let err = p
            .ingest_record("x", &json!({ "url": "https://facebook.com/a", "name": "A" }))
            .expect_err("category missing");
        assert!(matches!(err, PipelineError::Configuration(msg) if msg.contains("category")));

        let mut p = pipeline(&["electrician"]);
        p.ingest_record("x", &record("https://facebook.com/a", "Electrician", "A"))
            .expect("first record complete");
        // later records are projected, not rejected
        assert!(p.ingest_record("x", &json!({ "url": "https://facebook.com/b" })).is_ok());
    }

    #[test]
    fn url_normalization() {
        assert_eq!(
            normalize_url("facebook.com/acme", "facebook.com").as_deref(),
            Some("https://facebook.com/acme")
        );
        assert_eq!(
            normalize_url("//www.Facebook.com/acme", "facebook.com").as_deref(),
            Some("https://www.Facebook.com/acme")
        );
        assert_eq!(
            normalize_url("http://example.com", "facebook.com").as_deref(),
            Some("http://example.com")
        );
        assert_eq!(normalize_url("acme", "facebook.com"), None);
        assert_eq!(
            extract_urls("https://facebook.com/a, facebook.com/b  junk", "facebook.com"),
            vec!["https://facebook.com/a", "https://facebook.com/b"]
        );
    }

    #[test]
    fn index_unions_keywords_and_tags_items() {
        let mut a = Row::new();
        a.set("url", "https://facebook.com/a");
        a.set_keywords(&["x"]);
        let mut b = Row::new();
        b.set("url", "facebook.com/a https://facebook.com/b");
        b.set_keywords(&["y", "z"]);
        let index = UrlKeywordIndex::build(&[a, b], "url", "facebook.com");

        assert_eq!(index.urls(), vec!["https://facebook.com/a", "https://facebook.com/b"]);
        let kws: Vec<&str> = index
            .keywords_for("https://facebook.com/a")
            .expect("indexed")
            .iter()
            .map(String::as_str)
            .collect();
        assert_eq!(kws, vec!["x", "y", "z"]);

        let by_field = json!({ "pageUrl": "facebook.com/a", "title": "A", "info": ["i"] });
        let row = index.tag_item(&by_field);
        assert_eq!(row.keywords(), vec!["x", "y", "z"]);
        assert_eq!(row.get("keyword_3"), "z");
        assert_eq!(row.get("info"), r#"["i"]"#);

        let by_value = json!({ "link": "https://facebook.com/b", "title": "B" });
        assert_eq!(index.tag_item(&by_value).keywords(), vec!["y", "z"]);

        let unknown = json!({ "url": "https://facebook.com/zzz", "keyword": "stale" });
        assert!(index.tag_item(&unknown).keywords().is_empty());
    }
}

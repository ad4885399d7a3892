//! Australian numbering-plan classifier: mobile, landline or other.

use std::sync::OnceLock;

use indexmap::IndexSet;
use leadflow_archive::Sheet;
use leadflow_core::Row;
use regex::Regex;
use serde::Serialize;

pub const PHONE_FALLBACK_COLUMN: &str = "Phone";

// Each pattern consumes one non-digit (or an edge) on both sides of the
// number; scanning resumes at the end of the number itself.
const MOBILE_PATTERN: &str = r"(?:^|[^0-9])((?:\+?61|0)[\s\-]*4(?:[\s\-]*[0-9]){8})(?:[^0-9]|$)";
const LANDLINE_GEO_PATTERN: &str =
    r"(?:^|[^0-9])((?:\+?61|0)[\s\-]*[2378](?:[\s\-]*[0-9]){8})(?:[^0-9]|$)";
const LANDLINE_BIZ_PATTERN: &str =
    r"(?:^|[^0-9])((?:1300|1800)(?:[\s\-]*[0-9]){6}|13(?:[\s\-]*[0-9]){4})(?:[^0-9]|$)";

fn compiled(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static phone pattern compiles"))
}

fn mobile_regex() -> &'static Regex {
    static RX: OnceLock<Regex> = OnceLock::new();
    compiled(&RX, MOBILE_PATTERN)
}

fn landline_geo_regex() -> &'static Regex {
    static RX: OnceLock<Regex> = OnceLock::new();
    compiled(&RX, LANDLINE_GEO_PATTERN)
}

fn landline_biz_regex() -> &'static Regex {
    static RX: OnceLock<Regex> = OnceLock::new();
    compiled(&RX, LANDLINE_BIZ_PATTERN)
}

fn find_numbers(regex: &Regex, text: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut at = 0;
    while at <= text.len() {
        let Some(number) = regex.captures_at(text, at).and_then(|caps| caps.get(1)) else {
            break;
        };
        found.push(number.as_str().trim().to_string());
        at = number.end();
    }
    found
}

pub fn mobile_numbers(text: &str) -> Vec<String> {
    find_numbers(mobile_regex(), text)
}

pub fn has_landline(text: &str) -> bool {
    !find_numbers(landline_geo_regex(), text).is_empty()
        || !find_numbers(landline_biz_regex(), text).is_empty()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhoneClass {
    Mobile,
    Landline,
    Other,
}

/// First header that looks like a phone field, then one that looks like a
/// contact field, else [`PHONE_FALLBACK_COLUMN`].
pub fn guess_phone_column(headers: &[String]) -> String {
    let lower = |h: &String| h.to_lowercase();
    headers
        .iter()
        .find(|h| {
            let h = lower(h);
            h.contains("phone") || h.contains("mobile") || h.contains("cell")
        })
        .or_else(|| headers.iter().find(|h| lower(h).contains("contact")))
        .cloned()
        .unwrap_or_else(|| PHONE_FALLBACK_COLUMN.to_string())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassifiedRows {
    pub mobile: Vec<Row>,
    pub landline: Vec<Row>,
    pub other: Vec<Row>,
}

impl ClassifiedRows {
    pub fn total(&self) -> usize {
        self.mobile.len() + self.landline.len() + self.other.len()
    }

    /// `Mobiles`, `Landlines`, `Others`, always all three.
    pub fn into_sheets(self) -> Vec<Sheet> {
        vec![
            Sheet::new("Mobiles", self.mobile),
            Sheet::new("Landlines", self.landline),
            Sheet::new("Others", self.other),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct PhoneClassifier {
    phone_column: String,
}

impl PhoneClassifier {
    pub fn new(phone_column: impl Into<String>) -> Self {
        Self {
            phone_column: phone_column.into(),
        }
    }

    pub fn phone_column(&self) -> &str {
        &self.phone_column
    }

    /// Mobile wins over landline. Mobile numbers found anywhere in the row
    /// are appended to the phone column unless already present in it.
    pub fn classify(&self, mut row: Row) -> (PhoneClass, Row) {
        let mobiles: IndexSet<String> = row.values().flat_map(mobile_numbers).collect();
        if !mobiles.is_empty() {
            let existing = row.get(&self.phone_column).to_string();
            let mut merged = existing.clone();
            for number in &mobiles {
                if existing.contains(number.as_str()) {
                    continue;
                }
                if !merged.is_empty() {
                    merged.push_str(", ");
                }
                merged.push_str(number);
            }
            row.set(self.phone_column.clone(), merged);
            return (PhoneClass::Mobile, row);
        }
        if row.values().any(has_landline) {
            return (PhoneClass::Landline, row);
        }
        (PhoneClass::Other, row)
    }

    pub fn classify_all(&self, rows: impl IntoIterator<Item = Row>) -> ClassifiedRows {
        let mut out = ClassifiedRows::default();
        for row in rows {
            match self.classify(row) {
                (PhoneClass::Mobile, row) => out.mobile.push(row),
                (PhoneClass::Landline, row) => out.landline.push(row),
                (PhoneClass::Other, row) => out.other.push(row),
            }
        }
        out
    }
}

/// Enriched export header: every column in first-seen order, then missing
/// provenance columns, then the phone column if it is new.
pub fn enriched_headers(rows: &[Row], keyword_columns: &[String]) -> (Vec<String>, String) {
    let mut headers: IndexSet<String> = rows
        .iter()
        .flat_map(|row| row.columns().map(str::to_string))
        .collect();
    headers.extend(keyword_columns.iter().cloned());
    let mut headers: Vec<String> = headers.into_iter().collect();
    let phone_column = guess_phone_column(&headers);
    if !headers.contains(&phone_column) {
        headers.push(phone_column.clone());
    }
    (headers, phone_column)
}

//! Byte-level writers for run outputs: CRC-32, stored ZIP, SpreadsheetML and
//! CSV. Nothing here touches the filesystem.

use chrono::NaiveDate;
use thiserror::Error;

pub mod crc;
pub mod csv;
pub mod xlsx;
pub mod zip;

pub use crate::crc::crc32;
pub use crate::csv::build_csv;
pub use crate::xlsx::{build_xlsx, escape_xml, Sheet};
pub use crate::zip::{list_entries, write_stored_zip, ListedEntry, ZipEntry};

pub const CRATE_NAME: &str = "leadflow-archive";

/// Excel rejects sheet names longer than this.
pub const MAX_SHEET_NAME_CHARS: usize = 31;
pub const DEFAULT_SOURCE_NAME: &str = "pipeline";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive holds {0} entries; the end record caps at 65535")]
    TooManyEntries(usize),
    #[error("entry `{name}` is {len} bytes; stored entries cap at 4 GiB")]
    EntryTooLarge { name: String, len: usize },
    #[error("archive offset {0} exceeds 32-bit range")]
    ArchiveTooLarge(usize),
    #[error("malformed archive: {0}")]
    Malformed(&'static str),
    #[error("crc mismatch for entry `{name}`")]
    CrcMismatch { name: String },
    #[error("csv: {0}")]
    Csv(#[from] ::csv::Error),
}

/// Replace `: \ / ? * [ ]` with spaces, trim, cap at 31 chars; blank names
/// become `Sheet`.
pub fn sanitize_sheet_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|ch| match ch {
            ':' | '\\' | '/' | '?' | '*' | '[' | ']' => ' ',
            other => other,
        })
        .collect();
    let cleaned: String = replaced.trim().chars().take(MAX_SHEET_NAME_CHARS).collect();
    if cleaned.is_empty() {
        "Sheet".to_string()
    } else {
        cleaned
    }
}

/// `{source}_{suffix}_{YYYY-MM-DD}.{ext}`, e.g. `leads_Sorted_2024-03-01.xlsx`.
pub fn export_file_name(source: &str, suffix: &str, date: NaiveDate, ext: &str) -> String {
    let source = source.trim();
    let source: String = if source.is_empty() {
        DEFAULT_SOURCE_NAME.to_string()
    } else {
        source
            .chars()
            .map(|ch| if matches!(ch, '/' | '\\') { '_' } else { ch })
            .collect()
    };
    format!("{source}_{suffix}_{}.{ext}", date.format("%Y-%m-%d"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sheet_names_are_sanitized() {
        assert_eq!(sanitize_sheet_name("Mobiles"), "Mobiles");
        assert_eq!(sanitize_sheet_name("a:b\\c/d?e*f[g]"), "a b c d e f g");
        assert_eq!(sanitize_sheet_name("  [ ]  "), "Sheet");
        assert_eq!(sanitize_sheet_name(""), "Sheet");
        let long = "x".repeat(40);
        assert_eq!(sanitize_sheet_name(&long).chars().count(), MAX_SHEET_NAME_CHARS);
    }

    #[test]
    fn export_names_follow_pattern() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).expect("date");
        assert_eq!(
            export_file_name("leads", "Sorted", date, "xlsx"),
            "leads_Sorted_2024-03-01.xlsx"
        );
        assert_eq!(
            export_file_name("", "master", date, "csv"),
            "pipeline_master_2024-03-01.csv"
        );
        assert_eq!(
            export_file_name("a/b", "Sorted", date, "xlsx"),
            "a_b_Sorted_2024-03-01.xlsx"
        );
    }
}

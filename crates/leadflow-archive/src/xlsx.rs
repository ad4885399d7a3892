//! Minimal SpreadsheetML package: inline-string worksheets, no styles, no
//! shared strings.

use leadflow_core::Row;

use crate::zip::{write_stored_zip, ZipEntry};
use crate::{sanitize_sheet_name, ArchiveError};

const XML_DECL: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#;
const MAIN_NS: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";
const REL_NS: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";
const PKG_REL_NS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";
const CONTENT_TYPES_NS: &str = "http://schemas.openxmlformats.org/package/2006/content-types";
const WORKSHEET_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml";
const WORKBOOK_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml";

/// A named bucket of rows that becomes one worksheet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Row>,
}

impl Sheet {
    pub fn new(name: impl Into<String>, rows: Vec<Row>) -> Self {
        Self {
            name: name.into(),
            rows,
        }
    }
}

/// XML-escape a cell value. Every line break flavour becomes `&#10;`.
pub fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str("&#10;");
            }
            '\n' => out.push_str("&#10;"),
            other => out.push(other),
        }
    }
    out
}

/// Zero-based column index to spreadsheet letters (0 -> A, 26 -> AA).
pub fn column_letter(index: usize) -> String {
    let mut letters = Vec::new();
    let mut n = index + 1;
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    String::from_utf8_lossy(&letters).into_owned()
}

fn push_row<'a>(xml: &mut String, row_number: usize, values: impl Iterator<Item = &'a str>) {
    xml.push_str(&format!(r#"<row r="{row_number}">"#));
    for (col, value) in values.enumerate() {
        xml.push_str(&format!(
            r#"<c r="{}{}" t="inlineStr"><is><t>{}</t></is></c>"#,
            column_letter(col),
            row_number,
            escape_xml(value)
        ));
    }
    xml.push_str("</row>");
}

/// Header row first, then one row per record projected onto `headers`.
pub fn worksheet_xml(headers: &[String], rows: &[Row]) -> String {
    let mut sheet_data = String::new();
    push_row(&mut sheet_data, 1, headers.iter().map(String::as_str));
    for (idx, row) in rows.iter().enumerate() {
        push_row(
            &mut sheet_data,
            idx + 2,
            headers.iter().map(|header| row.get(header)),
        );
    }
    format!(r#"{XML_DECL}<worksheet xmlns="{MAIN_NS}"><sheetData>{sheet_data}</sheetData></worksheet>"#)
}

pub fn workbook_xml(sheet_names: &[String]) -> String {
    let sheets: String = sheet_names
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            format!(
                r#"<sheet name="{}" sheetId="{}" r:id="rId{}"/>"#,
                escape_xml(name),
                idx + 1,
                idx + 1
            )
        })
        .collect();
    format!(
        r#"{XML_DECL}<workbook xmlns="{MAIN_NS}" xmlns:r="{REL_NS}"><sheets>{sheets}</sheets></workbook>"#
    )
}

pub fn workbook_rels_xml(sheet_count: usize) -> String {
    let rels: String = (1..=sheet_count)
        .map(|n| {
            format!(
                r#"<Relationship Id="rId{n}" Type="{REL_NS}/worksheet" Target="worksheets/sheet{n}.xml"/>"#
            )
        })
        .collect();
    format!(r#"{XML_DECL}<Relationships xmlns="{PKG_REL_NS}">{rels}</Relationships>"#)
}

pub fn root_rels_xml() -> String {
    format!(
        r#"{XML_DECL}<Relationships xmlns="{PKG_REL_NS}"><Relationship Id="rId1" Type="{REL_NS}/officeDocument" Target="xl/workbook.xml"/></Relationships>"#
    )
}

pub fn content_types_xml(sheet_count: usize) -> String {
    let overrides: String = (1..=sheet_count)
        .map(|n| {
            format!(
                r#"<Override PartName="/xl/worksheets/sheet{n}.xml" ContentType="{WORKSHEET_TYPE}"/>"#
            )
        })
        .collect();
    format!(
        concat!(
            r#"{decl}<Types xmlns="{ns}">"#,
            r#"<Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>"#,
            r#"<Default Extension="xml" ContentType="application/xml"/>"#,
            r#"<Override PartName="/xl/workbook.xml" ContentType="{workbook}"/>"#,
            "{overrides}</Types>"
        ),
        decl = XML_DECL,
        ns = CONTENT_TYPES_NS,
        workbook = WORKBOOK_TYPE,
        overrides = overrides
    )
}

/// Package parts in archive order.
pub fn xlsx_parts(headers: &[String], sheets: &[Sheet]) -> Vec<ZipEntry> {
    let names: Vec<String> = sheets
        .iter()
        .map(|sheet| sanitize_sheet_name(&sheet.name))
        .collect();

    let mut parts = vec![
        ZipEntry::new("[Content_Types].xml", content_types_xml(sheets.len())),
        ZipEntry::new("_rels/.rels", root_rels_xml()),
        ZipEntry::new("xl/workbook.xml", workbook_xml(&names)),
        ZipEntry::new("xl/_rels/workbook.xml.rels", workbook_rels_xml(sheets.len())),
    ];
    parts.extend(sheets.iter().enumerate().map(|(idx, sheet)| {
        ZipEntry::new(
            format!("xl/worksheets/sheet{}.xml", idx + 1),
            worksheet_xml(headers, &sheet.rows),
        )
    }));
    parts
}

pub fn build_xlsx(headers: &[String], sheets: &[Sheet]) -> Result<Vec<u8>, ArchiveError> {
    write_stored_zip(&xlsx_parts(headers, sheets))
}

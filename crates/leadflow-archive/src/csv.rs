use ::csv::{QuoteStyle, Terminator, WriterBuilder};
use leadflow_core::Row;

use crate::ArchiveError;

/// Header record first, rows projected onto `headers`, records separated by
/// `\n` with no trailing newline.
pub fn build_csv(headers: &[String], rows: &[Row]) -> Result<Vec<u8>, ArchiveError> {
    let mut writer = WriterBuilder::new()
        .quote_style(QuoteStyle::Necessary)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(headers)?;
    for row in rows {
        writer.write_record(headers.iter().map(|h| row.get(h)))?;
    }
    let mut bytes = writer
        .into_inner()
        .map_err(|err| ::csv::Error::from(err.into_error()))?;
    if bytes.last() == Some(&b'\n') {
        bytes.pop();
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(headers: &[String], rows: &[Row]) -> String {
        String::from_utf8(build_csv(headers, rows).expect("csv")).expect("utf8")
    }

    #[test]
    fn quotes_only_when_needed() {
        let headers = vec!["name".to_string(), "note".to_string()];
        let mut row = Row::new();
        row.set("name", "Acme");
        row.set("note", "says \"hi\", twice");
        let mut plain = Row::new();
        plain.set("name", "Plain");

        let csv = text(&headers, &[row, plain]);
        assert_eq!(
            csv,
            "name,note\nAcme,\"says \"\"hi\"\", twice\"\nPlain,"
        );
        assert!(!csv.contains('\r'));
    }

    #[test]
    fn embedded_newline_is_quoted() {
        let headers = vec!["a".to_string()];
        let mut row = Row::new();
        row.set("a", "line1\nline2");
        assert_eq!(text(&headers, &[row]), "a\n\"line1\nline2\"");
    }

    #[test]
    fn header_only_when_no_rows() {
        let headers = vec!["a".to_string(), "b,c".to_string()];
        assert_eq!(text(&headers, &[]), "a,\"b,c\"");
    }
}

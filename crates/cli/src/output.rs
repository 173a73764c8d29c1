//! Printing: per-column reports and CSV paging through the row cache.

use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;
use tidygrid_client::{ErrorMap, FullPassSummary, Session};

use crate::CliError;

/// Per-column error counts, as printed by `check`.
#[derive(Debug, Serialize)]
pub struct ColumnReport {
    pub index: usize,
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
    pub invalid: usize,
    /// First few invalid rows, zero-based.
    pub sample_rows: Vec<usize>,
}

#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub rows: usize,
    pub chunks: usize,
    pub elapsed_ms: u128,
    pub invalid_cells: usize,
    pub columns: Vec<ColumnReport>,
}

const SAMPLE_ROWS: usize = 5;

impl CheckReport {
    pub fn build(session: &Session, summary: &FullPassSummary) -> Self {
        let errors = session.errors();
        let columns = session
            .schema()
            .into_iter()
            .enumerate()
            .map(|(index, column)| ColumnReport {
                index,
                invalid: errors.count(index),
                sample_rows: errors
                    .column(index)
                    .map(|rows| rows.iter().take(SAMPLE_ROWS).copied().collect())
                    .unwrap_or_default(),
                name: column.name,
                column_type: column.column_type.to_string(),
            })
            .collect();
        Self {
            rows: session.row_count(),
            chunks: summary.chunks,
            elapsed_ms: summary.elapsed.as_millis(),
            invalid_cells: errors.total(),
            columns,
        }
    }

    pub fn print_table(&self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "rows: {}  chunks: {}  elapsed: {}ms", self.rows, self.chunks, self.elapsed_ms)?;
        let name_width = self.columns.iter().map(|c| c.name.len()).max().unwrap_or(0).max(6);
        writeln!(out, "{:<name_width$}  {:<8}  {:>8}  rows", "column", "type", "invalid")?;
        for col in &self.columns {
            let sample: Vec<String> = col.sample_rows.iter().map(|r| r.to_string()).collect();
            let more = if col.invalid > col.sample_rows.len() { ", ..." } else { "" };
            writeln!(
                out,
                "{:<name_width$}  {:<8}  {:>8}  {}{}",
                col.name,
                col.column_type,
                col.invalid,
                sample.join(", "),
                more
            )?;
        }
        writeln!(out, "invalid cells: {}", self.invalid_cells)
    }
}

/// Write rows `start..start + count` (clamped) as CSV with a header,
/// fetching one window at a time. Returns the number of rows written.
pub fn write_rows(
    session: &Session,
    out: impl Write,
    start: usize,
    count: usize,
    mark_invalid: bool,
) -> Result<usize, CliError> {
    let mut writer = csv::Writer::from_writer(out);
    let schema = session.schema();
    writer.write_record(schema.iter().map(|c| c.name.as_str()))?;

    let end = start.saturating_add(count).min(session.row_count());
    let window = session.config().fetch_window.max(1);
    let errors = session.errors();
    let mut written = 0;
    let mut page = start;
    while page < end {
        let limit = window.min(end - page);
        smol::block_on(session.ensure_rows(page, limit)).map_err(CliError::client)?;
        for index in page..page + limit {
            let row = session
                .row(index)
                .ok_or_else(|| CliError::engine(format!("row {index} missing after fetch")))?;
            writer.write_record(cells(&row, index, &errors, mark_invalid))?;
            written += 1;
        }
        page += limit;
    }
    writer.flush()?;
    Ok(written)
}

fn cells(row: &[String], index: usize, errors: &ErrorMap, mark_invalid: bool) -> Vec<String> {
    row.iter()
        .enumerate()
        .map(|(col, value)| {
            if mark_invalid && errors.is_invalid(index, col) {
                format!("{value}!")
            } else {
                value.clone()
            }
        })
        .collect()
}

/// Export the whole dataset to `path`.
pub fn export(session: &Session, path: &Path) -> Result<(), CliError> {
    let file = std::fs::File::create(path)
        .map_err(|e| CliError::io(format!("{}: {}", path.display(), e)))?;
    let rows = write_rows(session, io::BufWriter::new(file), 0, session.row_count(), false)?;
    log::info!("wrote {rows} rows to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_cells_marks_only_invalid() {
        let mut errors = ErrorMap::new();
        errors.replace(1, BTreeSet::from([4]));
        let row = vec!["a".to_string(), "b".to_string()];
        assert_eq!(cells(&row, 4, &errors, true), vec!["a", "b!"]);
        assert_eq!(cells(&row, 4, &errors, false), vec!["a", "b"]);
        assert_eq!(cells(&row, 3, &errors, true), vec!["a", "b"]);
    }

    #[test]
    fn test_table_lists_samples() {
        let report = CheckReport {
            rows: 10,
            chunks: 1,
            elapsed_ms: 2,
            invalid_cells: 7,
            columns: vec![ColumnReport {
                index: 0,
                name: "qty".into(),
                column_type: "Integer".into(),
                invalid: 7,
                sample_rows: vec![1, 2, 3, 4, 5],
            }],
        };
        let mut out = Vec::new();
        report.print_table(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("1, 2, 3, 4, 5, ..."), "{text}");
        assert!(text.ends_with("invalid cells: 7\n"));
    }
}

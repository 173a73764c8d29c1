//! In-memory dataset held by the engine.
//!
//! Rows are stored as owned strings, aligned to the header. Short records are
//! padded with empty cells and long records truncated, so every row has
//! exactly `columns.len()` cells.

use std::collections::{BTreeMap, BTreeSet};

use tidygrid_protocol::{ColumnSchema, ColumnType, RowsPayload};

use crate::rules::{self, INFERENCE_SAMPLE_ROWS};
use crate::EngineError;

/// How [`Dataset::rows_payload`] serializes rows on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowShape {
    #[default]
    Positional,
    Keyed,
}

#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub columns: Vec<ColumnSchema>,
    rows: Vec<Vec<String>>,
}

impl Dataset {
    /// Build a dataset from already-split rows. Types are inferred.
    pub fn from_rows(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let width = headers.len();
        let rows: Vec<Vec<String>> = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, String::new());
                row
            })
            .collect();

        let columns = headers
            .into_iter()
            .enumerate()
            .map(|(col, name)| {
                let sample = rows
                    .iter()
                    .take(INFERENCE_SAMPLE_ROWS)
                    .map(|row| row[col].as_str());
                ColumnSchema::new(name, rules::infer_type(sample))
            })
            .collect();

        Self { columns, rows }
    }

    /// Parse CSV bytes with a header row. Header names must be unique; keyed
    /// rows are addressed by name.
    pub fn parse_csv(bytes: &[u8]) -> Result<Self, EngineError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(bytes);

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| EngineError::Parse(e.to_string()))?
            .iter()
            .map(str::to_string)
            .collect();
        if headers.is_empty() {
            return Err(EngineError::Parse("missing header row".to_string()));
        }
        let mut seen = BTreeSet::new();
        if let Some(dup) = headers.iter().find(|name| !seen.insert(name.as_str())) {
            return Err(EngineError::Parse(format!("duplicate column name \"{dup}\"")));
        }

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| EngineError::Parse(e.to_string()))?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        Ok(Self::from_rows(headers, rows))
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row).and_then(|r| r.get(col)).map(String::as_str)
    }

    pub fn column_type(&self, col: usize) -> Result<ColumnType, EngineError> {
        self.columns
            .get(col)
            .map(|c| c.column_type)
            .ok_or(EngineError::ColumnOutOfRange { col, columns: self.columns.len() })
    }

    fn check_col(&self, col: usize) -> Result<(), EngineError> {
        self.column_type(col).map(|_| ())
    }

    /// Replace the schema. Column names must stay aligned with the data.
    pub fn set_schema(&mut self, schema: Vec<ColumnSchema>) -> Result<(), EngineError> {
        if schema.len() != self.columns.len() {
            return Err(EngineError::SchemaMismatch {
                expected: self.columns.len(),
                actual: schema.len(),
            });
        }
        self.columns = schema;
        Ok(())
    }

    /// Rows in `[start, start+count)`, clamped to the dataset.
    pub fn rows_payload(&self, start: usize, count: usize, shape: RowShape) -> RowsPayload {
        let slice = self.row_slice(start, count);
        match shape {
            RowShape::Positional => RowsPayload::Positional { rows: slice.to_vec() },
            RowShape::Keyed => RowsPayload::Keyed {
                rows: slice
                    .iter()
                    .map(|row| {
                        self.columns
                            .iter()
                            .zip(row)
                            .map(|(c, v)| (c.name.clone(), v.clone()))
                            .collect::<BTreeMap<_, _>>()
                    })
                    .collect(),
            },
        }
    }

    fn row_slice(&self, start: usize, count: usize) -> &[Vec<String>] {
        let start = start.min(self.rows.len());
        let end = start.saturating_add(count).min(self.rows.len());
        &self.rows[start..end]
    }

    /// Invalid rows of one column under `column_type`. Also records the type
    /// on the engine-side schema so later analysis uses it.
    pub fn validate_column(
        &mut self,
        col: usize,
        column_type: ColumnType,
    ) -> Result<Vec<usize>, EngineError> {
        self.check_col(col)?;
        self.columns[col].column_type = column_type;
        Ok(self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| !rules::is_valid(column_type, &row[col]))
            .map(|(idx, _)| idx)
            .collect())
    }

    /// `(row, col)` violations in `[start, start+count)` under the current schema.
    pub fn validate_chunk(&self, start: usize, count: usize) -> Vec<(usize, usize)> {
        let first = start.min(self.rows.len());
        let mut pairs = Vec::new();
        for (offset, row) in self.row_slice(start, count).iter().enumerate() {
            for (col, schema) in self.columns.iter().enumerate() {
                if !rules::is_valid(schema.column_type, &row[col]) {
                    pairs.push((first + offset, col));
                }
            }
        }
        pairs
    }

    pub fn update_cell(&mut self, row: usize, col: usize, value: String) -> Result<(), EngineError> {
        self.check_col(col)?;
        let rows = self.rows.len();
        let target = self
            .rows
            .get_mut(row)
            .ok_or(EngineError::RowOutOfRange { row, rows })?;
        target[col] = value;
        Ok(())
    }

    /// Rewrite every cell of a column through `f`; `None` leaves a cell alone.
    /// Returns the number of cells whose value actually changed.
    pub fn rewrite_column<F>(&mut self, col: usize, mut f: F) -> Result<usize, EngineError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        self.check_col(col)?;
        let mut changed = 0;
        for row in &mut self.rows {
            if let Some(next) = f(&row[col]) {
                if next != row[col] {
                    row[col] = next;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    /// Plain substring replace over every column of `[start, start+count)`.
    /// Returns the number of cells changed.
    pub fn find_replace_range(&mut self, start: usize, count: usize, find: &str, replace: &str) -> usize {
        if find.is_empty() {
            return 0;
        }
        let len = self.rows.len();
        let start = start.min(len);
        let end = start.saturating_add(count).min(len);
        let mut replaced = 0;
        for row in &mut self.rows[start..end] {
            for cell in row.iter_mut() {
                if cell.contains(find) {
                    *cell = cell.replace(find, replace);
                    replaced += 1;
                }
            }
        }
        replaced
    }
}

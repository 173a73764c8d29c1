//! Column-wide correction strategies.

use tidygrid_protocol::CorrectionStrategy;

use crate::dataset::Dataset;
use crate::pii;
use crate::rules::is_valid;
use crate::EngineError;

/// Apply `strategy` to every cell of `col`. Returns the changed-cell count.
pub fn apply(ds: &mut Dataset, col: usize, strategy: &CorrectionStrategy) -> Result<usize, EngineError> {
    let column_type = ds.column_type(col)?;
    match strategy {
        CorrectionStrategy::TrimWhitespace => ds.rewrite_column(col, |value| {
            let trimmed = value.trim();
            (!is_valid(column_type, value) && is_valid(column_type, trimmed)).then(|| trimmed.to_string())
        }),
        CorrectionStrategy::ClearInvalid => {
            ds.rewrite_column(col, |value| (!is_valid(column_type, value)).then(String::new))
        }
        CorrectionStrategy::FillInvalid { value: fill } => {
            if !is_valid(column_type, fill) {
                return Err(EngineError::InvalidFill {
                    value: fill.clone(),
                    column_type,
                });
            }
            ds.rewrite_column(col, |value| (!is_valid(column_type, value)).then(|| fill.clone()))
        }
        CorrectionStrategy::RedactPii => ds.rewrite_column(col, pii::redact),
    }
}

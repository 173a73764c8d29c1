//! Column analysis: propose high-confidence fixes for invalid cells.
//!
//! Analysis looks at the invalid cells of the first [`MAX_ROWS_TO_SCAN`] rows
//! only, so suggestions come back quickly even on very large datasets.
//! Applying a suggestion always rewrites the whole column.

use std::collections::{BTreeSet, HashMap};

use tidygrid_protocol::{ColumnType, Suggestion, SuggestionReport};

use crate::dataset::Dataset;
use crate::rules::{self, is_valid};
use crate::EngineError;

const MAX_ROWS_TO_SCAN: usize = 50_000;
const MAX_UNIQUE_INVALID: usize = 30_000;
/// Stray characters proposed for removal in numeric columns.
const MAX_CHAR_SUGGESTIONS: usize = 3;

/// Transform one value as the suggestion would. `None` means "leave as is".
pub fn transform(suggestion: &Suggestion, value: &str) -> Option<String> {
    match suggestion {
        Suggestion::TrimWhitespace => Some(value.trim().to_string()),
        Suggestion::RemoveChars { chars } => {
            Some(value.chars().filter(|c| !chars.contains(*c)).collect())
        }
        Suggestion::DigitsOnly => Some(value.chars().filter(char::is_ascii_digit).collect()),
        Suggestion::PhoneStripToTenDigits => Some(phone_to_ten_digits(value)),
        Suggestion::NormalizeDateToIso => chrono::NaiveDate::parse_from_str(value.trim(), "%m/%d/%Y")
            .ok()
            .map(|d| d.format("%Y-%m-%d").to_string()),
        Suggestion::NormalizeBooleanCase => {
            let lower = value.trim().to_lowercase();
            (lower == "true" || lower == "false").then_some(lower)
        }
    }
}

/// Ten-digit form of a phone number, only when the extra digits are clearly
/// an extension (more than eleven digits). Eleven digits are ambiguous.
pub fn phone_to_ten_digits(value: &str) -> String {
    let digits: String = value.chars().filter(char::is_ascii_digit).collect();
    if digits.len() == 10 {
        digits
    } else if digits.len() > 11 {
        digits[..10].to_string()
    } else {
        value.to_string()
    }
}

/// Rewrite the column with `suggestion`, touching only cells that are
/// currently invalid and become valid.
pub fn apply(ds: &mut Dataset, col: usize, suggestion: &Suggestion) -> Result<usize, EngineError> {
    let column_type = ds.column_type(col)?;
    ds.rewrite_column(col, |value| {
        if is_valid(column_type, value) {
            return None;
        }
        transform(suggestion, value).filter(|after| !after.is_empty() && is_valid(column_type, after))
    })
}

/// Running tally for one candidate suggestion.
#[derive(Default)]
struct Tally {
    count: usize,
    example: Option<(String, String)>,
}

impl Tally {
    fn record(&mut self, before: &str, after: String) {
        self.count += 1;
        if self.example.is_none() {
            self.example = Some((before.to_string(), after));
        }
    }

    fn into_report(self, suggestion: Suggestion, description: String) -> Option<SuggestionReport> {
        let (example_before, example_after) = self.example?;
        Some(SuggestionReport {
            suggestion,
            description,
            affected_count: self.count,
            example_before,
            example_after,
        })
    }
}

/// Inspect invalid cells of a column and propose fixes, most general first.
pub fn analyze_column(ds: &Dataset, col: usize) -> Result<Vec<SuggestionReport>, EngineError> {
    let column_type = ds.column_type(col)?;
    let rows_to_scan = ds.row_count().min(MAX_ROWS_TO_SCAN);

    let candidates = candidates_for(column_type);
    let mut tallies: Vec<Tally> = candidates.iter().map(|_| Tally::default()).collect();
    let mut invalid: BTreeSet<&str> = BTreeSet::new();

    for row in 0..rows_to_scan {
        if invalid.len() >= MAX_UNIQUE_INVALID {
            break;
        }
        let Some(value) = ds.cell(row, col) else { continue };
        if is_valid(column_type, value) {
            continue;
        }
        invalid.insert(value);
        for (suggestion, tally) in candidates.iter().zip(tallies.iter_mut()) {
            if let Some(after) = fixes(suggestion, column_type, value) {
                tally.record(value, after);
            }
        }
    }

    if invalid.is_empty() {
        return Ok(Vec::new());
    }

    let mut reports: Vec<SuggestionReport> = candidates
        .into_iter()
        .zip(tallies)
        .filter_map(|(suggestion, tally)| {
            let description = describe(&suggestion, column_type, tally.count);
            tally.into_report(suggestion, description)
        })
        .collect();

    if matches!(column_type, ColumnType::Integer | ColumnType::Float) {
        reports.extend(stray_char_reports(ds, col, column_type, rows_to_scan, &invalid));
    }
    Ok(reports)
}

/// Fixed-shape suggestions worth counting for a column type.
fn candidates_for(column_type: ColumnType) -> Vec<Suggestion> {
    let mut out = vec![Suggestion::TrimWhitespace];
    match column_type {
        ColumnType::Email => out.push(Suggestion::RemoveChars { chars: " ".to_string() }),
        ColumnType::PhoneUS => {
            out.push(Suggestion::DigitsOnly);
            out.push(Suggestion::PhoneStripToTenDigits);
        }
        ColumnType::Date => out.push(Suggestion::NormalizeDateToIso),
        ColumnType::Boolean => out.push(Suggestion::NormalizeBooleanCase),
        _ => {}
    }
    out
}

/// The fixed value if `suggestion` turns an invalid `value` into a valid one.
fn fixes(suggestion: &Suggestion, column_type: ColumnType, value: &str) -> Option<String> {
    let after = transform(suggestion, value)?;
    (!after.is_empty() && after != value && is_valid(column_type, &after)).then_some(after)
}

fn describe(suggestion: &Suggestion, column_type: ColumnType, count: usize) -> String {
    match suggestion {
        Suggestion::TrimWhitespace => format!("Trim whitespace from {count} cells"),
        Suggestion::RemoveChars { chars } if chars == " " && column_type == ColumnType::Email => {
            format!("Remove spaces from {count} emails")
        }
        Suggestion::RemoveChars { chars } => format!("Remove character '{chars}' from {count} cells"),
        Suggestion::DigitsOnly => format!("Remove formatting from {count} phone numbers"),
        Suggestion::PhoneStripToTenDigits => {
            format!("Strip to 10 digits (drop extension) for {count} phone numbers")
        }
        Suggestion::NormalizeDateToIso => {
            format!("Convert dates from MM/DD/YYYY to ISO (YYYY-MM-DD) for {count} cells")
        }
        Suggestion::NormalizeBooleanCase => format!("Normalize true/false casing in {count} cells"),
    }
}

/// For numeric columns: the most frequent punctuation in invalid values,
/// proposed for removal when dropping it yields a valid number.
fn stray_char_reports(
    ds: &Dataset,
    col: usize,
    column_type: ColumnType,
    rows_to_scan: usize,
    invalid: &BTreeSet<&str>,
) -> Vec<SuggestionReport> {
    let mut frequency: HashMap<char, usize> = HashMap::new();
    for value in invalid {
        for ch in value
            .chars()
            .filter(|c| !c.is_alphanumeric() && !c.is_whitespace() && *c != '.' && *c != '-')
        {
            *frequency.entry(ch).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(char, usize)> = frequency.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut reports = Vec::new();
    for (ch, _) in ranked.into_iter().take(MAX_CHAR_SUGGESTIONS) {
        let suggestion = Suggestion::RemoveChars { chars: ch.to_string() };
        let mut tally = Tally::default();
        for row in 0..rows_to_scan {
            let Some(value) = ds.cell(row, col) else { continue };
            if !value.contains(ch) || rules::is_valid(column_type, value) {
                continue;
            }
            if let Some(after) = fixes(&suggestion, column_type, value) {
                tally.record(value, after);
            }
        }
        let description = describe(&suggestion, column_type, tally.count);
        reports.extend(tally.into_report(suggestion, description));
    }
    reports
}

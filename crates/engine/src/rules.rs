//! Per-cell type rules.
//!
//! Empty cells are valid for every type; a required-value rule would be a
//! separate concern.

use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use tidygrid_protocol::ColumnType;

/// Number of leading rows sampled when inferring a column type.
pub const INFERENCE_SAMPLE_ROWS: usize = 100;

/// Share of non-empty samples a candidate type must match to be chosen.
const INFERENCE_THRESHOLD: f64 = 0.9;

/// Date layouts accepted by [`ColumnType::Date`].
pub const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%m/%d/%Y"];

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        Regex::new(r"(?i)^[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}$").expect("email pattern")
    })
}

fn phone_us_regex() -> &'static Regex {
    static PHONE: OnceLock<Regex> = OnceLock::new();
    PHONE.get_or_init(|| {
        Regex::new(r"^\D*1?\D*([2-9][0-8][0-9])\D*([2-9][0-9]{2})\D*([0-9]{4})\D*$")
            .expect("phone pattern")
    })
}

/// Check a raw cell value against a column type.
pub fn is_valid(column_type: ColumnType, value: &str) -> bool {
    if value.is_empty() {
        return true;
    }
    match column_type {
        ColumnType::Text => true,
        ColumnType::Integer => value.parse::<i64>().is_ok(),
        ColumnType::Float => value.parse::<f64>().is_ok(),
        ColumnType::Boolean => matches!(
            value.to_lowercase().as_str(),
            "true" | "false" | "1" | "0" | "yes" | "no"
        ),
        ColumnType::Email => email_regex().is_match(value),
        ColumnType::PhoneUS => phone_us_regex().is_match(value),
        ColumnType::Date => parse_date(value).is_some(),
    }
}

/// Parse a date in any accepted layout.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
}

/// Guess a column type from a sample of its values.
///
/// Candidates are tried from most to least specific; the first one matching
/// more than 90% of the non-empty samples wins. All-empty samples are Text.
pub fn infer_type<'a>(sample: impl IntoIterator<Item = &'a str>) -> ColumnType {
    const CANDIDATES: [ColumnType; 6] = [
        ColumnType::Boolean,
        ColumnType::Integer,
        ColumnType::Float,
        ColumnType::Date,
        ColumnType::Email,
        ColumnType::PhoneUS,
    ];

    let non_empty: Vec<&str> = sample
        .into_iter()
        .filter(|v| !v.trim().is_empty())
        .collect();
    if non_empty.is_empty() {
        return ColumnType::Text;
    }

    for candidate in CANDIDATES {
        let matched = non_empty.iter().filter(|v| is_valid(candidate, v)).count();
        if matched as f64 / non_empty.len() as f64 > INFERENCE_THRESHOLD {
            return candidate;
        }
    }
    ColumnType::Text
}

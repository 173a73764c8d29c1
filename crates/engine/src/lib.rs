//! Reference compute engine.
//!
//! Parses CSV, infers column types, validates cells, proposes and applies
//! fixes. Everything is reachable only through protocol frames served by
//! [`spawn_engine`]; the client never touches the dataset directly.

pub mod correct;
pub mod dataset;
pub mod pii;
pub mod rules;
pub mod suggest;
pub mod worker;

use std::fmt;

use tidygrid_protocol::ColumnType;

pub use dataset::{Dataset, RowShape};
pub use worker::{spawn_engine, Engine, EngineHandle, EngineOptions};

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// A dataset call arrived before `load_dataset`.
    NoDataset,
    /// CSV could not be parsed.
    Parse(String),
    ColumnOutOfRange { col: usize, columns: usize },
    RowOutOfRange { row: usize, rows: usize },
    /// `update_schema` with a different column count.
    SchemaMismatch { expected: usize, actual: usize },
    /// A fill value that is itself invalid for the column type.
    InvalidFill { value: String, column_type: ColumnType },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDataset => write!(f, "no dataset loaded"),
            Self::Parse(msg) => write!(f, "parsing error: {msg}"),
            Self::ColumnOutOfRange { col, columns } => {
                write!(f, "column {col} out of bounds ({columns} columns)")
            }
            Self::RowOutOfRange { row, rows } => write!(f, "row {row} out of bounds ({rows} rows)"),
            Self::SchemaMismatch { expected, actual } => {
                write!(f, "schema has {actual} columns, dataset has {expected}")
            }
            Self::InvalidFill { value, column_type } => {
                write!(f, "fill value '{value}' is not a valid {column_type}")
            }
        }
    }
}

impl std::error::Error for EngineError {}

use std::fmt;

use tidygrid_protocol::CorrelationId;

use crate::stage::Stage;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    /// A dataset call was attempted before the engine signalled ready.
    EngineNotReady,
    /// The engine rejected a specific call.
    EngineFault { id: CorrelationId, message: String },
    /// The engine reported a failure that carries no correlation id.
    /// Never returned from a call; only logged and broadcast.
    UnroutableEngineFault { message: String },
    /// A frame or reply did not match the expected wire shape.
    Decode(String),
    /// No reply arrived within the configured call timeout.
    Timeout { id: Option<CorrelationId>, kind: &'static str },
    /// The channel to the engine is gone.
    ChannelClosed,
    /// The operation is not allowed in the current stage.
    InvalidStage { expected: &'static [Stage], actual: Stage },
    ColumnOutOfRange { col: usize, columns: usize },
    RowOutOfRange { row: usize, rows: usize },
    /// No dataset has been loaded into the session.
    NoDataset,
    /// A validation job is already running.
    ValidationBusy,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EngineNotReady => write!(f, "engine is not ready"),
            Self::EngineFault { id, message } => write!(f, "engine fault on call {id}: {message}"),
            Self::UnroutableEngineFault { message } => write!(f, "unroutable engine fault: {message}"),
            Self::Decode(msg) => write!(f, "decode error: {msg}"),
            Self::Timeout { id: Some(id), kind } => write!(f, "{kind} call {id} timed out"),
            Self::Timeout { id: None, kind } => write!(f, "{kind} timed out"),
            Self::ChannelClosed => write!(f, "engine channel closed"),
            Self::InvalidStage { expected, actual } => {
                let names: Vec<&str> = expected.iter().map(Stage::name).collect();
                write!(f, "not allowed in {} stage (needs {})", actual.name(), names.join(" or "))
            }
            Self::ColumnOutOfRange { col, columns } => {
                write!(f, "column {col} out of bounds ({columns} columns)")
            }
            Self::RowOutOfRange { row, rows } => write!(f, "row {row} out of bounds ({rows} rows)"),
            Self::NoDataset => write!(f, "no dataset loaded"),
            Self::ValidationBusy => write!(f, "a validation job is already running"),
        }
    }
}

impl std::error::Error for ClientError {}

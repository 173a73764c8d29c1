//! TidyGrid Engine Protocol: v1 frozen wire format
//!
//! This crate defines the canonical message types exchanged between the
//! client-side session (gateway) and the compute engine. The engine is only
//! reachable through asynchronous message passing, so every request carries a
//! correlation id and every reply echoes it back.
//!
//! # Protocol Version
//!
//! This is **protocol v1**. Every frame carries `"v"`; a frame with any other
//! version is rejected by the receiver as undecodable. Changes require:
//! 1. Version bump in PROTOCOL_VERSION
//! 2. New golden vectors in `crates/protocol/tests/golden/`
//!
//! # Usage
//!
//! ```ignore
//! use tidygrid_protocol::{RequestFrame, Request, EngineFrame};
//!
//! let frame = RequestFrame::call(7, Request::GetRows { start: 0, count: 200 });
//! let line = tidygrid_protocol::encode(&frame)?;
//! let reply: EngineFrame = tidygrid_protocol::decode(&incoming)?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Current protocol version. Increment for breaking changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Opaque token pairing an outstanding call with its reply.
pub type CorrelationId = u64;

// =============================================================================
// Schema vocabulary
// =============================================================================

/// Semantic type assigned to a column. Drives per-cell validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ColumnType {
    #[default]
    Text,
    Integer,
    Float,
    Boolean,
    Email,
    PhoneUS,
    Date,
}

impl ColumnType {
    pub const ALL: [ColumnType; 7] = [
        ColumnType::Text,
        ColumnType::Integer,
        ColumnType::Float,
        ColumnType::Boolean,
        ColumnType::Email,
        ColumnType::PhoneUS,
        ColumnType::Date,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Text => "Text",
            ColumnType::Integer => "Integer",
            ColumnType::Float => "Float",
            ColumnType::Boolean => "Boolean",
            ColumnType::Email => "Email",
            ColumnType::PhoneUS => "PhoneUS",
            ColumnType::Date => "Date",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string does not name a [`ColumnType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownColumnType(pub String);

impl fmt::Display for UnknownColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown column type '{}'", self.0)
    }
}

impl std::error::Error for UnknownColumnType {}

impl FromStr for ColumnType {
    type Err = UnknownColumnType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        ColumnType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownColumnType(s.to_string()))
    }
}

/// One column descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self { name: name.into(), column_type }
    }
}

// =============================================================================
// Fix vocabulary
// =============================================================================

/// Column-wide correction applied by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum CorrectionStrategy {
    /// Trim leading/trailing whitespace where that makes the cell valid.
    TrimWhitespace,
    /// Blank out every invalid cell.
    ClearInvalid,
    /// Replace every invalid cell with a fixed value.
    FillInvalid { value: String },
    /// Mask emails, SSNs, card numbers and IPv4 addresses.
    RedactPii,
}

/// Heuristic fix proposed by the engine's column analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "suggestion", rename_all = "snake_case")]
pub enum Suggestion {
    TrimWhitespace,
    RemoveChars { chars: String },
    DigitsOnly,
    /// Strip to digits then keep ten (drops an extension).
    PhoneStripToTenDigits,
    NormalizeDateToIso,
    NormalizeBooleanCase,
}

/// A suggestion with its projected impact and an example.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestionReport {
    pub suggestion: Suggestion,
    pub description: String,
    pub affected_count: usize,
    pub example_before: String,
    pub example_after: String,
}

// =============================================================================
// Client → Engine
// =============================================================================

/// Envelope for every request sent to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub v: u32,
    /// Absent for fire-and-forget requests (`init`, `shutdown`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,
    pub request: Request,
}

impl RequestFrame {
    /// A correlated call expecting exactly one reply.
    pub fn call(id: CorrelationId, request: Request) -> Self {
        Self { v: PROTOCOL_VERSION, id: Some(id), request }
    }

    /// A request answered (if at all) by an unsolicited message.
    pub fn signal(request: Request) -> Self {
        Self { v: PROTOCOL_VERSION, id: None, request }
    }
}

/// Requests understood by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    Init,
    LoadDataset {
        bytes: Vec<u8>,
    },
    UpdateSchema {
        schema: Vec<ColumnSchema>,
    },
    GetRows {
        start: usize,
        count: usize,
    },
    ValidateColumn {
        col: usize,
        column_type: ColumnType,
    },
    ValidateChunk {
        start: usize,
        count: usize,
        /// Used only to label the progress message the engine emits.
        total_rows: usize,
    },
    ApplyCorrection {
        col: usize,
        strategy: CorrectionStrategy,
    },
    GetSuggestions {
        col: usize,
    },
    ApplySuggestion {
        col: usize,
        suggestion: Suggestion,
    },
    UpdateCell {
        row: usize,
        col: usize,
        value: String,
    },
    FindReplaceRange {
        start: usize,
        count: usize,
        find: String,
        replace: String,
        total_rows: usize,
    },
    Shutdown,
}

impl Request {
    /// Stable wire name, used in logs and timeout errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Init => "init",
            Request::LoadDataset { .. } => "load_dataset",
            Request::UpdateSchema { .. } => "update_schema",
            Request::GetRows { .. } => "get_rows",
            Request::ValidateColumn { .. } => "validate_column",
            Request::ValidateChunk { .. } => "validate_chunk",
            Request::ApplyCorrection { .. } => "apply_correction",
            Request::GetSuggestions { .. } => "get_suggestions",
            Request::ApplySuggestion { .. } => "apply_suggestion",
            Request::UpdateCell { .. } => "update_cell",
            Request::FindReplaceRange { .. } => "find_replace_range",
            Request::Shutdown => "shutdown",
        }
    }

    /// True for requests that touch the loaded dataset and therefore must
    /// wait for the engine's ready signal.
    pub fn needs_dataset(&self) -> bool {
        !matches!(self, Request::Init | Request::Shutdown)
    }
}

// =============================================================================
// Engine → Client
// =============================================================================

/// Envelope for every message sent by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineFrame {
    pub v: u32,
    pub message: EngineMessage,
}

impl EngineFrame {
    pub fn new(message: EngineMessage) -> Self {
        Self { v: PROTOCOL_VERSION, message }
    }

    pub fn reply(id: CorrelationId, reply: Reply) -> Self {
        Self::new(EngineMessage::Reply { id, reply })
    }

    pub fn fault(id: Option<CorrelationId>, message: impl Into<String>) -> Self {
        Self::new(EngineMessage::Fault { id, message: message.into() })
    }
}

/// Messages emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineMessage {
    /// Engine finished initializing. Unsolicited, carries no id.
    Ready,
    /// Successful completion of a correlated call.
    Reply { id: CorrelationId, reply: Reply },
    /// Failure. With an id it rejects that call; without one it is unroutable.
    Fault {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<CorrelationId>,
        message: String,
    },
    /// Per-chunk progress during a long-running job. Unsolicited.
    Progress {
        job: JobKind,
        rows_processed: usize,
        total_rows: usize,
    },
}

/// Long-running engine jobs that report progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Validation,
    FindReplace,
}

/// Payload of a successful reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    Ack,
    Loaded {
        row_count: usize,
        schema: Vec<ColumnSchema>,
    },
    Rows {
        rows: RowsPayload,
    },
    InvalidRows {
        rows: Vec<usize>,
    },
    Violations {
        /// Flat `(row, col)` pairs.
        pairs: Vec<(usize, usize)>,
    },
    Changed {
        count: usize,
    },
    Suggestions {
        reports: Vec<SuggestionReport>,
    },
    Replaced {
        count: usize,
    },
}

impl Reply {
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Ack => "ack",
            Reply::Loaded { .. } => "loaded",
            Reply::Rows { .. } => "rows",
            Reply::InvalidRows { .. } => "invalid_rows",
            Reply::Violations { .. } => "violations",
            Reply::Changed { .. } => "changed",
            Reply::Suggestions { .. } => "suggestions",
            Reply::Replaced { .. } => "replaced",
        }
    }
}

/// Row serialization. The engine may answer positionally or keyed by
/// column name; the receiver must normalize against its own schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum RowsPayload {
    Positional { rows: Vec<Vec<String>> },
    Keyed { rows: Vec<BTreeMap<String, String>> },
}

impl RowsPayload {
    pub fn len(&self) -> usize {
        match self {
            RowsPayload::Positional { rows } => rows.len(),
            RowsPayload::Keyed { rows } => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Errors from encoding or decoding a frame.
#[derive(Debug)]
pub enum ProtocolError {
    /// The text was not a well-formed frame of the expected type.
    Malformed(String),
    /// The frame declared a version this build does not speak.
    UnsupportedVersion(u32),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Malformed(msg) => write!(f, "malformed frame: {msg}"),
            ProtocolError::UnsupportedVersion(v) => {
                write!(f, "unsupported protocol version {v} (expected {PROTOCOL_VERSION})")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Frames that carry a protocol version.
pub trait Versioned {
    fn version(&self) -> u32;
}

impl Versioned for RequestFrame {
    fn version(&self) -> u32 {
        self.v
    }
}

impl Versioned for EngineFrame {
    fn version(&self) -> u32 {
        self.v
    }
}

/// Serialize a frame to a single JSON line (no trailing newline).
pub fn encode<T: Serialize>(frame: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Strictly decode a frame and check its version.
pub fn decode<T: DeserializeOwned + Versioned>(line: &str) -> Result<T, ProtocolError> {
    let frame: T =
        serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if frame.version() != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(frame.version()));
    }
    Ok(frame)
}

/// Best-effort extraction of a correlation id from a frame that failed to
/// decode, so the failure can still be attributed to its caller.
pub fn salvage_id(line: &str) -> Option<CorrelationId> {
    #[derive(Deserialize)]
    struct Header {
        #[serde(default)]
        id: Option<CorrelationId>,
        #[serde(default)]
        message: Option<MessageHeader>,
    }
    #[derive(Deserialize)]
    struct MessageHeader {
        #[serde(default)]
        id: Option<CorrelationId>,
    }

    let header: Header = serde_json::from_str(line).ok()?;
    header.id.or_else(|| header.message.and_then(|m| m.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_type_from_str_is_case_insensitive() {
        assert_eq!("integer".parse::<ColumnType>(), Ok(ColumnType::Integer));
        assert_eq!(" PhoneUS ".parse::<ColumnType>(), Ok(ColumnType::PhoneUS));
        assert!("Currency".parse::<ColumnType>().is_err());
    }

    #[test]
    fn test_request_wire_shape() {
        let frame = RequestFrame::call(3, Request::GetRows { start: 10, count: 5 });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["v"], 1);
        assert_eq!(json["id"], 3);
        assert_eq!(json["request"]["kind"], "get_rows");
        assert_eq!(json["request"]["start"], 10);
    }

    #[test]
    fn test_signal_omits_id() {
        let frame = RequestFrame::signal(Request::Init);
        let line = encode(&frame).unwrap();
        assert!(!line.contains("\"id\""));
    }

    #[test]
    fn test_decode_rejects_other_version() {
        let line = r#"{"v":2,"message":{"type":"ready"}}"#;
        match decode::<EngineFrame>(line) {
            Err(ProtocolError::UnsupportedVersion(2)) => {}
            other => panic!("expected version error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_row_shape() {
        let line = r#"{"v":1,"message":{"type":"reply","id":4,"reply":{"kind":"rows","rows":{"shape":"columnar","rows":[]}}}}"#;
        assert!(matches!(decode::<EngineFrame>(line), Err(ProtocolError::Malformed(_))));
        assert_eq!(salvage_id(line), Some(4));
    }

    #[test]
    fn test_salvage_id_missing() {
        assert_eq!(salvage_id(r#"{"v":1,"message":{"type":"ready"}}"#), None);
        assert_eq!(salvage_id("not json"), None);
    }

    #[test]
    fn test_fault_without_id_round_trips() {
        let frame = EngineFrame::fault(None, "out of memory");
        let decoded: EngineFrame = decode(&encode(&frame).unwrap()).unwrap();
        match decoded.message {
            EngineMessage::Fault { id, message } => {
                assert_eq!(id, None);
                assert_eq!(message, "out of memory");
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
}

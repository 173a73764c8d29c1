//! Golden vector compatibility test for the v1 engine protocol.
//!
//! Every line in `tests/golden/*.jsonl` must decode into the shared types and
//! re-encode byte-for-byte. If this fails the types drifted from the wire
//! format: fix the types, not the vectors.

use std::fs;
use std::path::PathBuf;

use tidygrid_protocol::{
    decode, encode, salvage_id, ColumnType, CorrectionStrategy, EngineFrame, EngineMessage,
    JobKind, ProtocolError, Reply, Request, RequestFrame, RowsPayload, Suggestion,
};

fn load_golden_lines(filename: &str) -> Vec<String> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/golden").join(filename);
    let contents = fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read {}: {}", path.display(), e));
    contents.lines().filter(|line| !line.trim().is_empty()).map(String::from).collect()
}

#[test]
fn test_request_vectors_round_trip_exactly() {
    let lines = load_golden_lines("requests.jsonl");
    assert_eq!(lines.len(), 12);
    for line in &lines {
        let frame: RequestFrame = decode(line).unwrap_or_else(|e| panic!("{e}: {line}"));
        assert_eq!(&encode(&frame).unwrap(), line);
    }
}

#[test]
fn test_signals_carry_no_id() {
    let lines = load_golden_lines("requests.jsonl");
    let first: RequestFrame = decode(&lines[0]).unwrap();
    let last: RequestFrame = decode(lines.last().unwrap()).unwrap();
    assert!(matches!(first.request, Request::Init));
    assert!(matches!(last.request, Request::Shutdown));
    assert_eq!(first.id, None);
    assert_eq!(last.id, None);
}

#[test]
fn test_request_payloads() {
    let lines = load_golden_lines("requests.jsonl");
    let frames: Vec<RequestFrame> = lines.iter().map(|l| decode(l).unwrap()).collect();

    match &frames[1].request {
        Request::LoadDataset { bytes } => assert_eq!(bytes, b"id\n1\n"),
        other => panic!("expected load_dataset, got {other:?}"),
    }
    match &frames[2].request {
        Request::UpdateSchema { schema } => {
            assert_eq!(schema[1].name, "phone");
            assert_eq!(schema[1].column_type, ColumnType::PhoneUS);
        }
        other => panic!("expected update_schema, got {other:?}"),
    }
    match &frames[6].request {
        Request::ApplyCorrection { col: 2, strategy } => {
            assert_eq!(strategy, &CorrectionStrategy::FillInvalid { value: "0".into() });
        }
        other => panic!("expected apply_correction, got {other:?}"),
    }
    match &frames[8].request {
        Request::ApplySuggestion { suggestion, .. } => {
            assert_eq!(suggestion, &Suggestion::RemoveChars { chars: "$,".into() });
        }
        other => panic!("expected apply_suggestion, got {other:?}"),
    }
    let kinds: Vec<&str> = frames.iter().map(|f| f.request.kind()).collect();
    assert_eq!(
        kinds,
        vec![
            "init",
            "load_dataset",
            "update_schema",
            "get_rows",
            "validate_column",
            "validate_chunk",
            "apply_correction",
            "get_suggestions",
            "apply_suggestion",
            "update_cell",
            "find_replace_range",
            "shutdown",
        ]
    );
}

#[test]
fn test_engine_vectors_round_trip_exactly() {
    let lines = load_golden_lines("engine.jsonl");
    assert_eq!(lines.len(), 13);
    for line in &lines {
        let frame: EngineFrame = decode(line).unwrap_or_else(|e| panic!("{e}: {line}"));
        assert_eq!(&encode(&frame).unwrap(), line);
    }
}

#[test]
fn test_engine_payloads() {
    let lines = load_golden_lines("engine.jsonl");
    let messages: Vec<EngineMessage> =
        lines.iter().map(|l| decode::<EngineFrame>(l).unwrap().message).collect();

    assert!(matches!(messages[0], EngineMessage::Ready));
    match &messages[2] {
        EngineMessage::Reply { id: 3, reply: Reply::Rows { rows: RowsPayload::Positional { rows } } } => {
            assert_eq!(rows[1], vec!["2".to_string(), String::new()]);
        }
        other => panic!("expected positional rows, got {other:?}"),
    }
    match &messages[3] {
        EngineMessage::Reply { reply: Reply::Rows { rows: RowsPayload::Keyed { rows } }, .. } => {
            assert_eq!(rows[0].get("phone").map(String::as_str), Some("555-0100"));
        }
        other => panic!("expected keyed rows, got {other:?}"),
    }
    match &messages[5] {
        EngineMessage::Reply { reply: Reply::Violations { pairs }, .. } => {
            assert_eq!(pairs, &vec![(50001, 1), (50007, 0)]);
        }
        other => panic!("expected violations, got {other:?}"),
    }
    match &messages[10] {
        EngineMessage::Fault { id, message } => {
            assert_eq!(*id, Some(9));
            assert_eq!(message, "row 41 out of range");
        }
        other => panic!("expected routed fault, got {other:?}"),
    }
    assert!(matches!(&messages[11], EngineMessage::Fault { id: None, .. }));
    assert!(matches!(
        messages[12],
        EngineMessage::Progress { job: JobKind::Validation, rows_processed: 100000, total_rows: 120000 }
    ));
}

#[test]
fn test_rejected_vectors() {
    let lines = load_golden_lines("rejected.jsonl");
    assert_eq!(lines.len(), 4);

    assert!(matches!(decode::<EngineFrame>(&lines[0]), Err(ProtocolError::UnsupportedVersion(2))));
    for line in &lines[1..] {
        assert!(matches!(decode::<EngineFrame>(line), Err(ProtocolError::Malformed(_))));
    }

    // Undecodable frames still name their call when the id survives.
    let salvaged: Vec<Option<u64>> = lines.iter().map(|l| salvage_id(l)).collect();
    assert_eq!(salvaged, vec![None, Some(12), Some(13), None]);
}

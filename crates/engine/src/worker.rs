//! Engine worker: owns the dataset and serves protocol frames one at a time.
//!
//! The worker runs on its own thread and is reachable only through two
//! channels of JSON text frames. Processing is strictly sequential, which is
//! the only serialization the dataset gets; clients must not assume any
//! other ordering across independent calls.

use std::thread::{self, JoinHandle};

use smol::channel::{self, Receiver, Sender};
use tidygrid_protocol::{
    self as protocol, CorrelationId, EngineFrame, EngineMessage, JobKind, Reply, Request,
    RequestFrame,
};

use crate::dataset::{Dataset, RowShape};
use crate::{correct, suggest, EngineError};

/// Knobs for the reference engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOptions {
    /// Wire shape used for `get_rows` replies.
    pub row_shape: RowShape,
}

/// Engine state plus request dispatch. Thread-agnostic so it can be driven
/// directly in tests.
#[derive(Debug, Default)]
pub struct Engine {
    options: EngineOptions,
    dataset: Option<Dataset>,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Self {
        Self { options, dataset: None }
    }

    pub fn dataset(&self) -> Option<&Dataset> {
        self.dataset.as_ref()
    }

    fn loaded(&self) -> Result<&Dataset, EngineError> {
        self.dataset.as_ref().ok_or(EngineError::NoDataset)
    }

    fn loaded_mut(&mut self) -> Result<&mut Dataset, EngineError> {
        self.dataset.as_mut().ok_or(EngineError::NoDataset)
    }

    /// Handle one request frame and return every frame it produces, in order.
    pub fn handle(&mut self, frame: RequestFrame) -> Vec<EngineFrame> {
        let RequestFrame { id, request, .. } = frame;
        let kind = request.kind();

        if let Request::Init = request {
            return vec![EngineFrame::new(EngineMessage::Ready)];
        }

        let progress = self.progress_for(&request);
        let mut out = Vec::with_capacity(2);
        match (self.execute(request), id) {
            (Ok(reply), Some(id)) => out.push(EngineFrame::reply(id, reply)),
            (Ok(_), None) => log::warn!("{kind} sent without a correlation id; reply dropped"),
            (Err(e), id) => {
                log::debug!("{kind} failed: {e}");
                out.push(EngineFrame::fault(id, e.to_string()));
                return out;
            }
        }
        out.extend(progress.map(EngineFrame::new));
        out
    }

    /// Progress message to emit after a chunked request succeeds.
    fn progress_for(&self, request: &Request) -> Option<EngineMessage> {
        let rows = self.dataset.as_ref().map_or(0, Dataset::row_count);
        match *request {
            Request::ValidateChunk { start, count, total_rows } => Some(EngineMessage::Progress {
                job: JobKind::Validation,
                rows_processed: start.saturating_add(count).min(rows),
                total_rows,
            }),
            Request::FindReplaceRange { start, count, total_rows, .. } => {
                Some(EngineMessage::Progress {
                    job: JobKind::FindReplace,
                    rows_processed: start.saturating_add(count).min(rows),
                    total_rows,
                })
            }
            _ => None,
        }
    }

    fn execute(&mut self, request: Request) -> Result<Reply, EngineError> {
        match request {
            Request::Init | Request::Shutdown => Ok(Reply::Ack),
            Request::LoadDataset { bytes } => {
                let ds = Dataset::parse_csv(&bytes)?;
                log::info!(
                    "loaded {} rows x {} columns ({:.2} MB)",
                    ds.row_count(),
                    ds.column_count(),
                    bytes.len() as f64 / 1_048_576.0
                );
                let reply = Reply::Loaded {
                    row_count: ds.row_count(),
                    schema: ds.columns.clone(),
                };
                self.dataset = Some(ds);
                Ok(reply)
            }
            Request::UpdateSchema { schema } => {
                self.loaded_mut()?.set_schema(schema)?;
                Ok(Reply::Ack)
            }
            Request::GetRows { start, count } => {
                let shape = self.options.row_shape;
                Ok(Reply::Rows { rows: self.loaded()?.rows_payload(start, count, shape) })
            }
            Request::ValidateColumn { col, column_type } => Ok(Reply::InvalidRows {
                rows: self.loaded_mut()?.validate_column(col, column_type)?,
            }),
            Request::ValidateChunk { start, count, .. } => Ok(Reply::Violations {
                pairs: self.loaded()?.validate_chunk(start, count),
            }),
            Request::ApplyCorrection { col, strategy } => Ok(Reply::Changed {
                count: correct::apply(self.loaded_mut()?, col, &strategy)?,
            }),
            Request::GetSuggestions { col } => Ok(Reply::Suggestions {
                reports: suggest::analyze_column(self.loaded()?, col)?,
            }),
            Request::ApplySuggestion { col, suggestion } => Ok(Reply::Changed {
                count: suggest::apply(self.loaded_mut()?, col, &suggestion)?,
            }),
            Request::UpdateCell { row, col, value } => {
                self.loaded_mut()?.update_cell(row, col, value)?;
                Ok(Reply::Ack)
            }
            Request::FindReplaceRange { start, count, find, replace, .. } => Ok(Reply::Replaced {
                count: self.loaded_mut()?.find_replace_range(start, count, &find, &replace),
            }),
        }
    }
}

/// Channels and thread of a running engine worker.
pub struct EngineHandle {
    /// Client → engine request frames.
    pub requests: Sender<String>,
    /// Engine → client frames (replies, faults, progress, ready).
    pub frames: Receiver<String>,
    thread: JoinHandle<()>,
}

impl EngineHandle {
    /// Split into the two channel ends, keeping the thread handle.
    pub fn into_parts(self) -> (Sender<String>, Receiver<String>, JoinHandle<()>) {
        (self.requests, self.frames, self.thread)
    }
}

/// Start an engine worker thread.
///
/// The worker exits when it receives `shutdown` or when the request channel
/// is closed.
pub fn spawn_engine(options: EngineOptions) -> std::io::Result<EngineHandle> {
    let (requests, request_rx) = channel::unbounded::<String>();
    let (frame_tx, frames) = channel::unbounded::<String>();

    let thread = thread::Builder::new()
        .name("tidygrid-engine".to_string())
        .spawn(move || run(Engine::new(options), request_rx, frame_tx))?;

    Ok(EngineHandle { requests, frames, thread })
}

fn run(mut engine: Engine, requests: Receiver<String>, frames: Sender<String>) {
    while let Ok(line) = requests.recv_blocking() {
        let outgoing = match protocol::decode::<RequestFrame>(&line) {
            Ok(RequestFrame { request: Request::Shutdown, .. }) => break,
            Ok(frame) => engine.handle(frame),
            Err(e) => {
                let id: Option<CorrelationId> = protocol::salvage_id(&line);
                log::warn!("rejecting undecodable request (id {id:?}): {e}");
                vec![EngineFrame::fault(id, e.to_string())]
            }
        };

        for frame in outgoing {
            let encoded = match protocol::encode(&frame) {
                Ok(line) => line,
                Err(e) => {
                    log::error!("failed to encode engine frame: {e}");
                    continue;
                }
            };
            if frames.send_blocking(encoded).is_err() {
                log::debug!("client hung up; engine worker exiting");
                return;
            }
        }
    }
    log::debug!("engine worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidygrid_protocol::{ColumnType, RowsPayload};

    const CSV: &str = "id,score\n1,10\n2,x\n3,30\n";

    fn loaded_engine() -> Engine {
        let mut engine = Engine::new(EngineOptions::default());
        let out = engine.handle(RequestFrame::call(
            1,
            Request::LoadDataset { bytes: CSV.as_bytes().to_vec() },
        ));
        assert!(matches!(
            out[0].message,
            EngineMessage::Reply { id: 1, reply: Reply::Loaded { row_count: 3, .. } }
        ));
        engine
    }

    #[test]
    fn test_init_replies_with_ready_only() {
        let mut engine = Engine::new(EngineOptions::default());
        let out = engine.handle(RequestFrame::signal(Request::Init));
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].message, EngineMessage::Ready));
    }

    #[test]
    fn test_calls_without_dataset_fault_with_id() {
        let mut engine = Engine::new(EngineOptions::default());
        let out = engine.handle(RequestFrame::call(9, Request::GetRows { start: 0, count: 1 }));
        match &out[0].message {
            EngineMessage::Fault { id, message } => {
                assert_eq!(*id, Some(9));
                assert!(message.contains("no dataset"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_validate_chunk_emits_reply_then_progress() {
        let mut engine = loaded_engine();
        engine.handle(RequestFrame::call(
            2,
            Request::ValidateColumn { col: 1, column_type: ColumnType::Integer },
        ));
        let out = engine.handle(RequestFrame::call(
            3,
            Request::ValidateChunk { start: 0, count: 2, total_rows: 3 },
        ));
        assert_eq!(out.len(), 2);
        assert!(matches!(
            &out[0].message,
            EngineMessage::Reply { id: 3, reply: Reply::Violations { pairs } } if pairs == &vec![(1, 1)]
        ));
        assert!(matches!(
            out[1].message,
            EngineMessage::Progress { job: JobKind::Validation, rows_processed: 2, total_rows: 3 }
        ));
    }

    #[test]
    fn test_get_rows_in_keyed_shape() {
        let mut engine = Engine::new(EngineOptions { row_shape: RowShape::Keyed });
        engine.handle(RequestFrame::call(1, Request::LoadDataset { bytes: CSV.as_bytes().to_vec() }));
        let out = engine.handle(RequestFrame::call(2, Request::GetRows { start: 1, count: 1 }));
        match &out[0].message {
            EngineMessage::Reply { reply: Reply::Rows { rows: RowsPayload::Keyed { rows } }, .. } => {
                assert_eq!(rows[0]["score"], "x");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_worker_thread_round_trip() {
        let handle = spawn_engine(EngineOptions::default()).unwrap();
        let (requests, frames, thread) = handle.into_parts();

        requests
            .send_blocking(protocol::encode(&RequestFrame::signal(Request::Init)).unwrap())
            .unwrap();
        let ready: EngineFrame = protocol::decode(&frames.recv_blocking().unwrap()).unwrap();
        assert!(matches!(ready.message, EngineMessage::Ready));

        requests.send_blocking("{\"v\":1,\"id\":5,\"request\":{\"kind\":\"bogus\"}}".to_string()).unwrap();
        let fault: EngineFrame = protocol::decode(&frames.recv_blocking().unwrap()).unwrap();
        assert!(matches!(fault.message, EngineMessage::Fault { id: Some(5), .. }));

        requests
            .send_blocking(protocol::encode(&RequestFrame::signal(Request::Shutdown)).unwrap())
            .unwrap();
        thread.join().unwrap();
    }
}

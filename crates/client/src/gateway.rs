//! Engine gateway: correlated calls over the engine's message channels.
//!
//! The engine is reachable only through two channels of JSON text frames.
//! The gateway gives every call a fresh correlation id, parks a oneshot
//! completion handle under it, and runs a router task that matches inbound
//! replies and faults back to their handles. Messages without an id (ready,
//! progress, unroutable faults) are published to session subscribers.
//!
//! Every call is bounded by a timeout; a timed-out call removes its handle
//! so a late reply is simply discarded.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use smol::channel::{self, Receiver, Sender};
use smol::{Task, Timer};
use tidygrid_protocol::{
    self as protocol, ColumnSchema, ColumnType, CorrectionStrategy, CorrelationId, EngineFrame,
    EngineMessage, Reply, Request, RequestFrame, RowsPayload, Suggestion, SuggestionReport,
};

use crate::error::{ClientError, Result};
use crate::events::{EventRegistry, SessionEvent};

/// Single-use completion handles for correlated calls.
pub mod oneshot {
    use smol::channel;

    pub struct Sender<T>(channel::Sender<T>);
    pub struct Receiver<T>(channel::Receiver<T>);

    impl<T> Sender<T> {
        pub fn send(self, value: T) -> Result<(), T> {
            self.0.try_send(value).map_err(|e| e.into_inner())
        }
    }

    impl<T> Receiver<T> {
        pub async fn recv(self) -> Result<T, RecvError> {
            self.0.recv().await.map_err(|_| RecvError)
        }
    }

    #[derive(Debug, Clone, Copy)]
    pub struct RecvError;

    pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
        // Buffer of 1 for oneshot semantics
        let (tx, rx) = channel::bounded(1);
        (Sender(tx), Receiver(rx))
    }
}

type Completion = oneshot::Sender<Result<Reply>>;

/// State shared between callers and the router task.
struct Routing {
    pending: Mutex<HashMap<CorrelationId, Completion>>,
    ready: AtomicBool,
    ready_tx: Sender<()>,
    ready_rx: Receiver<()>,
    events: EventRegistry,
}

impl Routing {
    fn route(&self, line: &str) {
        let frame = match protocol::decode::<EngineFrame>(line) {
            Ok(frame) => frame,
            Err(e) => {
                match protocol::salvage_id(line) {
                    Some(id) => self.complete(id, Err(ClientError::Decode(e.to_string()))),
                    None => log::warn!("dropping undecodable engine frame: {e}"),
                }
                return;
            }
        };

        match frame.message {
            EngineMessage::Ready => {
                self.ready.store(true, Ordering::SeqCst);
                let _ = self.ready_tx.try_send(());
                log::info!("engine ready");
                self.events.broadcast(SessionEvent::EngineReady);
            }
            EngineMessage::Reply { id, reply } => self.complete(id, Ok(reply)),
            EngineMessage::Fault { id: Some(id), message } => {
                self.complete(id, Err(ClientError::EngineFault { id, message }))
            }
            EngineMessage::Fault { id: None, message } => {
                let err = ClientError::UnroutableEngineFault { message: message.clone() };
                log::warn!("{err}");
                self.events.broadcast(SessionEvent::UnroutableFault { message });
            }
            EngineMessage::Progress { job, rows_processed, total_rows } => {
                self.events.broadcast(SessionEvent::EngineProgress {
                    job,
                    rows_processed,
                    total_rows,
                });
            }
        }
    }

    fn complete(&self, id: CorrelationId, outcome: Result<Reply>) {
        let Some(handle) = self.pending.lock().remove(&id) else {
            log::debug!("no pending call {id} (timed out or already resolved)");
            return;
        };
        if handle.send(outcome).is_err() {
            log::debug!("caller for call {id} went away");
        }
    }

    /// Reject every outstanding call. Used when the channel goes away.
    fn fail_all(&self, err: ClientError) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (_, handle) in drained {
            let _ = handle.send(Err(err.clone()));
        }
    }
}

/// Owns the single channel to the engine.
pub struct EngineGateway {
    requests: Sender<String>,
    routing: Arc<Routing>,
    next_id: AtomicU64,
    call_timeout: Duration,
    _router: Task<()>,
}

impl EngineGateway {
    /// Attach to an engine's request and frame channels and start routing.
    pub fn connect(
        requests: Sender<String>,
        frames: Receiver<String>,
        call_timeout: Duration,
        events: EventRegistry,
    ) -> Self {
        let (ready_tx, ready_rx) = channel::bounded(1);
        let routing = Arc::new(Routing {
            pending: Mutex::new(HashMap::new()),
            ready: AtomicBool::new(false),
            ready_tx,
            ready_rx,
            events,
        });

        let router_state = routing.clone();
        let router = smol::spawn(async move {
            while let Ok(line) = frames.recv().await {
                router_state.route(&line);
            }
            log::debug!("engine frame channel closed");
            router_state.ready.store(false, Ordering::SeqCst);
            router_state.ready_tx.close();
            router_state.fail_all(ClientError::ChannelClosed);
        });

        Self {
            requests,
            routing,
            next_id: AtomicU64::new(1),
            call_timeout,
            _router: router,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.routing.ready.load(Ordering::SeqCst)
    }

    /// Number of calls awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.routing.pending.lock().len()
    }

    /// Send `init` and wait for the engine's ready signal.
    pub async fn init(&self, timeout: Duration) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        self.send(RequestFrame::signal(Request::Init)).await?;
        let ready = self.routing.ready_rx.clone();
        deadline(timeout, ClientError::Timeout { id: None, kind: "init" }, async move {
            ready.recv().await.map_err(|_| ClientError::ChannelClosed)
        })
        .await
    }

    /// Issue one correlated call and wait for its reply.
    ///
    /// Dataset calls made before the ready signal fail with
    /// [`ClientError::EngineNotReady`]; nothing is queued.
    pub async fn call(&self, request: Request) -> Result<Reply> {
        if self.requests.is_closed() {
            return Err(ClientError::ChannelClosed);
        }
        if request.needs_dataset() && !self.is_ready() {
            return Err(ClientError::EngineNotReady);
        }

        let kind = request.kind();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.routing.pending.lock().insert(id, tx);

        if let Err(e) = self.send(RequestFrame::call(id, request)).await {
            self.routing.pending.lock().remove(&id);
            return Err(e);
        }
        log::debug!("dispatched {kind} call {id}");

        let outcome = deadline(self.call_timeout, ClientError::Timeout { id: Some(id), kind }, async {
            rx.recv().await.unwrap_or(Err(ClientError::ChannelClosed))
        })
        .await;

        match &outcome {
            Err(ClientError::Timeout { .. }) => {
                self.routing.pending.lock().remove(&id);
                log::warn!("{kind} call {id} timed out after {:?}", self.call_timeout);
            }
            Err(e) => log::debug!("{kind} call {id} failed: {e}"),
            Ok(reply) => log::debug!("{kind} call {id} resolved with {}", reply.kind()),
        }
        outcome
    }

    async fn send(&self, frame: RequestFrame) -> Result<()> {
        let line = protocol::encode(&frame).map_err(|e| ClientError::Decode(e.to_string()))?;
        self.requests.send(line).await.map_err(|_| ClientError::ChannelClosed)
    }

    /// Ask the engine to stop and release the channel.
    pub fn shutdown(&self) {
        if let Ok(line) = protocol::encode(&RequestFrame::signal(Request::Shutdown)) {
            let _ = self.requests.try_send(line);
        }
        self.requests.close();
        self.routing.fail_all(ClientError::ChannelClosed);
    }

    // ------------------------------------------------------------------------
    // Typed calls
    // ------------------------------------------------------------------------

    pub async fn load_dataset(&self, bytes: Vec<u8>) -> Result<(usize, Vec<ColumnSchema>)> {
        match self.call(Request::LoadDataset { bytes }).await? {
            Reply::Loaded { row_count, schema } => Ok((row_count, schema)),
            other => Err(unexpected("loaded", &other)),
        }
    }

    pub async fn update_schema(&self, schema: Vec<ColumnSchema>) -> Result<()> {
        match self.call(Request::UpdateSchema { schema }).await? {
            Reply::Ack => Ok(()),
            other => Err(unexpected("ack", &other)),
        }
    }

    pub async fn get_rows(&self, start: usize, count: usize) -> Result<RowsPayload> {
        match self.call(Request::GetRows { start, count }).await? {
            Reply::Rows { rows } => Ok(rows),
            other => Err(unexpected("rows", &other)),
        }
    }

    pub async fn validate_column(&self, col: usize, column_type: ColumnType) -> Result<Vec<usize>> {
        match self.call(Request::ValidateColumn { col, column_type }).await? {
            Reply::InvalidRows { rows } => Ok(rows),
            other => Err(unexpected("invalid_rows", &other)),
        }
    }

    pub async fn validate_chunk(
        &self,
        start: usize,
        count: usize,
        total_rows: usize,
    ) -> Result<Vec<(usize, usize)>> {
        match self.call(Request::ValidateChunk { start, count, total_rows }).await? {
            Reply::Violations { pairs } => Ok(pairs),
            other => Err(unexpected("violations", &other)),
        }
    }

    pub async fn apply_correction(&self, col: usize, strategy: CorrectionStrategy) -> Result<usize> {
        match self.call(Request::ApplyCorrection { col, strategy }).await? {
            Reply::Changed { count } => Ok(count),
            other => Err(unexpected("changed", &other)),
        }
    }

    pub async fn get_suggestions(&self, col: usize) -> Result<Vec<SuggestionReport>> {
        match self.call(Request::GetSuggestions { col }).await? {
            Reply::Suggestions { reports } => Ok(reports),
            other => Err(unexpected("suggestions", &other)),
        }
    }

    pub async fn apply_suggestion(&self, col: usize, suggestion: Suggestion) -> Result<usize> {
        match self.call(Request::ApplySuggestion { col, suggestion }).await? {
            Reply::Changed { count } => Ok(count),
            other => Err(unexpected("changed", &other)),
        }
    }

    pub async fn update_cell(&self, row: usize, col: usize, value: String) -> Result<()> {
        match self.call(Request::UpdateCell { row, col, value }).await? {
            Reply::Ack => Ok(()),
            other => Err(unexpected("ack", &other)),
        }
    }

    pub async fn find_replace_range(
        &self,
        start: usize,
        count: usize,
        find: &str,
        replace: &str,
        total_rows: usize,
    ) -> Result<usize> {
        let request = Request::FindReplaceRange {
            start,
            count,
            find: find.to_string(),
            replace: replace.to_string(),
            total_rows,
        };
        match self.call(request).await? {
            Reply::Replaced { count } => Ok(count),
            other => Err(unexpected("replaced", &other)),
        }
    }
}

impl Drop for EngineGateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn unexpected(expected: &str, got: &Reply) -> ClientError {
    ClientError::Decode(format!("expected {expected} reply, got {}", got.kind()))
}

/// Race `fut` against a timer; the timer yields `on_timeout`.
async fn deadline<T>(
    limit: Duration,
    on_timeout: ClientError,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    smol::future::or(fut, async move {
        Timer::after(limit).await;
        Err(on_timeout)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        gateway: EngineGateway,
        engine_rx: Receiver<String>,
        engine_tx: Sender<String>,
        events: Receiver<SessionEvent>,
    }

    fn harness(timeout: Duration) -> Harness {
        let (requests, engine_rx) = channel::unbounded();
        let (engine_tx, frames) = channel::unbounded();
        let registry = EventRegistry::default();
        let (_, events) = registry.register();
        let gateway = EngineGateway::connect(requests, frames, timeout, registry);
        Harness { gateway, engine_rx, engine_tx, events }
    }

    fn send(tx: &Sender<String>, frame: EngineFrame) {
        tx.try_send(protocol::encode(&frame).unwrap()).unwrap();
    }

    async fn ready(h: &Harness) {
        let engine = async {
            let init: RequestFrame = protocol::decode(&h.engine_rx.recv().await.unwrap()).unwrap();
            assert!(matches!(init.request, Request::Init));
            assert_eq!(init.id, None);
            send(&h.engine_tx, EngineFrame::new(EngineMessage::Ready));
        };
        let (result, ()) = smol::future::zip(h.gateway.init(Duration::from_secs(5)), engine).await;
        result.unwrap();
        assert!(h.gateway.is_ready());
    }

    #[test]
    fn test_dataset_call_before_ready_fails() {
        smol::block_on(async {
            let h = harness(Duration::from_secs(5));
            let err = h.gateway.get_rows(0, 10).await.unwrap_err();
            assert_eq!(err, ClientError::EngineNotReady);
            assert!(h.engine_rx.try_recv().is_err(), "nothing should be sent");
        });
    }

    #[test]
    fn test_replies_resolve_out_of_order() {
        smol::block_on(async {
            let h = harness(Duration::from_secs(5));
            ready(&h).await;

            let first = h.gateway.validate_column(0, ColumnType::Integer);
            let second = h.gateway.update_cell(1, 0, "x".into());
            let engine = async {
                let a: RequestFrame = protocol::decode(&h.engine_rx.recv().await.unwrap()).unwrap();
                let b: RequestFrame = protocol::decode(&h.engine_rx.recv().await.unwrap()).unwrap();
                send(&h.engine_tx, EngineFrame::reply(b.id.unwrap(), Reply::Ack));
                send(&h.engine_tx, EngineFrame::reply(a.id.unwrap(), Reply::InvalidRows { rows: vec![3] }));
            };
            let ((a, b), ()) = smol::future::zip(smol::future::zip(first, second), engine).await;
            assert_eq!(a.unwrap(), vec![3]);
            assert!(b.is_ok());
            assert_eq!(h.gateway.pending_calls(), 0);
        });
    }

    #[test]
    fn test_fault_with_id_rejects_that_call() {
        smol::block_on(async {
            let h = harness(Duration::from_secs(5));
            ready(&h).await;

            let call = h.gateway.get_suggestions(9);
            let engine = async {
                let req: RequestFrame = protocol::decode(&h.engine_rx.recv().await.unwrap()).unwrap();
                send(&h.engine_tx, EngineFrame::fault(req.id, "column 9 out of bounds"));
            };
            let (result, ()) = smol::future::zip(call, engine).await;
            match result {
                Err(ClientError::EngineFault { message, .. }) => assert!(message.contains("column 9")),
                other => panic!("expected engine fault, got {:?}", other),
            }
        });
    }

    #[test]
    fn test_unroutable_fault_is_broadcast() {
        smol::block_on(async {
            let h = harness(Duration::from_secs(5));
            send(&h.engine_tx, EngineFrame::fault(None, "worker crashed"));
            loop {
                match h.events.recv().await.unwrap() {
                    SessionEvent::UnroutableFault { message } => {
                        assert_eq!(message, "worker crashed");
                        break;
                    }
                    _ => continue,
                }
            }
        });
    }

    #[test]
    fn test_call_times_out_and_cleans_up() {
        smol::block_on(async {
            let h = harness(Duration::from_millis(50));
            ready(&h).await;
            let err = h.gateway.get_rows(0, 1).await.unwrap_err();
            assert!(matches!(err, ClientError::Timeout { id: Some(_), kind: "get_rows" }));
            assert_eq!(h.gateway.pending_calls(), 0);
        });
    }

    #[test]
    fn test_undecodable_reply_rejects_call_with_decode_error() {
        smol::block_on(async {
            let h = harness(Duration::from_secs(5));
            ready(&h).await;

            let call = h.gateway.get_rows(0, 1);
            let engine = async {
                let req: RequestFrame = protocol::decode(&h.engine_rx.recv().await.unwrap()).unwrap();
                let bogus = format!(
                    r#"{{"v":1,"message":{{"type":"reply","id":{},"reply":{{"kind":"rows","rows":{{"shape":"columnar"}}}}}}}}"#,
                    req.id.unwrap()
                );
                h.engine_tx.try_send(bogus).unwrap();
            };
            let (result, ()) = smol::future::zip(call, engine).await;
            assert!(matches!(result, Err(ClientError::Decode(_))));
        });
    }

    #[test]
    fn test_closed_channel_fails_pending_calls() {
        smol::block_on(async {
            let h = harness(Duration::from_secs(5));
            ready(&h).await;
            let Harness { gateway, engine_rx, engine_tx, .. } = h;
            let call = gateway.get_rows(0, 1);
            let engine = async move {
                let _ = engine_rx.recv().await;
                drop(engine_tx);
            };
            let (result, ()) = smol::future::zip(call, engine).await;
            assert_eq!(result.unwrap_err(), ClientError::ChannelClosed);
        });
    }
}

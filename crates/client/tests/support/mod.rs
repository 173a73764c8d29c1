//! Scripted engine for session tests.
//!
//! Wraps the reference engine on its own thread, records every request it
//! receives, and lets a test intercept requests to delay, fail or swallow
//! them.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use smol::channel;
use tidygrid_client::{Session, SessionConfig};
use tidygrid_engine::{Engine, EngineOptions, RowShape};
use tidygrid_protocol::{self as protocol, ColumnType, EngineFrame, Request, RequestFrame};

/// Ten rows; `qty` holds two whitespace-padded numbers and one `x`, `active`
/// has one `maybe`.
pub const PEOPLE: &str = "id,name,qty,active\n\
0,ann,10,true\n\
1,bob, 7,false\n\
2,cat,12,yes\n\
3,dan,x,no\n\
4,eve,15,true\n\
5,fay, 3,false\n\
6,gus,18,true\n\
7,hal,,false\n\
8,ivy,21,maybe\n\
9,jon,24,true\n";

/// What the scripted engine does with one request.
pub enum Action {
    /// Hand it to the reference engine.
    Pass,
    /// Sleep, then hand it over.
    Delay(Duration),
    /// Reject it with a fault carrying its id.
    Fault(String),
    /// Answer with a fault that carries no id.
    Unroutable(String),
    /// Never answer.
    Swallow,
}

type Behavior = Box<dyn FnMut(&Request) -> Action + Send>;

pub struct FakeEngine {
    log: Arc<Mutex<Vec<Request>>>,
    behavior: Arc<Mutex<Behavior>>,
}

impl FakeEngine {
    /// Requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<Request> {
        self.log.lock().clone()
    }

    /// Number of requests of one wire kind.
    pub fn count(&self, kind: &str) -> usize {
        self.log.lock().iter().filter(|r| r.kind() == kind).count()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    pub fn set_behavior(&self, behavior: impl FnMut(&Request) -> Action + Send + 'static) {
        *self.behavior.lock() = Box::new(behavior);
    }

    pub fn reset_behavior(&self) {
        self.set_behavior(|_| Action::Pass);
    }
}

pub fn config() -> SessionConfig {
    SessionConfig {
        call_timeout: Duration::from_secs(10),
        ready_timeout: Duration::from_secs(5),
        ..SessionConfig::default()
    }
}

/// A session wired to a scripted engine.
pub fn connect(shape: RowShape, config: SessionConfig) -> (Session, FakeEngine) {
    let (requests, request_rx) = channel::unbounded::<String>();
    let (frame_tx, frames) = channel::unbounded::<String>();
    let log = Arc::new(Mutex::new(Vec::new()));
    let initial: Behavior = Box::new(|_: &Request| Action::Pass);
    let behavior = Arc::new(Mutex::new(initial));

    let thread_log = log.clone();
    let thread_behavior = behavior.clone();
    thread::Builder::new()
        .name("fake-engine".to_string())
        .spawn(move || {
            let mut engine = Engine::new(EngineOptions { row_shape: shape });
            while let Ok(line) = request_rx.recv_blocking() {
                let frame: RequestFrame = match protocol::decode(&line) {
                    Ok(frame) => frame,
                    Err(_) => continue,
                };
                if matches!(frame.request, Request::Shutdown) {
                    break;
                }
                thread_log.lock().push(frame.request.clone());
                let action = {
                    let mut behavior = thread_behavior.lock();
                    (*behavior)(&frame.request)
                };
                let out = match action {
                    Action::Pass => engine.handle(frame),
                    Action::Delay(d) => {
                        thread::sleep(d);
                        engine.handle(frame)
                    }
                    Action::Fault(message) => vec![EngineFrame::fault(frame.id, message)],
                    Action::Unroutable(message) => vec![EngineFrame::fault(None, message)],
                    Action::Swallow => Vec::new(),
                };
                for frame in out {
                    let line = protocol::encode(&frame).unwrap();
                    if frame_tx.send_blocking(line).is_err() {
                        return;
                    }
                }
            }
        })
        .unwrap();

    let session = Session::connect(requests, frames, config);
    (session, FakeEngine { log, behavior })
}

/// Drive a session through loading and confirmation into Studio.
pub async fn studio(session: &Session, csv: &str, retype: &[(usize, ColumnType)]) {
    session.init().await.unwrap();
    session.begin_ingestion().unwrap();
    session.load_dataset(csv.as_bytes().to_vec()).await.unwrap();
    for &(col, ty) in retype {
        session.set_column_type(col, ty).unwrap();
    }
    session.confirm_schema().await.unwrap();
}

/// `PEOPLE` in Studio with `qty` typed Integer.
pub fn people_in_studio(shape: RowShape) -> (Session, FakeEngine) {
    let (session, engine) = connect(shape, config());
    smol::block_on(studio(&session, PEOPLE, &[(2, ColumnType::Integer)]));
    engine.clear_log();
    (session, engine)
}

/// CSV with `rows` rows of `n,value` where every row in `bad` holds a
/// non-integer value.
pub fn numbered_csv(rows: usize, bad: impl Fn(usize) -> bool) -> String {
    let mut csv = String::from("n,value\n");
    for i in 0..rows {
        if bad(i) {
            csv.push_str(&format!("{i},v{i}\n"));
        } else {
            csv.push_str(&format!("{i},{}\n", i * 3));
        }
    }
    csv
}

//! TidyGrid client: session orchestration over an asynchronous engine.
//!
//! A [`Session`] owns the single channel to the engine and everything the
//! UI reads synchronously: the sparse row cache, the error map, the pending
//! validation set, the data version and the current-process slot.
//!
//! ```ignore
//! let engine = tidygrid_engine::spawn_engine(Default::default())?;
//! let (requests, frames, _thread) = engine.into_parts();
//! let session = Session::connect(requests, frames, SessionConfig::default());
//!
//! smol::block_on(async {
//!     session.init().await?;
//!     session.begin_ingestion()?;
//!     session.load_dataset(bytes).await?;
//!     session.confirm_schema().await?; // full pass, then Studio
//!     session.ensure_window(0).await?;
//!     let first = session.row(0);
//!     Ok(())
//! })
//! ```

pub mod error;
pub mod events;
pub mod gateway;
pub mod mutation;
pub mod process;
pub mod row_cache;
pub mod session;
pub mod stage;
pub mod validation;

pub use error::{ClientError, Result};
pub use events::{EventRegistry, SessionEvent};
pub use gateway::EngineGateway;
pub use mutation::{FindReplaceSummary, MutationReport};
pub use process::{CurrentProcess, ProcessGuard, ProcessPhase, ProcessSlot};
pub use row_cache::{EnsureOutcome, Row, RowCache};
pub use session::{Session, SessionConfig};
pub use stage::Stage;
pub use validation::{
    ErrorMap, FullPassSummary, TargetColumn, TargetedOutcome, TargetedReport,
    ValidationOrchestrator,
};

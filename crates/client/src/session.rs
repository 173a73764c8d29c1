//! Session: the stage machine and the service object that owns the
//! gateway, row cache, validation orchestrator and process slot.
//!
//! State lives here rather than in any UI framework. Presentation code reads
//! it synchronously (`row`, `errors`, `current_process`) and subscribes to
//! [`SessionEvent`]s to learn when to re-read.
//!
//! Stages: `Schema -> Ingestion -> Processing -> Studio`. Entering
//! Processing starts the full pass; its completion is the only automatic
//! transition.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use smol::channel::{Receiver, Sender};
use tidygrid_config::Settings;
use tidygrid_protocol::{ColumnSchema, ColumnType, SuggestionReport};

use crate::error::{ClientError, Result};
use crate::events::{EventRegistry, SessionEvent};
use crate::gateway::EngineGateway;
use crate::process::{CurrentProcess, ProcessPhase, ProcessSlot};
use crate::row_cache::{EnsureOutcome, Row, RowCache};
use crate::stage::Stage;
use crate::validation::{
    ErrorMap, FullPassSummary, TargetColumn, TargetedOutcome, ValidationOrchestrator,
};

/// Tuning knobs for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub validation_chunk_size: usize,
    pub find_replace_chunk_size: usize,
    /// Revalidate every column after a find/replace that changed cells.
    pub revalidate_after_replace: bool,
    pub call_timeout: Duration,
    pub ready_timeout: Duration,
    pub fetch_window: usize,
    pub event_queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for SessionConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            validation_chunk_size: settings.validation_chunk_size.max(1),
            find_replace_chunk_size: settings.find_replace_chunk_size.max(1),
            revalidate_after_replace: settings.find_replace_revalidate,
            call_timeout: Duration::from_millis(settings.call_timeout_ms),
            ready_timeout: Duration::from_millis(settings.ready_timeout_ms),
            fetch_window: settings.fetch_window.max(1),
            event_queue_depth: settings.event_queue_depth,
        }
    }
}

const INGESTION: &[Stage] = &[Stage::Ingestion];
const CONFIRMABLE: &[Stage] = &[Stage::Ingestion, Stage::Processing];
const PROCESSING: &[Stage] = &[Stage::Processing];
const RETYPABLE: &[Stage] = &[Stage::Ingestion, Stage::Studio];
pub(crate) const STUDIO: &[Stage] = &[Stage::Studio];
const SCHEMA: &[Stage] = &[Stage::Schema];

#[derive(Default)]
pub(crate) struct SessionState {
    pub(crate) stage: Stage,
    pub(crate) schema: Vec<ColumnSchema>,
    /// Snapshot taken at schema confirmation.
    pub(crate) baseline: Vec<ColumnSchema>,
    pub(crate) row_count: usize,
    pub(crate) loaded: bool,
}

pub(crate) struct SessionInner {
    pub(crate) config: SessionConfig,
    pub(crate) gateway: Arc<EngineGateway>,
    pub(crate) cache: RowCache,
    pub(crate) validator: ValidationOrchestrator,
    pub(crate) process: ProcessSlot,
    pub(crate) events: EventRegistry,
    pub(crate) data_version: AtomicU64,
    pub(crate) state: Mutex<SessionState>,
}

/// A dataset session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl Session {
    /// Attach to an engine's channel ends. Call [`Session::init`] before
    /// any dataset operation.
    pub fn connect(requests: Sender<String>, frames: Receiver<String>, config: SessionConfig) -> Self {
        let events = EventRegistry::new(config.event_queue_depth);
        let gateway = Arc::new(EngineGateway::connect(
            requests,
            frames,
            config.call_timeout,
            events.clone(),
        ));
        let validator = ValidationOrchestrator::new(gateway.clone(), events.clone());
        let process = ProcessSlot::new(events.clone());
        Self {
            inner: Arc::new(SessionInner {
                config,
                gateway,
                cache: RowCache::new(),
                validator,
                process,
                events,
                data_version: AtomicU64::new(0),
                state: Mutex::new(SessionState::default()),
            }),
        }
    }

    /// Send `init` and wait for the engine's ready signal.
    pub async fn init(&self) -> Result<()> {
        self.inner.gateway.init(self.inner.config.ready_timeout).await
    }

    pub fn is_ready(&self) -> bool {
        self.inner.gateway.is_ready()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------------
    // Stage machine
    // ------------------------------------------------------------------------

    pub fn stage(&self) -> Stage {
        self.inner.state.lock().stage
    }

    fn advance(&self, allowed: &'static [Stage], next: Stage) -> Result<()> {
        let from = {
            let mut state = self.inner.state.lock();
            let from = state.stage;
            if !allowed.contains(&from) || !from.can_advance_to(next) {
                return Err(ClientError::InvalidStage { expected: allowed, actual: from });
            }
            state.stage = next;
            from
        };
        if from != next {
            log::info!("stage {} -> {}", from.name(), next.name());
            self.inner.events.broadcast(SessionEvent::StageChanged { from, to: next });
        }
        Ok(())
    }

    pub(crate) fn require_stage(&self, allowed: &'static [Stage]) -> Result<()> {
        let actual = self.stage();
        if allowed.contains(&actual) {
            Ok(())
        } else {
            Err(ClientError::InvalidStage { expected: allowed, actual })
        }
    }

    /// Schema -> Ingestion. No engine call.
    pub fn begin_ingestion(&self) -> Result<()> {
        self.advance(SCHEMA, Stage::Ingestion)
    }

    /// Hand the file to the engine. Returns the row count.
    pub async fn load_dataset(&self, bytes: Vec<u8>) -> Result<usize> {
        self.require_stage(INGESTION)?;
        let _guard = self.inner.process.acquire(
            CurrentProcess::new(ProcessPhase::Loading, "Loading dataset")
                .with_detail(format!("{} bytes", bytes.len())),
        );

        let (row_count, schema) = self.inner.gateway.load_dataset(bytes).await?;
        {
            let mut state = self.inner.state.lock();
            state.schema = schema;
            state.baseline.clear();
            state.row_count = row_count;
            state.loaded = true;
        }
        self.inner.cache.clear();
        self.inner.validator.reset();
        log::info!("dataset loaded: {row_count} rows");
        Ok(row_count)
    }

    /// Reassign a column's type.
    ///
    /// In Ingestion this only edits the schema. In Studio the column's errors
    /// are dropped and its pending membership follows the baseline. The
    /// row cache is untouched: raw values do not change.
    pub fn set_column_type(&self, col: usize, column_type: ColumnType) -> Result<()> {
        let pending = {
            let mut state = self.inner.state.lock();
            if !RETYPABLE.contains(&state.stage) {
                return Err(ClientError::InvalidStage { expected: RETYPABLE, actual: state.stage });
            }
            let columns = state.schema.len();
            let column = state
                .schema
                .get_mut(col)
                .ok_or(ClientError::ColumnOutOfRange { col, columns })?;
            column.column_type = column_type;
            if state.stage == Stage::Ingestion {
                return Ok(());
            }
            state.baseline.get(col).map_or(true, |base| base.column_type != column_type)
        };
        self.inner.validator.retype(col, pending);
        Ok(())
    }

    /// Ingestion -> Processing -> Studio.
    ///
    /// Snapshots the baseline, clears the error map, pushes the schema to
    /// the engine and runs the full pass. A failed pass leaves the session
    /// in Processing; calling again retries. A call made while a pass is
    /// still running fails with [`ClientError::ValidationBusy`] and changes
    /// nothing.
    pub async fn confirm_schema(&self) -> Result<FullPassSummary> {
        let (schema, row_count) = {
            let state = self.inner.state.lock();
            if !state.loaded {
                return Err(ClientError::NoDataset);
            }
            (state.schema.clone(), state.row_count)
        };
        self.require_stage(CONFIRMABLE)?;
        let latch = self.inner.validator.try_latch().ok_or(ClientError::ValidationBusy)?;
        self.advance(CONFIRMABLE, Stage::Processing)?;

        self.inner.state.lock().baseline = schema.clone();
        self.inner.validator.reset();

        let guard = self.inner.process.acquire(
            CurrentProcess::new(ProcessPhase::Validating, "Validating dataset").with_total(row_count),
        );
        self.inner.gateway.update_schema(schema).await?;
        let summary = self
            .inner
            .validator
            .run_full_pass(&latch, row_count, self.inner.config.validation_chunk_size, &guard)
            .await?;
        drop(guard);

        self.advance(PROCESSING, Stage::Studio)?;
        Ok(summary)
    }

    /// Targeted pass over every pending column.
    pub async fn run_batch_validation(&self) -> Result<TargetedOutcome> {
        self.require_stage(STUDIO)?;
        if self.inner.validator.is_busy() {
            log::warn!("validation already running; batch validation dropped");
            return Ok(TargetedOutcome::Dropped);
        }
        let pending = self.inner.validator.pending();
        let targets = pending
            .iter()
            .map(|&col| self.target(col))
            .collect::<Result<Vec<_>>>()?;

        let guard = self.inner.process.acquire(
            CurrentProcess::new(ProcessPhase::Validating, "Batch validation")
                .with_detail(format!("{} columns", targets.len())),
        );
        Ok(self.inner.validator.run_targeted(targets, Some(&guard)).await)
    }

    pub(crate) fn target(&self, col: usize) -> Result<TargetColumn> {
        let state = self.inner.state.lock();
        let columns = state.schema.len();
        let column = state.schema.get(col).ok_or(ClientError::ColumnOutOfRange { col, columns })?;
        Ok(TargetColumn {
            index: col,
            name: column.name.clone(),
            column_type: column.column_type,
        })
    }

    pub(crate) fn all_targets(&self) -> Vec<TargetColumn> {
        let state = self.inner.state.lock();
        state
            .schema
            .iter()
            .enumerate()
            .map(|(index, c)| TargetColumn {
                index,
                name: c.name.clone(),
                column_type: c.column_type,
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Rows
    // ------------------------------------------------------------------------

    /// Cached row, if present. Never fetches.
    pub fn row(&self, index: usize) -> Option<Row> {
        self.inner.cache.get(index)
    }

    /// Make sure rows `[start, start + limit)` are cached, clamped to the
    /// dataset.
    pub async fn ensure_rows(&self, start: usize, limit: usize) -> Result<EnsureOutcome> {
        let (columns, row_count) = {
            let state = self.inner.state.lock();
            if !state.loaded {
                return Err(ClientError::NoDataset);
            }
            let names: Vec<String> = state.schema.iter().map(|c| c.name.clone()).collect();
            (names, state.row_count)
        };
        let limit = limit.min(row_count.saturating_sub(start));
        let outcome = self.inner.cache.ensure(&self.inner.gateway, &columns, start, limit).await?;
        if let EnsureOutcome::Fetched { start, count } = outcome {
            self.inner.events.broadcast(SessionEvent::RowsFetched { start, count });
        }
        Ok(outcome)
    }

    /// `ensure_rows` with the configured viewport size.
    pub async fn ensure_window(&self, start: usize) -> Result<EnsureOutcome> {
        self.ensure_rows(start, self.inner.config.fetch_window).await
    }

    pub async fn suggestions(&self, col: usize) -> Result<Vec<SuggestionReport>> {
        self.target(col)?;
        self.inner.gateway.get_suggestions(col).await
    }

    // ------------------------------------------------------------------------
    // Read-only state
    // ------------------------------------------------------------------------

    pub fn schema(&self) -> Vec<ColumnSchema> {
        self.inner.state.lock().schema.clone()
    }

    pub fn baseline(&self) -> Vec<ColumnSchema> {
        self.inner.state.lock().baseline.clone()
    }

    pub fn row_count(&self) -> usize {
        self.inner.state.lock().row_count
    }

    pub fn errors(&self) -> Arc<ErrorMap> {
        self.inner.validator.errors()
    }

    pub fn pending_columns(&self) -> BTreeSet<usize> {
        self.inner.validator.pending()
    }

    pub fn data_version(&self) -> u64 {
        self.inner.data_version.load(Ordering::SeqCst)
    }

    pub fn current_process(&self) -> Option<CurrentProcess> {
        self.inner.process.current()
    }

    // ------------------------------------------------------------------------
    // Events & teardown
    // ------------------------------------------------------------------------

    pub fn subscribe(&self) -> (u64, Receiver<SessionEvent>) {
        self.inner.events.register()
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.events.unregister(id);
    }

    pub fn dropped_events(&self) -> u64 {
        self.inner.events.dropped_events_count()
    }

    /// Stop the engine and release the channel. Also happens when the last
    /// clone is dropped.
    pub fn shutdown(&self) {
        self.inner.gateway.shutdown();
    }

    /// Drop cached rows and bump the data version.
    pub(crate) fn invalidate(&self) -> u64 {
        self.inner.cache.clear();
        let version = self.inner.data_version.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.events.broadcast(SessionEvent::DataVersionChanged(version));
        version
    }
}

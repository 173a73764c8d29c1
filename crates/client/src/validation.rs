//! Validation orchestrator: the chunked full pass and the targeted pass.
//!
//! Both jobs share one latch and never overlap. The full pass merges chunk
//! results into the error map as it goes. The targeted pass stages a
//! wholesale replacement per column and publishes the whole batch in one
//! swap together with the pending-set update, so readers see either the
//! old map or the new one.
//!
//! Readers get an `Arc<ErrorMap>` snapshot; writers copy on write.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tidygrid_protocol::ColumnType;

use crate::error::{ClientError, Result};
use crate::events::{EventRegistry, SessionEvent};
use crate::gateway::EngineGateway;
use crate::process::ProcessGuard;

/// Column index -> invalid row indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorMap {
    columns: BTreeMap<usize, BTreeSet<usize>>,
}

impl ErrorMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn column(&self, col: usize) -> Option<&BTreeSet<usize>> {
        self.columns.get(&col)
    }

    pub fn is_invalid(&self, row: usize, col: usize) -> bool {
        self.columns.get(&col).is_some_and(|rows| rows.contains(&row))
    }

    /// Invalid cell count for one column.
    pub fn count(&self, col: usize) -> usize {
        self.columns.get(&col).map_or(0, BTreeSet::len)
    }

    /// Invalid cell count across all columns.
    pub fn total(&self) -> usize {
        self.columns.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &BTreeSet<usize>)> {
        self.columns.iter().map(|(col, rows)| (*col, rows))
    }

    /// Additive merge of `(row, col)` pairs; nothing is removed.
    pub fn merge_pairs(&mut self, pairs: &[(usize, usize)]) {
        for &(row, col) in pairs {
            self.columns.entry(col).or_default().insert(row);
        }
    }

    /// Wholesale replacement of one column's entry.
    pub fn replace(&mut self, col: usize, rows: BTreeSet<usize>) {
        self.columns.insert(col, rows);
    }

    pub fn clear_column(&mut self, col: usize) {
        self.columns.remove(&col);
    }

    pub fn clear(&mut self) {
        self.columns.clear();
    }
}

/// A column to revalidate, with the type to validate it against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetColumn {
    pub index: usize,
    pub name: String,
    pub column_type: ColumnType,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FullPassSummary {
    pub chunks: usize,
    pub rows_processed: usize,
    pub violations: usize,
    pub elapsed: Duration,
}

/// Result of one targeted batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetedReport {
    /// Columns whose replacement was applied.
    pub validated: Vec<usize>,
    /// Columns whose engine call failed; their entries were left alone.
    pub failed: Vec<(usize, ClientError)>,
    /// Columns whose type changed while the batch ran; results discarded.
    pub superseded: Vec<usize>,
}

impl TargetedReport {
    pub fn first_failure(&self) -> Option<&ClientError> {
        self.failed.first().map(|(_, e)| e)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TargetedOutcome {
    Completed(TargetedReport),
    /// Another validation job held the latch; nothing was sent.
    Dropped,
}

impl TargetedOutcome {
    pub fn is_dropped(&self) -> bool {
        matches!(self, TargetedOutcome::Dropped)
    }
}

#[derive(Default)]
struct ValidationState {
    errors: Arc<ErrorMap>,
    pending: BTreeSet<usize>,
    /// Columns in the running targeted batch.
    batch: BTreeSet<usize>,
    /// Batch columns retyped since the batch started.
    superseded: BTreeSet<usize>,
}

pub struct ValidationOrchestrator {
    gateway: Arc<EngineGateway>,
    state: Mutex<ValidationState>,
    busy: AtomicBool,
    events: EventRegistry,
}

/// Holds the job latch; releases it on drop.
pub(crate) struct JobLatch<'a>(&'a AtomicBool);

impl Drop for JobLatch<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ValidationOrchestrator {
    pub fn new(gateway: Arc<EngineGateway>, events: EventRegistry) -> Self {
        Self {
            gateway,
            state: Mutex::new(ValidationState::default()),
            busy: AtomicBool::new(false),
            events,
        }
    }

    pub(crate) fn try_latch(&self) -> Option<JobLatch<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| JobLatch(&self.busy))
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Current error map snapshot.
    pub fn errors(&self) -> Arc<ErrorMap> {
        self.state.lock().errors.clone()
    }

    pub fn pending(&self) -> BTreeSet<usize> {
        self.state.lock().pending.clone()
    }

    pub fn is_pending(&self, col: usize) -> bool {
        self.state.lock().pending.contains(&col)
    }

    /// Drop all errors and pending columns (schema confirmation).
    pub fn reset(&self) {
        {
            let mut state = self.state.lock();
            state.errors = Arc::new(ErrorMap::new());
            state.pending.clear();
        }
        self.events.broadcast(SessionEvent::ErrorsChanged);
        self.events.broadcast(SessionEvent::PendingChanged);
    }

    /// Record a type change: set or clear pending membership and drop the
    /// column's stale errors.
    pub fn retype(&self, col: usize, pending: bool) {
        let pending_changed = {
            let mut state = self.state.lock();
            Arc::make_mut(&mut state.errors).clear_column(col);
            if state.batch.contains(&col) {
                state.superseded.insert(col);
            }
            if pending {
                state.pending.insert(col)
            } else {
                state.pending.remove(&col)
            }
        };
        self.events.broadcast(SessionEvent::ErrorsChanged);
        if pending_changed {
            self.events.broadcast(SessionEvent::PendingChanged);
        }
    }

    /// Validate `[0, row_count)` chunk by chunk.
    ///
    /// The caller holds the latch across the error-map reset and the pass.
    /// Chunk N+1 is dispatched only after chunk N was merged, with a yield
    /// in between. A failed chunk ends the pass with its error.
    pub(crate) async fn run_full_pass(
        &self,
        _latch: &JobLatch<'_>,
        row_count: usize,
        chunk_size: usize,
        guard: &ProcessGuard,
    ) -> Result<FullPassSummary> {
        let chunk_size = chunk_size.max(1);
        let started = Instant::now();
        let mut summary = FullPassSummary {
            chunks: 0,
            rows_processed: 0,
            violations: 0,
            elapsed: Duration::ZERO,
        };

        while summary.rows_processed < row_count {
            let start = summary.rows_processed;
            let count = chunk_size.min(row_count - start);
            let pairs = match self.gateway.validate_chunk(start, count, row_count).await {
                Ok(pairs) => pairs,
                Err(e) => {
                    log::error!("validation chunk {}..{} failed: {e}", start, start + count);
                    return Err(e);
                }
            };

            summary.violations += pairs.len();
            if !pairs.is_empty() {
                Arc::make_mut(&mut self.state.lock().errors).merge_pairs(&pairs);
                self.events.broadcast(SessionEvent::ErrorsChanged);
            }
            summary.chunks += 1;
            summary.rows_processed = start + count;
            guard.progress(summary.rows_processed, row_count, started);

            smol::future::yield_now().await;
        }

        summary.elapsed = started.elapsed();
        log::info!(
            "full validation pass: {} rows in {} chunks, {} violations ({:?})",
            summary.rows_processed,
            summary.chunks,
            summary.violations,
            summary.elapsed
        );
        self.events.broadcast(SessionEvent::ValidationCompleted {
            rows_processed: summary.rows_processed,
        });
        Ok(summary)
    }

    /// Revalidate `columns` one at a time and apply the batch atomically.
    ///
    /// Returns [`TargetedOutcome::Dropped`] without contacting the engine if
    /// another validation job is running.
    pub async fn run_targeted(
        &self,
        columns: Vec<TargetColumn>,
        guard: Option<&ProcessGuard>,
    ) -> TargetedOutcome {
        let Some(_latch) = self.try_latch() else {
            let indices: Vec<usize> = columns.iter().map(|c| c.index).collect();
            log::warn!("validation already running; dropping targeted request for {indices:?}");
            return TargetedOutcome::Dropped;
        };

        {
            let mut state = self.state.lock();
            state.batch = columns.iter().map(|c| c.index).collect();
            state.superseded.clear();
        }

        let mut staged = Vec::with_capacity(columns.len());
        let mut report = TargetedReport::default();
        for column in &columns {
            if let Some(guard) = guard {
                guard.set_detail(format!("Validating {}", column.name));
            }
            match self.gateway.validate_column(column.index, column.column_type).await {
                Ok(rows) => staged.push((column.index, rows.into_iter().collect::<BTreeSet<_>>())),
                Err(e) => {
                    log::warn!("revalidating column '{}' failed: {e}", column.name);
                    report.failed.push((column.index, e));
                }
            }
        }

        let pending_changed = {
            let mut state = self.state.lock();
            let superseded = std::mem::take(&mut state.superseded);
            state.batch.clear();

            let mut pending_changed = false;
            let errors = Arc::make_mut(&mut state.errors);
            let mut applied = Vec::with_capacity(staged.len());
            for (col, rows) in staged {
                if superseded.contains(&col) {
                    report.superseded.push(col);
                    continue;
                }
                errors.replace(col, rows);
                applied.push(col);
            }
            for col in &applied {
                pending_changed |= state.pending.remove(col);
            }
            report.validated = applied;
            pending_changed
        };

        self.events.broadcast(SessionEvent::ErrorsChanged);
        if pending_changed {
            self.events.broadcast(SessionEvent::PendingChanged);
        }
        TargetedOutcome::Completed(report)
    }
}

//! Mutation & invalidation: every operation that changes cell content.
//!
//! Single-column operations run: acquire the process slot, call the engine,
//! revalidate the column, clear the row cache and bump the data version,
//! release the slot. Once the engine has accepted a mutation the cache is
//! always cleared, even if revalidation then fails, so cached rows never
//! outlive the content they were read from.

use std::time::Instant;

use tidygrid_protocol::{CorrectionStrategy, Suggestion};

use crate::error::{ClientError, Result};
use crate::process::{CurrentProcess, ProcessGuard, ProcessPhase};
use crate::session::{Session, STUDIO};
use crate::validation::{TargetColumn, TargetedOutcome};

/// Outcome of a single-column mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationReport {
    /// Cells the engine changed.
    pub changed: usize,
    /// False when another validation job held the latch and the column
    /// stays pending.
    pub revalidated: bool,
    /// Data version after the mutation.
    pub data_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindReplaceSummary {
    pub replaced: usize,
    pub chunks: usize,
    pub revalidated: bool,
    pub data_version: u64,
}

impl Session {
    /// Apply a column-wide correction.
    pub async fn apply_correction(&self, col: usize, strategy: CorrectionStrategy) -> Result<MutationReport> {
        let target = self.studio_target(col)?;
        let guard = self.acquire_fix("Applying correction", &target);
        let changed = self.inner.gateway.apply_correction(col, strategy).await?;
        self.settle(vec![target], changed, &guard).await
    }

    /// Apply one of the engine's suggestions to a column.
    pub async fn apply_suggestion(&self, col: usize, suggestion: Suggestion) -> Result<MutationReport> {
        let target = self.studio_target(col)?;
        let guard = self.acquire_fix("Applying suggestion", &target);
        let changed = self.inner.gateway.apply_suggestion(col, suggestion).await?;
        self.settle(vec![target], changed, &guard).await
    }

    /// Edit one cell.
    pub async fn update_cell(&self, row: usize, col: usize, value: impl Into<String>) -> Result<MutationReport> {
        let target = self.studio_target(col)?;
        let rows = self.row_count();
        if row >= rows {
            return Err(ClientError::RowOutOfRange { row, rows });
        }
        let guard = self.acquire_fix("Editing cell", &target);
        self.inner.gateway.update_cell(row, col, value.into()).await?;
        self.settle(vec![target], 1, &guard).await
    }

    /// Plain-substring replace across the whole dataset, chunk by chunk.
    ///
    /// Not cancellable once started. If a chunk fails after earlier chunks
    /// changed cells, the cache is still invalidated before the error is
    /// returned.
    pub async fn find_replace_all(&self, find: &str, replace: &str) -> Result<FindReplaceSummary> {
        self.require_stage(STUDIO)?;
        let total = self.row_count();
        let chunk_size = self.inner.config.find_replace_chunk_size;
        let guard = self.inner.process.acquire(
            CurrentProcess::new(ProcessPhase::FindReplace, "Find & replace")
                .with_detail(format!("'{find}' -> '{replace}'"))
                .with_total(total),
        );

        let started = Instant::now();
        let mut replaced = 0;
        let mut chunks = 0;
        let mut done = 0;
        while done < total {
            let count = chunk_size.min(total - done);
            match self.inner.gateway.find_replace_range(done, count, find, replace, total).await {
                Ok(n) => replaced += n,
                Err(e) => {
                    log::error!("find/replace chunk {}..{} failed: {e}", done, done + count);
                    if chunks > 0 {
                        self.invalidate();
                    }
                    return Err(e);
                }
            }
            chunks += 1;
            done += count;
            guard.progress(done, total, started);
            smol::future::yield_now().await;
        }
        log::info!("find/replace changed {replaced} cells in {chunks} chunks");

        let data_version = self.invalidate();
        let mut revalidated = false;
        if replaced > 0 && self.inner.config.revalidate_after_replace {
            guard.set_label("Revalidating");
            match self.inner.validator.run_targeted(self.all_targets(), Some(&guard)).await {
                TargetedOutcome::Dropped => {}
                TargetedOutcome::Completed(report) => {
                    if let Some(e) = report.first_failure() {
                        return Err(e.clone());
                    }
                    revalidated = true;
                }
            }
        }

        Ok(FindReplaceSummary { replaced, chunks, revalidated, data_version })
    }

    fn studio_target(&self, col: usize) -> Result<TargetColumn> {
        self.require_stage(STUDIO)?;
        self.target(col)
    }

    fn acquire_fix(&self, label: &str, target: &TargetColumn) -> ProcessGuard {
        self.inner.process.acquire(
            CurrentProcess::new(ProcessPhase::ApplyingFix, label).with_detail(target.name.clone()),
        )
    }

    /// Revalidate the touched columns, then invalidate cached rows.
    async fn settle(
        &self,
        targets: Vec<TargetColumn>,
        changed: usize,
        guard: &ProcessGuard,
    ) -> Result<MutationReport> {
        let outcome = self.inner.validator.run_targeted(targets, Some(guard)).await;
        let data_version = self.invalidate();
        let revalidated = match outcome {
            TargetedOutcome::Dropped => false,
            TargetedOutcome::Completed(report) => match report.first_failure() {
                Some(e) => return Err(e.clone()),
                None => report.superseded.is_empty(),
            },
        };
        Ok(MutationReport { changed, revalidated, data_version })
    }
}

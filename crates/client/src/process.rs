//! The current-process slot: a single descriptor of the foreground operation.
//!
//! Acquisition is scoped. [`ProcessSlot::acquire`] hands out a
//! [`ProcessGuard`]; dropping the guard releases it on success, error and
//! cancellation alike. Holders stack: the newest one is shown, and when it
//! releases, the job it covered is shown again until that one ends too.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::events::{EventRegistry, SessionEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessPhase {
    Loading,
    Validating,
    ApplyingFix,
    FindReplace,
}

impl ProcessPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessPhase::Loading => "loading",
            ProcessPhase::Validating => "validating",
            ProcessPhase::ApplyingFix => "applying_fix",
            ProcessPhase::FindReplace => "find_replace",
        }
    }
}

/// What the UI shows while a long operation runs.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentProcess {
    pub phase: ProcessPhase,
    pub label: String,
    pub rows_processed: Option<usize>,
    pub total_rows: Option<usize>,
    pub rows_per_sec: Option<f64>,
    pub detail: Option<String>,
}

impl CurrentProcess {
    pub fn new(phase: ProcessPhase, label: impl Into<String>) -> Self {
        Self {
            phase,
            label: label.into(),
            rows_processed: None,
            total_rows: None,
            rows_per_sec: None,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_total(mut self, total_rows: usize) -> Self {
        self.total_rows = Some(total_rows);
        self.rows_processed = Some(0);
        self
    }
}

struct SlotInner {
    /// Live holders, oldest first. The last one is shown.
    holders: Vec<(u64, CurrentProcess)>,
    next_token: u64,
}

impl SlotInner {
    fn shown(&self) -> Option<CurrentProcess> {
        self.holders.last().map(|(_, process)| process.clone())
    }
}

#[derive(Clone)]
pub struct ProcessSlot {
    inner: Arc<Mutex<SlotInner>>,
    events: EventRegistry,
}

impl ProcessSlot {
    pub fn new(events: EventRegistry) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SlotInner {
                holders: Vec::new(),
                next_token: 1,
            })),
            events,
        }
    }

    /// Show `process` on top of whatever is running.
    pub fn acquire(&self, process: CurrentProcess) -> ProcessGuard {
        let token = {
            let mut inner = self.inner.lock();
            let token = inner.next_token;
            inner.next_token += 1;
            if let Some((_, below)) = inner.holders.last() {
                log::debug!("process '{}' shown over '{}'", process.label, below.label);
            }
            inner.holders.push((token, process.clone()));
            token
        };
        self.events.broadcast(SessionEvent::ProcessChanged(Some(process)));
        ProcessGuard { slot: self.clone(), token }
    }

    pub fn current(&self) -> Option<CurrentProcess> {
        self.inner.lock().shown()
    }

    /// Edit the holder's descriptor. Only the shown one is broadcast.
    fn update(&self, token: u64, f: impl FnOnce(&mut CurrentProcess)) {
        let snapshot = {
            let mut inner = self.inner.lock();
            let top = inner.holders.len().checked_sub(1);
            let Some(pos) = inner.holders.iter().position(|(t, _)| *t == token) else {
                return;
            };
            let process = &mut inner.holders[pos].1;
            f(process);
            if Some(pos) != top {
                return;
            }
            process.clone()
        };
        self.events.broadcast(SessionEvent::ProcessChanged(Some(snapshot)));
    }

    fn release(&self, token: u64) {
        let shown = {
            let mut inner = self.inner.lock();
            let Some(pos) = inner.holders.iter().position(|(t, _)| *t == token) else {
                return;
            };
            let was_top = pos + 1 == inner.holders.len();
            inner.holders.remove(pos);
            if !was_top {
                return;
            }
            inner.shown()
        };
        self.events.broadcast(SessionEvent::ProcessChanged(shown));
    }
}

/// Scoped ownership of the process slot. Releases on drop.
pub struct ProcessGuard {
    slot: ProcessSlot,
    token: u64,
}

impl ProcessGuard {
    /// Record chunk progress and derive throughput from `started`.
    pub fn progress(&self, rows_processed: usize, total_rows: usize, started: Instant) {
        let secs = started.elapsed().as_secs_f64();
        let rate = (secs > 0.0).then(|| rows_processed as f64 / secs);
        self.slot.update(self.token, |p| {
            p.rows_processed = Some(rows_processed);
            p.total_rows = Some(total_rows);
            p.rows_per_sec = rate;
        });
    }

    pub fn set_detail(&self, detail: impl Into<String>) {
        let detail = detail.into();
        self.slot.update(self.token, |p| p.detail = Some(detail));
    }

    pub fn set_label(&self, label: impl Into<String>) {
        let label = label.into();
        self.slot.update(self.token, |p| p.label = label);
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        self.slot.release(self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> ProcessSlot {
        ProcessSlot::new(EventRegistry::default())
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let slot = slot();
        {
            let _guard = slot.acquire(CurrentProcess::new(ProcessPhase::Loading, "Loading"));
            assert_eq!(slot.current().map(|p| p.phase), Some(ProcessPhase::Loading));
        }
        assert!(slot.current().is_none());
    }

    #[test]
    fn test_guard_releases_on_error_path() {
        fn failing(slot: &ProcessSlot) -> Result<(), &'static str> {
            let _guard = slot.acquire(CurrentProcess::new(ProcessPhase::ApplyingFix, "Fixing"));
            Err("engine fault")
        }
        let slot = slot();
        assert!(failing(&slot).is_err());
        assert!(slot.current().is_none());
    }

    #[test]
    fn test_release_shows_the_job_underneath() {
        let slot = slot();
        let batch = slot.acquire(CurrentProcess::new(ProcessPhase::Validating, "Batch"));
        let fix = slot.acquire(CurrentProcess::new(ProcessPhase::ApplyingFix, "Fix"));
        assert_eq!(slot.current().map(|p| p.phase), Some(ProcessPhase::ApplyingFix));

        batch.set_detail("Validating qty");
        assert_eq!(slot.current().unwrap().detail, None);

        drop(fix);
        let current = slot.current().unwrap();
        assert_eq!(current.label, "Batch");
        assert_eq!(current.detail.as_deref(), Some("Validating qty"));

        drop(batch);
        assert!(slot.current().is_none());
    }

    #[test]
    fn test_older_holder_released_first() {
        let events = EventRegistry::default();
        let slot = ProcessSlot::new(events.clone());
        let batch = slot.acquire(CurrentProcess::new(ProcessPhase::Validating, "Batch"));
        let fix = slot.acquire(CurrentProcess::new(ProcessPhase::ApplyingFix, "Fix"));
        let (_id, rx) = events.register();

        drop(batch);
        assert_eq!(slot.current().map(|p| p.label), Some("Fix".to_string()));
        assert!(rx.try_recv().is_err());

        drop(fix);
        assert!(slot.current().is_none());
        assert_eq!(rx.try_recv(), Ok(SessionEvent::ProcessChanged(None)));
    }

    #[test]
    fn test_progress_updates_counts() {
        let slot = slot();
        let guard = slot.acquire(CurrentProcess::new(ProcessPhase::Validating, "Validating").with_total(100));
        guard.progress(50, 100, Instant::now());
        let current = slot.current().unwrap();
        assert_eq!(current.rows_processed, Some(50));
        assert_eq!(current.total_rows, Some(100));
    }

    #[test]
    fn test_events_published() {
        let events = EventRegistry::default();
        let (_id, rx) = events.register();
        let slot = ProcessSlot::new(events);
        drop(slot.acquire(CurrentProcess::new(ProcessPhase::Loading, "Loading")));

        assert!(matches!(rx.try_recv(), Ok(SessionEvent::ProcessChanged(Some(_)))));
        assert_eq!(rx.try_recv(), Ok(SessionEvent::ProcessChanged(None)));
    }
}

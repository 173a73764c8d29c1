//! Sparse row cache with range-coalescing fetch.
//!
//! `get` never fetches. `ensure` finds the rows missing from a window and
//! asks the engine for one span covering the lowest through the highest
//! missing index, refetching any cached rows in between. A fetch that was
//! started before a `clear` is discarded when it lands, so the cache never
//! holds rows older than the last invalidation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tidygrid_protocol::RowsPayload;

use crate::error::Result;
use crate::gateway::EngineGateway;

/// One row, column-aligned with the session schema.
pub type Row = Arc<[String]>;

/// What an `ensure` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Every row in the window was already present.
    AlreadyCached,
    /// Rows `start..start + count` were fetched and stored.
    Fetched { start: usize, count: usize },
    /// A fetch from the same start offset is already in flight.
    Suppressed,
    /// The cache was cleared while the fetch was outstanding; rows dropped.
    Discarded,
}

#[derive(Default)]
struct CacheState {
    rows: HashMap<usize, Row>,
    /// Fetch start offset -> generation it was issued in.
    in_flight: HashMap<usize, u64>,
    generation: u64,
}

#[derive(Default)]
pub struct RowCache {
    state: Mutex<CacheState>,
}

impl RowCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached row at `index`, if present.
    pub fn get(&self, index: usize) -> Option<Row> {
        self.state.lock().rows.get(&index).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached row and orphan in-flight fetches.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.rows.clear();
        state.in_flight.clear();
        state.generation += 1;
    }

    /// The single span `(first, count)` that covers every missing row in
    /// `[start, start + limit)`, or `None` if nothing is missing.
    pub fn missing_span(&self, start: usize, limit: usize) -> Option<(usize, usize)> {
        let state = self.state.lock();
        missing_span(&state.rows, start, limit)
    }

    /// Make sure rows `[start, start + limit)` are cached.
    ///
    /// `columns` is the current schema's column-name list; returned rows are
    /// normalized against it. On failure the rows stay absent.
    pub async fn ensure(
        &self,
        gateway: &EngineGateway,
        columns: &[String],
        start: usize,
        limit: usize,
    ) -> Result<EnsureOutcome> {
        let (first, count, generation) = {
            let mut state = self.state.lock();
            let Some((first, count)) = missing_span(&state.rows, start, limit) else {
                return Ok(EnsureOutcome::AlreadyCached);
            };
            if state.in_flight.contains_key(&first) {
                return Ok(EnsureOutcome::Suppressed);
            }
            let generation = state.generation;
            state.in_flight.insert(first, generation);
            (first, count, generation)
        };
        let _in_flight = InFlight { cache: self, start: first, generation };

        let payload = gateway.get_rows(first, count).await?;
        let rows = normalize(payload, columns);

        let mut state = self.state.lock();
        if state.generation != generation {
            log::debug!("discarding rows {first}+{count} fetched before cache clear");
            return Ok(EnsureOutcome::Discarded);
        }
        let fetched = rows.len();
        for (offset, row) in rows.into_iter().enumerate() {
            state.rows.insert(first + offset, row);
        }
        Ok(EnsureOutcome::Fetched { start: first, count: fetched })
    }
}

/// Releases an in-flight marker, unless a clear already orphaned it.
struct InFlight<'a> {
    cache: &'a RowCache,
    start: usize,
    generation: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.cache.state.lock();
        if state.in_flight.get(&self.start) == Some(&self.generation) {
            state.in_flight.remove(&self.start);
        }
    }
}

fn missing_span(rows: &HashMap<usize, Row>, start: usize, limit: usize) -> Option<(usize, usize)> {
    let end = start.saturating_add(limit);
    let mut missing = (start..end).filter(|i| !rows.contains_key(i));
    let first = missing.next()?;
    let last = missing.last().unwrap_or(first);
    Some((first, last - first + 1))
}

/// Align engine rows with `columns`.
///
/// Positional rows are padded or truncated to the column count; keyed rows
/// are looked up by column name, defaulting to an empty string.
pub fn normalize(payload: RowsPayload, columns: &[String]) -> Vec<Row> {
    match payload {
        RowsPayload::Positional { rows } => rows
            .into_iter()
            .map(|mut row| {
                row.resize(columns.len(), String::new());
                Row::from(row)
            })
            .collect(),
        RowsPayload::Keyed { rows } => rows
            .into_iter()
            .map(|mut fields| {
                let row: Vec<String> = columns
                    .iter()
                    .map(|name| fields.remove(name).unwrap_or_default())
                    .collect();
                Row::from(row)
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn seed(cache: &RowCache, indices: &[usize]) {
        let mut state = cache.state.lock();
        for &i in indices {
            state.rows.insert(i, Row::from(vec![i.to_string()]));
        }
    }

    #[test]
    fn test_missing_span_covers_lowest_to_highest_gap() {
        let cache = RowCache::new();
        seed(&cache, &[0, 1, 4, 5, 9]);
        // Missing in [0,10): 2,3,6,7,8 -> one span 2..=8, refetching 4 and 5.
        assert_eq!(cache.missing_span(0, 10), Some((2, 7)));
    }

    #[test]
    fn test_missing_span_none_when_window_cached() {
        let cache = RowCache::new();
        seed(&cache, &[3, 4, 5]);
        assert_eq!(cache.missing_span(3, 3), None);
        assert_eq!(cache.missing_span(3, 0), None);
    }

    #[test]
    fn test_clear_drops_everything() {
        let cache = RowCache::new();
        seed(&cache, &[1, 2]);
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get(1).is_none());
    }

    #[test]
    fn test_normalize_positional_pads_and_truncates() {
        let payload = RowsPayload::Positional {
            rows: vec![vec!["a".into()], vec!["x".into(), "y".into(), "z".into()]],
        };
        let rows = normalize(payload, &cols(&["one", "two"]));
        assert_eq!(&*rows[0], &["a".to_string(), String::new()]);
        assert_eq!(&*rows[1], &["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn test_normalize_keyed_uses_schema_order() {
        let mut fields = BTreeMap::new();
        fields.insert("email".to_string(), "a@b.co".to_string());
        fields.insert("id".to_string(), "7".to_string());
        fields.insert("stray".to_string(), "ignored".to_string());
        let rows = normalize(RowsPayload::Keyed { rows: vec![fields] }, &cols(&["id", "name", "email"]));
        assert_eq!(&*rows[0], &["7".to_string(), String::new(), "a@b.co".to_string()]);
    }

    #[test]
    fn test_in_flight_marker_survives_only_its_generation() {
        let cache = RowCache::new();
        cache.state.lock().in_flight.insert(0, 0);
        let stale = InFlight { cache: &cache, start: 0, generation: 0 };
        cache.clear();
        cache.state.lock().in_flight.insert(0, 1);
        drop(stale);
        assert_eq!(cache.state.lock().in_flight.get(&0), Some(&1));
    }

    mod fetch {
        use super::*;
        use crate::events::EventRegistry;
        use smol::channel::{self, Receiver, Sender};
        use std::time::Duration;
        use tidygrid_protocol::{self as protocol, EngineFrame, EngineMessage, Reply, RequestFrame};

        async fn ready_gateway() -> (EngineGateway, Receiver<String>, Sender<String>) {
            let (requests, engine_rx) = channel::unbounded();
            let (engine_tx, frames) = channel::unbounded();
            let gateway =
                EngineGateway::connect(requests, frames, Duration::from_secs(5), EventRegistry::default());
            engine_tx
                .try_send(protocol::encode(&EngineFrame::new(EngineMessage::Ready)).unwrap())
                .unwrap();
            gateway.init(Duration::from_secs(5)).await.unwrap();
            (gateway, engine_rx, engine_tx)
        }

        /// Next correlated request, skipping signals like `init`.
        async fn next_call(rx: &Receiver<String>) -> RequestFrame {
            loop {
                let frame: RequestFrame = protocol::decode(&rx.recv().await.unwrap()).unwrap();
                if frame.id.is_some() {
                    return frame;
                }
            }
        }

        fn reply_rows(tx: &Sender<String>, frame: &RequestFrame, rows: Vec<Vec<String>>) {
            let reply = Reply::Rows { rows: RowsPayload::Positional { rows } };
            tx.try_send(protocol::encode(&EngineFrame::reply(frame.id.unwrap(), reply)).unwrap())
                .unwrap();
        }

        #[test]
        fn test_fetch_landing_after_clear_is_discarded() {
            smol::block_on(async {
                let (gateway, engine_rx, engine_tx) = ready_gateway().await;
                let cache = RowCache::new();
                let columns = cols(&["a"]);
                let engine = async {
                    let frame = next_call(&engine_rx).await;
                    cache.clear();
                    reply_rows(&engine_tx, &frame, vec![vec!["stale".into()]]);
                };
                let (outcome, ()) =
                    smol::future::zip(cache.ensure(&gateway, &columns, 0, 1), engine).await;
                assert_eq!(outcome.unwrap(), EnsureOutcome::Discarded);
                assert!(cache.is_empty());
                assert!(cache.state.lock().in_flight.is_empty());
            });
        }

        #[test]
        fn test_duplicate_fetch_is_suppressed() {
            smol::block_on(async {
                let (gateway, engine_rx, engine_tx) = ready_gateway().await;
                let cache = RowCache::new();
                let columns = cols(&["a"]);
                let engine = async {
                    let frame = next_call(&engine_rx).await;
                    reply_rows(&engine_tx, &frame, vec![vec!["r0".into()], vec!["r1".into()]]);
                };
                let ((first, second), ()) = smol::future::zip(
                    smol::future::zip(
                        cache.ensure(&gateway, &columns, 0, 2),
                        cache.ensure(&gateway, &columns, 0, 2),
                    ),
                    engine,
                )
                .await;
                assert_eq!(first.unwrap(), EnsureOutcome::Fetched { start: 0, count: 2 });
                assert_eq!(second.unwrap(), EnsureOutcome::Suppressed);
                assert_eq!(cache.get(1).map(|r| r[0].clone()), Some("r1".to_string()));
                assert!(engine_rx.try_recv().is_err());
            });
        }

        #[test]
        fn test_failed_fetch_leaves_rows_absent() {
            smol::block_on(async {
                let (gateway, engine_rx, engine_tx) = ready_gateway().await;
                let cache = RowCache::new();
                let columns = cols(&["a"]);
                let engine = async {
                    let frame = next_call(&engine_rx).await;
                    engine_tx
                        .try_send(protocol::encode(&EngineFrame::fault(frame.id, "boom")).unwrap())
                        .unwrap();
                };
                let (outcome, ()) =
                    smol::future::zip(cache.ensure(&gateway, &columns, 3, 2), engine).await;
                assert!(outcome.is_err());
                assert!(cache.get(3).is_none());
                assert_eq!(cache.missing_span(3, 2), Some((3, 2)));
                assert!(cache.state.lock().in_flight.is_empty());
            });
        }
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_span_covers_every_missing_row(
                cached in proptest::collection::btree_set(0usize..64, 0..64),
                start in 0usize..64,
                limit in 0usize..64,
            ) {
                let cache = RowCache::new();
                let indices: Vec<usize> = cached.iter().copied().collect();
                seed(&cache, &indices);
                let missing: Vec<usize> = (start..start + limit).filter(|i| !cached.contains(i)).collect();
                match cache.missing_span(start, limit) {
                    None => prop_assert!(missing.is_empty()),
                    Some((first, count)) => {
                        prop_assert_eq!(first, missing[0]);
                        prop_assert_eq!(first + count - 1, *missing.last().unwrap());
                        prop_assert!(first >= start && first + count <= start + limit);
                    }
                }
            }
        }
    }
}

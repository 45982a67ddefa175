//! Polling log watcher.
//!
//! Each poll reads the chain height, fetches logs for `[from, height]`, filters
//! them in memory and moves `from` past `height`. Transient chain errors are
//! logged and retried on the next cycle without moving `from`.

use crate::chain::{ChainClient, ChainEvent, EventKind};
use crate::error::{MixerError, MixerResult};
use alloy::primitives::U256;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Event kind plus exact-equality constraints on decoded fields.
#[derive(Debug, Clone)]
pub struct EventFilter {
    pub kind: EventKind,
    pub equals: Vec<(&'static str, U256)>,
}

impl EventFilter {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            equals: Vec::new(),
        }
    }

    pub fn field_eq(mut self, name: &'static str, value: U256) -> Self {
        self.equals.push((name, value));
        self
    }

    pub fn matches(&self, ev: &ChainEvent) -> bool {
        ev.kind == self.kind
            && self
                .equals
                .iter()
                .all(|(name, want)| ev.field(name) == Some(want))
    }
}

/// Matching events found in one poll over `[from_block, to_block]`.
#[derive(Debug, Clone)]
pub struct ScanBatch {
    pub from_block: u64,
    pub to_block: u64,
    pub events: Vec<ChainEvent>,
}

pub struct EventWatcher {
    chain: Arc<dyn ChainClient>,
    poll_interval: Duration,
}

impl EventWatcher {
    pub fn new(chain: Arc<dyn ChainClient>, poll_interval: Duration) -> Self {
        Self {
            chain,
            poll_interval,
        }
    }

    pub fn chain(&self) -> &Arc<dyn ChainClient> {
        &self.chain
    }

    /// Single poll. `None` when the chain has not reached `from_block` yet.
    pub async fn poll(
        &self,
        filter: &EventFilter,
        from_block: u64,
    ) -> MixerResult<Option<ScanBatch>> {
        let height = self.chain.block_number().await?;
        if from_block > height {
            return Ok(None);
        }
        let logs = self.chain.get_logs(filter.kind, from_block, height).await?;
        let events = logs.into_iter().filter(|ev| filter.matches(ev)).collect();
        Ok(Some(ScanBatch {
            from_block,
            to_block: height,
            events,
        }))
    }

    /// Non-polling lookup: first match in `[from_block, height]` or `NotFound`.
    pub async fn scan_once(&self, filter: &EventFilter, from_block: u64) -> MixerResult<ChainEvent> {
        self.poll(filter, from_block)
            .await?
            .and_then(|b| b.events.into_iter().next())
            .ok_or(MixerError::NotFound)
    }

    /// Poll until the first matching event shows up. Returns `Cancelled` once
    /// `keep_watching` turns false (checked once per cycle).
    pub async fn watch_once<F>(
        &self,
        filter: &EventFilter,
        from_block: u64,
        keep_watching: F,
    ) -> MixerResult<ChainEvent>
    where
        F: Fn() -> bool,
    {
        let mut from = from_block;
        loop {
            if !keep_watching() {
                return Err(MixerError::Cancelled);
            }
            match self.poll(filter, from).await {
                Ok(Some(batch)) => {
                    if let Some(ev) = batch.events.into_iter().next() {
                        return Ok(ev);
                    }
                    from = batch.to_block + 1;
                }
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    crate::metrics::inc_chain_poll_errors();
                    warn!(kind = ?filter.kind, from, "event poll failed, retrying: {e}");
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Poll while `predicate` holds, handing every non-empty batch to
    /// `on_batch`. Returns the next unscanned block once the predicate fails.
    pub async fn watch_while<P, S, Fut>(
        &self,
        filter: &EventFilter,
        from_block: u64,
        predicate: P,
        mut on_batch: S,
    ) -> MixerResult<u64>
    where
        P: Fn() -> bool,
        S: FnMut(ScanBatch) -> Fut,
        Fut: Future<Output = MixerResult<()>>,
    {
        let mut from = from_block;
        loop {
            if !predicate() {
                debug!(kind = ?filter.kind, from, "watch stopped");
                return Ok(from);
            }
            match self.poll(filter, from).await {
                Ok(Some(batch)) => {
                    let next = batch.to_block + 1;
                    if !batch.events.is_empty() {
                        on_batch(batch).await?;
                    }
                    from = next;
                }
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    crate::metrics::inc_chain_poll_errors();
                    warn!(kind = ?filter.kind, from, "event poll failed, retrying: {e}");
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeChain;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn watcher(chain: &Arc<FakeChain>) -> EventWatcher {
        EventWatcher::new(chain.clone(), Duration::from_millis(1))
    }

    #[tokio::test]
    async fn watch_once_returns_first_match_and_filters_fields() {
        let chain = Arc::new(FakeChain::new(120));
        chain.push_leaf(101, U256::from(5u64), 3);
        chain.push_leaf(105, U256::from(42u64), 7);
        chain.push_leaf(110, U256::from(42u64), 9);

        let f = EventFilter::new(EventKind::LeafAdded).field_eq("_leaf", U256::from(42u64));
        let ev = watcher(&chain).watch_once(&f, 100, || true).await.unwrap();
        assert_eq!(ev.block_number, 105);
        assert_eq!(ev.field("_leafIndex"), Some(&U256::from(7u64)));
    }

    #[tokio::test]
    async fn scan_once_miss_is_not_found() {
        let chain = Arc::new(FakeChain::new(50));
        chain.push_leaf(10, U256::from(1u64), 0);
        let f = EventFilter::new(EventKind::LeafAdded).field_eq("_leaf", U256::from(2u64));
        let err = watcher(&chain).scan_once(&f, 0).await.unwrap_err();
        assert!(matches!(err, MixerError::NotFound));

        // from past the head: nothing scanned, still a miss
        let err = watcher(&chain).scan_once(&f, 51).await.unwrap_err();
        assert!(matches!(err, MixerError::NotFound));
    }

    #[tokio::test]
    async fn watch_once_cancels_when_predicate_turns_false() {
        let chain = Arc::new(FakeChain::new(10));
        chain.advance_per_poll(1);
        let polls = AtomicUsize::new(0);
        let f = EventFilter::new(EventKind::LeafAdded);
        let err = watcher(&chain)
            .watch_once(&f, 0, || polls.fetch_add(1, Ordering::SeqCst) < 3)
            .await
            .unwrap_err();
        assert!(matches!(err, MixerError::Cancelled));
    }

    #[tokio::test]
    async fn transient_errors_do_not_advance_from_block() {
        let chain = Arc::new(FakeChain::new(20));
        chain.fail_next_polls(2);
        chain.push_leaf(20, U256::from(8u64), 1);
        let f = EventFilter::new(EventKind::LeafAdded);
        let ev = watcher(&chain).watch_once(&f, 20, || true).await.unwrap();
        assert_eq!(ev.block_number, 20);
        assert_eq!(chain.log_ranges(), vec![(20, 20)]);
    }

    #[tokio::test]
    async fn watch_while_ranges_are_contiguous_and_disjoint() {
        let chain = Arc::new(FakeChain::new(100));
        chain.advance_per_poll(3);
        chain.push_leaf(101, U256::from(1u64), 1);
        chain.push_leaf(108, U256::from(2u64), 2);

        let keep = AtomicBool::new(true);
        let batches = Mutex::new(Vec::new());
        let f = EventFilter::new(EventKind::LeafAdded);
        let polls = AtomicUsize::new(0);
        let next = watcher(&chain)
            .watch_while(
                &f,
                100,
                || polls.fetch_add(1, Ordering::SeqCst) < 6 && keep.load(Ordering::SeqCst),
                |b: ScanBatch| {
                    batches
                        .lock()
                        .unwrap()
                        .push((b.from_block, b.to_block, b.events.len()));
                    async { Ok(()) }
                },
            )
            .await
            .unwrap();

        let ranges = chain.log_ranges();
        assert!(!ranges.is_empty());
        assert_eq!(ranges[0].0, 100);
        for w in ranges.windows(2) {
            assert_eq!(w[1].0, w[0].1 + 1);
        }
        assert_eq!(next, ranges.last().unwrap().1 + 1);

        // only non-empty polls are emitted, each event exactly once
        let emitted = batches.lock().unwrap().clone();
        assert_eq!(emitted.iter().map(|b| b.2).sum::<usize>(), 2);
        assert!(emitted.iter().all(|b| b.2 > 0));
    }
}

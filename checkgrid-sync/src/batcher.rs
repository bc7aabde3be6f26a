//! Mutation ingest and batching.
//!
//! Connections push [`Update`]s into one bounded `mpsc` queue through an
//! [`IngestHandle`]. A single [`Batcher`] task drains it and flushes when
//! either trigger fires:
//!
//! - size: `batch_size` mutations are pending (1 = pass-through)
//! - time: the flush interval ticks while the batch is non-empty
//!
//! A flush applies the batch under one store write guard, releases it,
//! saves the full state through the gateway, then publishes the applied
//! updates to the hub. A failed save is logged and counted; the live state
//! and the broadcast go ahead regardless.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::bitvec::Update;
use crate::broadcast::{BroadcastHub, PublishReport};
use crate::protocol::Notification;
use crate::storage::PersistenceGateway;
use crate::store::BitStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    #[error("ingest queue closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatcherConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// Outcome of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub rejected: usize,
    /// Whether the durable copy was updated
    pub persisted: bool,
    pub published: PublishReport,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub received: u64,
    pub batches_flushed: u64,
    pub mutations_applied: u64,
    pub mutations_rejected: u64,
    pub persistence_failures: u64,
}

/// Live ingest counters, shared by every handle and the batcher.
#[derive(Default)]
pub struct IngestCounters {
    received: AtomicU64,
    batches_flushed: AtomicU64,
    mutations_applied: AtomicU64,
    mutations_rejected: AtomicU64,
    persistence_failures: AtomicU64,
}

impl IngestCounters {
    pub fn snapshot(&self) -> IngestStats {
        IngestStats {
            received: self.received.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            mutations_applied: self.mutations_applied.load(Ordering::Relaxed),
            mutations_rejected: self.mutations_rejected.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
        }
    }
}

/// Producer side of the ingest queue. Cheap to clone, one per connection.
#[derive(Clone)]
pub struct IngestHandle {
    sender: mpsc::Sender<Update>,
    stats: Arc<IngestCounters>,
}

impl IngestHandle {
    /// Queue a mutation, waiting if the queue is full.
    pub async fn submit(&self, update: Update) -> Result<(), IngestError> {
        self.sender
            .send(update)
            .await
            .map_err(|_| IngestError::Closed)?;
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> IngestStats {
        self.stats.snapshot()
    }

    pub fn counters(&self) -> Arc<IngestCounters> {
        self.stats.clone()
    }
}

pub struct Batcher {
    config: BatcherConfig,
    store: Arc<BitStore>,
    gateway: PersistenceGateway,
    hub: Arc<BroadcastHub>,
    receiver: mpsc::Receiver<Update>,
    pending: Vec<Update>,
    stats: Arc<IngestCounters>,
}

impl Batcher {
    /// Create the batcher and the handle producers submit through.
    pub fn new(
        config: BatcherConfig,
        queue_capacity: usize,
        store: Arc<BitStore>,
        gateway: PersistenceGateway,
        hub: Arc<BroadcastHub>,
    ) -> (IngestHandle, Self) {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let stats = Arc::new(IngestCounters::default());
        let config = BatcherConfig {
            batch_size: config.batch_size.max(1),
            ..config
        };
        let handle = IngestHandle {
            sender,
            stats: stats.clone(),
        };
        let batcher = Self {
            config,
            store,
            gateway,
            hub,
            receiver,
            pending: Vec::with_capacity(config.batch_size),
            stats,
        };
        (handle, batcher)
    }

    /// Drain the ingest queue until every handle is dropped.
    ///
    /// The pending batch is flushed before returning.
    pub async fn run(mut self) {
        log::info!(
            "Batcher started (batch_size={}, flush_interval={:?})",
            self.config.batch_size,
            self.config.flush_interval
        );

        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                msg = self.receiver.recv() => match msg {
                    Some(update) => {
                        if self.push(update) {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !self.pending.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }

        if !self.pending.is_empty() {
            self.flush().await;
        }
        log::info!("Batcher stopped");
    }

    /// Append to the pending batch. Returns true once the size trigger fires.
    pub fn push(&mut self, update: Update) -> bool {
        log::trace!("Queued update {}:{}", update.index, update.value);
        self.pending.push(update);
        self.pending.len() >= self.config.batch_size
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Apply, persist and publish the pending batch.
    pub async fn flush(&mut self) -> FlushReport {
        let batch = std::mem::take(&mut self.pending);
        if batch.is_empty() {
            return FlushReport::default();
        }

        let outcome = self.store.apply_batch(&batch).await;
        for (update, e) in &outcome.rejected {
            log::warn!("Rejected mutation {}:{}: {e}", update.index, update.value);
        }

        let mut report = FlushReport {
            applied: outcome.applied.len(),
            rejected: outcome.rejected.len(),
            ..FlushReport::default()
        };

        if !outcome.applied.is_empty() {
            // Write guard is released; the save sees this batch and nothing partial.
            let blob = self.store.save_to().await;
            match self.gateway.save(blob).await {
                Ok(()) => report.persisted = true,
                Err(e) => {
                    self.stats
                        .persistence_failures
                        .fetch_add(1, Ordering::Relaxed);
                    log::error!("Failed to persist state under '{}': {e}", self.gateway.key());
                }
            }

            report.published = self
                .hub
                .publish(Notification::updates(outcome.applied))
                .await;
        }

        self.stats.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .mutations_applied
            .fetch_add(report.applied as u64, Ordering::Relaxed);
        self.stats
            .mutations_rejected
            .fetch_add(report.rejected as u64, Ordering::Relaxed);

        log::debug!(
            "Flushed batch: {} applied, {} rejected, persisted={}, delivered to {}",
            report.applied,
            report.rejected,
            report.persisted,
            report.published.delivered
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlobStore;
    use tokio::time::{sleep, timeout};

    struct Fixture {
        store: Arc<BitStore>,
        blobs: Arc<MemoryBlobStore>,
        hub: Arc<BroadcastHub>,
    }

    fn fixture(len: u64) -> Fixture {
        Fixture {
            store: Arc::new(BitStore::new(len)),
            blobs: Arc::new(MemoryBlobStore::new()),
            hub: Arc::new(BroadcastHub::new(16)),
        }
    }

    fn batcher(f: &Fixture, config: BatcherConfig) -> (IngestHandle, Batcher) {
        let gateway = PersistenceGateway::new(f.blobs.clone(), "bitset");
        Batcher::new(config, 64, f.store.clone(), gateway, f.hub.clone())
    }

    #[tokio::test]
    async fn test_flush_last_writer_wins_single_save() {
        let f = fixture(8);
        let (_handle, mut batcher) = batcher(&f, BatcherConfig::default());

        batcher.push(Update::new(2, true));
        batcher.push(Update::new(5, true));
        batcher.push(Update::new(2, false));
        let report = batcher.flush().await;

        assert_eq!(report.applied, 3);
        assert!(report.persisted);
        assert_eq!(f.store.snapshot().await, vec![0b0010_0000]);
        assert_eq!(f.blobs.write_count(), 1);
        assert_eq!(
            f.blobs.peek("bitset").unwrap(),
            vec![0b0010_0000, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[tokio::test]
    async fn test_out_of_range_does_not_abort_batch() {
        let f = fixture(8);
        let (_handle, mut batcher) = batcher(&f, BatcherConfig::default());
        let mut observer = f.hub.register().await;

        batcher.push(Update::new(1, true));
        batcher.push(Update::new(100, true));
        batcher.push(Update::new(6, true));
        let report = batcher.flush().await;

        assert_eq!(report.applied, 2);
        assert_eq!(report.rejected, 1);
        assert!(f.store.get(1).await.unwrap());
        assert!(f.store.get(6).await.unwrap());

        // only the applied updates are broadcast
        assert_eq!(
            *observer.recv().await.unwrap(),
            Notification::updates(vec![Update::new(1, true), Update::new(6, true)])
        );
    }

    #[tokio::test]
    async fn test_all_rejected_skips_save_and_publish() {
        let f = fixture(8);
        let (_handle, mut batcher) = batcher(&f, BatcherConfig::default());
        let mut observer = f.hub.register().await;

        batcher.push(Update::new(8, true));
        let report = batcher.flush().await;

        assert_eq!(report.rejected, 1);
        assert!(!report.persisted);
        assert_eq!(f.blobs.write_count(), 0);
        assert!(observer.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_state_and_broadcast() {
        let f = fixture(64);
        f.blobs.set_unavailable(true);
        let (handle, mut batcher) = batcher(&f, BatcherConfig::default());
        let mut observer = f.hub.register().await;

        batcher.push(Update::new(9, true));
        let report = batcher.flush().await;

        assert!(!report.persisted);
        assert_eq!(report.published.delivered, 1);
        assert!(f.store.get(9).await.unwrap());
        assert!(observer.recv().await.is_some());
        assert_eq!(handle.stats().persistence_failures, 1);

        // store comes back: the next flush catches the durable copy up
        f.blobs.set_unavailable(false);
        batcher.push(Update::new(10, true));
        assert!(batcher.flush().await.persisted);
        let blob = f.blobs.peek("bitset").unwrap();
        assert_eq!(blob[1], 0b0000_0110);
    }

    #[tokio::test]
    async fn test_size_trigger() {
        let f = fixture(16);
        let config = BatcherConfig {
            batch_size: 3,
            flush_interval: Duration::from_secs(3600),
        };
        let (_handle, mut batcher) = batcher(&f, config);
        assert!(!batcher.push(Update::new(0, true)));
        assert!(!batcher.push(Update::new(1, true)));
        assert!(batcher.push(Update::new(2, true)));
        assert_eq!(batcher.pending(), 3);
        batcher.flush().await;
        assert_eq!(batcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_run_flushes_on_size() {
        let f = fixture(8);
        let config = BatcherConfig {
            batch_size: 3,
            flush_interval: Duration::from_secs(3600),
        };
        let (handle, batcher) = batcher(&f, config);
        let task = tokio::spawn(batcher.run());

        handle.submit(Update::new(2, true)).await.unwrap();
        handle.submit(Update::new(5, true)).await.unwrap();
        handle.submit(Update::new(2, false)).await.unwrap();

        timeout(Duration::from_secs(2), async {
            while f.blobs.write_count() == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(f.store.snapshot().await, vec![0b0010_0000]);
        assert_eq!(f.blobs.write_count(), 1);

        drop(handle);
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_flushes_on_tick() {
        let f = fixture(8);
        let config = BatcherConfig {
            batch_size: 100,
            flush_interval: Duration::from_millis(20),
        };
        let (handle, batcher) = batcher(&f, config);
        let task = tokio::spawn(batcher.run());

        handle.submit(Update::new(3, true)).await.unwrap();
        timeout(Duration::from_secs(2), async {
            while !f.store.get(3).await.unwrap() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let stats = handle.stats();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.batches_flushed, 1);

        drop(handle);
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_flushes_pending_on_close() {
        let f = fixture(8);
        let config = BatcherConfig {
            batch_size: 100,
            flush_interval: Duration::from_secs(3600),
        };
        let (handle, batcher) = batcher(&f, config);
        let task = tokio::spawn(batcher.run());

        handle.submit(Update::new(7, true)).await.unwrap();
        drop(handle);
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

        assert!(f.store.get(7).await.unwrap());
        assert_eq!(f.blobs.write_count(), 1);
    }

    #[tokio::test]
    async fn test_single_producer_order_preserved() {
        let f = fixture(8);
        let config = BatcherConfig {
            batch_size: 1,
            flush_interval: Duration::from_secs(3600),
        };
        let (handle, batcher) = batcher(&f, config);
        let mut observer = f.hub.register().await;
        let task = tokio::spawn(batcher.run());

        for value in [true, false, true] {
            handle.submit(Update::new(4, value)).await.unwrap();
        }
        drop(handle);
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

        let mut seen = Vec::new();
        while let Some(n) = observer.try_recv() {
            if let Notification::Updates(updates) = &*n {
                seen.extend(updates.iter().map(|u| u.value));
            }
        }
        assert_eq!(seen, vec![true, false, true]);
        assert!(f.store.get(4).await.unwrap());
    }

    #[tokio::test]
    async fn test_submit_after_close() {
        let f = fixture(8);
        let (handle, batcher) = batcher(&f, BatcherConfig::default());
        drop(batcher);
        assert_eq!(handle.submit(Update::new(0, true)).await, Err(IngestError::Closed));
    }
}

//! Fan-out of applied updates to every live observer.
//!
//! Each observer owns a bounded `mpsc` queue. Publishing does a
//! non-blocking `try_send` per observer: a full queue drops the
//! notification for that observer only, so one slow reader never stalls
//! the publisher or its neighbours. A lagging observer can recover with a
//! full-state resync.
//!
//! ```text
//!                 ┌──────────────┐ try_send ┌───────┐   delivery task   ┌──────┐
//! publish(n) ───► │ BroadcastHub │ ───────► │ queue │ ────────────────► │ sink │
//!                 │ (registry)   │ ───────► │ queue │ ────────────────► │ sink │
//!                 └──────────────┘          └───────┘                   └──────┘
//! ```
//!
//! The registry lock is only held for bookkeeping: exclusively by
//! register/unregister, shared by publish. Delivery runs outside it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::Notification;

/// Delivery failure on one observer's path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObserverError {
    #[error("observer write failed: {0}")]
    Write(String),
    #[error("observer {0} is not registered")]
    NotRegistered(Uuid),
    #[error("observer {0} queue is full")]
    QueueFull(Uuid),
}

/// Identity of a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(Uuid);

impl ObserverHandle {
    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for ObserverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The receiving side of a registration.
pub struct Observer {
    handle: ObserverHandle,
    receiver: mpsc::Receiver<Arc<Notification>>,
}

impl Observer {
    pub fn handle(&self) -> ObserverHandle {
        self.handle
    }

    /// Next queued notification; `None` once unregistered and drained.
    pub async fn recv(&mut self) -> Option<Arc<Notification>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Notification>> {
        self.receiver.try_recv().ok()
    }
}

/// Outcome of one `publish` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Observers the notification was queued for
    pub delivered: usize,
    /// Observers whose queue was full
    pub dropped: usize,
    /// Observers found closed and unregistered
    pub closed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub observers: usize,
}

/// Hub counters, updated without taking the registry lock.
#[derive(Default)]
struct AtomicHubStats {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

pub struct BroadcastHub {
    observers: RwLock<HashMap<Uuid, mpsc::Sender<Arc<Notification>>>>,
    queue_capacity: usize,
    stats: AtomicHubStats,
}

impl BroadcastHub {
    /// `queue_capacity` notifications are buffered per observer before
    /// further ones are dropped for it.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            stats: AtomicHubStats::default(),
        }
    }

    pub async fn register(&self) -> Observer {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let id = Uuid::new_v4();
        self.observers.write().await.insert(id, sender);
        log::debug!("Observer {id} registered");
        Observer {
            handle: ObserverHandle(id),
            receiver,
        }
    }

    /// Remove an observer. Its queue closes once drained.
    pub async fn unregister(&self, handle: ObserverHandle) -> bool {
        let removed = self.observers.write().await.remove(&handle.0).is_some();
        if removed {
            log::debug!("Observer {handle} unregistered");
        }
        removed
    }

    /// Queue `notification` for every registered observer without waiting.
    pub async fn publish(&self, notification: Notification) -> PublishReport {
        let notification = Arc::new(notification);
        let mut report = PublishReport::default();
        let mut closed = Vec::new();

        {
            let observers = self.observers.read().await;
            for (id, sender) in observers.iter() {
                match sender.try_send(notification.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        log::trace!("Observer {id} queue full, dropping notification");
                        report.dropped += 1;
                    }
                    Err(TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        if !closed.is_empty() {
            let mut observers = self.observers.write().await;
            for id in &closed {
                observers.remove(id);
            }
            report.closed = closed.len();
            log::debug!("Pruned {} closed observers", closed.len());
        }

        self.stats.published.fetch_add(1, Ordering::Relaxed);
        self.stats
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.stats
            .dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        report
    }

    /// Queue `notification` for a single observer without waiting.
    pub async fn send_to(
        &self,
        handle: ObserverHandle,
        notification: Notification,
    ) -> Result<(), ObserverError> {
        let observers = self.observers.read().await;
        let sender = observers
            .get(&handle.0)
            .ok_or(ObserverError::NotRegistered(handle.0))?;
        match sender.try_send(Arc::new(notification)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Err(ObserverError::QueueFull(handle.0))
            }
            Err(TrySendError::Closed(_)) => Err(ObserverError::NotRegistered(handle.0)),
        }
    }

    pub async fn observer_count(&self) -> usize {
        self.observers.read().await.len()
    }

    pub async fn is_registered(&self, handle: ObserverHandle) -> bool {
        self.observers.read().await.contains_key(&handle.0)
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            published: self.stats.published.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            observers: self.observers.read().await.len(),
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }
}

/// Where an observer's notifications are written.
pub trait ObserverSink: Send {
    fn deliver(
        &mut self,
        notification: &Notification,
    ) -> impl Future<Output = Result<(), ObserverError>> + Send;
}

/// Drain `observer`'s queue into `sink` in arrival order.
///
/// A write failure ends this observer only: it is unregistered and its
/// queue dropped. The error is returned to whoever awaits this task and
/// goes nowhere else.
pub async fn run_delivery<S: ObserverSink>(
    hub: Arc<BroadcastHub>,
    mut observer: Observer,
    mut sink: S,
) -> Result<(), ObserverError> {
    let handle = observer.handle();
    while let Some(notification) = observer.recv().await {
        if let Err(e) = sink.deliver(&notification).await {
            log::warn!("Observer {handle} delivery failed: {e}");
            hub.unregister(handle).await;
            return Err(e);
        }
    }
    log::debug!("Observer {handle} delivery finished");
    Ok(())
}

//! Legacy control loop.
//!
//! Every cleanup period the loop lists the cache and queues every key
//! (Accounts first), and every change-feed event queues its key. A fixed pool
//! of workers drains the coalescing [`WorkQueue`] through the engine.
//!
//! Runs in a single process without leader election.

use crate::cache::ChangeEvent;
use crate::engine::{Engine, Requeue};
use crate::error::ControllerError;
use crate::queue::WorkQueue;
use crate::reconciler::ReconcileKey;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bound on queued keys
pub const QUEUE_CAPACITY: usize = 1024;

/// What the loop is doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Listing,
    Reconciling(ReconcileKey),
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopState::Idle => write!(f, "idle"),
            LoopState::Listing => write!(f, "listing"),
            LoopState::Reconciling(key) => write!(f, "reconciling {}", key),
        }
    }
}

/// Periodic list-all plus change feed, drained by a worker pool
pub struct LegacyLoop {
    engine: Arc<Engine>,
    queue: Arc<WorkQueue>,
    cleanup_period: Duration,
    workers: usize,
}

impl LegacyLoop {
    pub fn new(engine: Arc<Engine>, cleanup_period: Duration, workers: usize) -> Self {
        Self {
            engine,
            queue: Arc::new(WorkQueue::new(QUEUE_CAPACITY)),
            cleanup_period,
            workers: workers.max(1),
        }
    }

    /// Run until `shutdown` fires or the change feed closes
    pub async fn run(
        self,
        mut events: mpsc::Receiver<ChangeEvent>,
        shutdown: CancellationToken,
    ) -> Result<(), ControllerError> {
        info!(
            "Legacy control loop running ({} workers, cleanup every {:?})",
            self.workers, self.cleanup_period
        );

        let mut workers = JoinSet::new();
        for id in 0..self.workers {
            workers.spawn(worker(id, Arc::clone(&self.engine), Arc::clone(&self.queue)));
        }

        let mut ticker = tokio::time::interval(self.cleanup_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let result = loop {
            tokio::select! {
                () = shutdown.cancelled() => break Ok(()),
                _ = ticker.tick() => self.list_all(&shutdown).await,
                event = events.recv() => match event {
                    Some(event) => {
                        debug!("{} {:?}", event.key, event.kind);
                        self.enqueue(event.key, &shutdown).await;
                    }
                    None => break Err(ControllerError::Watch("change feed closed".to_string())),
                },
            }
        };

        info!("Stopping legacy control loop");
        self.queue.shutdown();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Worker task failed: {}", e);
            }
        }
        result
    }

    async fn list_all(&self, shutdown: &CancellationToken) {
        let keys = self.engine.cache().keys_in_order();
        debug!("State: {} ({} objects)", LoopState::Listing, keys.len());
        for key in keys {
            if !self.enqueue(key, shutdown).await {
                debug!("Listing interrupted by shutdown");
                return;
            }
        }
    }

    /// Queue `key`, giving up if `shutdown` fires while the queue is full
    async fn enqueue(&self, key: ReconcileKey, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            () = shutdown.cancelled() => false,
            () = self.queue.add(key) => true,
        }
    }
}

async fn worker(id: usize, engine: Arc<Engine>, queue: Arc<WorkQueue>) {
    debug!("Worker {} started", id);
    while let Some(key) = queue.pop().await {
        debug!("Worker {} state: {}", id, LoopState::Reconciling(key.clone()));
        match engine.reconcile(&key).await {
            Ok(report) => match report.requeue {
                Requeue::After(delay) => queue.add_after(key.clone(), delay),
                Requeue::Resync | Requeue::Done => {}
            },
            Err(e) => {
                let delay = engine.retry_delay(&key);
                warn!("Reconcile of {} failed: {}; retrying in {:?}", key, e, delay);
                queue.add_after(key.clone(), delay);
            }
        }
        queue.done(&key);
        debug!("Worker {} state: {}", id, LoopState::Idle);
    }
    debug!("Worker {} stopped", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::ResourceKind;
    use crate::test_utils::{TestHarness, create_test_account, create_test_stream};
    use crds::Stream;
    use jetstream_client::MockOp;

    #[tokio::test]
    async fn test_change_feed_drives_reconciles() {
        let h = TestHarness::new();
        let events = h.cache.subscribe(64);
        let shutdown = CancellationToken::new();
        let legacy = LegacyLoop::new(Arc::clone(&h.engine), Duration::from_secs(3600), 1);
        let task = tokio::spawn(legacy.run(events, shutdown.clone()));

        h.add(create_test_account("acct-a", "default")).await;
        let mut stream = create_test_stream("s1", "default");
        stream.spec.account = Some("acct-a".to_string());
        h.add(stream).await;

        let mut converged = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            if h.broker.stream("s1").is_some() {
                converged = true;
                break;
            }
        }
        assert!(converged, "stream created once its account became ready");
        assert!(h.broker.account("acct-a").is_some());

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_periodic_listing_corrects_drift() {
        let h = TestHarness::new();
        h.add(create_test_stream("s1", "default")).await;
        let events = h.cache.subscribe(64);
        let shutdown = CancellationToken::new();
        let legacy = LegacyLoop::new(Arc::clone(&h.engine), Duration::from_millis(50), 1);
        let task = tokio::spawn(legacy.run(events, shutdown.clone()));

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if h.broker.call_count(MockOp::CreateStream) > 0 {
                break;
            }
        }
        let mut live = h.broker.stream("s1").unwrap();
        live.subjects = vec!["other.>".to_string()];
        h.broker.add_stream(live);

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if h.broker.stream("s1").unwrap().subjects == vec!["s1.>"] {
                break;
            }
        }
        assert_eq!(h.broker.stream("s1").unwrap().subjects, vec!["s1.>"]);
        assert!(h.get::<Stream>("default", "s1").is_some());

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_listing_full_queue_stops_on_shutdown() {
        let h = TestHarness::new();
        for name in ["s1", "s2", "s3"] {
            h.add(create_test_stream(name, "default")).await;
        }
        // No workers drain the queue, so the second key blocks
        let legacy = LegacyLoop {
            engine: Arc::clone(&h.engine),
            queue: Arc::new(WorkQueue::new(1)),
            cleanup_period: Duration::from_secs(3600),
            workers: 1,
        };
        let shutdown = CancellationToken::new();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), legacy.list_all(&shutdown))
            .await
            .expect("listing returns once shutdown fires");
        let queued = legacy.queue.pop().await.unwrap();
        assert_eq!(queued.kind, ResourceKind::Stream);
    }

    #[tokio::test]
    async fn test_closed_feed_stops_loop() {
        let h = TestHarness::new();
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        let legacy = LegacyLoop::new(Arc::clone(&h.engine), Duration::from_secs(3600), 1);

        let err = legacy.run(rx, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ControllerError::Watch(_)));
    }

    #[test]
    fn test_state_display() {
        let key = ReconcileKey::new(ResourceKind::Stream, "default", "s1");
        assert_eq!(LoopState::Reconciling(key).to_string(), "reconciling Stream default/s1");
        assert_eq!(LoopState::Idle.to_string(), "idle");
    }
}

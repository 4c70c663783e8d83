//! Coalescing work queue for the legacy control loop.
//!
//! A key is queued at most once. A key added while a worker holds it is marked
//! dirty and queued again when that worker calls [`WorkQueue::done`], so no
//! key is ever handed to two workers at the same time. The queue depth is
//! bounded: [`WorkQueue::add`] waits for space once `capacity` keys are queued.

use crate::reconciler::ReconcileKey;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<ReconcileKey>,
    /// Keys waiting to be processed (queued, or re-queued once done)
    dirty: HashSet<ReconcileKey>,
    /// Keys currently held by a worker
    processing: HashSet<ReconcileKey>,
    shutting_down: bool,
}

/// Bounded, coalescing queue of reconcile keys
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    items: Notify,
    space: Notify,
    capacity: usize,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            items: Notify::new(),
            space: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `key`, waiting while the queue is full
    pub async fn add(&self, key: ReconcileKey) {
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();
            {
                let mut state = self.state();
                if state.shutting_down || state.dirty.contains(&key) {
                    return;
                }
                if state.processing.contains(&key) {
                    // Re-queued by done()
                    state.dirty.insert(key);
                    return;
                }
                if state.queue.len() < self.capacity {
                    state.dirty.insert(key.clone());
                    state.queue.push_back(key);
                    self.items.notify_one();
                    return;
                }
            }
            space.await;
        }
    }

    /// Queue `key` after `delay`
    pub fn add_after(self: &Arc<Self>, key: ReconcileKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// Next key to process, `None` once the queue is shut down
    pub async fn pop(&self) -> Option<ReconcileKey> {
        loop {
            let items = self.items.notified();
            tokio::pin!(items);
            items.as_mut().enable();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    self.space.notify_one();
                    return Some(key);
                }
            }
            items.await;
        }
    }

    /// Release `key` after processing; re-queue it if it was added meanwhile
    pub fn done(&self, key: &ReconcileKey) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            self.items.notify_one();
        }
    }

    /// Stop handing out keys and wake everyone waiting
    pub fn shutdown(&self) {
        self.state().shutting_down = true;
        self.items.notify_waiters();
        self.space.notify_waiters();
    }

    /// Keys queued and not yet handed out
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

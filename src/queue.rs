//! De-duplicating shard work queue and worker pool
//!
//! Shard keys are hash-partitioned across a fixed set of workers so that all
//! mutations for one shard are serialized through exactly one worker. The
//! queue is bounded and de-duplicating: enqueueing a shard already pending
//! collapses into the existing entry, so the queue never grows beyond the
//! number of live shards and a burst of events yields one reconciliation
//! covering the latest state.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::shard::{ShardKey, ShardScheme};

/// One worker's pending set
#[derive(Debug, Default)]
struct Lane {
    notify: Notify,
    pending: std::sync::Mutex<LaneState>,
}

#[derive(Debug, Default)]
struct LaneState {
    order: VecDeque<ShardKey>,
    members: HashSet<ShardKey>,
}

impl Lane {
    /// Returns true when the key was newly enqueued (not already pending)
    fn push(&self, key: ShardKey) -> bool {
        let mut state = self.pending.lock().expect("lane mutex poisoned");
        if !state.members.insert(key.clone()) {
            return false;
        }
        state.order.push_back(key);
        true
    }

    fn pop(&self) -> Option<ShardKey> {
        let mut state = self.pending.lock().expect("lane mutex poisoned");
        let key = state.order.pop_front()?;
        state.members.remove(&key);
        Some(key)
    }
}

/// Fixed worker pool consuming shard keys in per-shard FIFO-with-collapse order
#[derive(Debug)]
pub struct ShardQueue {
    lanes: Vec<Arc<Lane>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ShardQueue {
    /// Create a queue feeding `workers` lanes
    ///
    /// Lane count must be a power of two so the partition mask is exact.
    pub fn new(workers: usize) -> Arc<Self> {
        assert!(workers > 0 && workers.is_power_of_two());
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            lanes: (0..workers).map(|_| Arc::new(Lane::default())).collect(),
            shutdown_tx,
        })
    }

    /// Enqueue a shard for reconciliation
    ///
    /// Idempotent: multiple enqueues of the same shard before it is
    /// processed collapse into one pending reconciliation. Enqueues after
    /// shutdown are dropped.
    pub fn enqueue(&self, key: ShardKey) {
        if *self.shutdown_tx.borrow() {
            debug!(shard = %key, "dropping enqueue after shutdown");
            return;
        }
        let lane = &self.lanes[self.lane_for(&key)];
        if lane.push(key) {
            lane.notify.notify_one();
        }
    }

    /// Enqueue a shard after a delay, for retry scheduling
    pub fn enqueue_after(self: &Arc<Self>, key: ShardKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(key);
        });
    }

    /// Start the worker loops
    ///
    /// Each worker drains its own lane through `handler`; the handler runs
    /// one shard at a time per worker, which is the serialization guarantee
    /// the graph and cache rely on.
    pub fn start<F, Fut>(self: &Arc<Self>, handler: F) -> Vec<JoinHandle<()>>
    where
        F: Fn(ShardKey) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.lanes
            .iter()
            .enumerate()
            .map(|(index, lane)| {
                let lane = Arc::clone(lane);
                let handler = handler.clone();
                let mut shutdown_rx = self.shutdown_tx.subscribe();
                tokio::spawn(async move {
                    loop {
                        while let Some(key) = lane.pop() {
                            debug!(worker = index, shard = %key, "reconciling");
                            handler(key).await;
                        }
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        tokio::select! {
                            _ = lane.notify.notified() => {}
                            _ = shutdown_rx.changed() => {}
                        }
                    }
                    info!(worker = index, "shard worker stopped");
                })
            })
            .collect()
    }

    /// Cooperative shutdown: stop accepting enqueues and let in-flight work
    /// finish
    ///
    /// Workers drain what is already pending and then exit; join the handles
    /// returned by [`Self::start`] to wait for them.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        for lane in &self.lanes {
            lane.notify.notify_one();
        }
    }

    /// Which worker owns a shard key
    ///
    /// A stable hash, so one shard's work is always serialized through the
    /// same worker.
    fn lane_for(&self, key: &ShardKey) -> usize {
        ShardScheme::bucket(key.as_str(), self.lanes.len() as u32) as usize
    }
}

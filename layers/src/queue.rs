use std::collections::VecDeque;

use parking_lot::Mutex;
use strata_blobstore::ContentStore;
use tokio::sync::Notify;
use tracing::{info, instrument, warn};

use crate::LayerService;

/// Default number of layer ids a [DiffQueue] holds.
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Default)]
struct State {
    ids: VecDeque<String>,
    closed: bool,
}

/// A capped FIFO of layer ids waiting for their diff to be computed.
///
/// Pushing into a full queue drops the oldest id. Diffs are computed on
/// demand anyway, so a dropped id only means the first request for its
/// diff is slower.
pub struct DiffQueue {
    capacity: usize,
    state: Mutex<State>,
    notify: Notify,
}

impl Default for DiffQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl DiffQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().ids.is_empty()
    }

    /// Enqueues a layer id. Returns false if the queue was closed.
    pub fn push(&self, id: impl Into<String>) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }

            if state.ids.len() >= self.capacity {
                if let Some(dropped) = state.ids.pop_front() {
                    warn!(layer.id = %dropped, capacity = self.capacity, "diff queue full, dropping oldest layer");
                }
            }
            state.ids.push_back(id.into());
        }

        self.notify.notify_one();
        true
    }

    /// Waits for the next layer id. Returns None once the queue is closed
    /// and drained.
    pub async fn pop(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking, so a push or close in between isn't missed
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(id) = state.ids.pop_front() {
                    return Some(id);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Refuses further pushes and wakes up all waiting workers. Ids already
    /// in the queue are still handed out.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }
}

/// Computes the diffs of queued layers until the queue is closed.
/// Failures are logged and don't stop the worker.
#[instrument(skip_all)]
pub async fn run_diff_worker<CS>(service: LayerService<CS>, queue: &DiffQueue)
where
    CS: ContentStore + Clone,
{
    while let Some(id) = queue.pop().await {
        match service.image_diff_json(&id).await {
            Ok(diff) => info!(layer.id = %id, diff.len = diff.len(), "computed diff"),
            Err(e) => warn!(layer.id = %id, err = %e, "failed to compute diff"),
        }
    }

    info!("diff queue closed, stopping worker");
}

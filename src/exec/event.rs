//! GPU completion fences and events
//!
//! A [`Fence`] carries a monotonically increasing completed value. A
//! [`GpuEvent`] is a fence plus a target value: the event has fired once the
//! fence's completed value has reached the target. Events returned by a
//! single queue are monotonic, which is what makes upload-heap reclamation a
//! simple front-to-back scan.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// A monotonic completion fence.
pub struct Fence {
    completed: AtomicU64,
    waiters: Mutex<()>,
    condvar: Condvar,
}

impl Fence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            completed: AtomicU64::new(0),
            waiters: Mutex::new(()),
            condvar: Condvar::new(),
        })
    }

    pub fn completed_value(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Advance the completed value. Values only ever move forward; signaling
    /// a smaller value is a no-op.
    pub fn signal(&self, value: u64) {
        let mut current = self.completed.load(Ordering::Relaxed);
        while current < value {
            match self.completed.compare_exchange_weak(
                current,
                value,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        let _guard = self.waiters.lock().unwrap_or_else(|err| err.into_inner());
        self.condvar.notify_all();
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("completed", &self.completed_value())
            .finish()
    }
}

/// A point on a fence's timeline.
#[derive(Clone, Debug)]
pub struct GpuEvent {
    fence: Arc<Fence>,
    value: u64,
}

impl GpuEvent {
    pub fn new(fence: Arc<Fence>, value: u64) -> Self {
        Self { fence, value }
    }

    /// An event that has already fired. Useful as a neutral initial value.
    pub fn signaled() -> Self {
        Self {
            fence: Fence::new(),
            value: 0,
        }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn fence(&self) -> &Arc<Fence> {
        &self.fence
    }

    /// Whether all GPU work submitted before this event has retired.
    pub fn is_signaled(&self) -> bool {
        self.fence.completed_value() >= self.value
    }

    /// Block the calling thread until the event fires.
    pub fn wait(&self) {
        let mut guard = self
            .fence
            .waiters
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        while self.fence.completed_value() < self.value {
            guard = self
                .fence
                .condvar
                .wait(guard)
                .unwrap_or_else(|err| err.into_inner());
        }
    }
}

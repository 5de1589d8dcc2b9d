//! Device events for cross-queue ordering and timing

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use super::error::{DeviceError, DeviceResult};

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// Marker that completes when a queue reaches the point it was recorded at
///
/// Every `record` hands out a new generation; a wait targets the latest
/// generation handed out when the wait was enqueued. Waiting on an event
/// that was never recorded returns immediately. Cloning shares the event.
#[derive(Clone)]
pub struct DeviceEvent {
    inner: Arc<EventInner>,
}

struct EventInner {
    id: u64,
    recorded: AtomicU64,
    state: Mutex<EventState>,
    completed_cv: Condvar,
}

#[derive(Default)]
struct EventState {
    completed: u64,
    timestamp: Option<Instant>,
}

impl DeviceEvent {
    pub fn new() -> Self {
        let id = NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("DeviceEvent::new: created event {}", id);
        DeviceEvent {
            inner: Arc::new(EventInner {
                id,
                recorded: AtomicU64::new(0),
                state: Mutex::new(EventState::default()),
                completed_cv: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Latest generation handed out by a record call (0 = never recorded)
    pub fn recorded_generation(&self) -> u64 {
        self.inner.recorded.load(Ordering::Acquire)
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.inner.recorded.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Called by the queue worker when it reaches the record point
    pub(crate) fn complete(&self, generation: u64) -> DeviceResult<()> {
        let mut state = self.inner.state.lock()?;
        if generation > state.completed {
            state.completed = generation;
            state.timestamp = Some(Instant::now());
        }
        self.inner.completed_cv.notify_all();
        Ok(())
    }

    /// Block until `generation` has completed
    pub(crate) fn wait_for(&self, generation: u64) -> DeviceResult<()> {
        if generation == 0 {
            return Ok(());
        }
        let mut state = self.inner.state.lock()?;
        while state.completed < generation {
            state = self.inner.completed_cv.wait(state)?;
        }
        Ok(())
    }

    /// Block the host until the latest recorded point has been reached
    pub fn synchronize(&self) -> DeviceResult<()> {
        tracing::trace!("DeviceEvent::synchronize: event {}", self.inner.id);
        self.wait_for(self.recorded_generation())
    }

    /// True once all recorded work has completed (never-recorded events are complete)
    pub fn query(&self) -> DeviceResult<bool> {
        let state = self.inner.state.lock()?;
        Ok(state.completed >= self.recorded_generation())
    }

    /// Milliseconds between the completion of `self` and the completion of `end`
    ///
    /// Both events must have completed at least once.
    pub fn elapsed_time(&self, end: &DeviceEvent) -> DeviceResult<f32> {
        let start = self.completion_time()?;
        let stop = end.completion_time()?;
        let elapsed = stop.saturating_duration_since(start);
        Ok(elapsed.as_secs_f64() as f32 * 1000.0)
    }

    fn completion_time(&self) -> DeviceResult<Instant> {
        let state = self.inner.state.lock()?;
        state.timestamp.ok_or_else(|| {
            DeviceError::EventError(format!("event {} has not completed", self.inner.id))
        })
    }
}

impl Default for DeviceEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceEvent")
            .field("id", &self.inner.id)
            .field("recorded", &self.recorded_generation())
            .finish()
    }
}

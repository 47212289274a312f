//! Consumed device-runtime interface.
//!
//! The engine invokes, and never redefines, the accelerator runtime:
//! opaque stream and event handles, asynchronous work submission, and
//! event record/wait. [`SimDevice`] is the in-process implementation used
//! for tests and host-only execution.

mod sim;

pub use sim::SimDevice;

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{AxonError, AxonResult};

/// Work submitted to a device stream. Streams execute work in FIFO order.
pub type DeviceWork = Box<dyn FnOnce() + Send + 'static>;

/// Opaque stream handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stream(pub u64);

enum EventState {
    Pending,
    Signaled,
    Failed(String),
}

struct EventInner {
    state: Mutex<EventState>,
    cond: Condvar,
}

/// Device completion event. Recorded on a stream, waited on by the
/// completion worker.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub fn new() -> Self {
        Event {
            inner: Arc::new(EventInner {
                state: Mutex::new(EventState::Pending),
                cond: Condvar::new(),
            }),
        }
    }

    /// Mark the event signaled and wake waiters.
    pub fn signal(&self) {
        let mut state = self.inner.state.lock();
        *state = EventState::Signaled;
        self.inner.cond.notify_all();
    }

    /// Mark the event failed; waiters observe the error.
    pub fn fail(&self, msg: impl Into<String>) {
        let mut state = self.inner.state.lock();
        *state = EventState::Failed(msg.into());
        self.inner.cond.notify_all();
    }

    /// Block until the event is signaled. Unbounded by design; hang
    /// detection belongs to a surrounding layer.
    pub fn wait(&self) -> AxonResult<()> {
        let mut state = self.inner.state.lock();
        loop {
            match &*state {
                EventState::Signaled => return Ok(()),
                EventState::Failed(msg) => return Err(AxonError::Completion(msg.clone())),
                EventState::Pending => self.inner.cond.wait(&mut state),
            }
        }
    }

    pub fn is_signaled(&self) -> bool {
        matches!(&*self.inner.state.lock(), EventState::Signaled)
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event(signaled={})", self.is_signaled())
    }
}

/// The device runtime consumed by the engine.
pub trait DeviceRuntime: Send + Sync {
    /// Create an execution stream.
    fn create_stream(&self) -> AxonResult<Stream>;

    /// Submit asynchronous work to a stream and return immediately.
    fn launch(&self, stream: Stream, work: DeviceWork) -> AxonResult<()>;

    /// Asynchronous memory copy. Copies are ordinary stream work.
    fn memcpy_async(&self, stream: Stream, copy: DeviceWork) -> AxonResult<()> {
        self.launch(stream, copy)
    }

    fn create_event(&self) -> Event {
        Event::new()
    }

    /// Enqueue an event-signal operation: the event fires once all work
    /// submitted to the stream before it has completed.
    fn record(&self, stream: Stream, event: &Event) -> AxonResult<()>;

    /// Host-side block until the event signals.
    fn wait_event(&self, event: &Event) -> AxonResult<()> {
        event.wait()
    }

    fn destroy_event(&self, _event: Event) -> AxonResult<()> {
        Ok(())
    }
}

//! Completion/callback subsystem.
//!
//! Bridges asynchronous device completion back into host-side scheduling.
//! One dedicated worker thread per invocation owns a FIFO queue of
//! (event, callback) pairs: producers push from whatever thread launched
//! the task, the worker blocks on the device event, runs the callback, and
//! loops. Dispatching threads therefore never block on device completion;
//! only this one thread does.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;

use crate::device::{DeviceRuntime, Event};
use crate::error::{AxonError, AxonResult};

/// Nullary host callback run once the paired device event signals.
pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

struct CallbackItem {
    /// `None` is the shutdown sentinel: the worker drains everything pushed
    /// before it, then exits.
    event: Option<Event>,
    run: Option<CompletionCallback>,
}

/// Per-invocation completion queue plus its single worker thread.
///
/// The only supported teardown path is [`CallbackManager::destroy`], which
/// pushes the sentinel and joins the worker.
pub struct CallbackManager {
    tx: Sender<CallbackItem>,
    worker: Mutex<Option<JoinHandle<AxonResult<()>>>>,
}

impl CallbackManager {
    /// Spawn the worker and return the handle producers push through.
    pub fn init(device: Arc<dyn DeviceRuntime>) -> AxonResult<Self> {
        let (tx, rx) = unbounded::<CallbackItem>();
        let worker = std::thread::Builder::new()
            .name("axon-callback".to_string())
            .spawn(move || -> AxonResult<()> {
                while let Ok(item) = rx.recv() {
                    let event = match item.event {
                        Some(event) => event,
                        None => return Ok(()),
                    };
                    // The single hard block in the system. A wait failure
                    // terminates the worker and surfaces at destroy().
                    device.wait_event(&event)?;
                    if let Some(run) = item.run {
                        run();
                    }
                }
                Ok(())
            })
            .map_err(|e| AxonError::internal(format!("failed to spawn callback worker: {e}")))?;

        Ok(CallbackManager {
            tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue a completion callback behind its device event.
    pub fn push(&self, event: Event, run: CompletionCallback) -> AxonResult<()> {
        self.tx
            .send(CallbackItem {
                event: Some(event),
                run: Some(run),
            })
            .map_err(|_| AxonError::Completion("callback worker already shut down".to_string()))
    }

    /// Push the sentinel and block until the worker has drained the queue
    /// and exited. Returns the worker's failure, if any.
    pub fn destroy(&self) -> AxonResult<()> {
        let handle = match self.worker.lock().take() {
            Some(handle) => handle,
            None => return Ok(()),
        };
        self.tx
            .send(CallbackItem {
                event: None,
                run: None,
            })
            .map_err(|_| AxonError::Completion("callback worker already shut down".to_string()))?;
        handle
            .join()
            .map_err(|_| AxonError::Completion("callback worker panicked".to_string()))?
    }
}

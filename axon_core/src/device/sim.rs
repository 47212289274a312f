//! In-process device backend: one FIFO worker thread per stream.

use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;

use crate::error::{AxonError, AxonResult};

use super::{DeviceRuntime, DeviceWork, Event, Stream};

enum StreamOp {
    Work(DeviceWork),
    Record(Event),
}

struct StreamWorker {
    tx: Option<Sender<StreamOp>>,
    handle: Option<JoinHandle<()>>,
}

impl StreamWorker {
    fn send(&self, op: StreamOp) -> AxonResult<()> {
        self.tx
            .as_ref()
            .and_then(|tx| tx.send(op).ok())
            .ok_or_else(|| AxonError::internal("stream worker terminated"))
    }
}

/// Simulated accelerator: each stream is a dedicated thread draining a FIFO
/// queue, so stream ordering matches a real device queue. Events recorded
/// on a stream signal once everything submitted before them has run.
pub struct SimDevice {
    streams: Mutex<Vec<StreamWorker>>,
}

impl SimDevice {
    pub fn new() -> Self {
        SimDevice {
            streams: Mutex::new(Vec::new()),
        }
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRuntime for SimDevice {
    fn create_stream(&self) -> AxonResult<Stream> {
        let (tx, rx) = unbounded::<StreamOp>();
        let handle = std::thread::Builder::new()
            .name("axon-sim-stream".to_string())
            .spawn(move || {
                while let Ok(op) = rx.recv() {
                    match op {
                        StreamOp::Work(work) => work(),
                        StreamOp::Record(event) => event.signal(),
                    }
                }
            })
            .map_err(|e| AxonError::internal(format!("failed to spawn stream worker: {e}")))?;

        let mut streams = self.streams.lock();
        streams.push(StreamWorker {
            tx: Some(tx),
            handle: Some(handle),
        });
        Ok(Stream(streams.len() as u64 - 1))
    }

    fn launch(&self, stream: Stream, work: DeviceWork) -> AxonResult<()> {
        let streams = self.streams.lock();
        let worker = streams
            .get(stream.0 as usize)
            .ok_or_else(|| AxonError::internal(format!("unknown stream {}", stream.0)))?;
        worker.send(StreamOp::Work(work))
    }

    fn record(&self, stream: Stream, event: &Event) -> AxonResult<()> {
        let streams = self.streams.lock();
        let worker = streams
            .get(stream.0 as usize)
            .ok_or_else(|| AxonError::internal(format!("unknown stream {}", stream.0)))?;
        worker.send(StreamOp::Record(event.clone()))
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        let mut streams = self.streams.lock();
        for worker in streams.iter_mut() {
            // Closing the queue lets the worker drain and exit.
            worker.tx = None;
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn stream_runs_work_in_fifo_order_before_event() {
        let device = SimDevice::new();
        let stream = device.create_stream().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..4 {
            let counter = Arc::clone(&counter);
            device
                .launch(
                    stream,
                    Box::new(move || {
                        // FIFO: each submission observes the previous count.
                        assert_eq!(counter.fetch_add(1, Ordering::SeqCst), i);
                    }),
                )
                .unwrap();
        }

        let event = device.create_event();
        device.record(stream, &event).unwrap();
        device.wait_event(&event).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn streams_are_independent() {
        let device = SimDevice::new();
        let s0 = device.create_stream().unwrap();
        let s1 = device.create_stream().unwrap();
        assert_ne!(s0, s1);

        let hit = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hit);
        device
            .launch(s1, Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        let event = device.create_event();
        device.record(s1, &event).unwrap();
        device.wait_event(&event).unwrap();
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }
}

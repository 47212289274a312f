//! Task abstraction: the per-node handle an executor prepares once and
//! launches on every invocation.
//!
//! A task owns everything needed to launch its node on the device. The
//! launch path is asynchronous end to end: `execute_async` submits work and
//! returns; the completion callback fires from the callback worker once the
//! paired device event signals. Cheap host-side tasks may instead run
//! inline and invoke the callback before returning.

use std::sync::Arc;

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::callback::{CallbackManager, CompletionCallback};
use crate::control::FrameState;
use crate::device::{DeviceRuntime, Stream};
use crate::engine::state::NodeState;
use crate::error::{AxonError, AxonResult};
use crate::graph::NodeId;
use crate::shape::TensorValue;

/// Per-launch context handed to a task: the node's runtime state plus the
/// device plumbing of the current invocation.
pub struct TaskContext {
    pub node_id: NodeId,
    pub node_name: String,
    pub state: Arc<NodeState>,
    pub frame: Option<Arc<FrameState>>,
    pub stream: Stream,
    pub device: Arc<dyn DeviceRuntime>,
    pub callbacks: Arc<CallbackManager>,
    /// Scratch buffer bound into the launch, sized during preparation.
    pub workspace: Vec<u8>,
}

impl TaskContext {
    /// Snapshot the node's input tensors, failing on any missing slot.
    pub fn take_inputs(&self) -> AxonResult<Vec<TensorValue>> {
        let inputs = self.state.inputs.lock();
        inputs
            .iter()
            .enumerate()
            .map(|(slot, v)| {
                v.clone().ok_or_else(|| AxonError::Dispatch {
                    node: self.node_name.clone(),
                    op_type: String::new(),
                    reason: format!("input slot {slot} empty at launch"),
                })
            })
            .collect()
    }
}

/// A prepared, launchable unit of work for one node.
pub trait Task: Send + Sync {
    /// Refresh launch arguments after shapes changed. No-op for tasks with
    /// static argument tables.
    fn update_args(&self, _ctx: &mut TaskContext) -> AxonResult<()> {
        Ok(())
    }

    /// Re-select the kernel binary for the resolved shapes.
    fn update_binary(&self, _ctx: &mut TaskContext) -> AxonResult<()> {
        Ok(())
    }

    /// Recompute tiling/blocking for the resolved shapes.
    fn update_tiling(&self, _ctx: &mut TaskContext) -> AxonResult<()> {
        Ok(())
    }

    /// Submit the node's work. Must not block on device completion; `done`
    /// runs exactly once when the work has finished (possibly inline).
    fn execute_async(&self, ctx: &mut TaskContext, done: CompletionCallback) -> AxonResult<()>;
}

/// A task with no device work at all. Completion is immediate.
pub struct NoopTask;

impl Task for NoopTask {
    fn execute_async(&self, _ctx: &mut TaskContext, done: CompletionCallback) -> AxonResult<()> {
        done();
        Ok(())
    }
}

/// Host-side kernel implementation registered per op type.
pub type KernelFn =
    Arc<dyn Fn(&[TensorValue]) -> AxonResult<Vec<TensorValue>> + Send + Sync>;

/// Op-type keyed kernel table shared by every compute executor.
pub struct KernelTable {
    fns: RwLock<HashMap<String, KernelFn>>,
}

impl KernelTable {
    pub fn new() -> Self {
        KernelTable {
            fns: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, op_type: impl Into<String>, f: KernelFn) {
        self.fns.write().insert(op_type.into(), f);
    }

    pub fn lookup(&self, op_type: &str) -> Option<KernelFn> {
        self.fns.read().get(op_type).cloned()
    }
}

impl Default for KernelTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Device-compute task: submits the kernel to the stream, records an event
/// behind it, and hands (event, callback) to the completion worker.
pub struct KernelTask {
    op_type: String,
    kernel: KernelFn,
}

impl KernelTask {
    pub fn new(op_type: impl Into<String>, kernel: KernelFn) -> Self {
        KernelTask {
            op_type: op_type.into(),
            kernel,
        }
    }
}

impl Task for KernelTask {
    fn execute_async(&self, ctx: &mut TaskContext, done: CompletionCallback) -> AxonResult<()> {
        let inputs = ctx.take_inputs()?;
        let state = Arc::clone(&ctx.state);
        let kernel = Arc::clone(&self.kernel);
        let op_type = self.op_type.clone();
        let node_name = ctx.node_name.clone();

        ctx.device.launch(
            ctx.stream,
            Box::new(move || match kernel(&inputs) {
                Ok(outputs) => {
                    for (slot, value) in outputs.into_iter().enumerate() {
                        state.set_output(slot, value);
                    }
                }
                Err(e) => state.record_task_error(AxonError::Dispatch {
                    node: node_name,
                    op_type,
                    reason: e.to_string(),
                }),
            }),
        )?;

        let event = ctx.device.create_event();
        ctx.device.record(ctx.stream, &event)?;
        ctx.callbacks.push(event, done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::build_node_items;
    use crate::device::SimDevice;
    use crate::graph::Graph;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn context_for(state: Arc<NodeState>) -> TaskContext {
        let device: Arc<dyn DeviceRuntime> = Arc::new(SimDevice::new());
        let stream = device.create_stream().unwrap();
        let callbacks = Arc::new(CallbackManager::init(Arc::clone(&device)).unwrap());
        TaskContext {
            node_id: 0,
            node_name: "node".to_string(),
            state,
            frame: None,
            stream,
            device,
            callbacks,
            workspace: Vec::new(),
        }
    }

    #[test]
    fn kernel_task_completes_through_the_callback_worker() {
        let mut g = Graph::new("g");
        let d = g.add_node("d", "Data", 0, 1);
        let neg = g.add_node("neg", "Neg", 1, 1);
        g.add_data_edge(d, 0, neg, 0);
        let items = build_node_items(&g).unwrap();
        let state = Arc::new(NodeState::new(&items[neg]));
        state.note_arrival(0, TensorValue::from_i32(5));

        let task = KernelTask::new(
            "Neg",
            Arc::new(|inputs: &[TensorValue]| {
                let v = inputs[0].scalar_i64().unwrap();
                Ok(vec![TensorValue::from_i64(-v)])
            }),
        );

        let mut ctx = context_for(Arc::clone(&state));
        let finished = Arc::new(AtomicBool::new(false));
        let fin = Arc::clone(&finished);
        task.execute_async(&mut ctx, Box::new(move || fin.store(true, Ordering::SeqCst)))
            .unwrap();

        ctx.callbacks.destroy().unwrap();
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(state.output(0).unwrap().scalar_i64(), Some(-5));
    }

    #[test]
    fn kernel_failure_lands_in_task_error_not_outputs() {
        let mut g = Graph::new("g");
        let d = g.add_node("d", "Data", 0, 1);
        let bad = g.add_node("bad", "Bad", 1, 1);
        g.add_data_edge(d, 0, bad, 0);
        let items = build_node_items(&g).unwrap();
        let state = Arc::new(NodeState::new(&items[bad]));
        state.note_arrival(0, TensorValue::from_i32(1));

        let task = KernelTask::new(
            "Bad",
            Arc::new(|_: &[TensorValue]| Err(AxonError::internal("kernel exploded"))),
        );

        let mut ctx = context_for(Arc::clone(&state));
        task.execute_async(&mut ctx, Box::new(|| {})).unwrap();
        ctx.callbacks.destroy().unwrap();

        assert!(state.output(0).is_none());
        assert!(matches!(
            state.take_task_error(),
            Some(AxonError::Dispatch { .. })
        ));
    }

    #[test]
    fn missing_input_fails_before_launch() {
        let mut g = Graph::new("g");
        let d = g.add_node("d", "Data", 0, 1);
        let neg = g.add_node("neg", "Neg", 1, 1);
        g.add_data_edge(d, 0, neg, 0);
        let items = build_node_items(&g).unwrap();
        let state = Arc::new(NodeState::new(&items[neg]));

        let task = KernelTask::new(
            "Neg",
            Arc::new(|_: &[TensorValue]| Ok(vec![TensorValue::from_i32(0)])),
        );
        let mut ctx = context_for(state);
        assert!(task.execute_async(&mut ctx, Box::new(|| {})).is_err());
        ctx.callbacks.destroy().unwrap();
    }
}

//! The execution engine: counter-driven asynchronous dispatch.
//!
//! One invocation owns a ready queue, a pool of dispatch workers, and a
//! completion worker. A node enters the ready queue when its arrival
//! counter reaches the descriptor's threshold; a dispatch worker runs
//! shape inference, resolves and prepares the node's executor, validates
//! input sizes, and launches the task. The task's completion callback
//! (running on the callback worker for device tasks, inline for host
//! tasks) propagates outputs to successors and may push them into the
//! ready queue in turn. The invocation ends when no node is in flight.

pub mod state;

pub use state::NodeState;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::callback::CallbackManager;
use crate::config::EngineConfig;
use crate::control::FrameState;
use crate::descriptor::{build_node_items, NodeItemTable, ShapeClass};
use crate::device::{DeviceRuntime, Stream};
use crate::error::{AxonError, AxonResult};
use crate::executor::{ExecutorRegistry, TaskContext};
use crate::graph::{Graph, NodeId, NodeKind};
use crate::shape::{DataType, InferenceEngine, TensorValue};

/// Allocation padding tolerated by input byte-size validation: a buffer
/// may be up to this many bytes smaller than its declared size before the
/// mismatch is a hard error.
pub const SIZE_CHECK_PADDING: usize = 32;

/// Ready-queue sentinel telling one dispatch worker to exit.
const SHUTDOWN: NodeId = usize::MAX;

/// Everything one graph invocation shares between dispatch workers and
/// completion callbacks.
struct Invocation {
    items: NodeItemTable,
    states: Vec<Arc<NodeState>>,
    frames: HashMap<i64, Arc<FrameState>>,
    registry: Arc<ExecutorRegistry>,
    inference: Arc<InferenceEngine>,
    device: Arc<dyn DeviceRuntime>,
    stream: Stream,
    callbacks: Arc<CallbackManager>,
    config: EngineConfig,
    ready_tx: Sender<NodeId>,
    ready_rx: Receiver<NodeId>,
    worker_count: usize,
    /// Nodes queued or executing. The invocation is over when this
    /// reaches zero.
    inflight: AtomicUsize,
    /// First failure; later ones are dropped.
    error: Mutex<Option<AxonError>>,
    result: Mutex<Option<Vec<TensorValue>>>,
    output_node: Option<NodeId>,
}

impl Invocation {
    fn record_error(&self, err: AxonError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            log::error!("invocation failed: {err}");
            *slot = Some(err);
        } else {
            log::debug!("suppressing secondary failure: {err}");
        }
    }

    /// Queue a node. The inflight count is bumped before the send so the
    /// zero check can never race a pending enqueue.
    fn enqueue(&self, id: NodeId) {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        if self.ready_tx.send(id).is_err() {
            self.inflight.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// One node left the pipeline. The last one out shuts the workers down.
    fn finish_node(&self) {
        if self.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            for _ in 0..self.worker_count {
                let _ = self.ready_tx.send(SHUTDOWN);
            }
        }
    }
}

/// Deliver one tensor to a successor input slot, queueing the successor
/// once its threshold is met.
fn deliver(inv: &Arc<Invocation>, dst: NodeId, dst_slot: usize, value: TensorValue) {
    let item = &inv.items[dst];
    let count = inv.states[dst].note_arrival(dst_slot, value);
    if count == item.data_wait_count {
        inv.enqueue(dst);
    }
}

fn notify_control(inv: &Arc<Invocation>, dst: NodeId) {
    let item = &inv.items[dst];
    let count = inv.states[dst].note_control();
    if count == item.data_wait_count {
        inv.enqueue(dst);
    }
}

/// Shape look-ahead: copy this node's resolved output descriptors onto its
/// successors and run inference early on any successor whose inputs all
/// became known, cascading as far as the knowledge reaches. Each node
/// propagates at most once per invocation.
fn propagate_shapes(inv: &Arc<Invocation>, id: NodeId) {
    let mut work = vec![id];
    while let Some(nid) = work.pop() {
        let item = &inv.items[nid];
        let state = &inv.states[nid];
        if state.descs_sent.swap(true, Ordering::AcqRel) {
            continue;
        }
        for succ in inv
            .inference
            .propagate_descs(item, state, &inv.items, &inv.states)
        {
            let succ_item = &inv.items[succ];
            let succ_state = &inv.states[succ];
            if succ_item.shape_class != ShapeClass::InputShapes
                || succ_state.skip_infer.load(Ordering::Acquire)
            {
                continue;
            }
            match inv.inference.infer_shape(succ_item, succ_state) {
                Ok(()) => {
                    succ_state.skip_infer.store(true, Ordering::Release);
                    work.push(succ);
                }
                Err(e) => {
                    // Not fatal: the successor infers again at dispatch,
                    // when its remaining inputs have landed.
                    log::debug!("shape look-ahead for '{}' failed: {e}", succ_item.name);
                }
            }
        }
    }
}

/// Input byte-size validation against the runtime-resolved descriptors.
/// Slots marked exempt, unfilled slots, and string tensors are skipped.
fn validate_input_sizes(inv: &Invocation, id: NodeId) -> AxonResult<()> {
    let item = &inv.items[id];
    let state = &inv.states[id];
    let inputs = state.inputs.lock();
    let descs = state.input_descs.lock();
    let padding = inv.config.size_check_padding;

    for (slot, value) in inputs.iter().enumerate() {
        if item.no_size_check.contains(&slot) {
            continue;
        }
        let value = match value {
            Some(v) => v,
            None => continue,
        };
        let desc = &descs[slot];
        if desc.dtype == DataType::String {
            continue;
        }
        let declared = match desc.size_bytes() {
            Some(bytes) => bytes,
            None => continue,
        };
        let actual = value.byte_len();
        if actual + padding < declared {
            return Err(AxonError::Validation {
                node: item.name.clone(),
                reason: format!(
                    "input {slot} holds {actual} bytes but shape {desc} needs {declared}"
                ),
            });
        }
        if actual < declared {
            log::warn!(
                "node '{}' input {} is {} bytes short of shape {} (within padding)",
                item.name,
                slot,
                declared - actual,
                desc
            );
        }
    }
    Ok(())
}

/// Dispatch one ready node: infer shapes, resolve the executor, validate,
/// launch.
fn dispatch_node(inv: &Arc<Invocation>, id: NodeId) -> AxonResult<()> {
    let item = &inv.items[id];
    let state = &inv.states[id];
    log::trace!("dispatch '{}' ({})", item.name, item.op_type);

    if state.skip_schedule.load(Ordering::Acquire) {
        inv.finish_node();
        return Ok(());
    }
    if let Some(frame) = inv.frames.get(&item.frame_id) {
        if !item.root_of_frame && !frame.is_active() {
            return Err(AxonError::Dispatch {
                node: item.name.clone(),
                op_type: item.op_type.clone(),
                reason: "frame was not activated by its entry node".to_string(),
            });
        }
    }
    state.consume_readiness(item.refire_decrement);

    if !state.skip_infer.load(Ordering::Acquire) {
        inv.inference.infer_shape(item, state)?;
    }
    // Shapes of compute-classified nodes are final only after the task
    // runs; their propagation waits for completion.
    if item.shape_class != ShapeClass::Compute {
        propagate_shapes(inv, id);
    }

    let kind = item.bind_executor_with(|| inv.registry.resolve_kind(item))?;
    let executor = inv.registry.executor_for(kind)?;

    let mut ctx = TaskContext {
        node_id: id,
        node_name: item.name.clone(),
        state: Arc::clone(state),
        frame: inv.frames.get(&item.frame_id).cloned(),
        stream: inv.stream,
        device: Arc::clone(&inv.device),
        callbacks: Arc::clone(&inv.callbacks),
        workspace: Vec::new(),
    };
    let task = executor.prepare_task(item, &mut ctx)?;

    if inv.config.validate_input_sizes {
        validate_input_sizes(inv, id)?;
    }

    let done_inv = Arc::clone(inv);
    executor.execute_task(&task, &mut ctx, Box::new(move || complete_node(&done_inv, id)))
}

/// Completion path: harvest failures, propagate outputs, release inputs.
fn complete_node(inv: &Arc<Invocation>, id: NodeId) {
    let item = &inv.items[id];
    let state = &inv.states[id];

    if let Some(err) = state.take_task_error() {
        inv.record_error(err);
        inv.finish_node();
        return;
    }

    if item.shape_class == ShapeClass::Compute {
        propagate_shapes(inv, id);
    }

    if item.kind.is_merge_family() {
        match state.take_merge_index() {
            Some(slot) => {
                if item.back_edge_slots.contains(&slot) {
                    if let Some(frame) = inv.frames.get(&item.frame_id) {
                        if !frame.is_active() {
                            inv.record_error(AxonError::internal(format!(
                                "merge '{}' took a frame arrival while frame {} is inactive",
                                item.name, item.frame_id
                            )));
                            inv.finish_node();
                            return;
                        }
                    }
                }
                if let Some(value) = state.output(0) {
                    for edge in &item.data_send {
                        deliver(inv, edge.dst, edge.dst_slot, value.clone());
                    }
                }
            }
            None => inv.record_error(AxonError::internal(format!(
                "merge '{}' completed without a selection",
                item.name
            ))),
        }
    } else if item.kind.is_switch_family() {
        match state.take_branch_index() {
            Some(branch) => {
                // Members of the losing branch groups are dead until a
                // later evaluation selects them again. Merge joins are
                // exempt: they fire on whichever input is live.
                for (b, group) in item.switch_groups.iter().enumerate() {
                    for &(dst, _) in group {
                        if inv.items[dst].kind.is_merge_family() {
                            continue;
                        }
                        inv.states[dst]
                            .skip_schedule
                            .store(b != branch, Ordering::Release);
                    }
                }
                if let (Some(value), Some(group)) =
                    (state.output(branch), item.switch_groups.get(branch))
                {
                    for &(dst, dst_slot) in group {
                        deliver(inv, dst, dst_slot, value.clone());
                    }
                }
            }
            None => inv.record_error(AxonError::internal(format!(
                "switch '{}' completed without a selection",
                item.name
            ))),
        }
    } else if item.kind == NodeKind::NetOutput {
        if inv.output_node == Some(id) {
            let outputs: Vec<TensorValue> =
                state.outputs.lock().iter().flatten().cloned().collect();
            *inv.result.lock() = Some(outputs);
        }
    } else {
        for edge in &item.data_send {
            if let Some(value) = state.output(edge.src_slot) {
                deliver(inv, edge.dst, edge.dst_slot, value);
            }
        }
    }

    for &dst in &item.ctrl_send {
        notify_control(inv, dst);
    }

    state.release_inputs(&item.persistent_input_slots);
    inv.finish_node();
}

fn worker_loop(inv: Arc<Invocation>) {
    while let Ok(id) = inv.ready_rx.recv() {
        if id == SHUTDOWN {
            break;
        }
        if let Err(err) = dispatch_node(&inv, id) {
            inv.record_error(err);
            inv.finish_node();
        }
    }
}

/// A loaded graph ready for repeated invocation.
///
/// Construction builds the immutable descriptor arena and takes one
/// initialization reference on the executor registry; dropping the engine
/// releases it.
pub struct ExecutionEngine {
    items: NodeItemTable,
    registry: Arc<ExecutorRegistry>,
    inference: Arc<InferenceEngine>,
    device: Arc<dyn DeviceRuntime>,
    config: EngineConfig,
    input_nodes: Vec<NodeId>,
    output_node: Option<NodeId>,
    /// Values bound to Constant/Variable nodes before the first run.
    bound_values: Mutex<HashMap<NodeId, TensorValue>>,
}

impl ExecutionEngine {
    pub fn new(
        graph: &Graph,
        registry: Arc<ExecutorRegistry>,
        device: Arc<dyn DeviceRuntime>,
        config: EngineConfig,
    ) -> AxonResult<Self> {
        registry.ensure_initialized()?;
        let items = match build_node_items(graph) {
            Ok(items) => items,
            Err(e) => {
                let _ = registry.finalize();
                return Err(e);
            }
        };
        log::info!(
            "loaded graph '{}': {} nodes, {} inputs",
            graph.name,
            items.len(),
            graph.input_ids.len()
        );
        let inference = Arc::new(InferenceEngine::new(Arc::clone(registry.shapes())));
        Ok(ExecutionEngine {
            items,
            registry,
            inference,
            device,
            config,
            input_nodes: graph.input_ids.clone(),
            output_node: graph.output_ids.first().copied(),
            bound_values: Mutex::new(HashMap::new()),
        })
    }

    /// Bind the value a Constant or Variable node produces.
    pub fn bind_value(&self, id: NodeId, value: TensorValue) {
        self.bound_values.lock().insert(id, value);
    }

    /// Execute the graph once. Blocks until every launched node has
    /// completed and the completion queue has drained.
    pub fn run(&self, inputs: Vec<TensorValue>) -> AxonResult<Vec<TensorValue>> {
        if inputs.len() != self.input_nodes.len() {
            return Err(AxonError::Validation {
                node: "<graph>".to_string(),
                reason: format!(
                    "{} inputs supplied, graph expects {}",
                    inputs.len(),
                    self.input_nodes.len()
                ),
            });
        }

        let stream = self.device.create_stream()?;
        let callbacks = Arc::new(CallbackManager::init(Arc::clone(&self.device))?);
        let states: Vec<Arc<NodeState>> = self
            .items
            .iter()
            .map(|item| Arc::new(NodeState::new(item)))
            .collect();

        let mut frames: HashMap<i64, Arc<FrameState>> = HashMap::new();
        for item in self.items.iter() {
            frames
                .entry(item.frame_id)
                .or_insert_with(|| Arc::new(FrameState::new(item.frame_id)));
            if item.parent_frame_id >= 0 {
                frames
                    .entry(item.parent_frame_id)
                    .or_insert_with(|| Arc::new(FrameState::new(item.parent_frame_id)));
            }
        }
        // The top-level frame has no Enter; it is live for the whole
        // invocation.
        if let Some(frame) = frames.get(&0) {
            frame.activate();
        }

        // Bind source values before anything can fire. Source shapes come
        // from the bound tensors themselves, so inference is skipped.
        for (node, value) in self.input_nodes.iter().zip(inputs) {
            states[*node].set_output(0, value);
            states[*node].skip_infer.store(true, Ordering::Release);
        }
        {
            let bound = self.bound_values.lock();
            for item in self.items.iter() {
                if matches!(item.kind, NodeKind::Constant | NodeKind::Variable) {
                    match bound.get(&item.node_id) {
                        Some(value) => {
                            states[item.node_id].set_output(0, value.clone());
                            states[item.node_id].skip_infer.store(true, Ordering::Release);
                        }
                        None => {
                            return Err(AxonError::Validation {
                                node: item.name.clone(),
                                reason: "constant node has no bound value".to_string(),
                            })
                        }
                    }
                }
            }
        }

        let (ready_tx, ready_rx) = unbounded::<NodeId>();
        let worker_count = self.config.dispatch_workers.max(1);
        let inv = Arc::new(Invocation {
            items: Arc::clone(&self.items),
            states,
            frames,
            registry: Arc::clone(&self.registry),
            inference: Arc::clone(&self.inference),
            device: Arc::clone(&self.device),
            stream,
            callbacks: Arc::clone(&callbacks),
            config: self.config.clone(),
            ready_tx,
            ready_rx,
            worker_count,
            inflight: AtomicUsize::new(0),
            error: Mutex::new(None),
            result: Mutex::new(None),
            output_node: self.output_node,
        });

        // Seed every node that waits on nothing.
        for item in inv.items.iter() {
            if item.data_wait_count == 0 {
                inv.enqueue(item.node_id);
            }
        }
        if inv.inflight.load(Ordering::Acquire) == 0 {
            for _ in 0..worker_count {
                let _ = inv.ready_tx.send(SHUTDOWN);
            }
        }

        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let inv = Arc::clone(&inv);
            let handle = std::thread::Builder::new()
                .name(format!("axon-dispatch-{i}"))
                .spawn(move || worker_loop(inv))
                .map_err(|e| AxonError::internal(format!("failed to spawn worker: {e}")))?;
            workers.push(handle);
        }
        for handle in workers {
            if handle.join().is_err() {
                inv.record_error(AxonError::internal("dispatch worker panicked"));
            }
        }
        callbacks.destroy()?;

        if let Some(err) = inv.error.lock().take() {
            return Err(err);
        }
        match self.output_node {
            None => Ok(Vec::new()),
            Some(_) => inv.result.lock().take().ok_or_else(|| {
                AxonError::Completion("graph finished without reaching its output".to_string())
            }),
        }
    }
}

impl Drop for ExecutionEngine {
    fn drop(&mut self) {
        if let Err(e) = self.registry.finalize() {
            log::warn!("registry finalize on engine drop: {e}");
        }
    }
}

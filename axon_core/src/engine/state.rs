//! Per-node, per-invocation runtime state.
//!
//! One [`NodeState`] exists per node per graph invocation. It is created
//! when the invocation's state table is built, mutated only by the node's
//! own task execution and by the completion callbacks of its predecessors,
//! and destroyed with the invocation. The static descriptor table is never
//! touched.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::descriptor::NodeItem;
use crate::error::AxonError;
use crate::shape::{TensorDesc, TensorValue};

/// Sentinel for "no selection made" in merge/branch indices.
const INDEX_UNSET: i64 = -1;

pub struct NodeState {
    /// Input slots whose shapes have been resolved. Slots that were
    /// already static at build time are pre-counted at creation.
    pub shape_ready: AtomicUsize,
    /// Arrivals counted toward the tensor-readiness threshold (data plus
    /// ordinary control notifications).
    pub data_ready: AtomicUsize,
    /// Times this node has been dispatched in this invocation.
    pub fire_count: AtomicUsize,
    /// Times output byte sizes have been (re)computed.
    pub sizes_computed: AtomicUsize,

    /// Merge selection index, written by the node's own task, consumed once
    /// by output propagation, then reset to unset.
    merge_index: AtomicI64,
    /// Switch branch selection, same consume-once discipline.
    branch_index: AtomicI64,
    /// Input slot of the most recent data arrival (what a Merge selects).
    last_arrival: AtomicI64,

    /// Skip shape inference for this invocation.
    pub skip_infer: AtomicBool,
    /// Skip scheduling entirely; the node is provably a no-op this
    /// invocation (e.g. unreached branch). Cleared when a later branch
    /// re-evaluation selects the node again.
    pub skip_schedule: AtomicBool,
    /// Set once this node's output descriptors have been copied onto its
    /// successors, so re-fires of loop nodes do not propagate twice.
    pub descs_sent: AtomicBool,

    /// Input tensor slots, written by predecessor completion callbacks.
    pub inputs: Mutex<Vec<Option<TensorValue>>>,
    /// Runtime-resolved input shapes.
    pub input_descs: Mutex<Vec<TensorDesc>>,
    /// Output tensor slots, written by the node's task.
    pub outputs: Mutex<Vec<Option<TensorValue>>>,
    /// Runtime-resolved output shapes.
    pub output_descs: Mutex<Vec<TensorDesc>>,

    /// Serializes the shape-inference call; some engines are not reentrant
    /// across threads for the same node.
    pub infer_guard: Mutex<()>,
    /// Failure reported by asynchronous device work, harvested by the
    /// completion path.
    pub task_error: Mutex<Option<AxonError>>,
}

impl NodeState {
    /// Fresh state seeded with the descriptor's compile-time shapes.
    pub fn new(item: &NodeItem) -> Self {
        NodeState {
            shape_ready: AtomicUsize::new(item.static_input_count),
            data_ready: AtomicUsize::new(0),
            fire_count: AtomicUsize::new(0),
            sizes_computed: AtomicUsize::new(0),
            merge_index: AtomicI64::new(INDEX_UNSET),
            branch_index: AtomicI64::new(INDEX_UNSET),
            last_arrival: AtomicI64::new(INDEX_UNSET),
            skip_infer: AtomicBool::new(false),
            skip_schedule: AtomicBool::new(false),
            descs_sent: AtomicBool::new(false),
            inputs: Mutex::new(vec![None; item.num_inputs]),
            input_descs: Mutex::new(item.input_descs.clone()),
            outputs: Mutex::new(vec![None; item.num_outputs]),
            output_descs: Mutex::new(item.output_descs.clone()),
            infer_guard: Mutex::new(()),
            task_error: Mutex::new(None),
        }
    }

    /// Record a data arrival on `slot`. Returns the new readiness count.
    pub fn note_arrival(&self, slot: usize, value: TensorValue) -> usize {
        {
            let mut inputs = self.inputs.lock();
            let mut descs = self.input_descs.lock();
            descs[slot] = value.desc.clone();
            inputs[slot] = Some(value);
        }
        self.last_arrival.store(slot as i64, Ordering::Release);
        self.data_ready.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record an ordinary control notification. Returns the new count.
    pub fn note_control(&self) -> usize {
        self.data_ready.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Consume readiness when the node fires, so back-edge deliveries can
    /// make it ready again in a later iteration.
    pub fn consume_readiness(&self, amount: usize) {
        if amount > 0 {
            self.data_ready.fetch_sub(amount, Ordering::AcqRel);
        }
        self.fire_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Input slot of the most recent arrival, for Merge selection.
    pub fn last_arrival(&self) -> Option<usize> {
        match self.last_arrival.load(Ordering::Acquire) {
            INDEX_UNSET => None,
            slot => Some(slot as usize),
        }
    }

    pub fn set_merge_index(&self, index: usize) {
        self.merge_index.store(index as i64, Ordering::Release);
    }

    /// Consume the merge selection: read and reset to unset.
    pub fn take_merge_index(&self) -> Option<usize> {
        match self.merge_index.swap(INDEX_UNSET, Ordering::AcqRel) {
            INDEX_UNSET => None,
            index => Some(index as usize),
        }
    }

    pub fn merge_index_is_unset(&self) -> bool {
        self.merge_index.load(Ordering::Acquire) == INDEX_UNSET
    }

    pub fn set_branch_index(&self, index: usize) {
        self.branch_index.store(index as i64, Ordering::Release);
    }

    /// Consume the switch branch selection: read and reset to unset.
    pub fn take_branch_index(&self) -> Option<usize> {
        match self.branch_index.swap(INDEX_UNSET, Ordering::AcqRel) {
            INDEX_UNSET => None,
            index => Some(index as usize),
        }
    }

    /// One-shot guard for the static short-circuit: only the first call
    /// returns true, so byte sizes are computed exactly once no matter how
    /// often inference runs for the node.
    pub fn mark_sizes_computed(&self) -> bool {
        self.sizes_computed
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn set_output(&self, slot: usize, value: TensorValue) {
        let mut outputs = self.outputs.lock();
        let mut descs = self.output_descs.lock();
        descs[slot] = value.desc.clone();
        outputs[slot] = Some(value);
    }

    pub fn output(&self, slot: usize) -> Option<TensorValue> {
        self.outputs.lock().get(slot).cloned().flatten()
    }

    pub fn record_task_error(&self, err: AxonError) {
        let mut slot = self.task_error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub fn take_task_error(&self) -> Option<AxonError> {
        self.task_error.lock().take()
    }

    /// Release input buffers after completion, keeping loop-invariant
    /// slots (constants, variables) alive for the next iteration.
    pub fn release_inputs(&self, persistent_slots: &[usize]) {
        let mut inputs = self.inputs.lock();
        for (slot, value) in inputs.iter_mut().enumerate() {
            if !persistent_slots.contains(&slot) {
                *value = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::build_node_items;
    use crate::graph::Graph;

    fn two_input_state() -> NodeState {
        let mut g = Graph::new("g");
        let a = g.add_node("a", "Data", 0, 1);
        let b = g.add_node("b", "Data", 0, 1);
        let add = g.add_node("add", "Add", 2, 1);
        g.add_data_edge(a, 0, add, 0);
        g.add_data_edge(b, 0, add, 1);
        let items = build_node_items(&g).unwrap();
        NodeState::new(&items[add])
    }

    #[test]
    fn arrivals_accumulate_and_consume() {
        let state = two_input_state();
        assert_eq!(state.note_arrival(0, TensorValue::from_i32(1)), 1);
        assert_eq!(state.note_arrival(1, TensorValue::from_i32(2)), 2);
        state.consume_readiness(2);
        assert_eq!(state.data_ready.load(Ordering::SeqCst), 0);
        assert_eq!(state.fire_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn merge_index_is_consumed_once() {
        let state = two_input_state();
        assert!(state.merge_index_is_unset());
        state.set_merge_index(1);
        assert_eq!(state.take_merge_index(), Some(1));
        assert_eq!(state.take_merge_index(), None);
        assert!(state.merge_index_is_unset());
    }

    #[test]
    fn byte_size_guard_is_one_shot() {
        let state = two_input_state();
        assert!(state.mark_sizes_computed());
        assert!(!state.mark_sizes_computed());
        assert!(!state.mark_sizes_computed());
        assert_eq!(state.sizes_computed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shape_ready_starts_at_the_static_input_count() {
        use crate::shape::DataType;

        let mut g = Graph::new("g");
        let a = g.add_node("a", "Data", 0, 1);
        let b = g.add_node("b", "Data", 0, 1);
        let add = g.add_node("add", "Add", 2, 1);
        g.set_input_desc(add, 0, TensorDesc::new(vec![4], DataType::Float32));
        g.add_data_edge(a, 0, add, 0);
        g.add_data_edge(b, 0, add, 1);
        let items = build_node_items(&g).unwrap();

        let state = NodeState::new(&items[add]);
        assert_eq!(items[add].static_input_count, 1);
        assert_eq!(state.shape_ready.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_keeps_persistent_slots() {
        let state = two_input_state();
        state.note_arrival(0, TensorValue::from_i32(1));
        state.note_arrival(1, TensorValue::from_i32(2));
        state.release_inputs(&[1]);
        let inputs = state.inputs.lock();
        assert!(inputs[0].is_none());
        assert!(inputs[1].is_some());
    }
}

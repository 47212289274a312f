//! Runtime shape inference.
//!
//! Resolves the output shapes (and byte sizes) of one node, synchronized
//! with the rest of the graph's shape propagation. Nodes whose shapes are
//! fully static short-circuit the engine-specific shape function entirely;
//! dynamically-shaped nodes run their shape function under a per-node
//! guard, then propagate (shape, element type) onto successor input slots.

mod types;

pub use types::{DataType, TensorDesc, TensorValue, DIM_UNKNOWN};

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::descriptor::{FusedSubgraph, NodeItem, ShapeClass};
use crate::engine::state::NodeState;
use crate::error::{AxonError, AxonResult};
use crate::graph::NodeId;

/// Engine-specific shape function: (op type, resolved input shapes,
/// compile-time output shapes) to resolved output shapes.
pub type ShapeFn =
    Arc<dyn Fn(&str, &[TensorDesc], &[TensorDesc]) -> AxonResult<Vec<TensorDesc>> + Send + Sync>;

/// Default inference: forward the first resolved input shape to every
/// output, falling back to the compile-time descriptors.
fn forward_first_input(
    _op_type: &str,
    inputs: &[TensorDesc],
    compile_outputs: &[TensorDesc],
) -> AxonResult<Vec<TensorDesc>> {
    match inputs.iter().find(|d| d.is_static()) {
        Some(desc) => Ok(vec![desc.clone(); compile_outputs.len()]),
        None => Ok(compile_outputs.to_vec()),
    }
}

/// Op-type keyed table of shape functions, populated by engine
/// registration before first use.
pub struct ShapeRegistry {
    fns: RwLock<HashMap<String, ShapeFn>>,
}

impl ShapeRegistry {
    pub fn new() -> Self {
        ShapeRegistry {
            fns: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, op_type: impl Into<String>, f: ShapeFn) {
        self.fns.write().insert(op_type.into(), f);
    }

    pub fn lookup(&self, op_type: &str) -> ShapeFn {
        self.fns
            .read()
            .get(op_type)
            .cloned()
            .unwrap_or_else(|| Arc::new(forward_first_input))
    }
}

impl Default for ShapeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The shape-inference engine shared by one loaded graph.
pub struct InferenceEngine {
    shapes: Arc<ShapeRegistry>,
}

impl InferenceEngine {
    pub fn new(shapes: Arc<ShapeRegistry>) -> Self {
        InferenceEngine { shapes }
    }

    pub fn registry(&self) -> &Arc<ShapeRegistry> {
        &self.shapes
    }

    /// Resolve one node's output shapes into its runtime state.
    ///
    /// Readiness (every predecessor shape/value this node's shape function
    /// reads) is guaranteed by the caller's counter-driven wait; this call
    /// never blocks on other nodes.
    pub fn infer_shape(&self, item: &NodeItem, state: &NodeState) -> AxonResult<()> {
        // Fully static: never invoke the shape function, compute byte
        // sizes exactly once.
        if item.outputs_static() && !item.is_dynamic() {
            if state.mark_sizes_computed() {
                *state.output_descs.lock() = item.output_descs.clone();
            }
            return Ok(());
        }

        // Some engines are not reentrant across threads for the same node.
        let _guard = state.infer_guard.lock();

        let input_descs = state.input_descs.lock().clone();
        let outputs = match &item.fused {
            Some(fused) => self.infer_fused(fused, &input_descs),
            None => {
                let f = self.shapes.lookup(&item.op_type);
                f(&item.op_type, &input_descs, &item.output_descs)
            }
        }
        .map_err(|e| AxonError::ShapeInference {
            node: item.name.clone(),
            op_type: item.op_type.clone(),
            reason: e.to_string(),
        })?;

        if outputs.len() != item.num_outputs {
            return Err(AxonError::ShapeInference {
                node: item.name.clone(),
                op_type: item.op_type.clone(),
                reason: format!(
                    "shape function produced {} descriptors for {} outputs",
                    outputs.len(),
                    item.num_outputs
                ),
            });
        }

        // Symbolic leftovers are only legal for classes resolved at or
        // after compute time.
        let runtime_resolvable = matches!(
            item.shape_class,
            ShapeClass::Compute | ShapeClass::ValueRange
        );
        for desc in &outputs {
            if !desc.is_static() && !runtime_resolvable {
                return Err(AxonError::ShapeInference {
                    node: item.name.clone(),
                    op_type: item.op_type.clone(),
                    reason: format!("output shape {desc} still symbolic after inference"),
                });
            }
        }

        *state.output_descs.lock() = outputs;
        state.sizes_computed.fetch_add(1, Ordering::AcqRel);

        // Late-bound classification correction: everything turned out
        // concrete for this graph after all.
        if input_descs.iter().all(|d| d.is_static())
            && state.output_descs.lock().iter().all(|d| d.is_static())
        {
            item.mark_static_resolved();
        }
        Ok(())
    }

    /// Inference for a fused cluster runs per inner node of the embedded
    /// subgraph in its own topological order, crossing the boundary
    /// through the input/output mapping tables.
    fn infer_fused(
        &self,
        fused: &FusedSubgraph,
        outer_inputs: &[TensorDesc],
    ) -> AxonResult<Vec<TensorDesc>> {
        let graph = &fused.graph;
        let mut descs: Vec<Vec<TensorDesc>> = graph
            .nodes()
            .iter()
            .map(|n| n.output_descs.clone())
            .collect();

        for (outer_slot, &data_id) in fused.input_map.iter().enumerate() {
            let desc = outer_inputs
                .get(outer_slot)
                .cloned()
                .ok_or_else(|| AxonError::internal("fused input mapping out of range"))?;
            descs[data_id][0] = desc;
        }

        for &id in &fused.topo {
            let node = graph.node(id);
            let mut edges = node.inputs.clone();
            edges.sort_by_key(|e| e.dst_index);
            let inputs: Vec<TensorDesc> = edges
                .iter()
                .map(|e| descs[e.src][e.src_index].clone())
                .collect();
            let f = self.shapes.lookup(&node.op_type);
            descs[id] = f(&node.op_type, &inputs, &node.output_descs)?;
        }

        Ok(fused
            .output_map
            .iter()
            .map(|&(src, slot)| descs[src][slot].clone())
            .collect())
    }

    /// Copy (shape, element type) onto each data successor's input slot,
    /// counting each copy toward the successor's shape-readiness threshold.
    /// Returns the successors whose threshold was crossed by this call, so
    /// the scheduler can run their inference ahead of tensor readiness.
    /// When this node's shape is not yet final and the successor depends on
    /// shapes rather than values, the copy is deferred until the shape
    /// becomes final (the completion path calls this again).
    pub fn propagate_descs(
        &self,
        item: &NodeItem,
        state: &NodeState,
        items: &[Arc<NodeItem>],
        states: &[Arc<NodeState>],
    ) -> Vec<NodeId> {
        let output_descs = state.output_descs.lock().clone();
        let shapes_final = output_descs.iter().all(|d| d.is_static());
        let mut shape_ready = Vec::new();

        for edge in &item.data_send {
            let succ_item = &items[edge.dst];
            // A shape-dependent successor must not observe a non-final
            // shape; the completion path re-propagates once it is final.
            if !shapes_final && succ_item.shape_class == ShapeClass::InputShapes {
                continue;
            }
            // Slots static at build time were pre-counted when the
            // successor's state was seeded.
            if succ_item.input_descs[edge.dst_slot].is_static() {
                continue;
            }
            if let Some(desc) = output_descs.get(edge.src_slot) {
                let succ_state = &states[edge.dst];
                succ_state.input_descs.lock()[edge.dst_slot] = desc.clone();
                let count = succ_state.shape_ready.fetch_add(1, Ordering::AcqRel) + 1;
                if count == succ_item.shape_wait_count {
                    shape_ready.push(edge.dst);
                }
            }
        }
        shape_ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::build_node_items;
    use crate::graph::{attr, AttrValue, Graph};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn static_nodes_never_call_the_shape_function() {
        let mut g = Graph::new("g");
        let d = g.add_node("d", "Data", 0, 1);
        g.set_output_desc(d, 0, TensorDesc::new(vec![4], DataType::Float32));
        let r = g.add_node("r", "Relu", 1, 1);
        g.set_input_desc(r, 0, TensorDesc::new(vec![4], DataType::Float32));
        g.set_output_desc(r, 0, TensorDesc::new(vec![4], DataType::Float32));
        g.add_data_edge(d, 0, r, 0);
        let items = build_node_items(&g).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(ShapeRegistry::new());
        let c = Arc::clone(&calls);
        registry.register(
            "Relu",
            Arc::new(move |_, inputs, outs| {
                c.fetch_add(1, Ordering::SeqCst);
                forward_first_input("Relu", inputs, outs)
            }),
        );
        let engine = InferenceEngine::new(registry);

        let state = NodeState::new(&items[r]);
        engine.infer_shape(&items[r], &state).unwrap();
        engine.infer_shape(&items[r], &state).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        // Byte sizes computed exactly once despite repeated calls.
        assert_eq!(state.sizes_computed.load(Ordering::SeqCst), 1);
        assert_eq!(
            state.output_descs.lock()[0].size_bytes(),
            Some(16)
        );
    }

    #[test]
    fn dynamic_node_resolves_through_registered_function() {
        let mut g = Graph::new("g");
        let r = g.add_node("r", "Tile", 1, 1);
        g.set_input_desc(r, 0, TensorDesc::new(vec![2], DataType::Float32));
        g.set_output_desc(r, 0, TensorDesc::new(vec![DIM_UNKNOWN], DataType::Float32));
        let items = build_node_items(&g).unwrap();

        let registry = Arc::new(ShapeRegistry::new());
        registry.register(
            "Tile",
            Arc::new(|_, inputs: &[TensorDesc], _: &[TensorDesc]| {
                let n = inputs[0].dims[0] * 2;
                Ok(vec![TensorDesc::new(vec![n], inputs[0].dtype)])
            }),
        );
        let engine = InferenceEngine::new(registry);

        let state = NodeState::new(&items[r]);
        engine.infer_shape(&items[r], &state).unwrap();
        assert_eq!(state.output_descs.lock()[0].dims, vec![4]);
        // Everything concrete now: the dynamic flag is corrected.
        assert!(!items[r].is_dynamic());
    }

    #[test]
    fn symbolic_leftover_is_an_error_unless_compute_class() {
        let mut g = Graph::new("g");
        let r = g.add_node("r", "Unique", 0, 1);
        g.set_output_desc(r, 0, TensorDesc::new(vec![DIM_UNKNOWN], DataType::Int32));
        let c = g.add_node("c", "Unique2", 0, 1);
        g.set_output_desc(c, 0, TensorDesc::new(vec![DIM_UNKNOWN], DataType::Int32));
        g.set_attr(c, attr::SHAPE_CLASS, AttrValue::Str("compute".into()));
        let items = build_node_items(&g).unwrap();

        let engine = InferenceEngine::new(Arc::new(ShapeRegistry::new()));
        let state = NodeState::new(&items[r]);
        assert!(engine.infer_shape(&items[r], &state).is_err());

        let state = NodeState::new(&items[c]);
        assert!(engine.infer_shape(&items[c], &state).is_ok());
    }

    #[test]
    fn propagation_reports_newly_shape_ready_successors() {
        let mut g = Graph::new("g");
        let a = g.add_node("a", "Data", 0, 1);
        g.set_output_desc(a, 0, TensorDesc::new(vec![4], DataType::Float32));
        // One successor with an unknown input shape, one whose input shape
        // was already static at build time.
        let r = g.add_node("r", "Relu", 1, 1);
        g.add_data_edge(a, 0, r, 0);
        let s = g.add_node("s", "Relu", 1, 1);
        g.set_input_desc(s, 0, TensorDesc::new(vec![4], DataType::Float32));
        g.add_data_edge(a, 0, s, 0);
        let items = build_node_items(&g).unwrap();
        let states: Vec<Arc<NodeState>> = items
            .iter()
            .map(|item| Arc::new(NodeState::new(item)))
            .collect();

        let engine = InferenceEngine::new(Arc::new(ShapeRegistry::new()));
        let ready = engine.propagate_descs(&items[a], &states[a], &items, &states);

        // The dynamic slot crossed its threshold; the static slot was
        // pre-counted at state creation and is not re-counted.
        assert_eq!(ready, vec![r]);
        assert_eq!(states[r].shape_ready.load(Ordering::SeqCst), 1);
        assert_eq!(states[r].input_descs.lock()[0].dims, vec![4]);
        assert_eq!(states[s].shape_ready.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fused_inference_crosses_the_boundary() {
        let mut inner = Graph::new("inner");
        let d0 = inner.add_node("in0", "Data", 0, 1);
        inner.set_attr(d0, attr::PARENT_INDEX, AttrValue::Int(0));
        let t = inner.add_node("tile", "Tile", 1, 1);
        inner.add_data_edge(d0, 0, t, 0);
        let ret = inner.add_node("ret", "NetOutput", 1, 1);
        inner.set_attr(ret, attr::PARENT_INDEX, AttrValue::Int(0));
        inner.add_data_edge(t, 0, ret, 0);

        let mut g = Graph::new("g");
        let fused = g.add_node("fused", "FusedCluster", 1, 1);
        g.set_attr(fused, attr::FUSED_GRAPH, AttrValue::Graph(Box::new(inner)));
        g.set_input_desc(fused, 0, TensorDesc::new(vec![3], DataType::Float32));
        g.set_output_desc(
            fused,
            0,
            TensorDesc::new(vec![DIM_UNKNOWN], DataType::Float32),
        );
        let items = build_node_items(&g).unwrap();

        let registry = Arc::new(ShapeRegistry::new());
        registry.register(
            "Tile",
            Arc::new(|_, inputs: &[TensorDesc], _: &[TensorDesc]| {
                let n = inputs[0].dims[0] * 2;
                Ok(vec![TensorDesc::new(vec![n], inputs[0].dtype)])
            }),
        );
        let engine = InferenceEngine::new(registry);

        let state = NodeState::new(&items[fused]);
        engine.infer_shape(&items[fused], &state).unwrap();
        assert_eq!(state.output_descs.lock()[0].dims, vec![6]);
    }
}

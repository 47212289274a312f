//! Static per-node descriptors.
//!
//! A [`NodeItem`] is built once when a compiled graph is loaded and is
//! immutable afterwards, except for a small set of late-bound cells (the
//! bound task, the bound executor kind, and the dynamic-flag correction
//! applied when shape inference turns every shape concrete). Descriptors
//! are shared by reference across all invocations of the graph; dependency
//! sets are append-only during the build and read concurrently by many
//! dispatch threads afterwards.

mod builder;

pub use builder::build_node_items;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::error::{AxonError, AxonResult};
use crate::executor::{ExecutorKind, Task};
use crate::graph::{Graph, NodeId, NodeKind};
use crate::shape::{TensorDesc, TensorValue};

/// Maximum identity-chain depth searched when deciding whether a
/// predecessor is Enter-fed. Deliberately bounded and ad hoc; longer chains
/// are treated as ordinary dependencies.
pub const ENTER_CHAIN_MAX_DEPTH: usize = 4;

/// Shape-dependence classification: when a node's output shapes become
/// knowable. Drives whether shape inference may run ahead of execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeClass {
    /// All shapes fixed at compile time.
    Static,
    /// Shapes known once every input shape is known.
    InputShapes,
    /// Shapes known only after the node's compute runs.
    Compute,
    /// Shapes bounded by a value range attached to the input.
    ValueRange,
}

impl ShapeClass {
    pub fn from_attr(s: &str) -> Option<Self> {
        match s {
            "static" => Some(ShapeClass::Static),
            "input_shapes" => Some(ShapeClass::InputShapes),
            "compute" => Some(ShapeClass::Compute),
            "value_range" => Some(ShapeClass::ValueRange),
            _ => None,
        }
    }
}

/// Scalar comparison evaluated by Switch-family nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn from_attr(s: &str) -> Option<Self> {
        match s {
            "eq" => Some(CompareOp::Eq),
            "ne" => Some(CompareOp::Ne),
            "lt" => Some(CompareOp::Lt),
            "le" => Some(CompareOp::Le),
            "gt" => Some(CompareOp::Gt),
            "ge" => Some(CompareOp::Ge),
            _ => None,
        }
    }

    /// Evaluate the comparison over two scalar tensors.
    pub fn evaluate(&self, lhs: &TensorValue, rhs: &TensorValue) -> AxonResult<bool> {
        let (a, b) = match (lhs.scalar_f64(), rhs.scalar_f64()) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                return Err(AxonError::internal(
                    "switch comparison requires scalar numeric inputs",
                ))
            }
        };
        Ok(match self {
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
            CompareOp::Gt => a > b,
            CompareOp::Ge => a >= b,
        })
    }
}

/// Embedded subgraph of a statically-known fused cluster, with the index
/// mappings that cross the cluster boundary.
#[derive(Debug, Clone)]
pub struct FusedSubgraph {
    pub graph: Graph,
    /// Outer input index -> inner Data node id.
    pub input_map: Vec<NodeId>,
    /// Outer output index -> (inner producer node id, producer output slot).
    pub output_map: Vec<(NodeId, usize)>,
    /// Inner nodes in execution order, return/Data plumbing excluded.
    pub topo: Vec<NodeId>,
}

/// One data delivery: which output slot feeds which successor input slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendEdge {
    pub src_slot: usize,
    pub dst: NodeId,
    pub dst_slot: usize,
}

/// Immutable static descriptor of one graph node.
pub struct NodeItem {
    pub node_id: NodeId,
    pub name: String,
    pub op_type: String,
    pub kind: NodeKind,
    pub num_inputs: usize,
    pub num_outputs: usize,
    /// Position of this node's first input in the invocation's flattened
    /// input tensor array.
    pub input_offset: usize,
    /// Position of this node's first output in the flattened output array.
    pub output_offset: usize,

    pub shape_class: ShapeClass,
    /// Whether any input or output shape is unknown at compile time.
    /// Cleared after inference if every shape became concrete.
    dynamic: AtomicBool,
    pub input_descs: Vec<TensorDesc>,
    pub output_descs: Vec<TensorDesc>,
    /// Number of inputs whose shape is already static; pre-counted toward
    /// the shape-readiness threshold when runtime state is created.
    pub static_input_count: usize,
    /// Eagerly computed output byte sizes, present only when every output
    /// shape is static with a fixed-size element type.
    pub output_sizes: Option<Vec<usize>>,

    /// Data successors fed by this node's outputs.
    pub data_send: Vec<SendEdge>,
    /// Ordinary control successors. Excludes edges into Merge-family nodes
    /// when this node is Enter-fed (see builder).
    pub ctrl_send: Vec<NodeId>,
    /// Per-branch successor groups for Switch-family nodes, indexed by
    /// branch selection.
    pub switch_groups: Vec<Vec<(NodeId, usize)>>,
    /// Whether this node is reached from an Enter strictly through
    /// identity-like nodes (bounded-depth pattern match).
    pub enter_fed: bool,
    /// Whether this node marks its frame's entry (Enter nodes).
    pub root_of_frame: bool,
    pub frame_id: i64,
    pub parent_frame_id: i64,
    /// For Merge-family nodes: input slots fed by Enter/NextIteration
    /// chains (the frame entry and the loop back edge).
    pub back_edge_slots: Vec<usize>,

    /// Tensor-readiness threshold: arrivals required before dispatch.
    pub data_wait_count: usize,
    /// Shape-readiness threshold for inference.
    pub shape_wait_count: usize,
    /// Amount consumed from the readiness counter when the node fires.
    /// Loop-invariant arrivals (constants, variables) are counted once and
    /// not consumed, so frame nodes re-fire on back-edge deliveries alone.
    pub refire_decrement: usize,

    /// Input slots exempt from byte-size validation.
    pub no_size_check: Vec<usize>,
    /// Input slots fed by constants/variables: kept alive across loop
    /// iterations when input buffers are released.
    pub persistent_input_slots: Vec<usize>,
    pub compare_op: Option<CompareOp>,
    pub engine_name: Option<String>,
    pub runtime_dynamic: bool,

    pub fused: Option<FusedSubgraph>,

    bound_task: OnceCell<Arc<dyn Task>>,
    bound_executor: OnceCell<ExecutorKind>,
}

impl NodeItem {
    /// Whether any shape is still unknown at compile time.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic.load(Ordering::Acquire)
    }

    /// Late-bound correction: every shape became concrete after inference.
    pub fn mark_static_resolved(&self) {
        self.dynamic.store(false, Ordering::Release);
    }

    /// Bound task, created once and reused across invocations.
    pub fn bound_task(&self) -> Option<&Arc<dyn Task>> {
        self.bound_task.get()
    }

    /// Bind or fetch the task for this node.
    pub fn bind_task_with<F>(&self, build: F) -> AxonResult<&Arc<dyn Task>>
    where
        F: FnOnce() -> AxonResult<Arc<dyn Task>>,
    {
        self.bound_task.get_or_try_init(build)
    }

    /// Bound executor kind, resolved once and cached.
    pub fn bind_executor_with<F>(&self, resolve: F) -> AxonResult<ExecutorKind>
    where
        F: FnOnce() -> AxonResult<ExecutorKind>,
    {
        self.bound_executor.get_or_try_init(resolve).map(|kind| *kind)
    }

    /// True when every output shape (and byte size) was fixed at build time.
    pub fn outputs_static(&self) -> bool {
        self.output_sizes.is_some()
    }
}

impl std::fmt::Debug for NodeItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeItem")
            .field("node_id", &self.node_id)
            .field("name", &self.name)
            .field("op_type", &self.op_type)
            .field("shape_class", &self.shape_class)
            .field("dynamic", &self.is_dynamic())
            .field("frame_id", &self.frame_id)
            .field("data_wait_count", &self.data_wait_count)
            .finish()
    }
}

/// Shared descriptor arena, indexed by node id.
pub type NodeItemTable = Arc<Vec<Arc<NodeItem>>>;

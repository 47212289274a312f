//! Compiled-graph model consumed by the execution engine.
//!
//! The engine does not define graph topology; it consumes a topologically
//! ordered node list with anchor-style edge queries (predecessor/successor,
//! by data or control) and per-node attributes produced by the compiler.
//! This module holds the minimal representation of that contract.

use std::collections::HashMap;

use crate::shape::TensorDesc;

/// Index of a node inside its graph. All cross-references between nodes are
/// plain indices into the graph's node arena, never owning pointers.
pub type NodeId = usize;

/// Well-known attribute keys set by the graph compiler.
pub mod attr {
    /// Engine/library name used for executor resolution.
    pub const ENGINE_NAME: &str = "_engine_name";
    /// Explicit shape-dependence classification.
    pub const SHAPE_CLASS: &str = "_shape_class";
    /// Frame (loop activation) id the node belongs to.
    pub const FRAME_ID: &str = "_frame_id";
    /// Parent frame id for nested frames.
    pub const PARENT_FRAME_ID: &str = "_parent_frame_id";
    /// Index of a Data/return node inside a fused subgraph.
    pub const PARENT_INDEX: &str = "_parent_index";
    /// Embedded fused subgraph.
    pub const FUSED_GRAPH: &str = "_fused_graph";
    /// Comparison operator for Switch-family nodes.
    pub const COMPARE_OP: &str = "_compare_op";
    /// Input indices exempt from byte-size validation.
    pub const NO_SIZE_CHECK: &str = "_no_size_check";
    /// Marks a structured-control op whose subgraph is still dynamic at
    /// runtime.
    pub const RUNTIME_DYNAMIC: &str = "_runtime_dynamic";
}

/// Closed set of node roles the scheduler special-cases. Everything the
/// scheduler does not need to distinguish collapses into `Compute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Data,
    Constant,
    Variable,
    NetOutput,
    Identity,
    Enter,
    Exit,
    Merge,
    StreamMerge,
    Switch,
    StreamSwitch,
    NextIteration,
    If,
    Case,
    While,
    FunctionCall,
    Compute,
}

impl NodeKind {
    /// Derive the scheduler-visible kind from the compiler's op-type string.
    pub fn from_op_type(op_type: &str) -> Self {
        match op_type {
            "Data" | "RefData" => NodeKind::Data,
            "Const" | "Constant" => NodeKind::Constant,
            "Variable" | "RefVariable" => NodeKind::Variable,
            "NetOutput" => NodeKind::NetOutput,
            "Identity" | "ReadVariableOp" | "Reshape" => NodeKind::Identity,
            "Enter" | "RefEnter" => NodeKind::Enter,
            "Exit" | "RefExit" => NodeKind::Exit,
            "Merge" | "RefMerge" => NodeKind::Merge,
            "StreamMerge" => NodeKind::StreamMerge,
            "Switch" | "RefSwitch" => NodeKind::Switch,
            "StreamSwitch" => NodeKind::StreamSwitch,
            "NextIteration" | "RefNextIteration" => NodeKind::NextIteration,
            "If" | "StatelessIf" => NodeKind::If,
            "Case" => NodeKind::Case,
            "While" | "StatelessWhile" => NodeKind::While,
            "PartitionedCall" | "StatefulPartitionedCall" => NodeKind::FunctionCall,
            _ => NodeKind::Compute,
        }
    }

    /// Merge-family join nodes (n-way, one live predecessor per iteration).
    pub fn is_merge_family(&self) -> bool {
        matches!(self, NodeKind::Merge | NodeKind::StreamMerge)
    }

    /// Switch-family branch nodes.
    pub fn is_switch_family(&self) -> bool {
        matches!(self, NodeKind::Switch | NodeKind::StreamSwitch)
    }

    /// Structured control operators expressed as graph nodes.
    pub fn is_structured_control(&self) -> bool {
        matches!(self, NodeKind::If | NodeKind::Case | NodeKind::While)
    }

    /// All control-flow operators handled by the control-op executor.
    pub fn is_control_op(&self) -> bool {
        self.is_merge_family()
            || self.is_switch_family()
            || self.is_structured_control()
            || matches!(
                self,
                NodeKind::Enter | NodeKind::Exit | NodeKind::NextIteration
            )
    }

    /// Copy-like nodes that forward their single input unchanged. Used by
    /// the bounded Enter-chain pattern match.
    pub fn is_identity_like(&self) -> bool {
        matches!(self, NodeKind::Identity)
    }
}

/// A small tagged attribute value attached to a node by the compiler.
#[derive(Debug, Clone)]
pub enum AttrValue {
    Int(i64),
    Str(String),
    Bool(bool),
    IntList(Vec<i64>),
    Graph(Box<Graph>),
}

impl AttrValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int_list(&self) -> Option<&[i64]> {
        match self {
            AttrValue::IntList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_graph(&self) -> Option<&Graph> {
        match self {
            AttrValue::Graph(g) => Some(g),
            _ => None,
        }
    }
}

/// A data edge into a node: which predecessor output feeds which input slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataEdge {
    pub src: NodeId,
    pub src_index: usize,
    pub dst_index: usize,
}

/// An outgoing data edge, kept as a reverse adjacency for successor queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutEdge {
    pub dst: NodeId,
    pub src_index: usize,
    pub dst_index: usize,
}

/// One node of the compiled graph.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: NodeId,
    pub name: String,
    pub op_type: String,
    pub kind: NodeKind,
    /// Incoming data edges, ordered by destination input slot.
    pub inputs: Vec<DataEdge>,
    /// Outgoing data edges (reverse adjacency).
    pub outputs: Vec<OutEdge>,
    /// Incoming control edges.
    pub control_inputs: Vec<NodeId>,
    /// Outgoing control edges (reverse adjacency).
    pub control_outputs: Vec<NodeId>,
    pub num_inputs: usize,
    pub num_outputs: usize,
    /// Compile-time input tensor descriptors, one per input slot.
    pub input_descs: Vec<TensorDesc>,
    /// Compile-time output tensor descriptors, one per output slot.
    pub output_descs: Vec<TensorDesc>,
    pub attrs: HashMap<String, AttrValue>,
}

impl GraphNode {
    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }
}

/// A compiled computation graph: a topologically ordered node arena plus
/// the graph-level input/output node lists.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub name: String,
    nodes: Vec<GraphNode>,
    pub input_ids: Vec<NodeId>,
    pub output_ids: Vec<NodeId>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Graph {
            name: name.into(),
            nodes: Vec::new(),
            input_ids: Vec::new(),
            output_ids: Vec::new(),
        }
    }

    /// Append a node. Nodes must be added in topological order; the engine
    /// relies on the compiler having ordered them.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        op_type: impl Into<String>,
        num_inputs: usize,
        num_outputs: usize,
    ) -> NodeId {
        let id = self.nodes.len();
        let op_type = op_type.into();
        let kind = NodeKind::from_op_type(&op_type);
        self.nodes.push(GraphNode {
            id,
            name: name.into(),
            op_type,
            kind,
            inputs: Vec::new(),
            outputs: Vec::new(),
            control_inputs: Vec::new(),
            control_outputs: Vec::new(),
            num_inputs,
            num_outputs,
            input_descs: vec![TensorDesc::unknown(); num_inputs],
            output_descs: vec![TensorDesc::unknown(); num_outputs],
            attrs: HashMap::new(),
        });
        match self.nodes[id].kind {
            NodeKind::Data => self.input_ids.push(id),
            NodeKind::NetOutput => self.output_ids.push(id),
            _ => {}
        }
        id
    }

    pub fn add_data_edge(&mut self, src: NodeId, src_index: usize, dst: NodeId, dst_index: usize) {
        self.nodes[dst].inputs.push(DataEdge {
            src,
            src_index,
            dst_index,
        });
        self.nodes[src].outputs.push(OutEdge {
            dst,
            src_index,
            dst_index,
        });
    }

    pub fn add_control_edge(&mut self, src: NodeId, dst: NodeId) {
        self.nodes[dst].control_inputs.push(src);
        self.nodes[src].control_outputs.push(dst);
    }

    pub fn set_attr(&mut self, id: NodeId, key: &str, value: AttrValue) {
        self.nodes[id].attrs.insert(key.to_string(), value);
    }

    pub fn set_input_desc(&mut self, id: NodeId, index: usize, desc: TensorDesc) {
        self.nodes[id].input_descs[index] = desc;
    }

    pub fn set_output_desc(&mut self, id: NodeId, index: usize, desc: TensorDesc) {
        self.nodes[id].output_descs[index] = desc;
    }

    pub fn node(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

//! Descriptor builder: one pass over the compiled graph at load time.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::error::{AxonError, AxonResult};
use crate::graph::{attr, Graph, NodeId, NodeKind};

use super::{
    CompareOp, FusedSubgraph, NodeItem, NodeItemTable, SendEdge, ShapeClass,
    ENTER_CHAIN_MAX_DEPTH,
};

/// Root of a bounded identity chain, when one exists.
fn chain_root(graph: &Graph, start: NodeId) -> Option<NodeKind> {
    let mut id = start;
    for _ in 0..=ENTER_CHAIN_MAX_DEPTH {
        let node = graph.node(id);
        match node.kind {
            NodeKind::Enter | NodeKind::NextIteration => return Some(node.kind),
            k if k.is_identity_like() => {
                // An intervening control input breaks the chain.
                if !node.control_inputs.is_empty() {
                    return None;
                }
                id = node.inputs.first()?.src;
            }
            _ => return None,
        }
    }
    None
}

/// Whether a node is fed from an Enter strictly through identity-like
/// nodes. Such a node supplies frame-internal values, so its edges into
/// Merge-family joins are not ordinary dependencies.
fn is_enter_fed(graph: &Graph, id: NodeId) -> bool {
    let node = graph.node(id);
    node.kind != NodeKind::Enter
        && node
            .inputs
            .iter()
            .any(|e| chain_root(graph, e.src) == Some(NodeKind::Enter))
}

fn build_error(graph: &Graph, id: NodeId, reason: impl Into<String>) -> AxonError {
    let node = graph.node(id);
    AxonError::DescriptorBuild {
        node: node.name.clone(),
        op_type: node.op_type.clone(),
        reason: reason.into(),
    }
}

/// Parse the embedded subgraph of a fused cluster: map outer inputs to
/// inner Data nodes, replace the return nodes with a single synthetic
/// output node, and record the boundary mappings.
fn parse_fused(graph: &Graph, id: NodeId, inner: &Graph) -> AxonResult<FusedSubgraph> {
    let mut inner = inner.clone();

    // Outer input index -> inner Data node, ordered by parent index.
    let mut data_nodes: Vec<(i64, NodeId)> = Vec::new();
    let mut return_nodes: Vec<(i64, NodeId)> = Vec::new();
    for node in inner.nodes() {
        match node.kind {
            NodeKind::Data | NodeKind::NetOutput => {
                let parent = node
                    .attr(attr::PARENT_INDEX)
                    .and_then(|v| v.as_int())
                    .ok_or_else(|| AxonError::MissingAttribute {
                        node: node.name.clone(),
                        attr: attr::PARENT_INDEX.to_string(),
                    })?;
                if node.kind == NodeKind::Data {
                    data_nodes.push((parent, node.id));
                } else {
                    return_nodes.push((parent, node.id));
                }
            }
            _ => {}
        }
    }
    data_nodes.sort_by_key(|&(parent, _)| parent);
    return_nodes.sort_by_key(|&(parent, _)| parent);

    let input_map: Vec<NodeId> = data_nodes.iter().map(|&(_, id)| id).collect();

    // Gather the return edges in parent order, then splice in the synthetic
    // output node so the cluster presents a single output boundary.
    let mut output_map: Vec<(NodeId, usize)> = Vec::new();
    for &(_, ret) in &return_nodes {
        let mut edges = inner.node(ret).inputs.clone();
        edges.sort_by_key(|e| e.dst_index);
        for edge in edges {
            output_map.push((edge.src, edge.src_index));
        }
    }
    let outer = graph.node(id);
    if output_map.len() != outer.num_outputs {
        return Err(build_error(
            graph,
            id,
            format!(
                "fused subgraph returns {} tensors but node declares {} outputs",
                output_map.len(),
                outer.num_outputs
            ),
        ));
    }

    let strip_before = inner.len();
    let synthetic = inner.add_node(
        format!("{}_output", outer.name),
        "NetOutput",
        output_map.len(),
        output_map.len(),
    );
    for (slot, &(src, src_index)) in output_map.iter().enumerate() {
        inner.add_data_edge(src, src_index, synthetic, slot);
    }

    // Inner execution order: the arena is topological; Data and the
    // (replaced) return nodes run only as boundary plumbing.
    let topo: Vec<NodeId> = inner
        .nodes()
        .iter()
        .take(strip_before)
        .filter(|n| !matches!(n.kind, NodeKind::Data | NodeKind::NetOutput))
        .map(|n| n.id)
        .collect();

    Ok(FusedSubgraph {
        graph: inner,
        input_map,
        output_map,
        topo,
    })
}

/// Build the immutable descriptor arena for a compiled graph.
///
/// Fails with a build-time error on inconsistent output counts or missing
/// role attributes; a failed build rejects the whole graph.
pub fn build_node_items(graph: &Graph) -> AxonResult<NodeItemTable> {
    let mut items: Vec<Arc<NodeItem>> = Vec::with_capacity(graph.len());
    let mut input_offset = 0usize;
    let mut output_offset = 0usize;

    for node in graph.nodes() {
        // Peer-consistency check: every consumed output slot must exist.
        for edge in &node.inputs {
            let src = graph.node(edge.src);
            if edge.src_index >= src.num_outputs {
                return Err(build_error(
                    graph,
                    node.id,
                    format!(
                        "input {} reads output {} of '{}' which has only {} outputs",
                        edge.dst_index, edge.src_index, src.name, src.num_outputs
                    ),
                ));
            }
        }

        let runtime_dynamic = node
            .attr(attr::RUNTIME_DYNAMIC)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let all_static = node.input_descs.iter().all(|d| d.is_static())
            && node.output_descs.iter().all(|d| d.is_static());

        // Classification from the attribute if present, otherwise defaulted
        // by role. Runtime-dynamic structured control (and dynamic function
        // calls) force "known only after compute": the control selection
        // itself is only known at runtime.
        let forced_compute = (node.kind.is_structured_control() && runtime_dynamic)
            || (node.kind == NodeKind::FunctionCall && !all_static);
        let shape_class = if forced_compute {
            ShapeClass::Compute
        } else {
            node.attr(attr::SHAPE_CLASS)
                .and_then(|v| v.as_str())
                .and_then(ShapeClass::from_attr)
                .unwrap_or(if all_static {
                    ShapeClass::Static
                } else {
                    ShapeClass::InputShapes
                })
        };

        let static_input_count = node.input_descs.iter().filter(|d| d.is_static()).count();
        let output_sizes: Option<Vec<usize>> = node
            .output_descs
            .iter()
            .map(|d| d.size_bytes())
            .collect::<Option<Vec<usize>>>()
            .filter(|_| node.output_descs.iter().all(|d| d.is_static()));

        // Dependency sets from one walk of the (reverse) adjacency. An
        // Enter/NextIteration-rooted predecessor of a Merge-family node is
        // not an ordinary control dependency: counting it would deadlock
        // the first iteration on a same-frame value that does not exist
        // yet.
        let data_send: Vec<SendEdge> = node
            .outputs
            .iter()
            .map(|e| SendEdge {
                src_slot: e.src_index,
                dst: e.dst,
                dst_slot: e.dst_index,
            })
            .collect();
        let enter_fed = is_enter_fed(graph, node.id);
        let frame_fed = chain_root(graph, node.id).is_some() || enter_fed;
        let ctrl_send: Vec<NodeId> = node
            .control_outputs
            .iter()
            .copied()
            .filter(|&dst| !(graph.node(dst).kind.is_merge_family() && frame_fed))
            .collect();

        let switch_groups: Vec<Vec<(NodeId, usize)>> = if node.kind.is_switch_family() {
            (0..node.num_outputs)
                .map(|branch| {
                    node.outputs
                        .iter()
                        .filter(|e| e.src_index == branch)
                        .map(|e| (e.dst, e.dst_index))
                        .collect()
                })
                .collect()
        } else {
            Vec::new()
        };

        let back_edge_slots: Vec<usize> = if node.kind.is_merge_family() {
            node.inputs
                .iter()
                .filter(|e| chain_root(graph, e.src).is_some())
                .map(|e| e.dst_index)
                .collect()
        } else {
            Vec::new()
        };

        // Readiness thresholds. A Merge-family join expects exactly one
        // live predecessor per iteration; everything else waits for all
        // data and ordinary control arrivals.
        let ordinary_ctrl = node
            .control_inputs
            .iter()
            .filter(|&&src| {
                !(node.kind.is_merge_family()
                    && (chain_root(graph, src).is_some() || is_enter_fed(graph, src)))
            })
            .count();
        let (data_wait_count, refire_decrement) = if node.kind.is_merge_family() {
            (1, 1)
        } else {
            let threshold = node.num_inputs + ordinary_ctrl;
            let varying = node
                .inputs
                .iter()
                .filter(|e| {
                    !matches!(
                        graph.node(e.src).kind,
                        NodeKind::Constant | NodeKind::Variable
                    )
                })
                .count()
                + ordinary_ctrl;
            let decrement = if threshold == 0 {
                0
            } else if varying == 0 {
                threshold
            } else {
                varying
            };
            (threshold, decrement)
        };
        let shape_wait_count = if node.kind.is_merge_family() {
            1
        } else {
            node.num_inputs
        };

        let fused = match node.attr(attr::FUSED_GRAPH).and_then(|v| v.as_graph()) {
            Some(inner) => Some(parse_fused(graph, node.id, inner)?),
            None => None,
        };

        let frame_id = node
            .attr(attr::FRAME_ID)
            .and_then(|v| v.as_int())
            .unwrap_or(0);
        let parent_frame_id = node
            .attr(attr::PARENT_FRAME_ID)
            .and_then(|v| v.as_int())
            .unwrap_or(-1);

        let no_size_check = node
            .attr(attr::NO_SIZE_CHECK)
            .and_then(|v| v.as_int_list())
            .map(|l| l.iter().map(|&i| i as usize).collect())
            .unwrap_or_default();

        let compare_op = node
            .attr(attr::COMPARE_OP)
            .and_then(|v| v.as_str())
            .and_then(CompareOp::from_attr);
        if node.kind.is_switch_family() && compare_op.is_none() {
            return Err(AxonError::MissingAttribute {
                node: node.name.clone(),
                attr: attr::COMPARE_OP.to_string(),
            });
        }

        let persistent_input_slots: Vec<usize> = node
            .inputs
            .iter()
            .filter(|e| {
                matches!(
                    graph.node(e.src).kind,
                    NodeKind::Constant | NodeKind::Variable
                )
            })
            .map(|e| e.dst_index)
            .collect();

        let engine_name = node
            .attr(attr::ENGINE_NAME)
            .and_then(|v| v.as_str())
            .map(String::from);

        items.push(Arc::new(NodeItem {
            node_id: node.id,
            name: node.name.clone(),
            op_type: node.op_type.clone(),
            kind: node.kind,
            num_inputs: node.num_inputs,
            num_outputs: node.num_outputs,
            input_offset,
            output_offset,
            shape_class,
            dynamic: AtomicBool::new(!all_static),
            input_descs: node.input_descs.clone(),
            output_descs: node.output_descs.clone(),
            static_input_count,
            output_sizes,
            data_send,
            ctrl_send,
            switch_groups,
            enter_fed,
            root_of_frame: node.kind == NodeKind::Enter,
            frame_id,
            parent_frame_id,
            back_edge_slots,
            data_wait_count,
            shape_wait_count,
            refire_decrement,
            no_size_check,
            persistent_input_slots,
            compare_op,
            engine_name,
            runtime_dynamic,
            fused,
            bound_task: OnceCell::new(),
            bound_executor: OnceCell::new(),
        }));

        input_offset += node.num_inputs;
        output_offset += node.num_outputs;
    }

    Ok(Arc::new(items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::AttrValue;
    use crate::shape::{DataType, TensorDesc};

    fn static_desc(dims: Vec<i64>) -> TensorDesc {
        TensorDesc::new(dims, DataType::Float32)
    }

    #[test]
    fn static_node_gets_eager_output_sizes() {
        let mut g = Graph::new("g");
        let d = g.add_node("d", "Data", 0, 1);
        g.set_output_desc(d, 0, static_desc(vec![2, 2]));
        let r = g.add_node("r", "Relu", 1, 1);
        g.set_input_desc(r, 0, static_desc(vec![2, 2]));
        g.set_output_desc(r, 0, static_desc(vec![2, 2]));
        g.add_data_edge(d, 0, r, 0);

        let items = build_node_items(&g).unwrap();
        let item = &items[r];
        assert_eq!(item.shape_class, ShapeClass::Static);
        assert!(!item.is_dynamic());
        assert_eq!(item.static_input_count, 1);
        assert_eq!(item.output_sizes, Some(vec![16]));
        assert_eq!(
            items[d].data_send,
            vec![SendEdge {
                src_slot: 0,
                dst: r,
                dst_slot: 0
            }]
        );
    }

    #[test]
    fn dynamic_while_is_forced_to_compute_class() {
        let mut g = Graph::new("g");
        let w = g.add_node("loop", "While", 1, 1);
        g.set_attr(w, attr::RUNTIME_DYNAMIC, AttrValue::Bool(true));
        g.set_attr(w, attr::SHAPE_CLASS, AttrValue::Str("input_shapes".into()));

        let items = build_node_items(&g).unwrap();
        assert_eq!(items[w].shape_class, ShapeClass::Compute);
    }

    #[test]
    fn enter_chain_is_not_an_ordinary_merge_dependency() {
        let mut g = Graph::new("g");
        let d = g.add_node("d", "Data", 0, 1);
        let enter = g.add_node("enter", "Enter", 1, 1);
        let ident = g.add_node("ident", "Identity", 1, 1);
        let merge = g.add_node("merge", "Merge", 2, 1);
        let plain = g.add_node("plain", "Relu", 1, 1);
        g.add_data_edge(d, 0, enter, 0);
        g.add_data_edge(enter, 0, ident, 0);
        g.add_data_edge(ident, 0, merge, 0);
        g.add_control_edge(ident, merge);
        g.add_control_edge(ident, plain);

        let items = build_node_items(&g).unwrap();
        // The Enter-fed identity keeps the control edge to the plain node
        // but drops the one into the merge.
        assert_eq!(items[ident].ctrl_send, vec![plain]);
        assert!(items[ident].enter_fed);
        assert_eq!(items[merge].data_wait_count, 1);
        assert_eq!(items[merge].back_edge_slots, vec![0]);
    }

    #[test]
    fn chain_depth_is_bounded() {
        let mut g = Graph::new("g");
        let d = g.add_node("d", "Data", 0, 1);
        let enter = g.add_node("enter", "Enter", 1, 1);
        g.add_data_edge(d, 0, enter, 0);
        let mut prev = enter;
        for i in 0..(ENTER_CHAIN_MAX_DEPTH + 2) {
            let ident = g.add_node(format!("i{i}"), "Identity", 1, 1);
            g.add_data_edge(prev, 0, ident, 0);
            prev = ident;
        }
        assert_eq!(chain_root(&g, prev), None);
    }

    #[test]
    fn bad_output_index_is_a_build_error() {
        let mut g = Graph::new("g");
        let d = g.add_node("d", "Data", 0, 1);
        let r = g.add_node("r", "Relu", 1, 1);
        g.add_data_edge(d, 3, r, 0);

        let err = build_node_items(&g).unwrap_err();
        assert!(matches!(err, AxonError::DescriptorBuild { .. }));
    }

    #[test]
    fn switch_groups_follow_output_slots() {
        let mut g = Graph::new("g");
        let a = g.add_node("a", "Data", 0, 1);
        let b = g.add_node("b", "Const", 0, 1);
        let sw = g.add_node("sw", "Switch", 2, 2);
        g.set_attr(sw, attr::COMPARE_OP, AttrValue::Str("lt".into()));
        let f = g.add_node("f", "Relu", 1, 1);
        let t = g.add_node("t", "Relu", 1, 1);
        g.add_data_edge(a, 0, sw, 0);
        g.add_data_edge(b, 0, sw, 1);
        g.add_data_edge(sw, 0, f, 0);
        g.add_data_edge(sw, 1, t, 0);

        let items = build_node_items(&g).unwrap();
        assert_eq!(items[sw].switch_groups.len(), 2);
        assert_eq!(items[sw].switch_groups[0], vec![(f, 0)]);
        assert_eq!(items[sw].switch_groups[1], vec![(t, 0)]);
        // The constant predecessor is counted once and never consumed, so
        // the switch re-fires on each loop-varying arrival.
        assert_eq!(items[sw].data_wait_count, 2);
        assert_eq!(items[sw].refire_decrement, 1);
    }

    #[test]
    fn fused_subgraph_requires_parent_index() {
        let mut inner = Graph::new("inner");
        let d = inner.add_node("in0", "Data", 0, 1);
        // No parent index on the Data node.
        let r = inner.add_node("relu", "Relu", 1, 1);
        inner.add_data_edge(d, 0, r, 0);

        let mut g = Graph::new("g");
        let fused = g.add_node("fused", "FusedCluster", 1, 1);
        g.set_attr(fused, attr::FUSED_GRAPH, AttrValue::Graph(Box::new(inner)));

        let err = build_node_items(&g).unwrap_err();
        assert!(matches!(err, AxonError::MissingAttribute { .. }));
    }

    #[test]
    fn fused_boundary_preserves_contract() {
        let mut inner = Graph::new("inner");
        let d0 = inner.add_node("in0", "Data", 0, 1);
        inner.set_attr(d0, attr::PARENT_INDEX, AttrValue::Int(0));
        let d1 = inner.add_node("in1", "Data", 0, 1);
        inner.set_attr(d1, attr::PARENT_INDEX, AttrValue::Int(1));
        let add = inner.add_node("add", "Add", 2, 1);
        inner.add_data_edge(d0, 0, add, 0);
        inner.add_data_edge(d1, 0, add, 1);
        let ret = inner.add_node("ret", "NetOutput", 1, 1);
        inner.set_attr(ret, attr::PARENT_INDEX, AttrValue::Int(0));
        inner.add_data_edge(add, 0, ret, 0);

        let mut g = Graph::new("g");
        let fused = g.add_node("fused", "FusedCluster", 2, 1);
        g.set_attr(fused, attr::FUSED_GRAPH, AttrValue::Graph(Box::new(inner)));

        let items = build_node_items(&g).unwrap();
        let fsg = items[fused].fused.as_ref().unwrap();
        // Same external contract: two inputs, one output, same order.
        assert_eq!(fsg.input_map, vec![d0, d1]);
        assert_eq!(fsg.output_map, vec![(add, 0)]);
        // Inner plumbing is excluded from independent scheduling.
        assert_eq!(fsg.topo, vec![add]);
    }
}

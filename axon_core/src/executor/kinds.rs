//! The closed set of executor implementations behind [`ExecutorKind`].

use std::sync::Arc;

use crate::callback::CompletionCallback;
use crate::control::{EnterTask, ExitTask, MergeTask, NextIterationTask, SwitchTask};
use crate::descriptor::{FusedSubgraph, NodeItem};
use crate::error::{AxonError, AxonResult};
use crate::graph::NodeKind;
use crate::shape::{ShapeRegistry, TensorDesc, TensorValue};

use super::task::{KernelTable, KernelTask, NoopTask, Task, TaskContext};
use super::NodeExecutor;

fn dispatch_error(item: &NodeItem, reason: impl Into<String>) -> AxonError {
    AxonError::Dispatch {
        node: item.name.clone(),
        op_type: item.op_type.clone(),
        reason: reason.into(),
    }
}

enum LocalRole {
    /// Outputs prefilled before scheduling (graph inputs, constants,
    /// variables); the task only verifies they are present.
    Source,
    /// Forward every input slot to the matching output slot.
    Forward,
}

struct LocalTask {
    role: LocalRole,
}

impl Task for LocalTask {
    fn execute_async(&self, ctx: &mut TaskContext, done: CompletionCallback) -> AxonResult<()> {
        match self.role {
            LocalRole::Source => {
                let outputs = ctx.state.outputs.lock();
                if outputs.iter().any(|v| v.is_none()) {
                    return Err(AxonError::Dispatch {
                        node: ctx.node_name.clone(),
                        op_type: String::new(),
                        reason: "source node fired before its value was bound".to_string(),
                    });
                }
            }
            LocalRole::Forward => {
                let inputs = ctx.take_inputs()?;
                for (slot, value) in inputs.into_iter().enumerate() {
                    ctx.state.set_output(slot, value);
                }
            }
        }
        done();
        Ok(())
    }
}

/// Host-local plumbing nodes: graph inputs/outputs, constants, variables,
/// identity copies. Always inline, never on-device.
pub struct LocalExecutor;

impl NodeExecutor for LocalExecutor {
    fn kind_name(&self) -> &'static str {
        "local"
    }

    fn prepare_task(&self, item: &NodeItem, _ctx: &mut TaskContext) -> AxonResult<Arc<dyn Task>> {
        let task = item.bind_task_with(|| {
            // Zero-output nodes have no device work at all; completion is
            // immediate so downstream accounting proceeds uniformly.
            if item.num_outputs == 0 {
                return Ok(Arc::new(NoopTask) as Arc<dyn Task>);
            }
            let role = match item.kind {
                NodeKind::Data | NodeKind::Constant | NodeKind::Variable => LocalRole::Source,
                NodeKind::NetOutput | NodeKind::Identity => LocalRole::Forward,
                _ => {
                    return Err(dispatch_error(
                        item,
                        "node is not a host-local plumbing op",
                    ))
                }
            };
            Ok(Arc::new(LocalTask { role }) as Arc<dyn Task>)
        })?;
        Ok(Arc::clone(task))
    }
}

/// Control-flow operators executed inline on the dispatching thread.
pub struct ControlOpExecutor;

impl NodeExecutor for ControlOpExecutor {
    fn kind_name(&self) -> &'static str {
        "control_op"
    }

    fn prepare_task(&self, item: &NodeItem, _ctx: &mut TaskContext) -> AxonResult<Arc<dyn Task>> {
        let task = item.bind_task_with(|| {
            let task: Arc<dyn Task> = match item.kind {
                NodeKind::Enter => Arc::new(EnterTask),
                NodeKind::Exit => Arc::new(ExitTask),
                NodeKind::Merge | NodeKind::StreamMerge => Arc::new(MergeTask),
                NodeKind::Switch | NodeKind::StreamSwitch => {
                    let compare = item
                        .compare_op
                        .ok_or_else(|| dispatch_error(item, "switch without comparison"))?;
                    Arc::new(SwitchTask::new(compare))
                }
                NodeKind::NextIteration => Arc::new(NextIterationTask),
                // Structured control reaches the scheduler only when the
                // compiler failed to lower it to frame form.
                NodeKind::If | NodeKind::Case | NodeKind::While => {
                    return Err(dispatch_error(
                        item,
                        "structured control op was not lowered to frame form",
                    ))
                }
                _ => return Err(dispatch_error(item, "node is not a control op")),
            };
            Ok(task)
        })?;
        Ok(Arc::clone(task))
    }
}

/// Compute nodes launched through the kernel table onto a device stream.
/// One instance serves every device-class kind; the kind only differs in
/// placement, which the device runtime owns.
pub struct KernelExecutor {
    name: &'static str,
    kernels: Arc<KernelTable>,
}

impl KernelExecutor {
    pub fn new(name: &'static str, kernels: Arc<KernelTable>) -> Self {
        KernelExecutor { name, kernels }
    }
}

impl NodeExecutor for KernelExecutor {
    fn kind_name(&self) -> &'static str {
        self.name
    }

    fn prepare_task(&self, item: &NodeItem, ctx: &mut TaskContext) -> AxonResult<Arc<dyn Task>> {
        let task = item.bind_task_with(|| {
            let kernel = self
                .kernels
                .lookup(&item.op_type)
                .ok_or_else(|| dispatch_error(item, "no kernel registered for op type"))?;
            Ok(Arc::new(KernelTask::new(item.op_type.clone(), kernel)) as Arc<dyn Task>)
        })?;
        let task = Arc::clone(task);

        if let Some(sizes) = &item.output_sizes {
            ctx.workspace.resize(sizes.iter().sum(), 0);
        }

        // Shapes changed since the task was built: refresh the launch
        // parameters before this fire.
        if item.is_dynamic() {
            task.update_binary(ctx)?;
            task.update_tiling(ctx)?;
            task.update_args(ctx)?;
        }
        Ok(task)
    }
}

struct SubgraphTask {
    fused: FusedSubgraph,
    kernels: Arc<KernelTable>,
    shapes: Arc<ShapeRegistry>,
    /// Re-run shape inference per inner node before each kernel. Set for
    /// dynamic clusters whose inner shapes depend on this fire's inputs.
    refresh_shapes: bool,
}

impl Task for SubgraphTask {
    fn execute_async(&self, ctx: &mut TaskContext, done: CompletionCallback) -> AxonResult<()> {
        let outer_inputs = ctx.take_inputs()?;
        let graph = &self.fused.graph;

        let mut values: Vec<Vec<Option<TensorValue>>> = graph
            .nodes()
            .iter()
            .map(|n| vec![None; n.num_outputs])
            .collect();
        for (slot, &data_id) in self.fused.input_map.iter().enumerate() {
            values[data_id][0] = outer_inputs.get(slot).cloned();
        }

        for &id in &self.fused.topo {
            let node = graph.node(id);
            let mut edges = node.inputs.clone();
            edges.sort_by_key(|e| e.dst_index);
            let inputs: Vec<TensorValue> = edges
                .iter()
                .map(|e| {
                    values[e.src][e.src_index].clone().ok_or_else(|| {
                        AxonError::Dispatch {
                            node: node.name.clone(),
                            op_type: node.op_type.clone(),
                            reason: format!("inner input from node {} missing", e.src),
                        }
                    })
                })
                .collect::<AxonResult<_>>()?;

            if self.refresh_shapes {
                let descs: Vec<TensorDesc> = inputs.iter().map(|v| v.desc.clone()).collect();
                let f = self.shapes.lookup(&node.op_type);
                f(&node.op_type, &descs, &node.output_descs)?;
            }

            let kernel = self.kernels.lookup(&node.op_type).ok_or_else(|| {
                AxonError::Dispatch {
                    node: node.name.clone(),
                    op_type: node.op_type.clone(),
                    reason: "no kernel registered for fused inner op".to_string(),
                }
            })?;
            let outputs = kernel(&inputs)?;
            values[id] = outputs.into_iter().map(Some).collect();
        }

        for (slot, &(src, src_slot)) in self.fused.output_map.iter().enumerate() {
            let value = values[src][src_slot].clone().ok_or_else(|| {
                AxonError::Dispatch {
                    node: ctx.node_name.clone(),
                    op_type: String::new(),
                    reason: format!("fused output {slot} never produced"),
                }
            })?;
            ctx.state.set_output(slot, value);
        }
        done();
        Ok(())
    }
}

/// Fused clusters run as one schedulable unit: the inner nodes execute in
/// their embedded topological order without touching the outer scheduler.
pub struct SubgraphExecutor {
    name: &'static str,
    kernels: Arc<KernelTable>,
    shapes: Arc<ShapeRegistry>,
    dynamic: bool,
}

impl SubgraphExecutor {
    pub fn compiled(kernels: Arc<KernelTable>, shapes: Arc<ShapeRegistry>) -> Self {
        SubgraphExecutor {
            name: "compiled_subgraph",
            kernels,
            shapes,
            dynamic: false,
        }
    }

    pub fn dynamic(kernels: Arc<KernelTable>, shapes: Arc<ShapeRegistry>) -> Self {
        SubgraphExecutor {
            name: "dynamic_subgraph",
            kernels,
            shapes,
            dynamic: true,
        }
    }
}

impl NodeExecutor for SubgraphExecutor {
    fn kind_name(&self) -> &'static str {
        self.name
    }

    fn prepare_task(&self, item: &NodeItem, _ctx: &mut TaskContext) -> AxonResult<Arc<dyn Task>> {
        let task = item.bind_task_with(|| {
            let fused = item
                .fused
                .clone()
                .ok_or_else(|| dispatch_error(item, "subgraph executor without fused graph"))?;
            Ok(Arc::new(SubgraphTask {
                fused,
                kernels: Arc::clone(&self.kernels),
                shapes: Arc::clone(&self.shapes),
                refresh_shapes: self.dynamic,
            }) as Arc<dyn Task>)
        })?;
        Ok(Arc::clone(task))
    }
}

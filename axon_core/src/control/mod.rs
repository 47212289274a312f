//! Graph-level control flow: frames and the Enter/Merge/Switch/
//! NextIteration/Exit task family.
//!
//! Loops are expressed structurally. Enter activates a frame, Merge joins
//! the frame entry with the loop back edge, Switch picks the continue or
//! exit branch from a scalar comparison, NextIteration feeds the next
//! iteration's Merge, and Exit deactivates the frame and forwards the loop
//! result out. Frame bookkeeping and selection indices are updated inline
//! on the dispatching thread; the forwarded value itself moves as an
//! asynchronous copy on the node's stream, so it stays ordered behind any
//! device work already queued there.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::callback::CompletionCallback;
use crate::descriptor::CompareOp;
use crate::error::{AxonError, AxonResult};
use crate::executor::{Task, TaskContext};
use crate::shape::TensorValue;

/// Per-invocation activation record of one loop frame.
pub struct FrameState {
    pub frame_id: i64,
    iterations: AtomicUsize,
    active: AtomicBool,
}

impl FrameState {
    pub fn new(frame_id: i64) -> Self {
        FrameState {
            frame_id,
            iterations: AtomicUsize::new(0),
            active: AtomicBool::new(false),
        }
    }

    pub fn activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Bump and return the new iteration count.
    pub fn next_iteration(&self) -> usize {
        self.iterations.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn iteration(&self) -> usize {
        self.iterations.load(Ordering::Acquire)
    }
}

fn take_input(ctx: &TaskContext, slot: usize) -> AxonResult<TensorValue> {
    ctx.state
        .inputs
        .lock()
        .get(slot)
        .cloned()
        .flatten()
        .ok_or_else(|| AxonError::Dispatch {
            node: ctx.node_name.clone(),
            op_type: String::new(),
            reason: format!("control op fired with empty input slot {slot}"),
        })
}

/// Enqueue the value transit on the node's stream: an async copy into the
/// output slot, then an event whose completion runs `done`. Completion
/// therefore cannot be observed before the copy has landed.
fn copy_to_output(
    ctx: &mut TaskContext,
    out_slot: usize,
    value: TensorValue,
    done: CompletionCallback,
) -> AxonResult<()> {
    let state = Arc::clone(&ctx.state);
    ctx.device.memcpy_async(
        ctx.stream,
        Box::new(move || state.set_output(out_slot, value)),
    )?;
    let event = ctx.device.create_event();
    ctx.device.record(ctx.stream, &event)?;
    ctx.callbacks.push(event, done)
}

fn transit_value(ctx: &mut TaskContext, in_slot: usize, done: CompletionCallback) -> AxonResult<()> {
    let value = take_input(ctx, in_slot)?;
    copy_to_output(ctx, 0, value, done)
}

/// Enter: activate the frame and forward the value into it.
pub struct EnterTask;

impl Task for EnterTask {
    fn execute_async(&self, ctx: &mut TaskContext, done: CompletionCallback) -> AxonResult<()> {
        if let Some(frame) = &ctx.frame {
            frame.activate();
        }
        transit_value(ctx, 0, done)
    }
}

/// Merge: forward whichever input arrived, recording the selection for
/// output propagation.
pub struct MergeTask;

impl Task for MergeTask {
    fn execute_async(&self, ctx: &mut TaskContext, done: CompletionCallback) -> AxonResult<()> {
        let slot = ctx.state.last_arrival().ok_or_else(|| AxonError::Dispatch {
            node: ctx.node_name.clone(),
            op_type: String::new(),
            reason: "merge fired with no recorded arrival".to_string(),
        })?;
        ctx.state.set_merge_index(slot);
        transit_value(ctx, slot, done)
    }
}

/// Switch: evaluate the scalar comparison and select a branch. The value
/// itself is input 0; input 1 is the comparison operand. Branch 1 is taken
/// when the comparison holds.
pub struct SwitchTask {
    compare: CompareOp,
}

impl SwitchTask {
    pub fn new(compare: CompareOp) -> Self {
        SwitchTask { compare }
    }
}

impl Task for SwitchTask {
    fn execute_async(&self, ctx: &mut TaskContext, done: CompletionCallback) -> AxonResult<()> {
        let (value, operand) = {
            let inputs = ctx.state.inputs.lock();
            let missing = || AxonError::Dispatch {
                node: ctx.node_name.clone(),
                op_type: String::new(),
                reason: "switch fired with missing operands".to_string(),
            };
            (
                inputs.first().cloned().flatten().ok_or_else(missing)?,
                inputs.get(1).cloned().flatten().ok_or_else(missing)?,
            )
        };
        let branch = usize::from(self.compare.evaluate(&value, &operand)?);
        ctx.state.set_branch_index(branch);
        copy_to_output(ctx, branch, value, done)
    }
}

/// NextIteration: advance the frame's iteration counter and feed the loop
/// back edge.
pub struct NextIterationTask;

impl Task for NextIterationTask {
    fn execute_async(&self, ctx: &mut TaskContext, done: CompletionCallback) -> AxonResult<()> {
        if let Some(frame) = &ctx.frame {
            frame.next_iteration();
        }
        transit_value(ctx, 0, done)
    }
}

/// Exit: deactivate the frame and forward the loop result out of it.
pub struct ExitTask;

impl Task for ExitTask {
    fn execute_async(&self, ctx: &mut TaskContext, done: CompletionCallback) -> AxonResult<()> {
        if let Some(frame) = &ctx.frame {
            frame.deactivate();
        }
        transit_value(ctx, 0, done)
    }
}

//! Executor registry and resolution.
//!
//! Every schedulable node is served by exactly one executor, chosen by a
//! fixed precedence: fused clusters first, host-local plumbing next,
//! control ops next, and finally the engine named by the node's attributes
//! (defaulting to the device-compute engine). Executor instances are
//! constructed lazily, cached, and shared; the registry is reference
//! counted so repeated engine setup and teardown is cheap and balanced.

mod kinds;
mod task;

pub use kinds::{ControlOpExecutor, KernelExecutor, LocalExecutor, SubgraphExecutor};
pub use task::{KernelFn, KernelTable, KernelTask, NoopTask, Task, TaskContext};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::callback::CompletionCallback;
use crate::descriptor::NodeItem;
use crate::error::{AxonError, AxonResult};
use crate::graph::NodeKind;
use crate::shape::{ShapeFn, ShapeRegistry};

/// Closed set of executor kinds. Resolution never produces anything
/// outside this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorKind {
    /// Statically compiled fused cluster.
    CompiledSubgraph,
    /// Fused cluster whose inner shapes resolve per fire.
    DynamicSubgraph,
    /// Host-local plumbing (inputs, outputs, constants, identity).
    Local,
    /// Enter/Merge/Switch/NextIteration/Exit family.
    ControlOp,
    /// Default device compute engine.
    DeviceCompute,
    /// Host CPU kernels.
    HostCpu,
    /// Auxiliary CPU engine.
    AuxCpu,
    /// Cross-device collective operations.
    Collective,
}

/// One executor implementation. Instances are shared across nodes and
/// invocations; per-node state lives in the bound task.
pub trait NodeExecutor: Send + Sync {
    fn kind_name(&self) -> &'static str;

    /// Build or fetch the node's task and refresh it for this fire.
    fn prepare_task(&self, item: &NodeItem, ctx: &mut TaskContext) -> AxonResult<Arc<dyn Task>>;

    /// Launch the prepared task.
    fn execute_task(
        &self,
        task: &Arc<dyn Task>,
        ctx: &mut TaskContext,
        done: CompletionCallback,
    ) -> AxonResult<()> {
        task.execute_async(ctx, done)
    }
}

impl std::fmt::Debug for dyn NodeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeExecutor")
            .field("kind_name", &self.kind_name())
            .finish()
    }
}

/// Zero-argument constructor for one executor kind, registered by engine
/// collaborators and invoked on the cache-miss path.
pub type ExecutorBuilder = Box<dyn Fn() -> AxonResult<Arc<dyn NodeExecutor>> + Send + Sync>;

struct RegistryInner {
    ref_count: usize,
    /// Engine-name attribute to executor kind.
    engines: HashMap<String, ExecutorKind>,
    builders: HashMap<ExecutorKind, ExecutorBuilder>,
    cache: HashMap<ExecutorKind, Arc<dyn NodeExecutor>>,
}

/// Shared executor registry: engine-name table, lazy executor cache, and
/// the kernel/shape tables every compute executor draws from.
pub struct ExecutorRegistry {
    inner: Mutex<RegistryInner>,
    kernels: Arc<KernelTable>,
    shapes: Arc<ShapeRegistry>,
}

fn default_builders(
    kernels: &Arc<KernelTable>,
    shapes: &Arc<ShapeRegistry>,
) -> HashMap<ExecutorKind, ExecutorBuilder> {
    let mut builders: HashMap<ExecutorKind, ExecutorBuilder> = HashMap::new();

    let (k, s) = (Arc::clone(kernels), Arc::clone(shapes));
    builders.insert(
        ExecutorKind::CompiledSubgraph,
        Box::new(move || Ok(Arc::new(SubgraphExecutor::compiled(Arc::clone(&k), Arc::clone(&s))))),
    );
    let (k, s) = (Arc::clone(kernels), Arc::clone(shapes));
    builders.insert(
        ExecutorKind::DynamicSubgraph,
        Box::new(move || Ok(Arc::new(SubgraphExecutor::dynamic(Arc::clone(&k), Arc::clone(&s))))),
    );
    builders.insert(ExecutorKind::Local, Box::new(|| Ok(Arc::new(LocalExecutor))));
    builders.insert(
        ExecutorKind::ControlOp,
        Box::new(|| Ok(Arc::new(ControlOpExecutor))),
    );
    for (kind, name) in [
        (ExecutorKind::DeviceCompute, "device_compute"),
        (ExecutorKind::HostCpu, "host_cpu"),
        (ExecutorKind::AuxCpu, "aux_cpu"),
        (ExecutorKind::Collective, "collective"),
    ] {
        let k = Arc::clone(kernels);
        builders.insert(
            kind,
            Box::new(move || Ok(Arc::new(KernelExecutor::new(name, Arc::clone(&k))))),
        );
    }
    builders
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        let kernels = Arc::new(KernelTable::new());
        let shapes = Arc::new(ShapeRegistry::new());
        let mut engines = HashMap::new();
        engines.insert("core".to_string(), ExecutorKind::DeviceCompute);
        engines.insert("host_cpu".to_string(), ExecutorKind::HostCpu);
        engines.insert("aux_cpu".to_string(), ExecutorKind::AuxCpu);
        engines.insert("collective".to_string(), ExecutorKind::Collective);
        let builders = default_builders(&kernels, &shapes);
        ExecutorRegistry {
            inner: Mutex::new(RegistryInner {
                ref_count: 0,
                engines,
                builders,
                cache: HashMap::new(),
            }),
            kernels,
            shapes,
        }
    }

    /// Map an engine-name attribute to an executor kind.
    pub fn register_engine(&self, name: impl Into<String>, kind: ExecutorKind) {
        self.inner.lock().engines.insert(name.into(), kind);
    }

    /// Replace the constructor invoked when an executor of `kind` is first
    /// needed. The next cache miss for the kind uses the new builder.
    pub fn register_builder(&self, kind: ExecutorKind, builder: ExecutorBuilder) {
        let mut inner = self.inner.lock();
        inner.builders.insert(kind, builder);
        inner.cache.remove(&kind);
    }

    pub fn register_kernel(&self, op_type: impl Into<String>, f: KernelFn) {
        self.kernels.register(op_type, f);
    }

    pub fn register_shape_fn(&self, op_type: impl Into<String>, f: ShapeFn) {
        self.shapes.register(op_type, f);
    }

    pub fn kernels(&self) -> &Arc<KernelTable> {
        &self.kernels
    }

    pub fn shapes(&self) -> &Arc<ShapeRegistry> {
        &self.shapes
    }

    /// Balanced with [`ExecutorRegistry::finalize`]. Only the first call
    /// per balance level does real work.
    pub fn ensure_initialized(&self) -> AxonResult<()> {
        let mut inner = self.inner.lock();
        inner.ref_count += 1;
        Ok(())
    }

    /// Drop one initialization reference; the last one releases every
    /// cached executor instance.
    pub fn finalize(&self) -> AxonResult<()> {
        let mut inner = self.inner.lock();
        if inner.ref_count == 0 {
            return Err(AxonError::NotInitialized(
                "executor registry finalized more times than initialized".to_string(),
            ));
        }
        inner.ref_count -= 1;
        if inner.ref_count == 0 {
            inner.cache.clear();
        }
        Ok(())
    }

    /// Resolve the executor kind for a node. Precedence: fused cluster,
    /// host-local plumbing, control op, then named engine.
    pub fn resolve_kind(&self, item: &NodeItem) -> AxonResult<ExecutorKind> {
        if item.fused.is_some() {
            return Ok(if item.runtime_dynamic {
                ExecutorKind::DynamicSubgraph
            } else {
                ExecutorKind::CompiledSubgraph
            });
        }
        match item.kind {
            NodeKind::Data
            | NodeKind::Constant
            | NodeKind::Variable
            | NodeKind::NetOutput
            | NodeKind::Identity => Ok(ExecutorKind::Local),
            k if k.is_control_op() => Ok(ExecutorKind::ControlOp),
            _ => match &item.engine_name {
                None => Ok(ExecutorKind::DeviceCompute),
                Some(name) => {
                    self.inner.lock().engines.get(name).copied().ok_or_else(|| {
                        AxonError::ExecutorResolution(format!(
                            "node '{}' names unknown engine '{name}'",
                            item.name
                        ))
                    })
                }
            },
        }
    }

    /// Fetch (lazily constructing) the executor instance for a kind.
    /// Construction failure is surfaced for this kind only; other kinds'
    /// cached instances are untouched, and a later call retries the
    /// builder.
    pub fn executor_for(&self, kind: ExecutorKind) -> AxonResult<Arc<dyn NodeExecutor>> {
        let mut inner = self.inner.lock();
        if inner.ref_count == 0 {
            return Err(AxonError::NotInitialized(
                "executor registry used before initialization".to_string(),
            ));
        }
        if let Some(exec) = inner.cache.get(&kind) {
            return Ok(Arc::clone(exec));
        }
        let builder = inner.builders.get(&kind).ok_or_else(|| {
            AxonError::ExecutorResolution(format!("no builder registered for {kind:?}"))
        })?;
        let exec = builder().map_err(|e| {
            AxonError::ExecutorResolution(format!("constructing {kind:?} executor failed: {e}"))
        })?;
        inner.cache.insert(kind, Arc::clone(&exec));
        Ok(exec)
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

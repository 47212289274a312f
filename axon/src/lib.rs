//! # AXON - Asynchronous eXecution Over Nodes
//!
//! AXON runs compiled tensor graphs on heterogeneous accelerator engines,
//! with just-in-time shape inference, asynchronous device dispatch, and
//! frame-based control flow.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use axon::prelude::*;
//! use axon::device::SimDevice;
//!
//! let mut graph = Graph::new("demo");
//! // ... populate from the compiler output ...
//! let registry = Arc::new(ExecutorRegistry::new());
//! let device = Arc::new(SimDevice::new());
//! let engine = ExecutionEngine::new(&graph, registry, device, EngineConfig::standard())?;
//! let outputs = engine.run(vec![])?;
//! # Ok::<(), AxonError>(())
//! ```

// Re-export core components
pub use axon_core::{self, *};

// Re-export commonly used dependencies
pub use anyhow;
pub use serde;
pub use thiserror;

/// The AXON prelude - everything you need to get started
pub mod prelude {
    // Engine types
    pub use axon_core::config::EngineConfig;
    pub use axon_core::engine::{ExecutionEngine, NodeState};

    // Graph and tensor types
    pub use axon_core::graph::{AttrValue, Graph, NodeId, NodeKind};
    pub use axon_core::shape::{DataType, TensorDesc, TensorValue};

    // Executors
    pub use axon_core::executor::{
        ExecutorBuilder, ExecutorKind, ExecutorRegistry, NodeExecutor, Task, TaskContext,
    };

    // Device runtime
    pub use axon_core::device::{DeviceRuntime, Event, Stream};

    // Error types
    pub use axon_core::error::{AxonError, AxonResult};
    pub type Result<T> = AxonResult<T>;

    // Common std types
    pub use std::sync::Arc;
}

/// Version of the AXON framework
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get the AXON version string
pub fn version() -> &'static str {
    VERSION
}

//! # AXON Core
//!
//! The core runtime of the AXON hybrid execution engine.
//!
//! AXON schedules compiled tensor graphs across heterogeneous accelerator
//! engines, resolving dynamic shapes just-in-time and overlapping host
//! dispatch with device execution. This crate provides the fundamental
//! building blocks:
//!
//! - **Graph**: the compiled-graph contract the engine consumes
//! - **Descriptors**: immutable per-node scheduling metadata built at load
//! - **Shape**: runtime shape inference and propagation
//! - **Executors**: the registry mapping nodes onto engine implementations
//! - **Engine**: counter-driven asynchronous dispatch
//! - **Control**: frame-based loop and branch execution
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use axon_core::{EngineConfig, ExecutionEngine, ExecutorRegistry};
//! use axon_core::device::SimDevice;
//! use axon_core::graph::Graph;
//!
//! let mut graph = Graph::new("demo");
//! // ... populate from the compiler output ...
//! let registry = Arc::new(ExecutorRegistry::new());
//! let device = Arc::new(SimDevice::new());
//! let engine = ExecutionEngine::new(&graph, registry, device, EngineConfig::standard())?;
//! let outputs = engine.run(vec![])?;
//! # Ok::<(), axon_core::AxonError>(())
//! ```

pub mod callback;
pub mod config;
pub mod control;
pub mod descriptor;
pub mod device;
pub mod engine;
pub mod error;
pub mod executor;
pub mod graph;
pub mod shape;

// Re-export commonly used types for easy access
pub use config::EngineConfig;
pub use engine::{ExecutionEngine, NodeState};
pub use error::{AxonError, AxonResult};
pub use executor::{ExecutorKind, ExecutorRegistry, Task, TaskContext};
pub use graph::{Graph, NodeId, NodeKind};
pub use shape::{DataType, TensorDesc, TensorValue};

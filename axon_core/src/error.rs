use thiserror::Error;

/// Result type used throughout the AXON core.
pub type AxonResult<T> = Result<T, AxonError>;

/// Unified error type for the hybrid execution engine.
///
/// Variants follow the failure taxonomy of the engine: descriptor build
/// failures are fatal to loading a graph, resolution failures are fatal to
/// the invocation but isolated per executor kind, and inference/dispatch/
/// completion failures abort the invocation as a whole.
#[derive(Debug, Error)]
pub enum AxonError {
    /// A node descriptor could not be built from the compiled graph.
    #[error("descriptor build failed for node '{node}' ({op_type}): {reason}")]
    DescriptorBuild {
        node: String,
        op_type: String,
        reason: String,
    },

    /// A required node attribute is absent.
    #[error("node '{node}' is missing required attribute '{attr}'")]
    MissingAttribute { node: String, attr: String },

    /// No executor is registered for an engine name, or the executor for a
    /// kind failed to construct or initialize.
    #[error("executor resolution failed: {0}")]
    ExecutorResolution(String),

    /// Shape inference failed for a node.
    #[error("shape inference failed for node '{node}' ({op_type}): {reason}")]
    ShapeInference {
        node: String,
        op_type: String,
        reason: String,
    },

    /// Input tensor validation failed during dispatch.
    #[error("input validation failed for node '{node}': {reason}")]
    Validation { node: String, reason: String },

    /// A dispatch step failed (allocation, device call, task launch).
    #[error("dispatch failed for node '{node}' ({op_type}): {reason}")]
    Dispatch {
        node: String,
        op_type: String,
        reason: String,
    },

    /// The completion worker failed waiting on a device event.
    #[error("device event wait failed: {0}")]
    Completion(String),

    /// The engine was used before initialization or after finalization.
    #[error("engine not initialized: {0}")]
    NotInitialized(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal invariant violation. The dependency graph guaranteed a
    /// condition that did not hold at runtime.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AxonError {
    /// Internal-error constructor for invariant violations.
    pub fn internal(msg: impl Into<String>) -> Self {
        AxonError::Internal(msg.into())
    }

    /// Configuration-error constructor.
    pub fn config(msg: impl Into<String>) -> Self {
        AxonError::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_identify_node_and_type() {
        let err = AxonError::Dispatch {
            node: "conv0".to_string(),
            op_type: "Conv2D".to_string(),
            reason: "stream launch rejected".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("conv0"));
        assert!(msg.contains("Conv2D"));
    }
}

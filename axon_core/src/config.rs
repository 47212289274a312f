//! Engine configuration.
//!
//! Plain data with serde support, loadable from TOML. Presets cover the
//! common deployments; individual fields can be overridden after choosing
//! a preset.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine::SIZE_CHECK_PADDING;
use crate::error::{AxonError, AxonResult};

/// Tunables of one [`crate::engine::ExecutionEngine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Dispatch worker threads draining the ready queue.
    pub dispatch_workers: usize,
    /// Whether input byte sizes are checked against resolved shapes
    /// before launch.
    pub validate_input_sizes: bool,
    /// Tolerated shortfall (bytes) before a size mismatch is fatal.
    pub size_check_padding: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            dispatch_workers: num_cpus::get(),
            validate_input_sizes: true,
            size_check_padding: SIZE_CHECK_PADDING,
        }
    }
}

impl EngineConfig {
    /// Default deployment: one worker per CPU, validation on.
    pub fn standard() -> Self {
        Self::default()
    }

    /// Deterministic single-worker dispatch, mainly for debugging.
    pub fn single_threaded() -> Self {
        EngineConfig {
            dispatch_workers: 1,
            ..Self::default()
        }
    }

    pub fn from_toml_str(s: &str) -> AxonResult<Self> {
        toml::from_str(s).map_err(|e| AxonError::config(format!("bad engine config: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> AxonResult<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            AxonError::config(format!(
                "cannot read config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_sane() {
        let cfg = EngineConfig::standard();
        assert!(cfg.dispatch_workers >= 1);
        assert!(cfg.validate_input_sizes);
        assert_eq!(EngineConfig::single_threaded().dispatch_workers, 1);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg = EngineConfig::from_toml_str("dispatch_workers = 2\n").unwrap();
        assert_eq!(cfg.dispatch_workers, 2);
        assert!(cfg.validate_input_sizes);
        assert_eq!(cfg.size_check_padding, SIZE_CHECK_PADDING);
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        let err = EngineConfig::from_toml_str("dispatch_workers = \"many\"").unwrap_err();
        assert!(matches!(err, AxonError::Config(_)));
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = EngineConfig {
            dispatch_workers: 3,
            validate_input_sizes: false,
            size_check_padding: 16,
        };
        let text = toml::to_string(&cfg).unwrap();
        let back = EngineConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.dispatch_workers, 3);
        assert!(!back.validate_input_sizes);
        assert_eq!(back.size_check_padding, 16);
    }
}

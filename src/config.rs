//! Compiler configuration: budgets and limits.
//!
//! Every field has a default, so a config file only needs to name the
//! values it overrides.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating a [`JitConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Budgets and limits for one JIT instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JitConfig {
    /// Wall-clock slice granted to one `compile`/`resume` call, in microseconds.
    pub time_slice_us: u64,
    /// Bytecodes a continuation emits before yielding back to the driver.
    pub increment_ops: u32,
    /// Initial buffer estimate, in bytes of native code per bytecode byte.
    pub code_size_factor: u32,
    /// Lower bound on the initial buffer size.
    pub min_code_size: u32,
    /// Hard ceiling on the size of one compiled unit.
    pub max_code_size: u32,
    /// How many times the buffer may double past its initial estimate.
    pub max_growths: u32,
    /// Cap on literals waiting to be written.
    pub max_unbound_literals: u32,
    /// A completed task flushes the pool if any literal would fall out of
    /// reach within this many bytes.
    pub literal_flush_slack: u32,
    /// Deepest inline nesting below the root unit.
    pub max_inline_depth: u32,
    /// Largest callee, in bytecode bytes, considered for inlining.
    pub inline_max_bytes: u32,
    /// Scratch memory available to the default code allocator.
    pub scratch_limit: usize,
    /// Emit trace-level compiler events.
    pub trace: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            time_slice_us: 2_000,
            increment_ops: 16,
            code_size_factor: 12,
            min_code_size: 256,
            max_code_size: 256 * 1024,
            max_growths: 3,
            max_unbound_literals: 32,
            literal_flush_slack: 256,
            max_inline_depth: 2,
            inline_max_bytes: 24,
            scratch_limit: 4 * 1024 * 1024,
            trace: false,
        }
    }
}

impl JitConfig {
    /// Load a config from a TOML file and validate it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: JitConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the compiler cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.increment_ops == 0 {
            return Err(ConfigError::Invalid("increment_ops must be at least 1".into()));
        }
        if self.min_code_size < 64 || self.min_code_size % 4 != 0 {
            return Err(ConfigError::Invalid(
                "min_code_size must be a multiple of 4 and at least 64".into(),
            ));
        }
        if self.max_code_size < self.min_code_size {
            return Err(ConfigError::Invalid(format!(
                "max_code_size ({}) is below min_code_size ({})",
                self.max_code_size, self.min_code_size
            )));
        }
        // Conditional branches on both back ends reach +-1MB.
        if self.max_code_size > 1024 * 1024 {
            return Err(ConfigError::Invalid("max_code_size may not exceed 1MB".into()));
        }
        if self.max_unbound_literals == 0 || self.max_unbound_literals > 64 {
            return Err(ConfigError::Invalid(
                "max_unbound_literals must be between 1 and 64".into(),
            ));
        }
        Ok(())
    }

    pub fn time_slice(&self) -> Duration {
        Duration::from_micros(self.time_slice_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        JitConfig::default().validate().unwrap();
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "increment_ops = 4\nmax_unbound_literals = 2").unwrap();

        let config = JitConfig::load(file.path()).unwrap();
        assert_eq!(config.increment_ops, 4);
        assert_eq!(config.max_unbound_literals, 2);
        assert_eq!(config.max_code_size, JitConfig::default().max_code_size);
    }

    #[test]
    fn test_load_rejects_unknown_field() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "jit_threshold = 10").unwrap();

        assert!(matches!(
            JitConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_validate_size_bounds() {
        let config = JitConfig {
            min_code_size: 1024,
            max_code_size: 512,
            ..JitConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}

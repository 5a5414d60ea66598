use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::script::Limits;

#[derive(Debug, Error, Clone, PartialEq)]
#[error("executor config invalid: {0}")]
pub struct ConfigError(pub String);

/// Resource limits applied to every user-code run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ExecutorConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Largest value a run may build or copy.
    #[serde(default = "default_max_value_bytes")]
    pub max_value_bytes: usize,
    #[serde(default = "default_max_value_depth")]
    pub max_value_depth: usize,
}

const fn default_max_steps() -> u64 {
    1_000_000
}

const fn default_max_call_depth() -> usize {
    64
}

const fn default_max_output_bytes() -> usize {
    1 << 20
}

const fn default_max_value_bytes() -> usize {
    16 << 20
}

const fn default_max_value_depth() -> usize {
    128
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_call_depth: default_max_call_depth(),
            max_output_bytes: default_max_output_bytes(),
            max_value_bytes: default_max_value_bytes(),
            max_value_depth: default_max_value_depth(),
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_steps == 0 {
            return Err(ConfigError("step limit must be greater than zero".into()));
        }
        if self.max_call_depth == 0 {
            return Err(ConfigError("call depth must be greater than zero".into()));
        }
        if self.max_value_bytes == 0 || self.max_value_depth == 0 {
            return Err(ConfigError("value limits must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_steps: self.max_steps,
            max_call_depth: self.max_call_depth,
            max_output_bytes: self.max_output_bytes,
            max_value_bytes: self.max_value_bytes,
            max_value_depth: self.max_value_depth,
        }
    }
}

//! Runs approved code units in the script interpreter.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use thiserror::Error;
use tracing::{debug, error};

use crate::{
    code::{UserCode, UserCodeExecutionResult},
    script::{process_code, Capture, Interpreter, Limits, Module, RuntimeError, ScriptError, Value},
    uid::Uid,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("code {id} no longer matches its recorded hash")]
    HashMismatch { id: Uid },
    #[error("failed to compile `{unique_name}`: {source}")]
    Compile {
        unique_name: String,
        #[source]
        source: ScriptError,
    },
    #[error("`{unique_name}` failed at runtime: {source}")]
    Runtime {
        unique_name: String,
        #[source]
        source: RuntimeError,
        stdout: String,
        stderr: String,
    },
}

/// Canonical source compiled once and shared by every later run.
#[derive(Debug)]
pub struct CompiledUnit {
    pub unique_name: String,
    pub source: String,
    pub module: Module,
}

#[derive(Debug, Default)]
pub struct CodeRegistry {
    units: HashMap<String, Arc<CompiledUnit>>,
}

impl CodeRegistry {
    pub fn get(&self, unique_name: &str) -> Option<Arc<CompiledUnit>> {
        self.units.get(unique_name).cloned()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Rebuilds the wrapper from `raw_code` and refuses the unit unless it
    /// prints to the stored `parsed_code`. A cached unit is reused only for
    /// the same canonical text.
    fn compile(&mut self, code: &UserCode) -> Result<Arc<CompiledUnit>, ExecutionError> {
        let processed = process_code(
            &code.raw_code,
            &code.unique_func_name,
            &code.service_func_name,
            &code.input_kwargs,
            &code.outputs,
        )
        .map_err(|source| ExecutionError::Compile {
            unique_name: code.unique_func_name.clone(),
            source,
        })?;
        if processed.source != code.parsed_code {
            return Err(ExecutionError::HashMismatch { id: code.id });
        }
        if let Some(unit) = self.get(&code.unique_func_name) {
            if unit.source == processed.source {
                return Ok(unit);
            }
        }
        let unit = Arc::new(CompiledUnit {
            unique_name: code.unique_func_name.clone(),
            source: processed.source,
            module: processed.module,
        });
        self.units
            .insert(code.unique_func_name.clone(), Arc::clone(&unit));
        debug!("compiled unit name={}", code.unique_func_name);
        Ok(unit)
    }
}

#[derive(Debug, Default)]
pub struct Executor {
    limits: Limits,
    registry: CodeRegistry,
}

impl Executor {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            registry: CodeRegistry::default(),
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn registry(&self) -> &CodeRegistry {
        &self.registry
    }

    /// Compiles (once) and runs `code` with already resolved inputs.
    pub fn execute_byte_code(
        &mut self,
        code: &UserCode,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<UserCodeExecutionResult, ExecutionError> {
        if !code.verify_hash() {
            error!("hash mismatch code_id={}", code.id);
            return Err(ExecutionError::HashMismatch { id: code.id });
        }
        let unit = self.registry.compile(code).inspect_err(|err| {
            error!("compile failed code_id={} err={err}", code.id);
        })?;

        let mut capture = Capture::new(self.limits.max_output_bytes);
        let outcome = {
            let mut interpreter = Interpreter::new(self.limits, &mut capture);
            let outcome = interpreter.call(&unit.module, &unit.unique_name, kwargs);
            debug!("run finished name={} steps={}", unit.unique_name, interpreter.steps());
            outcome
        };
        let (stdout, stderr) = capture.into_parts();
        match outcome {
            Ok(value) => Ok(UserCodeExecutionResult {
                id: Uid::new(),
                user_code_id: code.id,
                stdout,
                stderr,
                result: value.to_json(),
            }),
            Err(source) => {
                error!("execution failed code_id={} err={source}", code.id);
                Err(ExecutionError::Runtime {
                    unique_name: unit.unique_name.clone(),
                    source,
                    stdout,
                    stderr,
                })
            }
        }
    }
}

//! FedGov user-code governance.
//!
//! Submitted functions are parsed, checked for closure, wrapped and printed
//! canonically by an ordered transform pipeline, then held behind a
//! per-party approval record. Approved code runs in a step-limited
//! interpreter with its output captured per run.

pub mod code;
pub mod config;
pub mod errors;
pub mod executor;
pub mod node;
pub mod permission;
pub mod policy;
pub mod script;
pub mod service;
pub mod signature;
pub mod status;
pub mod store;
pub mod transform;
pub mod uid;

pub use code::{extract_uids, sha256_hex, InputArg, SubmitUserCode, UserCode, UserCodeExecutionResult};
pub use config::{ConfigError, ExecutorConfig};
pub use errors::{UserCodeError, UserCodeResult};
pub use executor::{CodeRegistry, CompiledUnit, ExecutionError, Executor};
pub use node::{NodeContext, NodeType, NodeView};
pub use permission::{CmpCrudPermission, CmpPermission, PermissionSet};
pub use policy::{
    BuiltinPolicy, BuiltinPolicyKind, CustomPolicySource, InMemoryPolicyStore, InputPolicyState,
    OutputPolicyState, Policy, PolicyInputs, PolicyStore, SubmitPolicy, UserPolicy,
};
pub use script::{Limits, ScriptError, Value};
pub use service::UserCodeService;
pub use signature::{ReturnAnnotation, Signature};
pub use status::{StatusRefusal, UserCodeStatus, UserCodeStatusContext};
pub use store::{ActionStore, InMemoryActionStore, UserCodeStore};
pub use transform::{submit_user_code_to_user_code, TransformContext, TransformStep, UserCodeDraft};
pub use uid::{IdParseError, Uid, VerifyKey};

use thiserror::Error;

use crate::{
    executor::ExecutionError,
    node::NodeView,
    policy::BuiltinPolicyKind,
    script::ScriptError,
    status::{StatusRefusal, UserCodeStatus},
    uid::{Uid, VerifyKey},
};

pub type UserCodeResult<T> = Result<T, UserCodeError>;

#[derive(Debug, Error)]
pub enum UserCodeError {
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error("transform step `{step}` failed: {source}")]
    Transform {
        step: &'static str,
        #[source]
        source: Box<UserCodeError>,
    },
    #[error("submission is missing its {0} policy")]
    MissingPolicy(&'static str),
    #[error("policy {0} not found")]
    PolicyNotFound(Uid),
    #[error("invalid init args for {kind:?}: {message}")]
    InvalidPolicyArgs {
        kind: BuiltinPolicyKind,
        message: String,
    },
    #[error("input policy does not name the serving domain {0}")]
    MissingReviewer(NodeView),
    #[error("input policy names no reviewing party")]
    NoReviewers,
    #[error("input `{name}` is bound by both {first} and {second}")]
    DuplicateInputName {
        name: String,
        first: NodeView,
        second: NodeView,
    },
    #[error("approval record holds no statuses")]
    InvalidStatusState,
    #[error("approval record has no entry for {0}")]
    NodeNotInStatus(NodeView),
    #[error("input `{0}` cannot be reduced to an object id")]
    UnreducibleInput(String),
    #[error(transparent)]
    Refused(#[from] StatusRefusal),
    #[error("identical code already submitted as {existing}")]
    DuplicateSubmission { existing: Uid },
    #[error("code {0} not found")]
    CodeNotFound(Uid),
    #[error("code {id} is {status}, not approved for execution")]
    NotApproved { id: Uid, status: UserCodeStatus },
    #[error("{requester} may not execute code on this node")]
    PermissionDenied { requester: VerifyKey },
    #[error("input policy rejected the execution: {0}")]
    PolicyViolation(String),
    #[error("output policy allows {limit} executions and all were used")]
    OutputPolicyExhausted { limit: u32 },
    #[error("no stored object for id {0}")]
    ActionNotFound(Uid),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("transform left `{0}` unset")]
    IncompleteDraft(&'static str),
}

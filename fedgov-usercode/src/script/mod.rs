//! FedGov script: the restricted function language user code is submitted in.
//!
//! Source goes through the usual compiler stages: [`lexer`] → [`parser`] →
//! [`scope`] (closed-over-names check) → [`rewrite`] (wrapper synthesis) →
//! [`printer`] (canonical text). [`interp`] executes compiled functions with
//! explicit capture buffers and a step budget.

pub mod ast;
pub mod interp;
pub mod lexer;
pub mod parser;
pub mod printer;
pub mod rewrite;
pub mod scope;
pub mod value;

use thiserror::Error;

pub use ast::{Arg, BinaryOp, Expr, FnDef, Module, Stmt, UnaryOp};
pub use interp::{Capture, Interpreter, Limits, RuntimeError, MAX_EVAL_DEPTH};
pub use parser::{Parser, MAX_NESTING};
pub use printer::{print_fn, print_module};
pub use rewrite::{capture_module, process_code, ProcessedCode};
pub use scope::{ensure_closed, free_variables, BUILTINS};
pub use value::Value;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScriptError {
    #[error("syntax error at {line}:{col}: {message}")]
    Syntax {
        line: usize,
        col: usize,
        message: String,
    },
    #[error("code references names outside its parameters and closure: {}", .names.join(", "))]
    FreeVariables { names: Vec<String> },
    #[error("expected exactly one top-level function, found {0}")]
    FunctionCount(usize),
    #[error("expected function `{expected}`, found `{found}`")]
    FunctionName { expected: String, found: String },
    #[error("function `{0}` not found in source")]
    MissingFunction(String),
    #[error("code nests deeper than {limit} levels")]
    NestingTooDeep { limit: usize },
    #[error("parameter `{param}` declared twice in `{function}`")]
    DuplicateParameter { function: String, param: String },
    #[error("function parameters {declared:?} do not match requested inputs {requested:?}")]
    ParameterMismatch {
        declared: Vec<String>,
        requested: Vec<String>,
    },
}

pub type ScriptResult<T> = Result<T, ScriptError>;

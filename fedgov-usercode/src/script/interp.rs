//! Tree-walking interpreter.
//!
//! Every statement, expression and loop iteration consumes one step from a
//! fixed budget, and calls are depth limited, so a run always terminates.
//! Values a run builds or copies are charged by size and capped in bytes and
//! nesting depth. `print`/`eprint` write into a [`Capture`] owned by the
//! caller.

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    rc::Rc,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ast::{Arg, BinaryOp, Expr, FnDef, Module, Stmt, UnaryOp};
use super::value::Value;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("undefined name `{0}`")]
    Undefined(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("integer overflow")]
    Overflow,
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },
    #[error("missing key {0:?}")]
    MissingKey(String),
    #[error("step limit of {0} exhausted")]
    StepLimit(u64),
    #[error("call depth limit of {0} exceeded")]
    CallDepth(usize),
    #[error("evaluation nested deeper than {0} levels")]
    EvalDepth(usize),
    #[error("captured output exceeded {0} bytes")]
    OutputLimit(usize),
    #[error("value exceeded {0} bytes")]
    MemoryLimit(usize),
    #[error("value nested deeper than {0} levels")]
    NestingLimit(usize),
    #[error("bad call to `{function}`: {message}")]
    Call { function: String, message: String },
}

type RunResult<T> = Result<T, RuntimeError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub max_steps: u64,
    pub max_call_depth: usize,
    pub max_output_bytes: usize,
    pub max_value_bytes: usize,
    pub max_value_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_steps: 1_000_000,
            max_call_depth: 64,
            max_output_bytes: 1 << 20,
            max_value_bytes: 16 << 20,
            max_value_depth: 128,
        }
    }
}

/// Bytes of value data copied per step charged.
const BYTES_PER_STEP: usize = 64;

/// Statements and expressions active at once, across all calls.
pub const MAX_EVAL_DEPTH: usize = 256;

/// Approximate heap size and nesting depth of a value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Footprint {
    bytes: usize,
    depth: usize,
}

impl Footprint {
    /// Walks with an explicit stack; input depth never grows the native one.
    fn of(value: &Value) -> Self {
        let mut total = Footprint::default();
        let mut pending = vec![(value, 1usize)];
        while let Some((value, depth)) = pending.pop() {
            total.depth = total.depth.max(depth);
            total.bytes = total.bytes.saturating_add(std::mem::size_of::<Value>());
            match value {
                Value::Str(text) => total.bytes = total.bytes.saturating_add(text.len()),
                Value::List(items) => pending.extend(items.iter().map(|item| (item, depth + 1))),
                Value::Map(entries) => {
                    for (key, item) in entries {
                        total.bytes = total.bytes.saturating_add(key.len());
                        pending.push((item, depth + 1));
                    }
                }
                _ => {}
            }
        }
        total
    }
}

/// Output buffers for one run. The byte cap covers both streams together.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capture {
    stdout: String,
    stderr: String,
    limit: usize,
}

impl Capture {
    pub fn new(limit: usize) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            limit,
        }
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn into_parts(self) -> (String, String) {
        (self.stdout, self.stderr)
    }

    fn write(&mut self, to_stderr: bool, text: &str) -> RunResult<()> {
        if self.stdout.len() + self.stderr.len() + text.len() > self.limit {
            return Err(RuntimeError::OutputLimit(self.limit));
        }
        if to_stderr {
            self.stderr.push_str(text);
        } else {
            self.stdout.push_str(text);
        }
        Ok(())
    }
}

#[derive(Default)]
struct Frame {
    vars: HashMap<String, Value>,
    fns: HashMap<String, Rc<FnDef>>,
}

/// Lexical chain, outermost first. A callee runs on the prefix of the
/// caller's chain that ends at the frame defining it.
type Env = Vec<Rc<RefCell<Frame>>>;

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

pub struct Interpreter<'c> {
    limits: Limits,
    steps: u64,
    depth: usize,
    nesting: usize,
    capture: &'c mut Capture,
}

impl<'c> Interpreter<'c> {
    pub fn new(limits: Limits, capture: &'c mut Capture) -> Self {
        Self {
            limits,
            steps: 0,
            depth: 0,
            nesting: 0,
            capture,
        }
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Calls the top-level function `entry` of `module` with keyword
    /// arguments.
    pub fn call(
        &mut self,
        module: &Module,
        entry: &str,
        kwargs: BTreeMap<String, Value>,
    ) -> RunResult<Value> {
        let root = Rc::new(RefCell::new(Frame::default()));
        {
            let mut frame = root.borrow_mut();
            for item in &module.items {
                frame.fns.insert(item.name.clone(), Rc::new(item.clone()));
            }
        }
        let env = vec![root];
        let (index, def) =
            lookup_fn(&env, entry).ok_or_else(|| RuntimeError::Undefined(entry.to_owned()))?;
        for value in kwargs.values() {
            self.measure(value)?;
        }
        self.call_fn(&def, env[..=index].to_vec(), Vec::new(), kwargs.into_iter().collect())
    }

    fn nested<T>(&mut self, run: impl FnOnce(&mut Self) -> RunResult<T>) -> RunResult<T> {
        if self.nesting >= MAX_EVAL_DEPTH {
            return Err(RuntimeError::EvalDepth(MAX_EVAL_DEPTH));
        }
        self.nesting += 1;
        let result = run(self);
        self.nesting -= 1;
        result
    }

    fn tick(&mut self) -> RunResult<()> {
        self.charge(1)
    }

    fn charge(&mut self, steps: u64) -> RunResult<()> {
        self.steps = self.steps.saturating_add(steps);
        if self.steps > self.limits.max_steps {
            Err(RuntimeError::StepLimit(self.limits.max_steps))
        } else {
            Ok(())
        }
    }

    fn measure(&self, value: &Value) -> RunResult<Footprint> {
        let footprint = Footprint::of(value);
        if footprint.depth > self.limits.max_value_depth {
            return Err(RuntimeError::NestingLimit(self.limits.max_value_depth));
        }
        if footprint.bytes > self.limits.max_value_bytes {
            return Err(RuntimeError::MemoryLimit(self.limits.max_value_bytes));
        }
        Ok(footprint)
    }

    /// Checks a freshly built or copied value against the value limits and
    /// charges steps for its size.
    fn admit(&mut self, value: Value) -> RunResult<Value> {
        let footprint = self.measure(&value)?;
        self.charge(u64::try_from(footprint.bytes / BYTES_PER_STEP).unwrap_or(u64::MAX))?;
        Ok(value)
    }

    fn call_fn(
        &mut self,
        def: &FnDef,
        mut env: Env,
        positional: Vec<Value>,
        keywords: Vec<(String, Value)>,
    ) -> RunResult<Value> {
        if self.depth >= self.limits.max_call_depth {
            return Err(RuntimeError::CallDepth(self.limits.max_call_depth));
        }
        let bad_call = |message: String| RuntimeError::Call {
            function: def.name.clone(),
            message,
        };
        if positional.len() > def.params.len() {
            return Err(bad_call(format!(
                "takes {} arguments, got {}",
                def.params.len(),
                positional.len()
            )));
        }

        let mut bound: HashMap<String, Value> = def.params.iter().cloned().zip(positional).collect();
        for (name, value) in keywords {
            if !def.params.contains(&name) {
                return Err(bad_call(format!("unexpected keyword argument `{name}`")));
            }
            if bound.insert(name.clone(), value).is_some() {
                return Err(bad_call(format!("argument `{name}` given twice")));
            }
        }
        if let Some(missing) = def.params.iter().find(|param| !bound.contains_key(*param)) {
            return Err(bad_call(format!("missing argument `{missing}`")));
        }

        env.push(Rc::new(RefCell::new(Frame {
            vars: bound,
            fns: HashMap::new(),
        })));
        self.depth += 1;
        let flow = self.exec_stmts(&env, &def.body);
        self.depth -= 1;
        match flow? {
            Flow::Return(value) => Ok(value),
            _ => Ok(Value::None),
        }
    }

    fn exec_block(&mut self, env: &Env, stmts: &[Stmt]) -> RunResult<Flow> {
        let mut inner = env.clone();
        inner.push(Rc::new(RefCell::new(Frame::default())));
        self.exec_stmts(&inner, stmts)
    }

    fn exec_stmts(&mut self, env: &Env, stmts: &[Stmt]) -> RunResult<Flow> {
        if let Some(frame) = env.last() {
            let mut frame = frame.borrow_mut();
            for stmt in stmts {
                if let Stmt::Fn(def) = stmt {
                    frame.fns.insert(def.name.clone(), Rc::new(def.clone()));
                }
            }
        }
        for stmt in stmts {
            match self.exec_stmt(env, stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, env: &Env, stmt: &Stmt) -> RunResult<Flow> {
        self.nested(|this| this.exec_stmt_inner(env, stmt))
    }

    fn exec_stmt_inner(&mut self, env: &Env, stmt: &Stmt) -> RunResult<Flow> {
        self.tick()?;
        match stmt {
            Stmt::Let { name, value } => {
                let value = self.eval(env, value)?;
                if let Some(frame) = env.last() {
                    frame.borrow_mut().vars.insert(name.clone(), value);
                }
                Ok(Flow::Normal)
            }
            Stmt::Assign {
                name,
                indices,
                value,
            } => {
                let indices = indices
                    .iter()
                    .map(|index| self.eval(env, index))
                    .collect::<RunResult<Vec<_>>>()?;
                let value = self.eval(env, value)?;
                if !indices.is_empty()
                    && indices.len() + Footprint::of(&value).depth > self.limits.max_value_depth
                {
                    return Err(RuntimeError::NestingLimit(self.limits.max_value_depth));
                }
                let frame = env
                    .iter()
                    .rev()
                    .find(|frame| frame.borrow().vars.contains_key(name))
                    .ok_or_else(|| RuntimeError::Undefined(name.clone()))?;
                let mut frame = frame.borrow_mut();
                let slot = frame
                    .vars
                    .get_mut(name)
                    .ok_or_else(|| RuntimeError::Undefined(name.clone()))?;
                assign_path(slot, &indices, value)?;
                Ok(Flow::Normal)
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                if self.eval(env, cond)?.truthy() {
                    self.exec_block(env, then_body)
                } else if let Some(else_body) = else_body {
                    self.exec_block(env, else_body)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::For { var, iter, body } => {
                let items = match self.eval(env, iter)? {
                    Value::List(items) => items,
                    Value::Map(entries) => entries.into_keys().map(Value::Str).collect(),
                    Value::Str(text) => text.chars().map(|ch| Value::Str(ch.to_string())).collect(),
                    other => {
                        return Err(RuntimeError::Type(format!(
                            "cannot iterate over {}",
                            other.type_name()
                        )))
                    }
                };
                for item in items {
                    self.tick()?;
                    let mut inner = env.clone();
                    let mut frame = Frame::default();
                    frame.vars.insert(var.clone(), item);
                    inner.push(Rc::new(RefCell::new(frame)));
                    match self.exec_stmts(&inner, body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::While { cond, body } => {
                while self.eval(env, cond)?.truthy() {
                    self.tick()?;
                    match self.exec_block(env, body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(env, expr)?,
                    None => Value::None,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            // Hoisted when the enclosing block was entered.
            Stmt::Fn(_) => Ok(Flow::Normal),
            Stmt::Expr(expr) => {
                self.eval(env, expr)?;
                Ok(Flow::Normal)
            }
        }
    }

    fn eval(&mut self, env: &Env, expr: &Expr) -> RunResult<Value> {
        self.nested(|this| this.eval_inner(env, expr))
    }

    fn eval_inner(&mut self, env: &Env, expr: &Expr) -> RunResult<Value> {
        self.tick()?;
        match expr {
            Expr::Int(value) => Ok(Value::Int(*value)),
            Expr::Float(value) => Ok(Value::Float(*value)),
            Expr::Str(value) => Ok(Value::Str(value.clone())),
            Expr::Bool(value) => Ok(Value::Bool(*value)),
            Expr::None => Ok(Value::None),
            Expr::List(items) => {
                let items = items
                    .iter()
                    .map(|item| self.eval(env, item))
                    .collect::<RunResult<_>>()?;
                self.admit(Value::List(items))
            }
            Expr::Map(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    let key = match self.eval(env, key)? {
                        Value::Str(key) => key,
                        other => {
                            return Err(RuntimeError::Type(format!(
                                "map keys must be str, not {}",
                                other.type_name()
                            )))
                        }
                    };
                    let value = self.eval(env, value)?;
                    map.insert(key, value);
                }
                self.admit(Value::Map(map))
            }
            Expr::Name(name) => {
                let value = env
                    .iter()
                    .rev()
                    .find_map(|frame| frame.borrow().vars.get(name).cloned())
                    .ok_or_else(|| RuntimeError::Undefined(name.clone()))?;
                self.admit(value)
            }
            Expr::Unary { op, expr } => {
                let value = self.eval(env, expr)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                    UnaryOp::Neg => match value {
                        Value::Int(int) => int.checked_neg().map(Value::Int).ok_or(RuntimeError::Overflow),
                        Value::Float(float) => Ok(Value::Float(-float)),
                        other => Err(RuntimeError::Type(format!(
                            "cannot negate {}",
                            other.type_name()
                        ))),
                    },
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.eval(env, lhs)?;
                match op {
                    BinaryOp::And if !lhs.truthy() => Ok(lhs),
                    BinaryOp::Or if lhs.truthy() => Ok(lhs),
                    BinaryOp::And | BinaryOp::Or => self.eval(env, rhs),
                    BinaryOp::Add => {
                        let rhs = self.eval(env, rhs)?;
                        let sum = binary_op(*op, lhs, rhs)?;
                        self.admit(sum)
                    }
                    _ => {
                        let rhs = self.eval(env, rhs)?;
                        binary_op(*op, lhs, rhs)
                    }
                }
            }
            Expr::Index { target, index } => {
                let target = self.eval(env, target)?;
                let index = self.eval(env, index)?;
                index_value(target, &index)
            }
            Expr::Call { callee, args } => {
                let mut positional = Vec::new();
                let mut keywords = Vec::new();
                for arg in args {
                    match arg {
                        Arg::Positional(expr) => positional.push(self.eval(env, expr)?),
                        Arg::Keyword(name, expr) => {
                            keywords.push((name.clone(), self.eval(env, expr)?))
                        }
                    }
                }
                match lookup_fn(env, callee) {
                    Some((index, def)) => {
                        self.call_fn(&def, env[..=index].to_vec(), positional, keywords)
                    }
                    None => {
                        let value = self.call_builtin(callee, positional, keywords)?;
                        self.admit(value)
                    }
                }
            }
        }
    }

    fn call_builtin(
        &mut self,
        name: &str,
        args: Vec<Value>,
        keywords: Vec<(String, Value)>,
    ) -> RunResult<Value> {
        let bad_call = |message: String| RuntimeError::Call {
            function: name.to_owned(),
            message,
        };
        let mut reverse = false;
        for (key, value) in &keywords {
            match (name, key.as_str()) {
                ("sorted", "reverse") => reverse = value.truthy(),
                _ => return Err(bad_call(format!("unexpected keyword argument `{key}`"))),
            }
        }
        let arity = |expected: usize| {
            if args.len() == expected {
                Ok(())
            } else {
                Err(bad_call(format!(
                    "takes {expected} arguments, got {}",
                    args.len()
                )))
            }
        };

        match name {
            "print" | "eprint" => {
                let line: Vec<String> = args.iter().map(Value::to_string).collect();
                let mut text = line.join(" ");
                text.push('\n');
                self.capture.write(name == "eprint", &text)?;
                Ok(Value::None)
            }
            "len" => {
                arity(1)?;
                let len = match &args[0] {
                    Value::Str(text) => text.chars().count(),
                    Value::List(items) => items.len(),
                    Value::Map(entries) => entries.len(),
                    other => return Err(bad_call(format!("{} has no length", other.type_name()))),
                };
                i64::try_from(len).map(Value::Int).map_err(|_| RuntimeError::Overflow)
            }
            "range" => {
                let ints = args
                    .iter()
                    .map(|arg| expect_int(name, arg))
                    .collect::<RunResult<Vec<_>>>()?;
                let (start, stop, step) = match ints.as_slice() {
                    [stop] => (0, *stop, 1),
                    [start, stop] => (*start, *stop, 1),
                    [start, stop, step] => (*start, *stop, *step),
                    _ => return Err(bad_call("takes 1 to 3 arguments".into())),
                };
                if step == 0 {
                    return Err(bad_call("step must not be zero".into()));
                }
                let span = i128::from(stop) - i128::from(start);
                let step_wide = i128::from(step);
                let count = if (span > 0 && step > 0) || (span < 0 && step < 0) {
                    (span.abs() + step_wide.abs() - 1) / step_wide.abs()
                } else {
                    0
                };
                self.charge(u64::try_from(count).unwrap_or(u64::MAX))?;
                let items = (0..count)
                    .map(|i| Value::Int((i128::from(start) + i * step_wide) as i64))
                    .collect();
                Ok(Value::List(items))
            }
            "sum" => {
                arity(1)?;
                let items = expect_list(name, &args[0])?;
                items
                    .iter()
                    .cloned()
                    .try_fold(Value::Int(0), |acc, item| binary_op(BinaryOp::Add, acc, item))
            }
            "min" | "max" => {
                let items = match args.as_slice() {
                    [single] => expect_list(name, single)?.to_vec(),
                    _ => args.clone(),
                };
                let wanted = if name == "min" {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Greater
                };
                let mut iter = items.into_iter();
                let mut best = iter
                    .next()
                    .ok_or_else(|| bad_call("empty sequence".into()))?;
                for item in iter {
                    let ordering = item.compare(&best).ok_or_else(|| {
                        bad_call(format!(
                            "cannot compare {} with {}",
                            item.type_name(),
                            best.type_name()
                        ))
                    })?;
                    if ordering == wanted {
                        best = item;
                    }
                }
                Ok(best)
            }
            "abs" => {
                arity(1)?;
                match &args[0] {
                    Value::Int(int) => int.checked_abs().map(Value::Int).ok_or(RuntimeError::Overflow),
                    Value::Float(float) => Ok(Value::Float(float.abs())),
                    other => Err(bad_call(format!("expected a number, got {}", other.type_name()))),
                }
            }
            "round" => match args.as_slice() {
                [Value::Int(int)] => Ok(Value::Int(*int)),
                [Value::Float(float)] => float_to_int(float.round()),
                [number, digits] => {
                    let number = number
                        .as_f64()
                        .ok_or_else(|| bad_call("expected a number".into()))?;
                    let digits = i32::try_from(expect_int(name, digits)?)
                        .map_err(|_| RuntimeError::Overflow)?;
                    let scale = 10f64.powi(digits);
                    Ok(Value::Float((number * scale).round() / scale))
                }
                _ => Err(bad_call("expected a number and optional digit count".into())),
            },
            "str" => {
                arity(1)?;
                Ok(Value::Str(args[0].to_string()))
            }
            "int" => {
                arity(1)?;
                match &args[0] {
                    Value::Int(int) => Ok(Value::Int(*int)),
                    Value::Bool(flag) => Ok(Value::Int(i64::from(*flag))),
                    Value::Float(float) => float_to_int(float.trunc()),
                    Value::Str(text) => text
                        .trim()
                        .parse::<i64>()
                        .map(Value::Int)
                        .map_err(|_| bad_call(format!("invalid integer {text:?}"))),
                    other => Err(bad_call(format!("cannot convert {}", other.type_name()))),
                }
            }
            "float" => {
                arity(1)?;
                match &args[0] {
                    Value::Str(text) => text
                        .trim()
                        .parse::<f64>()
                        .map(Value::Float)
                        .map_err(|_| bad_call(format!("invalid float {text:?}"))),
                    other => other
                        .as_f64()
                        .map(Value::Float)
                        .ok_or_else(|| bad_call(format!("cannot convert {}", other.type_name()))),
                }
            }
            "keys" | "values" => {
                arity(1)?;
                let Value::Map(entries) = &args[0] else {
                    return Err(bad_call(format!("expected map, got {}", args[0].type_name())));
                };
                Ok(Value::List(if name == "keys" {
                    entries.keys().cloned().map(Value::Str).collect()
                } else {
                    entries.values().cloned().collect()
                }))
            }
            "append" => {
                arity(2)?;
                let mut items = expect_list(name, &args[0])?.to_vec();
                items.push(args[1].clone());
                Ok(Value::List(items))
            }
            "sorted" => {
                arity(1)?;
                let mut items = expect_list(name, &args[0])?.to_vec();
                let mut failure = None;
                items.sort_by(|a, b| {
                    a.compare(b).unwrap_or_else(|| {
                        failure.get_or_insert_with(|| {
                            format!("cannot compare {} with {}", a.type_name(), b.type_name())
                        });
                        std::cmp::Ordering::Equal
                    })
                });
                if let Some(message) = failure {
                    return Err(bad_call(message));
                }
                if reverse {
                    items.reverse();
                }
                Ok(Value::List(items))
            }
            other => Err(RuntimeError::Undefined(other.to_owned())),
        }
    }
}

fn lookup_fn(env: &Env, name: &str) -> Option<(usize, Rc<FnDef>)> {
    env.iter()
        .enumerate()
        .rev()
        .find_map(|(index, frame)| frame.borrow().fns.get(name).map(|def| (index, Rc::clone(def))))
}

fn expect_int(function: &str, value: &Value) -> RunResult<i64> {
    match value {
        Value::Int(int) => Ok(*int),
        other => Err(RuntimeError::Call {
            function: function.to_owned(),
            message: format!("expected int, got {}", other.type_name()),
        }),
    }
}

fn expect_list<'v>(function: &str, value: &'v Value) -> RunResult<&'v [Value]> {
    match value {
        Value::List(items) => Ok(items),
        other => Err(RuntimeError::Call {
            function: function.to_owned(),
            message: format!("expected list, got {}", other.type_name()),
        }),
    }
}

fn float_to_int(value: f64) -> RunResult<Value> {
    if value.is_finite() && value >= i64::MIN as f64 && value < i64::MAX as f64 {
        Ok(Value::Int(value as i64))
    } else {
        Err(RuntimeError::Overflow)
    }
}

fn normalize_index(index: i64, len: usize) -> RunResult<usize> {
    let out_of_range = RuntimeError::IndexOutOfRange { index, len };
    let len_i = i64::try_from(len).map_err(|_| RuntimeError::Overflow)?;
    let resolved = if index < 0 { len_i + index } else { index };
    if resolved < 0 || resolved >= len_i {
        Err(out_of_range)
    } else {
        usize::try_from(resolved).map_err(|_| RuntimeError::Overflow)
    }
}

fn index_value(target: Value, index: &Value) -> RunResult<Value> {
    match (target, index) {
        (Value::List(mut items), Value::Int(i)) => {
            let at = normalize_index(*i, items.len())?;
            Ok(items.swap_remove(at))
        }
        (Value::Str(text), Value::Int(i)) => {
            let chars: Vec<char> = text.chars().collect();
            let at = normalize_index(*i, chars.len())?;
            Ok(Value::Str(chars[at].to_string()))
        }
        (Value::Map(mut entries), Value::Str(key)) => entries
            .remove(key)
            .ok_or_else(|| RuntimeError::MissingKey(key.clone())),
        (target, index) => Err(RuntimeError::Type(format!(
            "cannot index {} with {}",
            target.type_name(),
            index.type_name()
        ))),
    }
}

fn assign_path(slot: &mut Value, indices: &[Value], value: Value) -> RunResult<()> {
    let Some((first, rest)) = indices.split_first() else {
        *slot = value;
        return Ok(());
    };
    match (slot, first) {
        (Value::List(items), Value::Int(i)) => {
            let at = normalize_index(*i, items.len())?;
            assign_path(&mut items[at], rest, value)
        }
        (Value::Map(entries), Value::Str(key)) => {
            if rest.is_empty() {
                entries.insert(key.clone(), value);
                Ok(())
            } else {
                let inner = entries
                    .get_mut(key)
                    .ok_or_else(|| RuntimeError::MissingKey(key.clone()))?;
                assign_path(inner, rest, value)
            }
        }
        (slot, index) => Err(RuntimeError::Type(format!(
            "cannot assign into {} with {} index",
            slot.type_name(),
            index.type_name()
        ))),
    }
}

fn binary_op(op: BinaryOp, lhs: Value, rhs: Value) -> RunResult<Value> {
    let type_error = |lhs: &Value, rhs: &Value| {
        RuntimeError::Type(format!(
            "unsupported operands for `{}`: {} and {}",
            op.symbol(),
            lhs.type_name(),
            rhs.type_name()
        ))
    };
    match op {
        BinaryOp::Eq => Ok(Value::Bool(lhs.loose_eq(&rhs))),
        BinaryOp::NotEq => Ok(Value::Bool(!lhs.loose_eq(&rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = lhs.compare(&rhs).ok_or_else(|| type_error(&lhs, &rhs))?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinaryOp::In => match (&lhs, &rhs) {
            (item, Value::List(items)) => Ok(Value::Bool(items.iter().any(|x| x.loose_eq(item)))),
            (Value::Str(key), Value::Map(entries)) => Ok(Value::Bool(entries.contains_key(key))),
            (Value::Str(needle), Value::Str(haystack)) => {
                Ok(Value::Bool(haystack.contains(needle.as_str())))
            }
            _ => Err(type_error(&lhs, &rhs)),
        },
        BinaryOp::Add => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => a.checked_add(b).map(Value::Int).ok_or(RuntimeError::Overflow),
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
            (Value::List(mut a), Value::List(b)) => {
                a.extend(b);
                Ok(Value::List(a))
            }
            (lhs, rhs) => float_op(&lhs, &rhs, |a, b| a + b).ok_or_else(|| type_error(&lhs, &rhs)),
        },
        BinaryOp::Sub => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => a.checked_sub(b).map(Value::Int).ok_or(RuntimeError::Overflow),
            (lhs, rhs) => float_op(&lhs, &rhs, |a, b| a - b).ok_or_else(|| type_error(&lhs, &rhs)),
        },
        BinaryOp::Mul => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => a.checked_mul(b).map(Value::Int).ok_or(RuntimeError::Overflow),
            (lhs, rhs) => float_op(&lhs, &rhs, |a, b| a * b).ok_or_else(|| type_error(&lhs, &rhs)),
        },
        BinaryOp::Div => {
            let (a, b) = lhs
                .as_f64()
                .zip(rhs.as_f64())
                .ok_or_else(|| type_error(&lhs, &rhs))?;
            if b == 0.0 {
                return Err(RuntimeError::DivisionByZero);
            }
            Ok(Value::Float(a / b))
        }
        BinaryOp::Rem => match (lhs, rhs) {
            (Value::Int(_), Value::Int(0)) => Err(RuntimeError::DivisionByZero),
            (Value::Int(a), Value::Int(b)) => {
                let rem = a.checked_rem(b).ok_or(RuntimeError::Overflow)?;
                // Result takes the sign of the divisor.
                Ok(Value::Int(if rem != 0 && (rem < 0) != (b < 0) { rem + b } else { rem }))
            }
            (lhs, rhs) => {
                let (a, b) = lhs
                    .as_f64()
                    .zip(rhs.as_f64())
                    .ok_or_else(|| type_error(&lhs, &rhs))?;
                if b == 0.0 {
                    return Err(RuntimeError::DivisionByZero);
                }
                let rem = a % b;
                Ok(Value::Float(if rem != 0.0 && (rem < 0.0) != (b < 0.0) { rem + b } else { rem }))
            }
        },
        BinaryOp::And | BinaryOp::Or => Err(type_error(&lhs, &rhs)),
    }
}

fn float_op(lhs: &Value, rhs: &Value, op: impl Fn(f64, f64) -> f64) -> Option<Value> {
    Some(Value::Float(op(lhs.as_f64()?, rhs.as_f64()?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Parser;

    fn run(source: &str, entry: &str, kwargs: &[(&str, Value)]) -> (RunResult<Value>, Capture) {
        run_with(Limits::default(), source, entry, kwargs)
    }

    fn run_with(
        limits: Limits,
        source: &str,
        entry: &str,
        kwargs: &[(&str, Value)],
    ) -> (RunResult<Value>, Capture) {
        let module = Parser::parse(source).unwrap();
        let mut capture = Capture::new(1024);
        let kwargs = kwargs
            .iter()
            .map(|(name, value)| ((*name).to_owned(), value.clone()))
            .collect();
        let result = Interpreter::new(limits, &mut capture).call(&module, entry, kwargs);
        (result, capture)
    }

    #[test]
    fn evaluates_loops_and_nested_functions() {
        let source = r#"
            fn mean(xs) {
                let total = 0;
                let factor = 2;
                for x in xs {
                    total = total + scale(x);
                }
                print("n =", len(xs));
                return total / len(xs);
                fn scale(v) { return v * factor; }
            }
        "#;
        let (result, capture) = run(
            source,
            "mean",
            &[("xs", Value::List(vec![1.into(), 2.into(), 3.into()]))],
        );
        assert_eq!(result, Ok(Value::Float(4.0)));
        assert_eq!(capture.stdout(), "n = 3\n");
        assert_eq!(capture.stderr(), "");
    }

    #[test]
    fn indexed_assignment_updates_nested_containers() {
        let source = r#"
            fn f() {
                let m = {"rows": [1, 2, 3]};
                m["rows"][-1] = 30;
                m["extra"] = sorted([3, 1, 2], reverse = true);
                return m;
            }
        "#;
        let (result, _) = run(source, "f", &[]);
        let expected = Value::from_json(&serde_json::json!({
            "rows": [1, 2, 30],
            "extra": [3, 2, 1],
        }));
        assert_eq!(result, Ok(expected));
    }

    #[test]
    fn python_style_arithmetic() {
        let source = "fn f() { return [7 % -3, -7 % 3, 7 / 2, 2 in [1, 2], \"b\" in {\"b\": 1}]; }";
        let (result, _) = run(source, "f", &[]);
        assert_eq!(
            result,
            Ok(Value::List(vec![
                Value::Int(-2),
                Value::Int(2),
                Value::Float(3.5),
                Value::Bool(true),
                Value::Bool(true),
            ]))
        );
    }

    #[test]
    fn runaway_loops_hit_the_step_limit() {
        let (result, _) = run("fn f() { while true { } }", "f", &[]);
        assert_eq!(result, Err(RuntimeError::StepLimit(Limits::default().max_steps)));
    }

    #[test]
    fn repeated_doubling_hits_the_value_size_limit() {
        let limits = Limits {
            max_value_bytes: 4096,
            ..Limits::default()
        };
        let strings = r#"fn f() { let s = "x"; for i in range(28) { s = s + s; } return len(s); }"#;
        let (result, _) = run_with(limits, strings, "f", &[]);
        assert_eq!(result, Err(RuntimeError::MemoryLimit(4096)));

        let lists = "fn f() { let xs = [0]; for i in range(40) { xs = append(xs + xs, 1); } return 0; }";
        let (result, _) = run_with(limits, lists, "f", &[]);
        assert_eq!(result, Err(RuntimeError::MemoryLimit(4096)));

        let (result, _) = run(strings, "f", &[]);
        assert!(matches!(
            result,
            Err(RuntimeError::MemoryLimit(_) | RuntimeError::StepLimit(_))
        ));
    }

    #[test]
    fn copies_are_charged_by_size() {
        let source = "fn f(xs) { let n = 0; for i in range(10) { n = n + len(xs); } return n; }";
        let rows = Value::List(vec![Value::Int(0); 10_000]);
        let limits = Limits {
            max_steps: 10_000,
            ..Limits::default()
        };
        let (result, _) = run_with(limits, source, "f", &[("xs", rows)]);
        assert_eq!(result, Err(RuntimeError::StepLimit(10_000)));
    }

    #[test]
    fn deeply_nested_values_are_refused() {
        let wrapped = "fn f() { let x = []; for i in range(200000) { x = [x]; } return 1; }";
        let (result, _) = run(wrapped, "f", &[]);
        assert_eq!(result, Err(RuntimeError::NestingLimit(128)));

        let assigned = r#"fn f() { let m = {"k": 0}; for i in range(200) { m["k"] = m; } return 1; }"#;
        let (result, _) = run(assigned, "f", &[]);
        assert_eq!(result, Err(RuntimeError::NestingLimit(128)));
    }

    #[test]
    fn unbounded_recursion_hits_the_depth_limit() {
        let (result, _) = run("fn f(n) { return f(n + 1); }", "f", &[("n", Value::Int(0))]);
        assert_eq!(result, Err(RuntimeError::CallDepth(64)));
    }

    #[test]
    fn deep_expressions_in_recursion_hit_the_eval_depth_limit() {
        let source = format!(
            "fn f(n) {{ if n == 0 {{ return 0; }} return {}f(n - 1){}; }}",
            "(".repeat(60),
            " + 1)".repeat(60)
        );
        let (result, _) = run(&source, "f", &[("n", Value::Int(40))]);
        assert_eq!(result, Err(RuntimeError::EvalDepth(MAX_EVAL_DEPTH)));

        let (result, _) = run(&source, "f", &[("n", Value::Int(3))]);
        assert_eq!(result, Ok(Value::Int(180)));
    }

    #[test]
    fn output_cap_covers_both_streams() {
        let source = r#"fn f() { for i in range(1000) { eprint("0123456789"); } }"#;
        let (result, capture) = run(source, "f", &[]);
        assert_eq!(result, Err(RuntimeError::OutputLimit(1024)));
        assert!(capture.stderr().len() <= 1024);
    }

    #[test]
    fn missing_keyword_arguments_are_reported() {
        let (result, _) = run("fn f(a, b) { return a; }", "f", &[("a", Value::Int(1))]);
        assert_eq!(
            result,
            Err(RuntimeError::Call {
                function: "f".into(),
                message: "missing argument `b`".into()
            })
        );
    }
}

//! Closed-over-names check.
//!
//! A function may only reference its parameters, `let` bindings of
//! enclosing blocks, functions hoisted into enclosing blocks and the
//! builtins. Anything else would resolve against state the reviewer never
//! saw, so the submission is rejected.

use std::collections::{BTreeSet, HashSet};

use super::ast::{Arg, Expr, FnDef, Module, Stmt};
use super::{ScriptError, ScriptResult};

pub const BUILTINS: &[&str] = &[
    "print", "eprint", "len", "range", "sum", "min", "max", "abs", "round", "str", "int",
    "float", "keys", "values", "append", "sorted",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

/// Names referenced by `module` that nothing binds, sorted. Top-level
/// functions of the module are visible to each other.
pub fn free_variables(module: &Module) -> Vec<String> {
    let mut scopes = Scopes::default();
    scopes.push();
    for item in &module.items {
        scopes.bind_fn(&item.name);
    }
    for item in &module.items {
        scopes.visit_fn(item);
    }
    scopes.free.into_iter().collect()
}

pub fn ensure_closed(module: &Module) -> ScriptResult<()> {
    let names = free_variables(module);
    if names.is_empty() {
        Ok(())
    } else {
        Err(ScriptError::FreeVariables { names })
    }
}

#[derive(Default)]
struct Frame {
    vars: HashSet<String>,
    fns: HashSet<String>,
}

#[derive(Default)]
struct Scopes {
    frames: Vec<Frame>,
    free: BTreeSet<String>,
}

impl Scopes {
    fn push(&mut self) {
        self.frames.push(Frame::default());
    }

    fn pop(&mut self) {
        self.frames.pop();
    }

    fn bind_var(&mut self, name: &str) {
        if let Some(frame) = self.frames.last_mut() {
            frame.vars.insert(name.to_owned());
        }
    }

    fn bind_fn(&mut self, name: &str) {
        if let Some(frame) = self.frames.last_mut() {
            frame.fns.insert(name.to_owned());
        }
    }

    fn has_var(&self, name: &str) -> bool {
        self.frames.iter().rev().any(|frame| frame.vars.contains(name))
    }

    fn has_fn(&self, name: &str) -> bool {
        self.frames.iter().rev().any(|frame| frame.fns.contains(name))
    }

    fn visit_fn(&mut self, def: &FnDef) {
        self.push();
        for param in &def.params {
            self.bind_var(param);
        }
        self.visit_stmts(&def.body);
        self.pop();
    }

    fn visit_block(&mut self, stmts: &[Stmt]) {
        self.push();
        self.visit_stmts(stmts);
        self.pop();
    }

    /// Visits statements in the current frame, hoisting nested functions
    /// first.
    fn visit_stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            if let Stmt::Fn(def) = stmt {
                self.bind_fn(&def.name);
            }
        }
        for stmt in stmts {
            self.visit_stmt(stmt);
        }
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Let { name, value } => {
                self.visit_expr(value);
                self.bind_var(name);
            }
            Stmt::Assign {
                name,
                indices,
                value,
            } => {
                if !self.has_var(name) {
                    self.free.insert(name.clone());
                }
                for index in indices {
                    self.visit_expr(index);
                }
                self.visit_expr(value);
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                self.visit_expr(cond);
                self.visit_block(then_body);
                if let Some(else_body) = else_body {
                    self.visit_block(else_body);
                }
            }
            Stmt::For { var, iter, body } => {
                self.visit_expr(iter);
                self.push();
                self.bind_var(var);
                self.visit_stmts(body);
                self.pop();
            }
            Stmt::While { cond, body } => {
                self.visit_expr(cond);
                self.visit_block(body);
            }
            Stmt::Return(value) => {
                if let Some(value) = value {
                    self.visit_expr(value);
                }
            }
            Stmt::Break | Stmt::Continue => {}
            Stmt::Fn(def) => self.visit_fn(def),
            Stmt::Expr(expr) => self.visit_expr(expr),
        }
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Int(_) | Expr::Float(_) | Expr::Str(_) | Expr::Bool(_) | Expr::None => {}
            Expr::List(items) => items.iter().for_each(|item| self.visit_expr(item)),
            Expr::Map(entries) => {
                for (key, value) in entries {
                    self.visit_expr(key);
                    self.visit_expr(value);
                }
            }
            Expr::Name(name) => {
                if !self.has_var(name) {
                    self.free.insert(name.clone());
                }
            }
            Expr::Unary { expr, .. } => self.visit_expr(expr),
            Expr::Binary { lhs, rhs, .. } => {
                self.visit_expr(lhs);
                self.visit_expr(rhs);
            }
            Expr::Index { target, index } => {
                self.visit_expr(target);
                self.visit_expr(index);
            }
            Expr::Call { callee, args } => {
                if !self.has_fn(callee) && !is_builtin(callee) {
                    self.free.insert(callee.clone());
                }
                for arg in args {
                    match arg {
                        Arg::Positional(expr) | Arg::Keyword(_, expr) => self.visit_expr(expr),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Parser;

    fn free(source: &str) -> Vec<String> {
        free_variables(&Parser::parse(source).unwrap())
    }

    #[test]
    fn parameters_locals_and_builtins_are_bound() {
        let source = r#"
            fn f(rows) {
                let total = 0;
                for row in rows {
                    total = total + row;
                }
                print(len(rows));
                return total;
            }
        "#;
        assert!(free(source).is_empty());
    }

    #[test]
    fn globals_and_unknown_calls_are_free() {
        let source = "fn f(x) { secret = 1; return x + offset + fetch(x); }";
        assert_eq!(free(source), vec!["fetch", "offset", "secret"]);
    }

    #[test]
    fn nested_functions_are_hoisted_and_close_over_locals() {
        let source = r#"
            fn outer(x) {
                let scale = 3;
                return helper(x);
                fn helper(v) { return v * scale; }
            }
        "#;
        assert!(free(source).is_empty());
    }

    #[test]
    fn let_bindings_do_not_leak_out_of_blocks() {
        let source = "fn f(x) { if x { let y = 1; } return y; }";
        assert_eq!(free(source), vec!["y"]);

        let loop_var = "fn f(xs) { for v in xs { } return v; }";
        assert_eq!(free(loop_var), vec!["v"]);
    }

    #[test]
    fn ensure_closed_reports_every_name() {
        let module = Parser::parse("fn f() { return a + b; }").unwrap();
        assert_eq!(
            ensure_closed(&module).unwrap_err(),
            ScriptError::FreeVariables {
                names: vec!["a".into(), "b".into()]
            }
        );
    }
}

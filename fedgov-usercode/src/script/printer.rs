//! Canonical pretty-printer. Output re-parses to the same tree, and equal
//! trees always print to the same text.

use std::fmt::Write;

use super::ast::{Arg, Expr, FnDef, Module, Stmt, UnaryOp, ATOM_PRECEDENCE, NEG_PRECEDENCE, NOT_PRECEDENCE};

const INDENT: &str = "    ";

pub fn print_module(module: &Module) -> String {
    let mut out = String::new();
    for (i, item) in module.items.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        write_fn(&mut out, item, 0);
    }
    out
}

pub fn print_fn(def: &FnDef) -> String {
    let mut out = String::new();
    write_fn(&mut out, def, 0);
    out
}

pub fn print_expr(expr: &Expr) -> String {
    match expr {
        Expr::Int(value) => value.to_string(),
        Expr::Float(value) => format!("{value:?}"),
        Expr::Str(value) => quote(value),
        Expr::Bool(true) => "true".into(),
        Expr::Bool(false) => "false".into(),
        Expr::None => "none".into(),
        Expr::List(items) => {
            let items: Vec<String> = items.iter().map(print_expr).collect();
            format!("[{}]", items.join(", "))
        }
        Expr::Map(entries) => {
            let entries: Vec<String> = entries
                .iter()
                .map(|(key, value)| format!("{}: {}", print_expr(key), print_expr(value)))
                .collect();
            format!("{{{}}}", entries.join(", "))
        }
        Expr::Name(name) => name.clone(),
        Expr::Unary { op, expr } => match op {
            UnaryOp::Not => format!("not {}", wrap(expr, expr.precedence() < NOT_PRECEDENCE)),
            UnaryOp::Neg => format!("-{}", wrap(expr, expr.precedence() < NEG_PRECEDENCE)),
        },
        Expr::Binary { op, lhs, rhs } => {
            let level = op.precedence();
            // Comparisons do not chain, so a comparison operand on either
            // side needs parentheses.
            let lhs_parens = if op.is_comparison() {
                lhs.precedence() <= level
            } else {
                lhs.precedence() < level
            };
            format!(
                "{} {} {}",
                wrap(lhs, lhs_parens),
                op.symbol(),
                wrap(rhs, rhs.precedence() <= level)
            )
        }
        Expr::Index { target, index } => format!(
            "{}[{}]",
            wrap(target, target.precedence() < ATOM_PRECEDENCE),
            print_expr(index)
        ),
        Expr::Call { callee, args } => {
            let args: Vec<String> = args
                .iter()
                .map(|arg| match arg {
                    Arg::Positional(expr) => print_expr(expr),
                    Arg::Keyword(name, expr) => format!("{name} = {}", print_expr(expr)),
                })
                .collect();
            format!("{callee}({})", args.join(", "))
        }
    }
}

fn wrap(expr: &Expr, parens: bool) -> String {
    if parens {
        format!("({})", print_expr(expr))
    } else {
        print_expr(expr)
    }
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str(INDENT);
    }
}

fn write_fn(out: &mut String, def: &FnDef, depth: usize) {
    indent(out, depth);
    let _ = write!(out, "fn {}({})", def.name, def.params.join(", "));
    if let Some(returns) = &def.returns {
        let _ = write!(out, " -> {returns}");
    }
    out.push_str(" {\n");
    write_body(out, &def.body, depth + 1);
    indent(out, depth);
    out.push_str("}\n");
}

fn write_body(out: &mut String, stmts: &[Stmt], depth: usize) {
    for stmt in stmts {
        write_stmt(out, stmt, depth);
    }
}

fn write_stmt(out: &mut String, stmt: &Stmt, depth: usize) {
    match stmt {
        Stmt::Fn(def) => return write_fn(out, def, depth),
        Stmt::If { .. } => {
            indent(out, depth);
            write_if(out, stmt, depth);
            out.push('\n');
            return;
        }
        _ => {}
    }

    indent(out, depth);
    match stmt {
        Stmt::Let { name, value } => {
            let _ = write!(out, "let {name} = {};", print_expr(value));
        }
        Stmt::Assign {
            name,
            indices,
            value,
        } => {
            out.push_str(name);
            for index in indices {
                let _ = write!(out, "[{}]", print_expr(index));
            }
            let _ = write!(out, " = {};", print_expr(value));
        }
        Stmt::For { var, iter, body } => {
            let _ = writeln!(out, "for {var} in {} {{", print_expr(iter));
            write_body(out, body, depth + 1);
            indent(out, depth);
            out.push('}');
        }
        Stmt::While { cond, body } => {
            let _ = writeln!(out, "while {} {{", print_expr(cond));
            write_body(out, body, depth + 1);
            indent(out, depth);
            out.push('}');
        }
        Stmt::Return(Some(value)) => {
            let _ = write!(out, "return {};", print_expr(value));
        }
        Stmt::Return(None) => out.push_str("return;"),
        Stmt::Break => out.push_str("break;"),
        Stmt::Continue => out.push_str("continue;"),
        Stmt::Expr(expr) => {
            let _ = write!(out, "{};", print_expr(expr));
        }
        Stmt::Fn(_) | Stmt::If { .. } => {}
    }
    out.push('\n');
}

/// Writes an `if` chain without leading indent or trailing newline.
fn write_if(out: &mut String, stmt: &Stmt, depth: usize) {
    let Stmt::If {
        cond,
        then_body,
        else_body,
    } = stmt
    else {
        return;
    };
    let _ = writeln!(out, "if {} {{", print_expr(cond));
    write_body(out, then_body, depth + 1);
    indent(out, depth);
    out.push('}');
    match else_body.as_deref() {
        Some([nested @ Stmt::If { .. }]) => {
            out.push_str(" else ");
            write_if(out, nested, depth);
        }
        Some(body) => {
            out.push_str(" else {\n");
            write_body(out, body, depth + 1);
            indent(out, depth);
            out.push('}');
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Parser;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalizes_layout() {
        let source = r#"fn f(a,b)->Table{let x=(a+b)*2;if x>1{return x;}else if x<0{return -x;}else{print("a\"b");}}"#;
        let expected = r#"fn f(a, b) -> Table {
    let x = (a + b) * 2;
    if x > 1 {
        return x;
    } else if x < 0 {
        return -x;
    } else {
        print("a\"b");
    }
}
"#;
        assert_eq!(print_module(&Parser::parse(source).unwrap()), expected);
    }

    #[test]
    fn printed_source_reparses_to_the_same_tree() {
        let source = r#"
            fn f(xs, m) {
                let a = not (1 < 2) == false;
                let b = (1 - (2 - 3)) / -(4 % 2);
                let c = (-xs)[0] + m["k"][1];
                let d = {"a": [1, 2.5, none], "b": true or false and not true};
                m["k"] = sorted(xs, key = 1e-7);
                while a { break; }
                for x in range(3) { continue; }
                fn g() { return; }
            }
        "#;
        let module = Parser::parse(source).unwrap();
        let printed = print_module(&module);
        assert_eq!(Parser::parse(&printed).unwrap(), module);
        assert_eq!(print_module(&Parser::parse(&printed).unwrap()), printed);
    }
}

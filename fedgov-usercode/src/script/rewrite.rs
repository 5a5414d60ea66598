//! Wrapper synthesis for submitted functions and capture of policy source.

use super::ast::{Arg, Expr, FnDef, Module, Stmt};
use super::parser::Parser;
use super::printer::print_module;
use super::scope::ensure_closed;
use super::{ScriptError, ScriptResult};

const RESULT_BINDING: &str = "result";

/// Parsed and printed form of a unit. `source` is what gets persisted and
/// later compiled.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessedCode {
    pub module: Module,
    pub source: String,
}

/// Turns a single submitted function into its executable wrapper.
///
/// The wrapper is named `unique_name`, takes `input_kwargs` as parameters,
/// nests the submitted function, calls it by keyword and returns either the
/// whole result or, when `outputs` is non-empty, a map holding exactly those
/// keys of it.
pub fn process_code(
    raw_code: &str,
    unique_name: &str,
    service_name: &str,
    input_kwargs: &[String],
    outputs: &[String],
) -> ScriptResult<ProcessedCode> {
    let parsed = Parser::parse(raw_code)?;
    let original = match parsed.items.as_slice() {
        [single] => single.clone(),
        items => return Err(ScriptError::FunctionCount(items.len())),
    };
    if original.name != service_name {
        return Err(ScriptError::FunctionName {
            expected: service_name.to_owned(),
            found: original.name,
        });
    }
    ensure_closed(&parsed)?;

    let mut declared = original.params.clone();
    let mut requested = input_kwargs.to_vec();
    declared.sort();
    requested.sort();
    if declared != requested {
        return Err(ScriptError::ParameterMismatch {
            declared,
            requested,
        });
    }

    let call = Expr::Call {
        callee: original.name.clone(),
        args: input_kwargs
            .iter()
            .map(|name| Arg::Keyword(name.clone(), Expr::name(name.as_str())))
            .collect(),
    };
    let returned = if outputs.is_empty() {
        Expr::name(RESULT_BINDING)
    } else {
        Expr::Map(
            outputs
                .iter()
                .map(|key| {
                    (
                        Expr::string(key.as_str()),
                        Expr::index(Expr::name(RESULT_BINDING), Expr::string(key.as_str())),
                    )
                })
                .collect(),
        )
    };

    let wrapper = FnDef {
        name: unique_name.to_owned(),
        params: input_kwargs.to_vec(),
        returns: None,
        body: vec![
            Stmt::Fn(original),
            Stmt::Let {
                name: RESULT_BINDING.to_owned(),
                value: call,
            },
            Stmt::Return(Some(returned)),
        ],
    };
    let module = Module {
        items: vec![wrapper],
    };
    ensure_closed(&module)?;
    let source = print_module(&module);
    Ok(ProcessedCode { module, source })
}

/// Structural capture of a user-authored policy: the source must be closed
/// and define `entry` at the top level. Helper functions are allowed.
pub fn capture_module(raw_code: &str, entry: &str) -> ScriptResult<ProcessedCode> {
    let module = Parser::parse(raw_code)?;
    if module.function(entry).is_none() {
        return Err(ScriptError::MissingFunction(entry.to_owned()));
    }
    ensure_closed(&module)?;
    let source = print_module(&module);
    Ok(ProcessedCode { module, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| (*item).to_owned()).collect()
    }

    #[test]
    fn wrapper_restricts_the_result_to_declared_outputs() {
        let raw = "fn stats(data) { return {\"a\": 1, \"b\": 2, \"c\": data}; }";
        let processed =
            process_code(raw, "user_func_stats_k_h", "stats", &names(&["data"]), &names(&["a", "b"]))
                .unwrap();
        let expected = r#"fn user_func_stats_k_h(data) {
    fn stats(data) {
        return {"a": 1, "b": 2, "c": data};
    }
    let result = stats(data = data);
    return {"a": result["a"], "b": result["b"]};
}
"#;
        assert_eq!(processed.source, expected);
    }

    #[test]
    fn rejects_multiple_functions_and_wrong_names() {
        let two = "fn a() { } fn b() { }";
        assert_eq!(
            process_code(two, "u", "a", &[], &[]).unwrap_err(),
            ScriptError::FunctionCount(2)
        );
        assert_eq!(
            process_code("fn a() { }", "u", "b", &[], &[]).unwrap_err(),
            ScriptError::FunctionName {
                expected: "b".into(),
                found: "a".into()
            }
        );
    }

    #[test]
    fn rejects_free_variables_and_parameter_drift() {
        assert_eq!(
            process_code("fn f(x) { return x + y; }", "u", "f", &names(&["x"]), &[]).unwrap_err(),
            ScriptError::FreeVariables {
                names: names(&["y"])
            }
        );
        assert!(matches!(
            process_code("fn f(x) { return x; }", "u", "f", &names(&["z"]), &[]),
            Err(ScriptError::ParameterMismatch { .. })
        ));
    }

    #[test]
    fn captures_policy_modules_with_helpers() {
        let raw = "fn Policy(n) { return check(n); } fn check(n) { return n > 0; }";
        let captured = capture_module(raw, "Policy").unwrap();
        assert_eq!(captured.module.items.len(), 2);
        assert_eq!(
            capture_module(raw, "Other").unwrap_err(),
            ScriptError::MissingFunction("Other".into())
        );
    }
}

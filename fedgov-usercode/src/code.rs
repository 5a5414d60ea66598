//! Submitted and stored forms of a user function.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    errors::{UserCodeError, UserCodeResult},
    node::NodeView,
    policy::{InputPolicyState, OutputPolicyState, Policy, PolicyInputs, SubmitPolicy},
    script::{Parser, ScriptError},
    signature::Signature,
    status::UserCodeStatusContext,
    uid::{Uid, VerifyKey},
};

/// Lowercase hex SHA-256 of the UTF-8 source.
pub fn sha256_hex(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

/// A function as a data scientist submits it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubmitUserCode {
    pub code: String,
    pub func_name: String,
    pub signature: Signature,
    pub input_policy: SubmitPolicy,
    pub output_policy: SubmitPolicy,
    pub input_kwargs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl SubmitUserCode {
    pub fn builder(code: impl Into<String>) -> SubmitUserCodeBuilder {
        SubmitUserCodeBuilder::new(code)
    }

    pub fn input_policy_init_args(&self) -> Option<serde_json::Value> {
        policy_init_args(&self.input_policy)
    }

    pub fn output_policy_init_args(&self) -> Option<serde_json::Value> {
        policy_init_args(&self.output_policy)
    }
}

fn policy_init_args(policy: &SubmitPolicy) -> Option<serde_json::Value> {
    match policy {
        SubmitPolicy::BuiltIn { init_args, .. } => Some(init_args.clone()),
        SubmitPolicy::Custom(source) => Some(source.init_kwargs.clone()),
        SubmitPolicy::Reference { .. } => None,
    }
}

/// Reads the function name, parameters and signature out of the source.
pub struct SubmitUserCodeBuilder {
    code: String,
    input_policy: Option<SubmitPolicy>,
    output_policy: Option<SubmitPolicy>,
    outputs: Vec<String>,
}

impl SubmitUserCodeBuilder {
    fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            input_policy: None,
            output_policy: None,
            outputs: Vec::new(),
        }
    }

    pub fn input_policy(mut self, policy: SubmitPolicy) -> Self {
        self.input_policy = Some(policy);
        self
    }

    pub fn output_policy(mut self, policy: SubmitPolicy) -> Self {
        self.output_policy = Some(policy);
        self
    }

    pub fn outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> UserCodeResult<SubmitUserCode> {
        let module = Parser::parse(&self.code)?;
        let function = match module.items.as_slice() {
            [single] => single,
            items => return Err(ScriptError::FunctionCount(items.len()).into()),
        };
        let input_policy = self
            .input_policy
            .ok_or(UserCodeError::MissingPolicy("input"))?;
        let output_policy = self
            .output_policy
            .ok_or(UserCodeError::MissingPolicy("output"))?;
        Ok(SubmitUserCode {
            func_name: function.name.clone(),
            signature: Signature::new(function.params.clone(), function.returns.clone()),
            input_kwargs: function.params.clone(),
            code: self.code,
            input_policy,
            output_policy,
            outputs: self.outputs,
        })
    }
}

/// A submission after the transform pipeline: canonical, hashed and
/// carrying its approval record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserCode {
    pub id: Uid,
    pub user_verify_key: VerifyKey,
    pub raw_code: String,
    pub code_hash: String,
    /// Canonical source of the wrapper, the only text ever compiled.
    pub parsed_code: String,
    pub service_func_name: String,
    pub unique_func_name: String,
    pub user_unique_func_name: String,
    pub signature: Signature,
    pub input_policy: Policy,
    pub input_policy_state: InputPolicyState,
    pub input_policy_init_args: Option<serde_json::Value>,
    pub output_policy: Policy,
    pub output_policy_state: OutputPolicyState,
    pub output_policy_init_args: Option<serde_json::Value>,
    pub status: UserCodeStatusContext,
    pub input_kwargs: Vec<String>,
    pub outputs: Vec<String>,
}

impl UserCode {
    /// Whether `code_hash` still matches `raw_code`.
    pub fn verify_hash(&self) -> bool {
        sha256_hex(&self.raw_code) == self.code_hash
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserCodeExecutionResult {
    pub id: Uid,
    pub user_code_id: Uid,
    pub stdout: String,
    pub stderr: String,
    pub result: serde_json::Value,
}

/// Something passed as an execution input.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum InputArg {
    Id { id: Uid },
    ActionObject { id: Uid },
    TwinObject { id: Uid },
    Asset { name: String, action_id: Uid },
    Literal { value: serde_json::Value },
}

impl InputArg {
    pub fn uid(&self) -> Option<Uid> {
        match self {
            InputArg::Id { id } | InputArg::ActionObject { id } | InputArg::TwinObject { id } => {
                Some(*id)
            }
            InputArg::Asset { action_id, .. } => Some(*action_id),
            InputArg::Literal { .. } => None,
        }
    }
}

impl From<Uid> for InputArg {
    fn from(id: Uid) -> Self {
        InputArg::Id { id }
    }
}

/// Reduces every input to the identifier of a stored object.
pub fn extract_uids(kwargs: &BTreeMap<String, InputArg>) -> UserCodeResult<BTreeMap<String, Uid>> {
    kwargs
        .iter()
        .map(|(name, arg)| {
            arg.uid()
                .map(|uid| (name.clone(), uid))
                .ok_or_else(|| UserCodeError::UnreducibleInput(name.clone()))
        })
        .collect()
}

impl SubmitPolicy {
    /// Exact-match input policy from per-party inputs that may still be
    /// objects rather than identifiers.
    pub fn exact_match_objects(
        inputs: BTreeMap<NodeView, BTreeMap<String, InputArg>>,
    ) -> UserCodeResult<Self> {
        let reduced = inputs
            .into_iter()
            .map(|(view, kwargs)| extract_uids(&kwargs).map(|ids| (view, ids)))
            .collect::<UserCodeResult<PolicyInputs>>()?;
        Ok(SubmitPolicy::exact_match(reduced))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::ReturnAnnotation;

    #[test]
    fn builder_captures_name_and_signature() {
        let submission = SubmitUserCode::builder("fn mean(data, weights) -> Table { return data; }")
            .input_policy(SubmitPolicy::single_execution())
            .output_policy(SubmitPolicy::single_execution())
            .outputs(["mean"])
            .build()
            .unwrap();
        assert_eq!(submission.func_name, "mean");
        assert_eq!(submission.input_kwargs, vec!["data", "weights"]);
        assert_eq!(
            submission.signature.return_annotation,
            ReturnAnnotation::Named("Table".into())
        );
        assert_eq!(submission.outputs, vec!["mean"]);
    }

    #[test]
    fn builder_requires_both_policies() {
        let err = SubmitUserCode::builder("fn f() { }")
            .input_policy(SubmitPolicy::single_execution())
            .build()
            .unwrap_err();
        assert!(matches!(err, UserCodeError::MissingPolicy("output")));
    }

    #[test]
    fn deeply_nested_source_is_rejected_at_build() {
        let code = format!(
            "fn f() {{ return {}1{}; }}",
            "(".repeat(200_000),
            ")".repeat(200_000)
        );
        let err = SubmitUserCode::builder(code)
            .input_policy(SubmitPolicy::single_execution())
            .output_policy(SubmitPolicy::single_execution())
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            UserCodeError::Script(ScriptError::NestingTooDeep { .. })
        ));
    }

    #[test]
    fn literals_cannot_be_reduced_to_ids() {
        let id = Uid::new();
        let mut kwargs = BTreeMap::new();
        kwargs.insert(
            "data".to_owned(),
            InputArg::Asset {
                name: "census".into(),
                action_id: id,
            },
        );
        assert_eq!(extract_uids(&kwargs).unwrap()["data"], id);

        kwargs.insert(
            "k".to_owned(),
            InputArg::Literal {
                value: serde_json::json!(3),
            },
        );
        assert!(matches!(
            extract_uids(&kwargs),
            Err(UserCodeError::UnreducibleInput(name)) if name == "k"
        ));
    }

    #[test]
    fn hashes_are_lowercase_sha256() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}

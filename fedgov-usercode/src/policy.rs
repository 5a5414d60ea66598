//! Input and output policies attached to a code unit.
//!
//! A submission names each policy one of three ways: by reference to a
//! stored policy, as a built-in kind plus init args, or as user-authored
//! FedGov script. The pipeline resolves all three into a [`Policy`].

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::{
    code::sha256_hex,
    errors::{UserCodeError, UserCodeResult},
    node::{NodeContext, NodeType, NodeView},
    script::capture_module,
    uid::{Uid, VerifyKey},
};

/// Per reviewing party, the keyword inputs it contributes and the objects
/// bound to them.
pub type PolicyInputs = BTreeMap<NodeView, BTreeMap<String, Uid>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuiltinPolicyKind {
    ExactMatch,
    SingleExecutionExactOutput,
    OutputPolicyExecuteCount,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum BuiltinPolicy {
    /// Input policy: execution must bind exactly these objects.
    ExactMatch { inputs: PolicyInputs },
    /// Output policy: one execution.
    SingleExecutionExactOutput,
    /// Output policy: at most `limit` executions.
    OutputPolicyExecuteCount { limit: u32 },
}

#[derive(Deserialize)]
struct ExactMatchArgs {
    inputs: PolicyInputs,
}

#[derive(Deserialize)]
struct ExecuteCountArgs {
    limit: u32,
}

impl BuiltinPolicy {
    pub fn instantiate(kind: BuiltinPolicyKind, init_args: &serde_json::Value) -> UserCodeResult<Self> {
        let invalid = |err: serde_json::Error| UserCodeError::InvalidPolicyArgs {
            kind,
            message: err.to_string(),
        };
        match kind {
            BuiltinPolicyKind::ExactMatch => {
                let args: ExactMatchArgs =
                    serde_json::from_value(init_args.clone()).map_err(invalid)?;
                Ok(BuiltinPolicy::ExactMatch { inputs: args.inputs })
            }
            BuiltinPolicyKind::SingleExecutionExactOutput => {
                Ok(BuiltinPolicy::SingleExecutionExactOutput)
            }
            BuiltinPolicyKind::OutputPolicyExecuteCount => {
                let args: ExecuteCountArgs =
                    serde_json::from_value(init_args.clone()).map_err(invalid)?;
                Ok(BuiltinPolicy::OutputPolicyExecuteCount { limit: args.limit })
            }
        }
    }

    pub fn kind(&self) -> BuiltinPolicyKind {
        match self {
            BuiltinPolicy::ExactMatch { .. } => BuiltinPolicyKind::ExactMatch,
            BuiltinPolicy::SingleExecutionExactOutput => {
                BuiltinPolicyKind::SingleExecutionExactOutput
            }
            BuiltinPolicy::OutputPolicyExecuteCount { .. } => {
                BuiltinPolicyKind::OutputPolicyExecuteCount
            }
        }
    }
}

/// User-authored policy as submitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustomPolicySource {
    pub code: String,
    /// Entry function of `code`.
    pub class_name: String,
    #[serde(default)]
    pub init_kwargs: serde_json::Value,
    #[serde(default)]
    pub inputs: PolicyInputs,
}

/// User-authored policy after capture: closed, canonicalized and hashed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserPolicy {
    pub id: Uid,
    pub class_name: String,
    pub raw_code: String,
    pub code_hash: String,
    pub canonical_code: String,
    pub init_kwargs: serde_json::Value,
    pub inputs: PolicyInputs,
    pub user_verify_key: VerifyKey,
}

impl UserPolicy {
    pub fn capture(source: &CustomPolicySource, user_verify_key: VerifyKey) -> UserCodeResult<Self> {
        let captured = capture_module(&source.code, &source.class_name)?;
        Ok(Self {
            id: Uid::new(),
            class_name: source.class_name.clone(),
            raw_code: source.code.clone(),
            code_hash: sha256_hex(&source.code),
            canonical_code: captured.source,
            init_kwargs: source.init_kwargs.clone(),
            inputs: source.inputs.clone(),
            user_verify_key,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum SubmitPolicy {
    Reference { id: Uid },
    BuiltIn {
        policy: BuiltinPolicyKind,
        #[serde(default)]
        init_args: serde_json::Value,
    },
    Custom(CustomPolicySource),
}

impl SubmitPolicy {
    pub fn exact_match(inputs: PolicyInputs) -> Self {
        SubmitPolicy::BuiltIn {
            policy: BuiltinPolicyKind::ExactMatch,
            init_args: serde_json::json!({ "inputs": inputs }),
        }
    }

    pub fn execute_count(limit: u32) -> Self {
        SubmitPolicy::BuiltIn {
            policy: BuiltinPolicyKind::OutputPolicyExecuteCount,
            init_args: serde_json::json!({ "limit": limit }),
        }
    }

    pub fn single_execution() -> Self {
        SubmitPolicy::BuiltIn {
            policy: BuiltinPolicyKind::SingleExecutionExactOutput,
            init_args: serde_json::Value::Null,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum Policy {
    BuiltIn(BuiltinPolicy),
    User(UserPolicy),
}

impl Policy {
    /// Parties named by the policy. Drives the initial approval record.
    pub fn inputs(&self) -> Option<&PolicyInputs> {
        match self {
            Policy::BuiltIn(BuiltinPolicy::ExactMatch { inputs }) => Some(inputs),
            Policy::User(user) => Some(&user.inputs),
            Policy::BuiltIn(_) => None,
        }
    }

    /// Keyword bindings an execution on `node` must present, when the
    /// policy pins them. A domain sees its own share; an enclave sees every
    /// party's.
    pub fn expected_inputs(&self, node: &NodeContext) -> Option<BTreeMap<String, Uid>> {
        let inputs = self.inputs()?;
        match node.node_type {
            NodeType::Domain => inputs.get(&node.view()).cloned(),
            NodeType::Enclave => Some(
                inputs
                    .values()
                    .flat_map(|assets| assets.iter().map(|(name, id)| (name.clone(), *id)))
                    .collect(),
            ),
        }
    }

    /// Refuses inputs where two parties bind the same keyword, since an
    /// enclave merges every party's bindings into one call.
    pub fn ensure_distinct_inputs(&self) -> UserCodeResult<()> {
        let Some(inputs) = self.inputs() else {
            return Ok(());
        };
        let mut owners: BTreeMap<&str, &NodeView> = BTreeMap::new();
        for (view, assets) in inputs {
            for name in assets.keys() {
                if let Some(first) = owners.insert(name, view) {
                    return Err(UserCodeError::DuplicateInputName {
                        name: name.clone(),
                        first: first.clone(),
                        second: view.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn execution_limit(&self) -> Option<u32> {
        match self {
            Policy::BuiltIn(BuiltinPolicy::SingleExecutionExactOutput) => Some(1),
            Policy::BuiltIn(BuiltinPolicy::OutputPolicyExecuteCount { limit }) => Some(*limit),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputPolicyState {
    /// Executions whose inputs passed the policy.
    pub accepted: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPolicyState {
    pub execution_count: u32,
}

pub trait PolicyStore {
    fn resolve_policy_by_id(&self, id: &Uid) -> Option<Policy>;
}

#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    policies: HashMap<Uid, Policy>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: Uid, policy: Policy) {
        self.policies.insert(id, policy);
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

impl PolicyStore for InMemoryPolicyStore {
    fn resolve_policy_by_id(&self, id: &Uid) -> Option<Policy> {
        self.policies.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(name: &str) -> NodeContext {
        NodeContext::new(name, VerifyKey::derive(name), NodeType::Domain)
    }

    #[test]
    fn exact_match_args_use_node_view_keys() {
        let node = domain("canada");
        let data = Uid::new();
        let mut inputs = PolicyInputs::new();
        inputs.insert(node.view(), BTreeMap::from([("data".to_owned(), data)]));

        let SubmitPolicy::BuiltIn { policy, init_args } = SubmitPolicy::exact_match(inputs.clone())
        else {
            panic!("expected built-in");
        };
        let policy = Policy::BuiltIn(BuiltinPolicy::instantiate(policy, &init_args).unwrap());
        assert_eq!(policy.inputs(), Some(&inputs));
        assert_eq!(
            policy.expected_inputs(&node),
            Some(BTreeMap::from([("data".to_owned(), data)]))
        );
        assert_eq!(policy.expected_inputs(&domain("italy")), None);
    }

    #[test]
    fn parties_may_not_share_a_keyword() {
        let canada = domain("canada");
        let italy = domain("italy");
        let mut inputs = PolicyInputs::new();
        inputs.insert(canada.view(), BTreeMap::from([("data".to_owned(), Uid::new())]));
        inputs.insert(italy.view(), BTreeMap::from([("weights".to_owned(), Uid::new())]));
        let distinct = Policy::BuiltIn(BuiltinPolicy::ExactMatch {
            inputs: inputs.clone(),
        });
        distinct.ensure_distinct_inputs().unwrap();

        inputs.insert(italy.view(), BTreeMap::from([("data".to_owned(), Uid::new())]));
        let clashing = Policy::BuiltIn(BuiltinPolicy::ExactMatch { inputs });
        let err = clashing.ensure_distinct_inputs().unwrap_err();
        assert!(matches!(
            err,
            UserCodeError::DuplicateInputName { name, first, second }
                if name == "data" && first == canada.view() && second == italy.view()
        ));
        assert!(Policy::BuiltIn(BuiltinPolicy::SingleExecutionExactOutput)
            .ensure_distinct_inputs()
            .is_ok());
    }

    #[test]
    fn execute_count_requires_a_limit() {
        let err = BuiltinPolicy::instantiate(
            BuiltinPolicyKind::OutputPolicyExecuteCount,
            &serde_json::json!({}),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            UserCodeError::InvalidPolicyArgs {
                kind: BuiltinPolicyKind::OutputPolicyExecuteCount,
                ..
            }
        ));
        let single = Policy::BuiltIn(BuiltinPolicy::SingleExecutionExactOutput);
        assert_eq!(single.execution_limit(), Some(1));
    }

    #[test]
    fn custom_policies_are_captured_and_hashed() {
        let source = CustomPolicySource {
            code: "fn Limit(n) { return n <= 3; }".into(),
            class_name: "Limit".into(),
            init_kwargs: serde_json::json!({"n": 3}),
            inputs: PolicyInputs::new(),
        };
        let policy = UserPolicy::capture(&source, VerifyKey::derive("alice")).unwrap();
        assert_eq!(policy.code_hash, sha256_hex(&source.code));
        assert_eq!(policy.canonical_code, "fn Limit(n) {\n    return n <= 3;\n}\n");

        let leaky = CustomPolicySource {
            code: "fn Limit(n) { return n <= cap; }".into(),
            ..source
        };
        assert!(matches!(
            UserPolicy::capture(&leaky, VerifyKey::derive("alice")),
            Err(UserCodeError::Script(_))
        ));
    }
}

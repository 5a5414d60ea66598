use std::collections::BTreeMap;

use fedgov_usercode::{
    sha256_hex, submit_user_code_to_user_code, CmpCrudPermission, CmpPermission,
    InMemoryActionStore, InMemoryPolicyStore, InputArg, Limits, NodeContext, NodeType,
    PolicyInputs, ScriptError, StatusRefusal, SubmitPolicy, SubmitUserCode, Uid, UserCodeError,
    UserCodeService, UserCodeStatus, Value, VerifyKey,
};
use pretty_assertions::assert_eq;
use serde_json::json;

const MEAN: &str = "fn mean(data) {\n    return {\"mean\": sum(data) / len(data), \"n\": len(data)};\n}";

fn domain(name: &str) -> NodeContext {
    NodeContext::new(name, VerifyKey::derive(name), NodeType::Domain)
}

fn service(node: NodeContext) -> UserCodeService {
    UserCodeService::new(
        node,
        InMemoryPolicyStore::new(),
        InMemoryActionStore::new(),
        Limits::default(),
    )
}

fn pinned(node: &NodeContext, name: &str, id: Uid) -> PolicyInputs {
    BTreeMap::from([(node.view(), BTreeMap::from([(name.to_owned(), id)]))])
}

fn submission(code: &str, inputs: PolicyInputs, output_policy: SubmitPolicy) -> SubmitUserCode {
    SubmitUserCode::builder(code)
        .input_policy(SubmitPolicy::exact_match(inputs))
        .output_policy(output_policy)
        .outputs(["mean"])
        .build()
        .unwrap()
}

fn kwargs(entries: &[(&str, Uid)]) -> BTreeMap<String, InputArg> {
    entries
        .iter()
        .map(|(name, id)| ((*name).to_owned(), InputArg::from(*id)))
        .collect()
}

#[test]
fn identical_submissions_transform_identically() {
    let node = domain("canada");
    let data = Uid::new();
    let alice = VerifyKey::derive("alice");
    let input = submission(MEAN, pinned(&node, "data", data), SubmitPolicy::single_execution());
    let policies = InMemoryPolicyStore::new();

    let first = submit_user_code_to_user_code(&input, alice, &node, &policies).unwrap();
    let second = submit_user_code_to_user_code(&input, alice, &node, &policies).unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(first.code_hash, second.code_hash);
    assert_eq!(first.code_hash, sha256_hex(MEAN));
    assert_eq!(first.parsed_code, second.parsed_code);
    assert_eq!(first.unique_func_name, second.unique_func_name);
    assert_eq!(first.user_unique_func_name, second.user_unique_func_name);

    let bob = submit_user_code_to_user_code(&input, VerifyKey::derive("bob"), &node, &policies)
        .unwrap();
    assert_eq!(bob.code_hash, first.code_hash);
    assert_ne!(bob.unique_func_name, first.unique_func_name);
}

#[test]
fn domain_execution_flow() {
    let node = domain("canada");
    let alice = VerifyKey::derive("alice");
    let mut service = service(node.clone());
    let data = service
        .actions_mut()
        .put(Value::List(vec![Value::Int(2), Value::Int(4), Value::Int(9)]));

    let input = submission(MEAN, pinned(&node, "data", data), SubmitPolicy::execute_count(2));
    let id = service.submit(&input, alice).unwrap().id;
    assert_eq!(service.status(&id).unwrap(), UserCodeStatus::Submitted);

    let err = service.execute(&id, alice, &kwargs(&[("data", data)])).unwrap_err();
    assert!(matches!(
        err,
        UserCodeError::NotApproved {
            status: UserCodeStatus::Submitted,
            ..
        }
    ));

    let approved = service
        .review(&id, "canada", node.verify_key, UserCodeStatus::Execute)
        .unwrap();
    assert_eq!(approved, UserCodeStatus::Execute);

    let other = service.actions_mut().put(Value::List(vec![Value::Int(1)]));
    let err = service.execute(&id, alice, &kwargs(&[("data", other)])).unwrap_err();
    assert!(matches!(err, UserCodeError::PolicyViolation(_)));

    let result = service.execute(&id, alice, &kwargs(&[("data", data)])).unwrap();
    assert_eq!(result.result, json!({"mean": 5.0}));
    assert_eq!(result.user_code_id, id);

    service.execute(&id, alice, &kwargs(&[("data", data)])).unwrap();
    let err = service.execute(&id, alice, &kwargs(&[("data", data)])).unwrap_err();
    assert!(matches!(err, UserCodeError::OutputPolicyExhausted { limit: 2 }));

    let stored = service.get_by_id(&id).unwrap();
    assert_eq!(stored.output_policy_state.execution_count, 2);
    assert_eq!(service.results_for(&id).len(), 2);
    assert_eq!(
        service.latest_for(&stored.user_unique_func_name).map(|code| code.id),
        Some(id)
    );
}

#[test]
fn none_execute_grant_blocks_the_requester() {
    let node = domain("canada");
    let alice = VerifyKey::derive("alice");
    let mut service = service(node.clone());
    let data = service.actions_mut().put(Value::List(vec![Value::Int(1)]));
    let id = service
        .submit(
            &submission(MEAN, pinned(&node, "data", data), SubmitPolicy::single_execution()),
            alice,
        )
        .unwrap()
        .id;
    service
        .review(&id, "canada", node.verify_key, UserCodeStatus::Execute)
        .unwrap();
    service
        .permissions_mut()
        .grant(CmpPermission::for_user(alice, CmpCrudPermission::NoneExecute));

    let err = service.execute(&id, alice, &kwargs(&[("data", data)])).unwrap_err();
    assert!(matches!(err, UserCodeError::PermissionDenied { requester } if requester == alice));
    assert!(service.results_for(&id).is_empty());
}

#[test]
fn enclave_requires_every_party() {
    let canada = domain("canada");
    let italy = domain("italy");
    let enclave = NodeContext::new("enclave", VerifyKey::derive("enclave"), NodeType::Enclave);
    let mut service = service(enclave);

    let x = Uid::new();
    let y = Uid::new();
    service.actions_mut().insert(x, Value::Int(3));
    service.actions_mut().insert(y, Value::Int(4));

    let mut inputs = pinned(&canada, "x", x);
    inputs.extend(pinned(&italy, "y", y));
    let input = SubmitUserCode::builder(
        "fn combine(x, y) { return {\"a\": x + y, \"b\": x * y, \"c\": 0}; }",
    )
    .input_policy(SubmitPolicy::exact_match(inputs))
    .output_policy(SubmitPolicy::single_execution())
    .outputs(["a", "b"])
    .build()
    .unwrap();
    let alice = VerifyKey::derive("alice");
    let id = service.submit(&input, alice).unwrap().id;

    let after_canada = service
        .review(&id, "canada", canada.verify_key, UserCodeStatus::Execute)
        .unwrap();
    assert_eq!(after_canada, UserCodeStatus::Submitted);

    let before = service.get_by_id(&id).unwrap().status.clone();
    let err = service
        .review(&id, "canada", canada.verify_key, UserCodeStatus::Denied)
        .unwrap_err();
    assert!(matches!(
        err,
        UserCodeError::Refused(StatusRefusal::AlreadyResolved { .. })
    ));
    assert_eq!(service.get_by_id(&id).unwrap().status, before);

    let after_italy = service
        .review(&id, "italy", italy.verify_key, UserCodeStatus::Execute)
        .unwrap();
    assert_eq!(after_italy, UserCodeStatus::Execute);

    let result = service
        .execute(&id, alice, &kwargs(&[("x", x), ("y", y)]))
        .unwrap();
    assert_eq!(result.result, json!({"a": 7, "b": 12}));
}

#[test]
fn free_variables_reject_without_committing() {
    let node = domain("canada");
    let mut service = service(node.clone());
    let code = "fn leak(data) { return secret; }";
    let input = SubmitUserCode::builder(code)
        .input_policy(SubmitPolicy::exact_match(pinned(&node, "data", Uid::new())))
        .output_policy(SubmitPolicy::single_execution())
        .build()
        .unwrap();

    let err = service.submit(&input, VerifyKey::derive("alice")).unwrap_err();
    let UserCodeError::Transform { step, source } = err else {
        panic!("expected a transform failure");
    };
    assert_eq!(step, "new_check_code");
    assert!(matches!(
        *source,
        UserCodeError::Script(ScriptError::FreeVariables { ref names }) if names == &["secret"]
    ));
    assert!(service.get_by_hash(&sha256_hex(code)).is_none());
}

#[test]
fn duplicate_source_is_rejected_with_the_existing_id() {
    let node = domain("canada");
    let mut service = service(node.clone());
    let input = submission(MEAN, pinned(&node, "data", Uid::new()), SubmitPolicy::single_execution());
    let first = service.submit(&input, VerifyKey::derive("alice")).unwrap().id;

    let err = service.submit(&input, VerifyKey::derive("bob")).unwrap_err();
    assert!(matches!(err, UserCodeError::DuplicateSubmission { existing } if existing == first));
    assert_eq!(service.get_by_hash(&sha256_hex(MEAN)).map(|code| code.id), Some(first));
}

#[test]
fn domain_must_be_named_by_the_input_policy() {
    let mut service = service(domain("canada"));
    let input = submission(
        MEAN,
        pinned(&domain("italy"), "data", Uid::new()),
        SubmitPolicy::single_execution(),
    );
    let err = service.submit(&input, VerifyKey::derive("alice")).unwrap_err();
    assert!(matches!(
        err,
        UserCodeError::Transform { step: "add_custom_status", source }
            if matches!(*source, UserCodeError::MissingReviewer(_))
    ));
}

//! Submission, review and execution of user code on one node.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, warn};

use crate::{
    code::{extract_uids, InputArg, SubmitUserCode, UserCode, UserCodeExecutionResult},
    errors::{UserCodeError, UserCodeResult},
    executor::Executor,
    node::NodeContext,
    permission::PermissionSet,
    policy::{InMemoryPolicyStore, PolicyStore},
    script::{Limits, Value},
    status::UserCodeStatus,
    store::{ActionStore, InMemoryActionStore, UserCodeStore},
    transform::submit_user_code_to_user_code,
    uid::{Uid, VerifyKey},
};

pub struct UserCodeService<P = InMemoryPolicyStore, A = InMemoryActionStore> {
    node: NodeContext,
    policies: P,
    actions: A,
    store: UserCodeStore,
    permissions: PermissionSet,
    executor: Executor,
}

impl<P: PolicyStore, A: ActionStore> UserCodeService<P, A> {
    pub fn new(node: NodeContext, policies: P, actions: A, limits: Limits) -> Self {
        Self {
            node,
            policies,
            actions,
            store: UserCodeStore::new(),
            permissions: PermissionSet::new(),
            executor: Executor::new(limits),
        }
    }

    pub fn node(&self) -> &NodeContext {
        &self.node
    }

    pub fn permissions_mut(&mut self) -> &mut PermissionSet {
        &mut self.permissions
    }

    pub fn actions_mut(&mut self) -> &mut A {
        &mut self.actions
    }

    pub fn policies_mut(&mut self) -> &mut P {
        &mut self.policies
    }

    /// Transforms and stores a submission. Identical source already on the
    /// node is rejected with the existing id.
    pub fn submit(
        &mut self,
        submission: &SubmitUserCode,
        credentials: VerifyKey,
    ) -> UserCodeResult<&UserCode> {
        let code =
            submit_user_code_to_user_code(submission, credentials, &self.node, &self.policies)?;
        if let Some(existing) = self.store.get_by_hash(&code.code_hash) {
            warn!(
                "duplicate submission func={} existing={}",
                code.service_func_name, existing.id
            );
            return Err(UserCodeError::DuplicateSubmission {
                existing: existing.id,
            });
        }
        info!(
            "code submitted id={} func={} user={credentials} status={}",
            code.id, code.service_func_name, code.status
        );
        let id = code.id;
        self.store.insert(code);
        self.get_by_id(&id)
    }

    pub fn get_by_id(&self, id: &Uid) -> UserCodeResult<&UserCode> {
        self.store.get(id).ok_or(UserCodeError::CodeNotFound(*id))
    }

    pub fn get_by_hash(&self, code_hash: &str) -> Option<&UserCode> {
        self.store.get_by_hash(code_hash)
    }

    pub fn latest_for(&self, user_unique_func_name: &str) -> Option<&UserCode> {
        self.store.latest_for(user_unique_func_name)
    }

    /// Aggregate status of `id` as this node sees it.
    pub fn status(&self, id: &Uid) -> UserCodeResult<UserCodeStatus> {
        self.get_by_id(id)?.status.for_context(&self.node)
    }

    /// Records one reviewer's decision and returns the new aggregate status.
    pub fn review(
        &mut self,
        id: &Uid,
        reviewer_name: &str,
        reviewer_key: VerifyKey,
        decision: UserCodeStatus,
    ) -> UserCodeResult<UserCodeStatus> {
        let code = self
            .store
            .get_mut(id)
            .ok_or(UserCodeError::CodeNotFound(*id))?;
        if let Err(refusal) = code.status.mutate(decision, reviewer_name, reviewer_key) {
            warn!("review refused id={id} reviewer={reviewer_name} reason={refusal}");
            return Err(refusal.into());
        }
        info!("review applied id={id} reviewer={reviewer_name} decision={decision}");
        code.status.for_context(&self.node)
    }

    /// Runs `id` for `requester` once every gate passes, storing the result.
    pub fn execute(
        &mut self,
        id: &Uid,
        requester: VerifyKey,
        kwargs: &BTreeMap<String, InputArg>,
    ) -> UserCodeResult<UserCodeExecutionResult> {
        let code = self.store.get(id).ok_or(UserCodeError::CodeNotFound(*id))?;

        let status = code.status.for_context(&self.node)?;
        if status != UserCodeStatus::Execute {
            return Err(UserCodeError::NotApproved { id: *id, status });
        }
        if !self.permissions.allows_execute(&requester) {
            warn!("execution denied id={id} requester={requester}");
            return Err(UserCodeError::PermissionDenied { requester });
        }

        let ids = extract_uids(kwargs)?;
        check_inputs(code, &self.node, &ids)?;
        if let Some(limit) = code.output_policy.execution_limit() {
            if code.output_policy_state.execution_count >= limit {
                return Err(UserCodeError::OutputPolicyExhausted { limit });
            }
        }

        let values = ids
            .iter()
            .map(|(name, uid)| {
                self.actions
                    .get(uid)
                    .map(|value| (name.clone(), value))
                    .ok_or(UserCodeError::ActionNotFound(*uid))
            })
            .collect::<UserCodeResult<BTreeMap<String, Value>>>()?;

        let result = self.executor.execute_byte_code(code, values)?;
        info!(
            "code executed id={id} requester={requester} result_id={}",
            result.id
        );

        if let Some(code) = self.store.get_mut(id) {
            code.input_policy_state.accepted += 1;
            code.output_policy_state.execution_count += 1;
        }
        self.store.append_result(result.clone());
        Ok(result)
    }

    pub fn results_for(&self, id: &Uid) -> &[UserCodeExecutionResult] {
        self.store.results_for(id)
    }
}

fn check_inputs(
    code: &UserCode,
    node: &NodeContext,
    ids: &BTreeMap<String, Uid>,
) -> UserCodeResult<()> {
    let declared: BTreeSet<&String> = code.input_kwargs.iter().collect();
    let given: BTreeSet<&String> = ids.keys().collect();
    if declared != given {
        return Err(UserCodeError::PolicyViolation(format!(
            "expected inputs {:?}, got {:?}",
            code.input_kwargs,
            ids.keys().collect::<Vec<_>>()
        )));
    }
    if let Some(expected) = code.input_policy.expected_inputs(node) {
        if let Some((name, _)) = expected.iter().find(|(name, uid)| ids.get(*name) != Some(*uid)) {
            return Err(UserCodeError::PolicyViolation(format!(
                "input `{name}` is not the approved object"
            )));
        }
    }
    Ok(())
}

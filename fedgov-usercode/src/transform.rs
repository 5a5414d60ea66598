//! Submission to stored code unit, as an ordered list of steps over a
//! shared context. A failing step aborts the run and nothing is kept.

use tracing::debug;

use crate::{
    code::{sha256_hex, SubmitUserCode, UserCode},
    errors::{UserCodeError, UserCodeResult},
    node::NodeContext,
    policy::{BuiltinPolicy, InputPolicyState, OutputPolicyState, Policy, PolicyStore, SubmitPolicy, UserPolicy},
    script::process_code,
    signature::{ReturnAnnotation, Signature},
    status::UserCodeStatusContext,
    uid::{Uid, VerifyKey},
};

pub struct TransformContext<'a> {
    pub credentials: VerifyKey,
    pub node: &'a NodeContext,
    pub policies: &'a dyn PolicyStore,
    pub input: &'a SubmitUserCode,
    pub output: UserCodeDraft,
}

/// Fields of a [`UserCode`] as the steps fill them in.
#[derive(Clone, Debug, Default)]
pub struct UserCodeDraft {
    pub id: Option<Uid>,
    pub raw_code: Option<String>,
    pub code_hash: Option<String>,
    pub service_func_name: Option<String>,
    pub unique_func_name: Option<String>,
    pub user_unique_func_name: Option<String>,
    pub signature: Option<Signature>,
    pub parsed_code: Option<String>,
    pub user_verify_key: Option<VerifyKey>,
    pub input_policy: Option<Policy>,
    pub output_policy: Option<Policy>,
    pub input_policy_state: Option<InputPolicyState>,
    pub output_policy_state: Option<OutputPolicyState>,
    pub status: Option<UserCodeStatusContext>,
}

fn required<T>(field: Option<T>, name: &'static str) -> UserCodeResult<T> {
    field.ok_or(UserCodeError::IncompleteDraft(name))
}

impl UserCodeDraft {
    pub fn finish(self, input: &SubmitUserCode) -> UserCodeResult<UserCode> {
        Ok(UserCode {
            id: required(self.id, "id")?,
            user_verify_key: required(self.user_verify_key, "user_verify_key")?,
            raw_code: required(self.raw_code, "raw_code")?,
            code_hash: required(self.code_hash, "code_hash")?,
            parsed_code: required(self.parsed_code, "parsed_code")?,
            service_func_name: required(self.service_func_name, "service_func_name")?,
            unique_func_name: required(self.unique_func_name, "unique_func_name")?,
            user_unique_func_name: required(self.user_unique_func_name, "user_unique_func_name")?,
            signature: required(self.signature, "signature")?,
            input_policy: required(self.input_policy, "input_policy")?,
            input_policy_state: required(self.input_policy_state, "input_policy_state")?,
            input_policy_init_args: input.input_policy_init_args(),
            output_policy: required(self.output_policy, "output_policy")?,
            output_policy_state: required(self.output_policy_state, "output_policy_state")?,
            output_policy_init_args: input.output_policy_init_args(),
            status: required(self.status, "status")?,
            input_kwargs: input.input_kwargs.clone(),
            outputs: input.outputs.clone(),
        })
    }
}

pub type TransformStep = fn(&mut TransformContext<'_>) -> UserCodeResult<()>;

pub fn submit_user_code_steps() -> [(&'static str, TransformStep); 11] {
    [
        ("generate_id", generate_id as TransformStep),
        ("hash_code", hash_code as TransformStep),
        ("generate_unique_func_name", generate_unique_func_name as TransformStep),
        ("modify_signature", modify_signature as TransformStep),
        ("new_check_code", new_check_code as TransformStep),
        ("add_credentials", add_credentials as TransformStep),
        ("check_input_policy", check_input_policy as TransformStep),
        ("check_output_policy", check_output_policy as TransformStep),
        ("init_input_policy_state", init_input_policy_state as TransformStep),
        ("init_output_policy_state", init_output_policy_state as TransformStep),
        ("add_custom_status", add_custom_status as TransformStep),
    ]
}

/// Runs every step in order for a submission served on `node`.
pub fn submit_user_code_to_user_code(
    input: &SubmitUserCode,
    credentials: VerifyKey,
    node: &NodeContext,
    policies: &dyn PolicyStore,
) -> UserCodeResult<UserCode> {
    let mut context = TransformContext {
        credentials,
        node,
        policies,
        input,
        output: UserCodeDraft::default(),
    };
    for (step, run) in submit_user_code_steps() {
        debug!("transform step={step} func={}", input.func_name);
        run(&mut context).map_err(|source| UserCodeError::Transform {
            step,
            source: Box::new(source),
        })?;
    }
    context.output.finish(input)
}

pub fn generate_id(context: &mut TransformContext<'_>) -> UserCodeResult<()> {
    context.output.id = Some(Uid::new());
    Ok(())
}

pub fn hash_code(context: &mut TransformContext<'_>) -> UserCodeResult<()> {
    let code = context.input.code.clone();
    context.output.code_hash = Some(sha256_hex(&code));
    context.output.raw_code = Some(code);
    Ok(())
}

pub fn generate_unique_func_name(context: &mut TransformContext<'_>) -> UserCodeResult<()> {
    let code_hash = context
        .output
        .code_hash
        .as_deref()
        .ok_or(UserCodeError::IncompleteDraft("code_hash"))?;
    let service_func_name = &context.input.func_name;
    let credentials = context.credentials;
    context.output.unique_func_name =
        Some(format!("user_func_{service_func_name}_{credentials}_{code_hash}"));
    context.output.user_unique_func_name =
        Some(format!("user_func_{service_func_name}_{credentials}"));
    context.output.service_func_name = Some(service_func_name.clone());
    Ok(())
}

pub fn modify_signature(context: &mut TransformContext<'_>) -> UserCodeResult<()> {
    context.output.signature = Some(
        context
            .input
            .signature
            .clone()
            .with_return_annotation(ReturnAnnotation::StructuredMapping),
    );
    Ok(())
}

pub fn new_check_code(context: &mut TransformContext<'_>) -> UserCodeResult<()> {
    let raw_code = required(context.output.raw_code.as_deref(), "raw_code")?;
    let unique_func_name = required(context.output.unique_func_name.as_deref(), "unique_func_name")?;
    let processed = process_code(
        raw_code,
        unique_func_name,
        &context.input.func_name,
        &context.input.input_kwargs,
        &context.input.outputs,
    )?;
    context.output.parsed_code = Some(processed.source);
    Ok(())
}

pub fn add_credentials(context: &mut TransformContext<'_>) -> UserCodeResult<()> {
    context.output.user_verify_key = Some(context.credentials);
    Ok(())
}

fn check_policy(context: &TransformContext<'_>, policy: &SubmitPolicy) -> UserCodeResult<Policy> {
    let policy = match policy {
        SubmitPolicy::Reference { id } => context
            .policies
            .resolve_policy_by_id(id)
            .ok_or(UserCodeError::PolicyNotFound(*id))?,
        SubmitPolicy::BuiltIn { policy, init_args } => {
            Policy::BuiltIn(BuiltinPolicy::instantiate(*policy, init_args)?)
        }
        SubmitPolicy::Custom(source) => {
            Policy::User(UserPolicy::capture(source, context.credentials)?)
        }
    };
    policy.ensure_distinct_inputs()?;
    Ok(policy)
}

pub fn check_input_policy(context: &mut TransformContext<'_>) -> UserCodeResult<()> {
    let policy = check_policy(context, &context.input.input_policy)?;
    context.output.input_policy = Some(policy);
    Ok(())
}

pub fn check_output_policy(context: &mut TransformContext<'_>) -> UserCodeResult<()> {
    let policy = check_policy(context, &context.input.output_policy)?;
    context.output.output_policy = Some(policy);
    Ok(())
}

pub fn init_input_policy_state(context: &mut TransformContext<'_>) -> UserCodeResult<()> {
    required(context.output.input_policy.as_ref(), "input_policy")?;
    context.output.input_policy_state = Some(InputPolicyState::default());
    Ok(())
}

pub fn init_output_policy_state(context: &mut TransformContext<'_>) -> UserCodeResult<()> {
    required(context.output.output_policy.as_ref(), "output_policy")?;
    context.output.output_policy_state = Some(OutputPolicyState::default());
    Ok(())
}

pub fn add_custom_status(context: &mut TransformContext<'_>) -> UserCodeResult<()> {
    let input_policy = required(context.output.input_policy.as_ref(), "input_policy")?;
    let status = UserCodeStatusContext::initial(context.node, input_policy)?;
    context.output.status = Some(status);
    Ok(())
}

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use fedgov_dp::{
    Aggregation, DataSubjectList, InMemoryLedger, LedgerError, PublishConfig, PublishError,
    PublishGate, PublishParams, PublishReceipt, Query,
};
use fedgov_usercode::{
    InMemoryActionStore, InMemoryPolicyStore, InputArg, NodeContext, SubmitPolicy, SubmitUserCode,
    Uid, UserCodeError, UserCodeService, UserCodeStatus, Value, VerifyKey,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::{Config, ConfigError};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    UserCode(#[from] UserCodeError),
    #[error("unable to read request {path}: {source}")]
    RequestIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed request {path}: {source}")]
    RequestFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A publish request as read from JSON. Budget and sigma fall back to the
/// `[publish]` section.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PublishRequest {
    pub values: Vec<f64>,
    pub min_vals: Vec<f64>,
    pub max_vals: Vec<f64>,
    pub subjects: Vec<String>,
    #[serde(default = "default_linear")]
    pub linear: bool,
    #[serde(default)]
    pub budget: Option<f64>,
    #[serde(default)]
    pub sigma: Option<f64>,
    #[serde(default)]
    pub aggregation: Aggregation,
}

const fn default_linear() -> bool {
    true
}

/// A code submission as read from JSON.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SubmitRequest {
    pub code: String,
    pub input_policy: SubmitPolicy,
    pub output_policy: SubmitPolicy,
    #[serde(default)]
    pub outputs: Vec<String>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SubmitReport {
    pub id: Uid,
    pub code_hash: String,
    pub unique_func_name: String,
    pub user_unique_func_name: String,
    pub status: UserCodeStatus,
    pub parsed_code: String,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct DemoReport {
    pub submission: SubmitReport,
    pub status: UserCodeStatus,
    pub result: serde_json::Value,
    pub stdout: String,
    pub published: PublishReceipt,
}

pub fn read_request<T: DeserializeOwned>(path: &Path) -> Result<T, NodeError> {
    let raw = fs::read_to_string(path).map_err(|source| NodeError::RequestIo {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| NodeError::RequestFormat {
        path: path.to_path_buf(),
        source,
    })
}

pub struct NodeService {
    node: NodeContext,
    publish: PublishConfig,
    gate: PublishGate,
    ledger: InMemoryLedger,
    usercode: UserCodeService,
}

impl NodeService {
    pub fn new(config: &Config) -> Result<Self, NodeError> {
        let node = config.node.context()?;
        let ledger = InMemoryLedger::restore(config.ledger.clone())?;
        let usercode = UserCodeService::new(
            node.clone(),
            InMemoryPolicyStore::new(),
            InMemoryActionStore::new(),
            config.executor.limits(),
        );
        info!("node ready name={} type={}", node.name, node.node_type);
        Ok(Self {
            node,
            publish: config.publish.clone(),
            gate: PublishGate::new(&config.publish),
            ledger,
            usercode,
        })
    }

    pub fn node(&self) -> &NodeContext {
        &self.node
    }

    pub fn ledger(&self) -> &InMemoryLedger {
        &self.ledger
    }

    pub fn publish(&mut self, request: &PublishRequest) -> Result<PublishReceipt, NodeError> {
        let query = Query {
            values: request.values.clone(),
            min_vals: request.min_vals.clone(),
            max_vals: request.max_vals.clone(),
            subjects: DataSubjectList::from_subjects(request.subjects.iter().map(String::as_str)),
            linear: request.linear,
        };
        let params = PublishParams {
            budget: request.budget.unwrap_or(self.publish.default_budget),
            sigma: request.sigma.unwrap_or(self.publish.default_sigma),
            aggregation: request.aggregation,
        };
        let receipt = self.gate.publish(&query, &mut self.ledger, &params)?;
        info!(
            "published value={} worst_case_l2_norm={}",
            receipt.value, receipt.worst_case_l2_norm
        );
        Ok(receipt)
    }

    pub fn submit(
        &mut self,
        request: &SubmitRequest,
        credentials: VerifyKey,
    ) -> Result<SubmitReport, NodeError> {
        let submission = SubmitUserCode::builder(request.code.clone())
            .input_policy(request.input_policy.clone())
            .output_policy(request.output_policy.clone())
            .outputs(request.outputs.iter().cloned())
            .build()?;
        let code = self.usercode.submit(&submission, credentials)?;
        Ok(SubmitReport {
            id: code.id,
            code_hash: code.code_hash.clone(),
            unique_func_name: code.unique_func_name.clone(),
            user_unique_func_name: code.user_unique_func_name.clone(),
            status: code.status.for_context(&self.node)?,
            parsed_code: code.parsed_code.clone(),
        })
    }

    /// One pass through both paths on this node: a clipped sum submitted,
    /// approved and executed as user code, then the same values released
    /// through the privacy ledger.
    pub fn run_demo(&mut self) -> Result<DemoReport, NodeError> {
        let subjects = ["ada", "bo", "cy", "ada"];
        let ages = [34.0, 51.0, 27.0, 40.0];
        let dataset = self.usercode.actions_mut().put(Value::List(
            ages.iter().map(|age| Value::Float(*age)).collect(),
        ));

        let inputs = BTreeMap::from([(
            self.node.view(),
            BTreeMap::from([("ages".to_owned(), dataset)]),
        )]);
        let request = SubmitRequest {
            code: DEMO_CODE.to_owned(),
            input_policy: SubmitPolicy::exact_match(inputs),
            output_policy: SubmitPolicy::single_execution(),
            outputs: vec!["total".into(), "count".into()],
        };
        let scientist = VerifyKey::derive("demo-scientist");
        let submission = self.submit(&request, scientist)?;

        let status = self.usercode.review(
            &submission.id,
            &self.node.name,
            self.node.verify_key,
            UserCodeStatus::Execute,
        )?;
        let kwargs = BTreeMap::from([("ages".to_owned(), InputArg::from(dataset))]);
        let execution = self.usercode.execute(&submission.id, scientist, &kwargs)?;

        let published = self.publish(&PublishRequest {
            values: ages.to_vec(),
            min_vals: vec![0.0; ages.len()],
            max_vals: vec![100.0; ages.len()],
            subjects: subjects.iter().map(|s| (*s).to_owned()).collect(),
            linear: true,
            budget: None,
            sigma: None,
            aggregation: Aggregation::Sum,
        })?;

        Ok(DemoReport {
            submission,
            status,
            result: execution.result,
            stdout: execution.stdout,
            published,
        })
    }
}

const DEMO_CODE: &str = r#"fn clipped_total(ages) {
    let total = 0;
    for age in ages {
        total = total + min(max(age, 0), 100);
    }
    print("rows", len(ages));
    return {"total": total, "count": len(ages)};
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn service() -> NodeService {
        NodeService::new(&Config::sample()).unwrap()
    }

    #[test]
    fn publish_without_noise_returns_the_clipped_sum() {
        let mut service = service();
        let receipt = service
            .publish(&PublishRequest {
                values: vec![5.0, 10.0],
                min_vals: vec![0.0, 0.0],
                max_vals: vec![10.0, 10.0],
                subjects: vec!["a".into(), "b".into()],
                linear: true,
                budget: Some(1000.0),
                sigma: Some(0.0),
                aggregation: Aggregation::Sum,
            })
            .unwrap();
        assert_eq!(receipt.value, 15.0);
        assert_eq!(service.ledger().len(), 2);
    }

    #[test]
    fn non_linear_requests_are_refused() {
        let mut service = service();
        let request: PublishRequest = serde_json::from_value(json!({
            "values": [1.0],
            "min-vals": [0.0],
            "max-vals": [2.0],
            "subjects": ["a"],
            "linear": false
        }))
        .unwrap();
        assert!(matches!(
            service.publish(&request),
            Err(NodeError::Publish(PublishError::NonLinearUnsupported))
        ));
    }

    #[test]
    fn demo_runs_both_paths() {
        let mut service = service();
        let report = service.run_demo().unwrap();
        assert_eq!(report.status, UserCodeStatus::Execute);
        assert_eq!(report.result, json!({"total": 152.0, "count": 4}));
        assert_eq!(report.stdout, "rows 4\n");
        assert_eq!(report.submission.status, UserCodeStatus::Submitted);
        assert_eq!(service.ledger().len(), 4);
    }

    #[test]
    fn submissions_report_derived_names() {
        let mut service = service();
        let node = service.node().clone();
        let request: SubmitRequest = serde_json::from_value(json!({
            "code": "fn count(rows) { return len(rows); }",
            "input-policy": SubmitPolicy::exact_match(BTreeMap::from([(
                node.view(),
                BTreeMap::from([("rows".to_owned(), Uid::new())]),
            )])),
            "output-policy": { "kind": "built-in", "policy": "single-execution-exact-output" }
        }))
        .unwrap();
        let alice = VerifyKey::derive("alice");
        let report = service.submit(&request, alice).unwrap();
        assert_eq!(
            report.user_unique_func_name,
            format!("user_func_count_{alice}")
        );
        assert!(report.unique_func_name.ends_with(&report.code_hash));
    }
}

use rand::{rngs::StdRng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    bounds::calculate_bounds_for_mechanism,
    config::PublishConfig,
    errors::{PublishError, PublishResult},
    ledger::{PrivacyLedger, SpendBatch},
    subjects::DataSubjectList,
};

/// One statistical query over protected values.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Query {
    pub values: Vec<f64>,
    pub min_vals: Vec<f64>,
    pub max_vals: Vec<f64>,
    pub subjects: DataSubjectList,
    pub linear: bool,
}

impl Query {
    pub fn linear(
        values: Vec<f64>,
        min_vals: Vec<f64>,
        max_vals: Vec<f64>,
        subjects: DataSubjectList,
    ) -> Self {
        Self {
            values,
            min_vals,
            max_vals,
            subjects,
            linear: true,
        }
    }
}

/// Built-in output functions. Masked subjects contribute zero, so `Mean`
/// divides by the full value count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Aggregation {
    #[default]
    Sum,
    Mean,
    Min,
    Max,
}

impl Aggregation {
    pub fn apply(&self, values: &[f64]) -> f64 {
        match self {
            Aggregation::Sum => values.iter().sum(),
            Aggregation::Mean => {
                if values.is_empty() {
                    0.0
                } else {
                    values.iter().sum::<f64>() / values.len() as f64
                }
            }
            Aggregation::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Aggregation::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PublishParams {
    /// Per-query-issuer ceiling on each subject's cumulative spend.
    pub budget: f64,
    pub sigma: f64,
    #[serde(default)]
    pub aggregation: Aggregation,
}

impl PublishParams {
    pub fn from_config(config: &PublishConfig) -> Self {
        Self {
            budget: config.default_budget,
            sigma: config.default_sigma,
            aggregation: Aggregation::Sum,
        }
    }
}

/// What the query issuer gets back. The actual L2 norm is deliberately absent.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PublishReceipt {
    pub value: f64,
    pub worst_case_l2_norm: f64,
}

/// Gates a single aggregate release on the privacy ledger and adds Gaussian
/// noise to whatever survives the budget mask.
pub struct PublishGate {
    rng: ChaCha20Rng,
}

impl PublishGate {
    pub fn new(config: &PublishConfig) -> Self {
        match config.noise_seed.as_deref() {
            Some(label) => Self::with_seed(*blake3::hash(label.as_bytes()).as_bytes()),
            None => {
                let mut seed = [0u8; 32];
                StdRng::from_entropy().fill_bytes(&mut seed);
                Self::with_seed(seed)
            }
        }
    }

    pub fn with_seed(seed: [u8; 32]) -> Self {
        Self {
            rng: ChaCha20Rng::from_seed(seed),
        }
    }

    pub fn publish<L>(
        &mut self,
        query: &Query,
        ledger: &mut L,
        params: &PublishParams,
    ) -> PublishResult<PublishReceipt>
    where
        L: PrivacyLedger + ?Sized,
    {
        let aggregation = params.aggregation;
        self.publish_with(query, ledger, params.budget, params.sigma, |values| {
            aggregation.apply(values)
        })
    }

    /// Runs the release with a caller-supplied output function.
    ///
    /// Ledger calls happen strictly in the order append, over-budget query,
    /// flush, and all of them complete before the value is released. Spend is
    /// recorded for every subject, including the ones masked out of the
    /// result.
    pub fn publish_with<L, F>(
        &mut self,
        query: &Query,
        ledger: &mut L,
        budget: f64,
        sigma: f64,
        output_func: F,
    ) -> PublishResult<PublishReceipt>
    where
        L: PrivacyLedger + ?Sized,
        F: Fn(&[f64]) -> f64,
    {
        if !sigma.is_finite() || sigma < 0.0 {
            return Err(PublishError::InvalidSigma(sigma));
        }
        if !budget.is_finite() || budget < 0.0 {
            return Err(PublishError::InvalidBudget(budget));
        }
        if query.subjects.len() != query.values.len() {
            return Err(PublishError::SubjectMismatch {
                values: query.values.len(),
                subjects: query.subjects.len(),
            });
        }

        let unique_subjects = query.subjects.one_hot_lookup().len();
        debug!(
            "publish start values={} subjects={unique_subjects}",
            query.values.len()
        );

        let sigmas = vec![sigma; query.values.len()];
        let coeffs = vec![1.0; query.values.len()];
        let bounds =
            calculate_bounds_for_mechanism(&query.values, &query.min_vals, &query.max_vals)?;

        if !query.linear {
            return Err(PublishError::NonLinearUnsupported);
        }
        let lipschitz_bounds = vec![1.0; query.values.len()];

        let input_entities = query.subjects.per_value();
        ledger.batch_append(SpendBatch {
            sigmas: &sigmas,
            l2_norms: &bounds.l2_norm,
            l2_norm_bounds: &bounds.worst_case_l2_norm,
            lipschitz_bounds: &lipschitz_bounds,
            coefficients: &coeffs,
            subject_ids: &input_entities,
        })?;

        let mask = ledger.get_overbudgeted_entities(budget, &input_entities)?;
        let masked = mask.iter().filter(|over| **over).count();
        debug!("publish mask obtained masked={masked}");

        let update = ledger.write_to_db()?;
        debug!("publish ledger flushed committed={}", update.committed);

        let filtered: Vec<f64> = query
            .values
            .iter()
            .zip(mask.iter())
            .map(|(value, over)| if *over { 0.0 } else { *value })
            .collect();
        let noise = Normal::new(0.0, sigma).map_err(|_| PublishError::InvalidSigma(sigma))?;
        let value = output_func(&filtered) + noise.sample(&mut self.rng);

        Ok(PublishReceipt {
            value,
            worst_case_l2_norm: bounds.disclosable(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregations_fold_filtered_values() {
        let values = [4.0, 0.0, 2.0];
        assert_eq!(Aggregation::Sum.apply(&values), 6.0);
        assert_eq!(Aggregation::Mean.apply(&values), 2.0);
        assert_eq!(Aggregation::Min.apply(&values), 0.0);
        assert_eq!(Aggregation::Max.apply(&values), 4.0);
        assert_eq!(Aggregation::Mean.apply(&[]), 0.0);
    }

    #[test]
    fn seeded_gates_draw_identical_noise() {
        let config = PublishConfig::sample();
        let mut a = PublishGate::new(&config);
        let mut b = PublishGate::new(&config);
        let normal = Normal::new(0.0, 1.0).unwrap();
        assert_eq!(normal.sample(&mut a.rng), normal.sample(&mut b.rng));
    }
}

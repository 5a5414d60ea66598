use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{config::LedgerConfig, subjects::SubjectId};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("spend batch column `{column}` has {found} entries, expected {expected}")]
    ColumnMismatch {
        column: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("spend charge for subject {subject} is not finite")]
    NonFiniteCharge { subject: SubjectId },
    #[error("unable to access ledger snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("ledger snapshot is malformed: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// Column-oriented batch of spend entries, one row per released value.
#[derive(Clone, Copy, Debug)]
pub struct SpendBatch<'a> {
    pub sigmas: &'a [f64],
    pub l2_norms: &'a [f64],
    pub l2_norm_bounds: &'a [f64],
    pub lipschitz_bounds: &'a [f64],
    pub coefficients: &'a [f64],
    pub subject_ids: &'a [SubjectId],
}

impl SpendBatch<'_> {
    /// Number of rows, after checking that every column agrees.
    pub fn rows(&self) -> Result<usize, LedgerError> {
        let expected = self.subject_ids.len();
        let columns = [
            ("sigmas", self.sigmas.len()),
            ("l2_norms", self.l2_norms.len()),
            ("l2_norm_bounds", self.l2_norm_bounds.len()),
            ("lipschitz_bounds", self.lipschitz_bounds.len()),
            ("coefficients", self.coefficients.len()),
        ];
        for (column, found) in columns {
            if found != expected {
                return Err(LedgerError::ColumnMismatch {
                    column,
                    expected,
                    found,
                });
            }
        }
        Ok(expected)
    }
}

/// Cumulative privacy spend per data subject.
///
/// Implementations must serialize appends for the same subject so that an
/// over-budget check never sees a stale spend value. Spend is never
/// decremented.
pub trait PrivacyLedger {
    fn batch_append(&mut self, batch: SpendBatch<'_>) -> Result<(), LedgerError>;

    /// Mask aligned with `subject_ids`: `true` where the subject's cumulative
    /// spend exceeds `budget`.
    fn get_overbudgeted_entities(
        &self,
        budget: f64,
        subject_ids: &[SubjectId],
    ) -> Result<Vec<bool>, LedgerError>;

    /// Durably flush everything appended since the previous flush.
    fn write_to_db(&mut self) -> Result<LedgerUpdate, LedgerError>;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SpendRecord {
    pub subject_id: SubjectId,
    pub sigma: f64,
    pub l2_norm: f64,
    pub l2_norm_bound: f64,
    pub lipschitz_bound: f64,
    pub coefficient: f64,
    pub charge: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerUpdate {
    pub committed: usize,
    pub total_records: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LedgerSnapshot {
    pub records: Vec<SpendRecord>,
    pub spend: BTreeMap<SubjectId, f64>,
}

/// Reference ledger backed by process memory with an optional JSON snapshot.
///
/// Every record is charged the Rényi cost of a Gaussian mechanism at order
/// `rdp_alpha`: `alpha * (l2 * L * c)^2 / (2 * sigma^2)`, with `sigma` clamped
/// to `sigma_floor`. Charges are summed per subject; composition beyond that
/// belongs to a real accountant.
pub struct InMemoryLedger {
    config: LedgerConfig,
    committed: Vec<SpendRecord>,
    pending: Vec<SpendRecord>,
    spend: BTreeMap<SubjectId, f64>,
}

impl InMemoryLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            committed: Vec::new(),
            pending: Vec::new(),
            spend: BTreeMap::new(),
        }
    }

    /// Opens the ledger, replaying the snapshot at `persist_path` if one
    /// exists.
    pub fn restore(config: LedgerConfig) -> Result<Self, LedgerError> {
        let mut ledger = Self::new(config);
        let Some(path) = ledger.config.persist_path.clone() else {
            return Ok(ledger);
        };
        if !path.exists() {
            return Ok(ledger);
        }
        let raw = fs::read_to_string(&path).map_err(|source| LedgerError::Io {
            path: path.clone(),
            source,
        })?;
        let snapshot: LedgerSnapshot = serde_json::from_str(&raw)?;
        debug!(
            "ledger restored path={} records={}",
            path.display(),
            snapshot.records.len()
        );
        ledger.committed = snapshot.records;
        ledger.spend = snapshot.spend;
        Ok(ledger)
    }

    pub fn spend_for(&self, subject: &SubjectId) -> f64 {
        self.spend.get(subject).copied().unwrap_or_default()
    }

    pub fn records(&self) -> impl Iterator<Item = &SpendRecord> {
        self.committed.iter().chain(self.pending.iter())
    }

    pub fn len(&self) -> usize {
        self.committed.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            records: self.records().cloned().collect(),
            spend: self.spend.clone(),
        }
    }

    fn charge(&self, sigma: f64, l2_norm: f64, lipschitz: f64, coefficient: f64) -> f64 {
        let sigma = sigma.max(self.config.sigma_floor);
        let sensitivity = l2_norm * lipschitz * coefficient;
        self.config.rdp_alpha * sensitivity * sensitivity / (2.0 * sigma * sigma)
    }

    fn persist(&self, path: &Path) -> Result<(), LedgerError> {
        let encoded = serde_json::to_string_pretty(&self.snapshot())?;
        fs::write(path, encoded).map_err(|source| LedgerError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl PrivacyLedger for InMemoryLedger {
    fn batch_append(&mut self, batch: SpendBatch<'_>) -> Result<(), LedgerError> {
        let rows = batch.rows()?;
        let mut staged = Vec::with_capacity(rows);
        for row in 0..rows {
            let subject_id = batch.subject_ids[row].clone();
            let charge = self.charge(
                batch.sigmas[row],
                batch.l2_norms[row],
                batch.lipschitz_bounds[row],
                batch.coefficients[row],
            );
            if !charge.is_finite() || charge < 0.0 {
                return Err(LedgerError::NonFiniteCharge {
                    subject: subject_id,
                });
            }
            staged.push(SpendRecord {
                subject_id,
                sigma: batch.sigmas[row],
                l2_norm: batch.l2_norms[row],
                l2_norm_bound: batch.l2_norm_bounds[row],
                lipschitz_bound: batch.lipschitz_bounds[row],
                coefficient: batch.coefficients[row],
                charge,
            });
        }
        for record in &staged {
            *self.spend.entry(record.subject_id.clone()).or_default() += record.charge;
        }
        debug!("ledger append rows={rows} pending={}", self.pending.len() + rows);
        self.pending.extend(staged);
        Ok(())
    }

    fn get_overbudgeted_entities(
        &self,
        budget: f64,
        subject_ids: &[SubjectId],
    ) -> Result<Vec<bool>, LedgerError> {
        Ok(subject_ids
            .iter()
            .map(|subject| self.spend_for(subject) > budget)
            .collect())
    }

    fn write_to_db(&mut self) -> Result<LedgerUpdate, LedgerError> {
        let committed = self.pending.len();
        self.committed.append(&mut self.pending);
        if let Some(path) = self.config.persist_path.as_deref() {
            self.persist(path)?;
        }
        Ok(LedgerUpdate {
            committed,
            total_records: self.committed.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn subjects(names: &[&str]) -> Vec<SubjectId> {
        names.iter().map(|name| SubjectId::from(*name)).collect()
    }

    #[test]
    fn spend_accumulates_per_subject() {
        let mut ledger = InMemoryLedger::new(LedgerConfig::default());
        let ids = subjects(&["alice", "bob", "alice"]);
        let ones = [1.0; 3];
        ledger
            .batch_append(SpendBatch {
                sigmas: &[2.0; 3],
                l2_norms: &[2.0; 3],
                l2_norm_bounds: &[4.0; 3],
                lipschitz_bounds: &ones,
                coefficients: &ones,
                subject_ids: &ids,
            })
            .unwrap();
        // alpha 2 * 4 / (2 * 4) = 1 per row
        assert_relative_eq!(ledger.spend_for(&SubjectId::from("alice")), 2.0);
        assert_relative_eq!(ledger.spend_for(&SubjectId::from("bob")), 1.0);
        let mask = ledger
            .get_overbudgeted_entities(1.5, &subjects(&["alice", "bob", "carol"]))
            .unwrap();
        assert_eq!(mask, vec![true, false, false]);
    }

    #[test]
    fn ragged_batches_leave_the_ledger_untouched() {
        let mut ledger = InMemoryLedger::new(LedgerConfig::default());
        let ids = subjects(&["alice", "bob"]);
        let err = ledger
            .batch_append(SpendBatch {
                sigmas: &[1.0, 1.0],
                l2_norms: &[1.0],
                l2_norm_bounds: &[1.0, 1.0],
                lipschitz_bounds: &[1.0, 1.0],
                coefficients: &[1.0, 1.0],
                subject_ids: &ids,
            })
            .expect_err("ragged batch");
        assert!(matches!(
            err,
            LedgerError::ColumnMismatch {
                column: "l2_norms",
                ..
            }
        ));
        assert!(ledger.is_empty());
        assert_eq!(ledger.spend_for(&ids[0]), 0.0);
    }

    #[test]
    fn zero_sigma_is_charged_at_the_floor() {
        let ledger = InMemoryLedger::new(LedgerConfig::default());
        assert_relative_eq!(ledger.charge(0.0, 3.0, 1.0, 1.0), 9.0);
    }

    #[test]
    fn write_to_db_commits_pending_records() {
        let mut ledger = InMemoryLedger::new(LedgerConfig::default());
        let ids = subjects(&["alice"]);
        ledger
            .batch_append(SpendBatch {
                sigmas: &[1.0],
                l2_norms: &[1.0],
                l2_norm_bounds: &[1.0],
                lipschitz_bounds: &[1.0],
                coefficients: &[1.0],
                subject_ids: &ids,
            })
            .unwrap();
        assert_eq!(ledger.pending(), 1);
        let update = ledger.write_to_db().unwrap();
        assert_eq!(
            update,
            LedgerUpdate {
                committed: 1,
                total_records: 1
            }
        );
        assert_eq!(ledger.pending(), 0);
        assert_eq!(ledger.len(), 1);
    }
}

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BoundsError {
    #[error("cannot broadcast arrays of length {values}, {min} and {max} to a common shape")]
    ShapeMismatch { values: usize, min: usize, max: usize },
    #[error("sensitivity bounds need at least one value")]
    Empty,
}

/// L2 sensitivity bounds for one query, broadcast to the shape of `values`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensitivityBounds {
    /// `||values||₂`. Private: disclosing it leaks more than the mechanism
    /// guarantees, so it only ever flows into the ledger.
    pub l2_norm: Vec<f64>,
    /// `||max - min||₂`. Safe to show the query issuer for budget transparency.
    pub worst_case_l2_norm: Vec<f64>,
}

impl SensitivityBounds {
    pub fn len(&self) -> usize {
        self.l2_norm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.l2_norm.is_empty()
    }

    /// The disclosable bound as a scalar (every entry carries the same norm).
    pub fn disclosable(&self) -> f64 {
        self.worst_case_l2_norm.first().copied().unwrap_or_default()
    }
}

/// Computes the actual and worst-case L2 norms used to size the Gaussian
/// mechanism and to book privacy spend.
///
/// Each output entry holds the norm of the whole vector, not a per-element
/// value. Arrays of length one broadcast against the others; any other length
/// disagreement is a shape mismatch.
pub fn calculate_bounds_for_mechanism(
    values: &[f64],
    min_vals: &[f64],
    max_vals: &[f64],
) -> Result<SensitivityBounds, BoundsError> {
    broadcast_len(values.len(), min_vals.len(), max_vals.len())?;

    let range_width = min_vals.len().max(max_vals.len());
    let worst_case = (0..range_width)
        .map(|idx| broadcast(max_vals, idx) - broadcast(min_vals, idx))
        .map(|span| span * span)
        .sum::<f64>()
        .sqrt();
    let l2 = values.iter().map(|v| v * v).sum::<f64>().sqrt();

    Ok(SensitivityBounds {
        l2_norm: vec![l2; values.len()],
        worst_case_l2_norm: vec![worst_case; values.len()],
    })
}

fn broadcast_len(values: usize, min: usize, max: usize) -> Result<usize, BoundsError> {
    if values == 0 || min == 0 || max == 0 {
        return Err(BoundsError::Empty);
    }
    let width = values.max(min).max(max);
    if [values, min, max].iter().all(|len| *len == width || *len == 1) {
        Ok(width)
    } else {
        Err(BoundsError::ShapeMismatch { values, min, max })
    }
}

fn broadcast(array: &[f64], idx: usize) -> f64 {
    if array.len() == 1 {
        array[0]
    } else {
        array[idx]
    }
}

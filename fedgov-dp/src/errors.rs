use thiserror::Error;

use crate::{bounds::BoundsError, ledger::LedgerError};

pub type PublishResult<T> = Result<T, PublishError>;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Bounds(#[from] BoundsError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("lipschitz bounds for non-linear queries are not implemented")]
    NonLinearUnsupported,
    #[error("sigma must be finite and >= 0, got {0}")]
    InvalidSigma(f64),
    #[error("budget must be finite and >= 0, got {0}")]
    InvalidBudget(f64),
    #[error("query carries {values} values but {subjects} subject assignments")]
    SubjectMismatch { values: usize, subjects: usize },
}

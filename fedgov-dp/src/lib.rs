//! FedGov privacy-budgeted publish path.
//!
//! A query's values are bounded for sensitivity, every contribution is booked
//! against a per-subject spend ledger, and only subjects still inside their
//! budget are released as part of a Gaussian-noised aggregate. Budget is spent
//! on attempt, not on disclosure.

pub mod bounds;
pub mod config;
pub mod errors;
pub mod ledger;
pub mod publish;
pub mod subjects;

pub use bounds::{calculate_bounds_for_mechanism, BoundsError, SensitivityBounds};
pub use config::{ConfigError, LedgerConfig, PublishConfig};
pub use errors::{PublishError, PublishResult};
pub use ledger::{
    InMemoryLedger, LedgerError, LedgerSnapshot, LedgerUpdate, PrivacyLedger, SpendBatch,
    SpendRecord,
};
pub use publish::{Aggregation, PublishGate, PublishParams, PublishReceipt, Query};
pub use subjects::{DataSubjectList, SubjectId};

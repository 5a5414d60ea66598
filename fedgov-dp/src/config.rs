use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("publish config invalid: {0}")]
    Publish(String),
    #[error("ledger config invalid: {0}")]
    Ledger(String),
}

/// Defaults applied to publish requests that do not carry their own budget or
/// noise scale.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct PublishConfig {
    #[serde(default = "default_budget")]
    pub default_budget: f64,
    #[serde(default = "default_sigma")]
    pub default_sigma: f64,
    /// Label hashed into the noise RNG seed. Unset means OS entropy.
    #[serde(default)]
    pub noise_seed: Option<String>,
}

const fn default_budget() -> f64 {
    675.0
}

const fn default_sigma() -> f64 {
    1.5
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            default_budget: default_budget(),
            default_sigma: default_sigma(),
            noise_seed: None,
        }
    }
}

impl PublishConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.default_budget.is_finite() || self.default_budget < 0.0 {
            return Err(ConfigError::Publish(
                "default budget must be finite and non-negative".into(),
            ));
        }
        if !self.default_sigma.is_finite() || self.default_sigma < 0.0 {
            return Err(ConfigError::Publish(
                "default sigma must be finite and non-negative".into(),
            ));
        }
        Ok(())
    }

    pub fn sample() -> Self {
        Self {
            noise_seed: Some("fedgov/publish".into()),
            ..Self::default()
        }
    }
}

/// Parameters of the in-memory ledger's spend charge, see
/// [`crate::ledger::InMemoryLedger`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct LedgerConfig {
    #[serde(default = "default_rdp_alpha")]
    pub rdp_alpha: f64,
    /// Noise scales below this floor are charged as if they were the floor.
    #[serde(default = "default_sigma_floor")]
    pub sigma_floor: f64,
    /// Snapshot file written on every `write_to_db`.
    #[serde(default)]
    pub persist_path: Option<PathBuf>,
}

const fn default_rdp_alpha() -> f64 {
    2.0
}

const fn default_sigma_floor() -> f64 {
    1.0
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rdp_alpha: default_rdp_alpha(),
            sigma_floor: default_sigma_floor(),
            persist_path: None,
        }
    }
}

impl LedgerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.rdp_alpha.is_finite() || self.rdp_alpha <= 1.0 {
            return Err(ConfigError::Ledger("rdp alpha must be > 1".into()));
        }
        if !self.sigma_floor.is_finite() || self.sigma_floor <= 0.0 {
            return Err(ConfigError::Ledger("sigma floor must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        PublishConfig::default().validate().unwrap();
        PublishConfig::sample().validate().unwrap();
        LedgerConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_degenerate_ledger_parameters() {
        let config = LedgerConfig {
            sigma_floor: 0.0,
            ..LedgerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Ledger(_))));
        let config = LedgerConfig {
            rdp_alpha: 1.0,
            ..LedgerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

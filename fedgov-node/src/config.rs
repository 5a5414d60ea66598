use std::{
    fs,
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use fedgov_dp::{LedgerConfig, PublishConfig};
use fedgov_usercode::{ExecutorConfig, NodeContext, NodeType, VerifyKey};
use serde::Deserialize;
use thiserror::Error;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ConfigFormat {
    Auto,
    Toml,
    Yaml,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Domain,
    Enclave,
}

impl From<NodeKind> for NodeType {
    fn from(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Domain => NodeType::Domain,
            NodeKind::Enclave => NodeType::Enclave,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {format:?} config: {details}")]
    Parse {
        format: ConfigFormat,
        details: String,
    },
    #[error("configuration invalid: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub node: NodeSection,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeSection {
    pub name: String,
    #[serde(default = "default_node_type")]
    pub node_type: NodeKind,
    /// Hex verify key. When absent the key is derived from `name`.
    #[serde(default)]
    pub verify_key: Option<String>,
}

const fn default_node_type() -> NodeKind {
    NodeKind::Domain
}

impl NodeSection {
    pub fn verify_key(&self) -> Result<VerifyKey, ConfigError> {
        match &self.verify_key {
            Some(hex) => hex
                .parse()
                .map_err(|err| ConfigError::Validation(format!("node verify key: {err}"))),
            None => Ok(VerifyKey::derive(&self.name)),
        }
    }

    pub fn context(&self) -> Result<NodeContext, ConfigError> {
        Ok(NodeContext::new(
            self.name.clone(),
            self.verify_key()?,
            self.node_type.into(),
        ))
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.name.trim().is_empty() {
            return Err(ConfigError::Validation("node name must not be empty".into()));
        }
        self.node.verify_key()?;
        self.publish
            .validate()
            .map_err(|err| ConfigError::Validation(err.to_string()))?;
        self.ledger
            .validate()
            .map_err(|err| ConfigError::Validation(err.to_string()))?;
        self.executor
            .validate()
            .map_err(|err| ConfigError::Validation(err.to_string()))?;
        Ok(())
    }

    pub fn sample() -> Self {
        Self {
            node: NodeSection {
                name: "canada".into(),
                node_type: default_node_type(),
                verify_key: None,
            },
            publish: PublishConfig::sample(),
            ledger: LedgerConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

pub fn load_config(path: &Path, format: ConfigFormat) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let format = resolve_format(path, format);
    let config: Config = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(&contents).map_err(|err| ConfigError::Parse {
            format,
            details: err.to_string(),
        }),
        ConfigFormat::Toml | ConfigFormat::Auto => {
            toml::from_str(&contents).map_err(|err| ConfigError::Parse {
                format,
                details: err.to_string(),
            })
        }
    }?;
    config.validate()?;
    Ok(config)
}

fn resolve_format(path: &Path, format: ConfigFormat) -> ConfigFormat {
    match format {
        ConfigFormat::Auto => match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Toml,
        },
        _ => format,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn sample_config_is_valid() {
        Config::sample().validate().unwrap();
    }

    #[test]
    fn loads_toml_with_section_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[node]\nname = \"italy\"\nnode-type = \"enclave\"\n\n[executor]\nmax-steps = 5000\n"
        )
        .unwrap();
        let config = load_config(file.path(), ConfigFormat::Auto).unwrap();
        assert_eq!(config.node.node_type, NodeKind::Enclave);
        assert_eq!(config.executor.max_steps, 5000);
        assert_eq!(config.executor.max_call_depth, 64);
        assert_eq!(config.publish, PublishConfig::default());
        assert_eq!(
            config.node.context().unwrap().verify_key,
            VerifyKey::derive("italy")
        );
    }

    #[test]
    fn loads_yaml_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "node:\n  name: canada\npublish:\n  default-budget: 10.0\n").unwrap();
        let config = load_config(file.path(), ConfigFormat::Auto).unwrap();
        assert_eq!(config.node.node_type, NodeKind::Domain);
        assert_eq!(config.publish.default_budget, 10.0);
    }

    #[test]
    fn rejects_invalid_sections() {
        let mut config = Config::sample();
        config.ledger.sigma_floor = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = Config::sample();
        config.node.verify_key = Some("zz".into());
        assert!(config.validate().is_err());
    }
}

//! Identity of the node a request is served on.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::uid::{IdParseError, VerifyKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    /// Holds its own data; approves only for itself.
    Domain,
    /// Runs code over several domains' data; every domain must approve.
    Enclave,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Domain => write!(f, "domain"),
            NodeType::Enclave => write!(f, "enclave"),
        }
    }
}

/// A reviewing party as it appears in policies and approval records.
///
/// Renders and serializes as `name@verify_key_hex`, so it can key JSON maps.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeView {
    pub node_name: String,
    pub verify_key: VerifyKey,
}

impl NodeView {
    pub fn new(node_name: impl Into<String>, verify_key: VerifyKey) -> Self {
        Self {
            node_name: node_name.into(),
            verify_key,
        }
    }
}

impl fmt::Display for NodeView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_name, self.verify_key)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NodeViewParseError {
    #[error("node view `{0}` is missing the `@` separator")]
    MissingSeparator(String),
    #[error(transparent)]
    Key(#[from] IdParseError),
}

impl FromStr for NodeView {
    type Err = NodeViewParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let (name, key) = text
            .rsplit_once('@')
            .ok_or_else(|| NodeViewParseError::MissingSeparator(text.to_owned()))?;
        Ok(Self::new(name, key.parse()?))
    }
}

impl TryFrom<String> for NodeView {
    type Error = NodeViewParseError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        text.parse()
    }
}

impl From<NodeView> for String {
    fn from(view: NodeView) -> Self {
        view.to_string()
    }
}

/// The serving node: what the pipeline and the approval record consult.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeContext {
    pub name: String,
    pub verify_key: VerifyKey,
    pub node_type: NodeType,
}

impl NodeContext {
    pub fn new(name: impl Into<String>, verify_key: VerifyKey, node_type: NodeType) -> Self {
        Self {
            name: name.into(),
            verify_key,
            node_type,
        }
    }

    pub fn view(&self) -> NodeView {
        NodeView::new(self.name.clone(), self.verify_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn views_key_json_maps() {
        let view = NodeView::new("canada@east", VerifyKey::derive("canada"));
        let text = view.to_string();
        assert_eq!(text.parse::<NodeView>().unwrap(), view);

        let mut map = std::collections::BTreeMap::new();
        map.insert(view.clone(), 1);
        let json = serde_json::to_string(&map).unwrap();
        let back: std::collections::BTreeMap<NodeView, i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back[&view], 1);
    }
}

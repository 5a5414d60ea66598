//! Multi-party approval record for a code unit.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    errors::{UserCodeError, UserCodeResult},
    node::{NodeContext, NodeType, NodeView},
    policy::Policy,
    uid::VerifyKey,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserCodeStatus {
    Submitted,
    Denied,
    Execute,
}

impl fmt::Display for UserCodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserCodeStatus::Submitted => write!(f, "submitted"),
            UserCodeStatus::Denied => write!(f, "denied"),
            UserCodeStatus::Execute => write!(f, "execute"),
        }
    }
}

/// Why a reviewer's mutation was not applied. The record is untouched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StatusRefusal {
    #[error("{0} is not a reviewer of this code")]
    UnknownReviewer(NodeView),
    #[error("{reviewer} already resolved this code as {status}")]
    AlreadyResolved {
        reviewer: NodeView,
        status: UserCodeStatus,
    },
    #[error("a review can only resolve to execute or denied, not {0}")]
    InvalidDecision(UserCodeStatus),
}

/// Reviewer to status. Equality and hashing are by content.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserCodeStatusContext {
    pub base: BTreeMap<NodeView, UserCodeStatus>,
}

impl UserCodeStatusContext {
    pub fn new(base: BTreeMap<NodeView, UserCodeStatus>) -> Self {
        Self { base }
    }

    /// Initial record for a submission served on `node`.
    ///
    /// A domain must be one of the input policy's parties and reviews alone.
    /// On an enclave every party reviews.
    pub fn initial(node: &NodeContext, input_policy: &Policy) -> UserCodeResult<Self> {
        let parties = input_policy.inputs();
        match node.node_type {
            NodeType::Domain => {
                let view = node.view();
                if !parties.is_some_and(|inputs| inputs.contains_key(&view)) {
                    return Err(UserCodeError::MissingReviewer(view));
                }
                Ok(Self::new(BTreeMap::from([(view, UserCodeStatus::Submitted)])))
            }
            NodeType::Enclave => {
                let base: BTreeMap<_, _> = parties
                    .into_iter()
                    .flat_map(|inputs| inputs.keys())
                    .map(|view| (view.clone(), UserCodeStatus::Submitted))
                    .collect();
                if base.is_empty() {
                    return Err(UserCodeError::NoReviewers);
                }
                Ok(Self::new(base))
            }
        }
    }

    /// Aggregate status as seen from `node`.
    pub fn for_context(&self, node: &NodeContext) -> UserCodeResult<UserCodeStatus> {
        match node.node_type {
            NodeType::Enclave => {
                let statuses: Vec<UserCodeStatus> = self.base.values().copied().collect();
                if statuses.is_empty() {
                    return Err(UserCodeError::InvalidStatusState);
                }
                if statuses.contains(&UserCodeStatus::Denied) {
                    Ok(UserCodeStatus::Denied)
                } else if statuses.contains(&UserCodeStatus::Submitted) {
                    Ok(UserCodeStatus::Submitted)
                } else {
                    Ok(UserCodeStatus::Execute)
                }
            }
            NodeType::Domain => {
                let view = node.view();
                self.base
                    .get(&view)
                    .copied()
                    .ok_or(UserCodeError::NodeNotInStatus(view))
            }
        }
    }

    /// Applies one reviewer's decision. Only a present reviewer may resolve
    /// its own `Submitted` entry, and only to `Execute` or `Denied`.
    pub fn mutate(
        &mut self,
        value: UserCodeStatus,
        node_name: &str,
        verify_key: VerifyKey,
    ) -> Result<&Self, StatusRefusal> {
        let reviewer = NodeView::new(node_name, verify_key);
        if value == UserCodeStatus::Submitted {
            return Err(StatusRefusal::InvalidDecision(value));
        }
        let Some(current) = self.base.get_mut(&reviewer) else {
            return Err(StatusRefusal::UnknownReviewer(reviewer));
        };
        if *current != UserCodeStatus::Submitted {
            return Err(StatusRefusal::AlreadyResolved {
                reviewer,
                status: *current,
            });
        }
        *current = value;
        Ok(self)
    }

    pub fn get(&self, reviewer: &NodeView) -> Option<UserCodeStatus> {
        self.base.get(reviewer).copied()
    }
}

impl fmt::Display for UserCodeStatusContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (view, status)) in self.base.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {status}", view.node_name)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn view(name: &str) -> NodeView {
        NodeView::new(name, VerifyKey::derive(name))
    }

    fn enclave() -> NodeContext {
        NodeContext::new("enclave", VerifyKey::derive("enclave"), NodeType::Enclave)
    }

    fn record(entries: &[(&str, UserCodeStatus)]) -> UserCodeStatusContext {
        UserCodeStatusContext::new(
            entries
                .iter()
                .map(|(name, status)| (view(name), *status))
                .collect(),
        )
    }

    #[test]
    fn enclave_aggregation() {
        use UserCodeStatus::*;
        let node = enclave();
        let cases = [
            (vec![("a", Submitted)], Submitted),
            (vec![("a", Execute)], Execute),
            (vec![("a", Execute), ("b", Execute)], Execute),
            (vec![("a", Execute), ("b", Submitted)], Submitted),
            (vec![("a", Denied), ("b", Submitted)], Denied),
            (vec![("a", Denied), ("b", Execute)], Denied),
        ];
        for (entries, expected) in cases {
            assert_eq!(record(&entries).for_context(&node).unwrap(), expected);
        }
        assert!(matches!(
            record(&[]).for_context(&node),
            Err(UserCodeError::InvalidStatusState)
        ));
    }

    #[test]
    fn domain_sees_only_its_own_entry() {
        let status = record(&[("canada", UserCodeStatus::Execute)]);
        let canada = NodeContext::new("canada", VerifyKey::derive("canada"), NodeType::Domain);
        let italy = NodeContext::new("italy", VerifyKey::derive("italy"), NodeType::Domain);
        assert_eq!(status.for_context(&canada).unwrap(), UserCodeStatus::Execute);
        assert!(matches!(
            status.for_context(&italy),
            Err(UserCodeError::NodeNotInStatus(_))
        ));
    }

    #[test]
    fn refusals_leave_the_record_unchanged() {
        let mut status = record(&[("a", UserCodeStatus::Submitted), ("b", UserCodeStatus::Submitted)]);
        let before = status.clone();

        assert_eq!(
            status.mutate(UserCodeStatus::Execute, "c", VerifyKey::derive("c")),
            Err(StatusRefusal::UnknownReviewer(view("c")))
        );
        assert_eq!(
            status.mutate(UserCodeStatus::Submitted, "a", VerifyKey::derive("a")),
            Err(StatusRefusal::InvalidDecision(UserCodeStatus::Submitted))
        );
        assert_eq!(
            status.mutate(UserCodeStatus::Execute, "a", VerifyKey::derive("mallory")),
            Err(StatusRefusal::UnknownReviewer(NodeView::new("a", VerifyKey::derive("mallory"))))
        );
        assert_eq!(status, before);

        status
            .mutate(UserCodeStatus::Denied, "a", VerifyKey::derive("a"))
            .unwrap();
        let resolved = status.clone();
        assert_eq!(
            status.mutate(UserCodeStatus::Execute, "a", VerifyKey::derive("a")),
            Err(StatusRefusal::AlreadyResolved {
                reviewer: view("a"),
                status: UserCodeStatus::Denied
            })
        );
        assert_eq!(status, resolved);
    }
}

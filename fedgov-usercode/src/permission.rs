//! Declarative execute grants.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::uid::VerifyKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CmpCrudPermission {
    NoneExecute,
    AllExecute,
}

impl fmt::Display for CmpCrudPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CmpCrudPermission::NoneExecute => f.write_str("NONE_EXECUTE"),
            CmpCrudPermission::AllExecute => f.write_str("ALL_EXECUTE"),
        }
    }
}

/// A grant scoped to one user, or compound (everyone).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "scope")]
pub enum CmpPermission {
    User {
        user_id: VerifyKey,
        permission: CmpCrudPermission,
    },
    Compound {
        permission: CmpCrudPermission,
    },
}

impl CmpPermission {
    pub fn all_execute() -> Self {
        CmpPermission::Compound {
            permission: CmpCrudPermission::AllExecute,
        }
    }

    pub fn none_execute() -> Self {
        CmpPermission::Compound {
            permission: CmpCrudPermission::NoneExecute,
        }
    }

    pub fn for_user(user_id: VerifyKey, permission: CmpCrudPermission) -> Self {
        CmpPermission::User {
            user_id,
            permission,
        }
    }

    pub fn permission(&self) -> CmpCrudPermission {
        match self {
            CmpPermission::User { permission, .. } | CmpPermission::Compound { permission } => {
                *permission
            }
        }
    }

    /// Whether the grant speaks about `requester`.
    pub fn applies_to(&self, requester: &VerifyKey) -> bool {
        match self {
            CmpPermission::User { user_id, .. } => user_id == requester,
            CmpPermission::Compound { .. } => true,
        }
    }

    pub fn permission_string(&self) -> String {
        match self {
            CmpPermission::User {
                user_id,
                permission,
            } => format!("<{user_id}>_{permission}"),
            CmpPermission::Compound { permission } => permission.to_string(),
        }
    }
}

impl fmt::Display for CmpPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.permission_string())
    }
}

/// Grants held by a service. Execution is allowed unless a `NONE_EXECUTE`
/// grant applies to the requester.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    grants: Vec<CmpPermission>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&mut self, permission: CmpPermission) {
        if !self.grants.contains(&permission) {
            self.grants.push(permission);
        }
    }

    pub fn revoke(&mut self, permission: &CmpPermission) {
        self.grants.retain(|grant| grant != permission);
    }

    pub fn grants(&self) -> &[CmpPermission] {
        &self.grants
    }

    pub fn allows_execute(&self, requester: &VerifyKey) -> bool {
        !self.grants.iter().any(|grant| {
            grant.permission() == CmpCrudPermission::NoneExecute && grant.applies_to(requester)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_permission_strings() {
        assert_eq!(CmpPermission::all_execute().to_string(), "ALL_EXECUTE");
        assert_eq!(CmpPermission::none_execute().to_string(), "NONE_EXECUTE");
        let key = VerifyKey::derive("alice");
        assert_eq!(
            CmpPermission::for_user(key, CmpCrudPermission::AllExecute).permission_string(),
            format!("<{key}>_ALL_EXECUTE")
        );
    }

    #[test]
    fn none_execute_denies_the_named_user_only() {
        let alice = VerifyKey::derive("alice");
        let bob = VerifyKey::derive("bob");
        let mut grants = PermissionSet::new();
        grants.grant(CmpPermission::all_execute());
        assert!(grants.allows_execute(&alice));

        grants.grant(CmpPermission::for_user(alice, CmpCrudPermission::NoneExecute));
        assert!(!grants.allows_execute(&alice));
        assert!(grants.allows_execute(&bob));

        grants.grant(CmpPermission::none_execute());
        assert!(!grants.allows_execute(&bob));
    }
}

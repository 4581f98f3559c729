//! Role and permission checks for administrative actions.
//!
//! Roles are static configuration. The caller's role name is resolved outside
//! this crate and passed in; the checks here are pure functions over the table.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::error::ConfigError;

/// Explicit permission list, or the wildcard granting everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PermissionSet {
    /// Serialized as the string `"all"`.
    All(AllMarker),
    Only(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllMarker {
    All,
}

impl PermissionSet {
    pub fn all() -> Self {
        PermissionSet::All(AllMarker::All)
    }

    pub fn only(perms: &[&str]) -> Self {
        PermissionSet::Only(perms.iter().map(|p| p.to_string()).collect())
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, PermissionSet::All(_))
    }

    pub fn contains(&self, permission: &str) -> bool {
        match self {
            PermissionSet::All(_) => true,
            PermissionSet::Only(list) => list.iter().any(|p| p == permission),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub level: u32,
    pub permissions: PermissionSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialKind {
    Role,
    Permission,
    Level,
}

/// Structured authorization failure, translated to a 403 by the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("access denied: requires {kind:?} {required}, caller has {current}")]
pub struct AccessDenied {
    pub kind: DenialKind,
    pub required: String,
    pub current: String,
}

impl AccessDenied {
    pub fn code(&self) -> &'static str {
        match self.kind {
            DenialKind::Role => "INSUFFICIENT_ROLE",
            DenialKind::Permission => "INSUFFICIENT_PERMISSION",
            DenialKind::Level => "INSUFFICIENT_LEVEL",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoleTable {
    roles: HashMap<String, Role>,
}

impl RoleTable {
    pub fn new(roles: Vec<Role>) -> Result<Self, ConfigError> {
        let mut map = HashMap::with_capacity(roles.len());
        for role in roles {
            let name = role.name.clone();
            if map.insert(name.clone(), role).is_some() {
                return Err(ConfigError::Invalid(format!("duplicate role {name}")));
            }
        }
        Ok(Self { roles: map })
    }

    pub fn get(&self, role: &str) -> Option<&Role> {
        self.roles.get(role)
    }

    /// Unknown roles hold no permissions.
    pub fn has_permission(&self, role: &str, permission: &str) -> bool {
        self.get(role)
            .is_some_and(|r| r.permissions.contains(permission))
    }

    pub fn has_minimum_level(&self, role: &str, level: u32) -> bool {
        self.get(role)
            .is_some_and(|r| r.permissions.is_wildcard() || r.level >= level)
    }

    /// Require one of the named roles. Wildcard roles always pass.
    pub fn require_role(&self, role: Option<&str>, allowed: &[&str]) -> Result<(), AccessDenied> {
        let current = role.unwrap_or("anonymous");
        let ok = role.and_then(|r| self.get(r)).is_some_and(|r| {
            r.permissions.is_wildcard() || allowed.iter().any(|a| *a == r.name)
        });
        if ok {
            Ok(())
        } else {
            Err(AccessDenied {
                kind: DenialKind::Role,
                required: allowed.join(","),
                current: current.to_string(),
            })
        }
    }

    pub fn require_permission(
        &self,
        role: Option<&str>,
        permission: &str,
    ) -> Result<(), AccessDenied> {
        match role {
            Some(r) if self.has_permission(r, permission) => Ok(()),
            _ => Err(AccessDenied {
                kind: DenialKind::Permission,
                required: permission.to_string(),
                current: role.unwrap_or("anonymous").to_string(),
            }),
        }
    }

    pub fn require_minimum_level(&self, role: Option<&str>, level: u32) -> Result<(), AccessDenied> {
        match role {
            Some(r) if self.has_minimum_level(r, level) => Ok(()),
            _ => Err(AccessDenied {
                kind: DenialKind::Level,
                required: level.to_string(),
                current: role
                    .and_then(|r| self.get(r))
                    .map(|r| r.level)
                    .unwrap_or(0)
                    .to_string(),
            }),
        }
    }
}

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::SystemRole;
use crate::permissions;

/// A named bundle of permissions that users are assigned to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub name: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub permissions: Vec<String>,
    pub is_system: bool,
    pub is_active: bool,
    pub priority: i64,
}

impl RoleDefinition {
    /// Seed definition for a built-in role.
    pub fn system(role: SystemRole) -> Self {
        let priority = match role {
            SystemRole::User => 10,
            SystemRole::Manager => 50,
            SystemRole::Admin => 100,
        };
        Self {
            name: role.as_str().to_string(),
            display_name: role.display_name().to_string(),
            description: None,
            permissions: permissions::default_permissions(role)
                .into_iter()
                .map(str::to_string)
                .collect(),
            is_system: true,
            is_active: true,
            priority,
        }
    }

    pub fn system_defaults() -> Vec<Self> {
        SystemRole::ALL.into_iter().map(Self::system).collect()
    }

    /// Validates a new custom role and normalises its permission list.
    pub fn custom(
        name: &str,
        display_name: &str,
        description: Option<String>,
        permissions: Vec<String>,
        priority: i64,
    ) -> Result<Self, RoleError> {
        let name = validate_role_name(name)?;
        if name.parse::<SystemRole>().is_ok() {
            return Err(RoleError::Reserved(name));
        }
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(RoleError::MissingDisplayName);
        }
        Ok(Self {
            name,
            display_name: display_name.to_string(),
            description: description
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
            permissions: normalize_permissions(permissions)?,
            is_system: false,
            is_active: true,
            priority,
        })
    }
}

/// Deduplicates, sorts and checks every entry against the catalog.
pub fn normalize_permissions(names: Vec<String>) -> Result<Vec<String>, RoleError> {
    let mut set = BTreeSet::new();
    for name in names {
        let trimmed = name.trim();
        if !permissions::is_known(trimmed) {
            return Err(RoleError::UnknownPermission(trimmed.to_string()));
        }
        set.insert(trimmed.to_string());
    }
    Ok(set.into_iter().collect())
}

pub fn validate_role_name(raw: &str) -> Result<String, RoleError> {
    let name = raw.trim().to_ascii_lowercase();
    let valid_len = (2..=32).contains(&name.len());
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if valid_len && valid_chars {
        Ok(name)
    } else {
        Err(RoleError::InvalidName(raw.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoleError {
    #[error("role name '{0}' must be 2-32 characters of a-z, 0-9, '_' or '-'")]
    InvalidName(String),
    #[error("role name '{0}' is reserved")]
    Reserved(String),
    #[error("display name is required")]
    MissingDisplayName,
    #[error("unknown permission '{0}'")]
    UnknownPermission(String),
}

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Staff,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Staff => "staff",
        }
    }

    pub fn parse(value: &str) -> Option<Role> {
        match value {
            "owner" => Some(Role::Owner),
            "admin" => Some(Role::Admin),
            "staff" => Some(Role::Staff),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Customers,
    Orders,
    Assets,
    Billing,
    Workspace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Write,
    Delete,
    Manage,
}

/// Static role policy. Owners hold every permission; admins everything but
/// workspace management; staff read everywhere and write customer/order data.
pub fn allows(role: Role, resource: Resource, action: Action) -> bool {
    match role {
        Role::Owner => true,
        Role::Admin => !matches!(
            (resource, action),
            (Resource::Workspace, Action::Manage) | (Resource::Billing, Action::Manage)
        ),
        Role::Staff => match action {
            Action::Read => true,
            Action::Write => matches!(resource, Resource::Customers | Resource::Orders),
            Action::Delete | Action::Manage => false,
        },
    }
}

pub fn authorize(role: Role, resource: Resource, action: Action) -> AppResult<()> {
    if allows(role, resource, action) {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

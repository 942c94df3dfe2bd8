//! Caller identity passed into every user-facing operation.

use serde::{Deserialize, Serialize};

use crate::config::DevIdentity;
use crate::error::{JobGateError, JobGateResult};
use crate::job::UserId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

/// An authenticated principal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: UserId,
    pub role: Role,
}

impl Caller {
    pub fn user(user_id: UserId) -> Self {
        Self {
            user_id,
            role: Role::User,
        }
    }

    pub fn admin(user_id: UserId) -> Self {
        Self {
            user_id,
            role: Role::Admin,
        }
    }

    /// Identity named by the `dev_identity` config section.
    pub fn from_config(identity: &DevIdentity) -> Self {
        Self {
            user_id: identity.user_id,
            role: identity.role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn ensure_admin(&self) -> JobGateResult<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(JobGateError::forbidden("administrator role required"))
        }
    }

    /// Owners may act on their own resources; admins may act on anyone's.
    pub fn ensure_owner(&self, owner: UserId) -> JobGateResult<()> {
        if self.is_admin() || self.user_id == owner {
            Ok(())
        } else {
            Err(JobGateError::forbidden("resource belongs to another user"))
        }
    }
}

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::permissions::{ANY_RESOURCE, Permission};

/// Identity of an authenticated principal (human user, service account, etc).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(Uuid);

impl PrincipalId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PrincipalId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for PrincipalId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for PrincipalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(s)?))
    }
}

/// A permission granted on a resource type, optionally narrowed to one resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Grant {
    pub permission: Permission,
    pub resource_type: String,
    /// Resource id, or [`ANY_RESOURCE`] for every resource of the type.
    pub resource_id: String,
}

impl Grant {
    pub fn new(
        permission: Permission,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            permission,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        }
    }

    /// Grant covering every resource of `resource_type`.
    pub fn on_all(permission: Permission, resource_type: impl Into<String>) -> Self {
        Self::new(permission, resource_type, ANY_RESOURCE)
    }

    pub fn covers(&self, permission: &Permission, resource_type: &str, resource_id: &str) -> bool {
        self.permission.satisfies(permission)
            && (self.resource_type == ANY_RESOURCE || self.resource_type == resource_type)
            && (self.resource_id == ANY_RESOURCE || self.resource_id == resource_id)
    }
}

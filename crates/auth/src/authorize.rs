use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::{Grant, Permission, PrincipalId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("forbidden: missing permission '{permission}' on {resource_type} '{resource_id}'")]
    Forbidden {
        permission: String,
        resource_type: String,
        resource_id: String,
    },
}

/// Authorization decision contract consumed by the engine.
///
/// Only answers yes/no; how grants are stored and resolved is up to the
/// implementation.
pub trait Authorizer: Send + Sync {
    fn check(
        &self,
        subject: &PrincipalId,
        permission: &Permission,
        resource_type: &str,
        resource_id: &str,
    ) -> bool;
}

impl<A> Authorizer for std::sync::Arc<A>
where
    A: Authorizer + ?Sized,
{
    fn check(
        &self,
        subject: &PrincipalId,
        permission: &Permission,
        resource_type: &str,
        resource_id: &str,
    ) -> bool {
        (**self).check(subject, permission, resource_type, resource_id)
    }
}

/// Authorize against an explicit set of grants.
///
/// - No IO
/// - No panics
pub fn authorize(
    grants: &[Grant],
    permission: &Permission,
    resource_type: &str,
    resource_id: &str,
) -> Result<(), AuthzError> {
    if grants
        .iter()
        .any(|g| g.covers(permission, resource_type, resource_id))
    {
        Ok(())
    } else {
        Err(AuthzError::Forbidden {
            permission: permission.as_str().to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
        })
    }
}

/// Authorizer that grants everything. Useful when authorization is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn check(&self, _: &PrincipalId, _: &Permission, _: &str, _: &str) -> bool {
        true
    }
}

/// In-memory grant table keyed by principal.
#[derive(Debug, Default)]
pub struct GrantAuthorizer {
    grants: RwLock<HashMap<PrincipalId, Vec<Grant>>>,
}

impl GrantAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, principal: PrincipalId, grant: Grant) {
        if let Ok(mut grants) = self.grants.write() {
            grants.entry(principal).or_default().push(grant);
        }
    }

    pub fn revoke_all(&self, principal: &PrincipalId) {
        if let Ok(mut grants) = self.grants.write() {
            grants.remove(principal);
        }
    }

    pub fn grants_of(&self, principal: &PrincipalId) -> Vec<Grant> {
        self.grants
            .read()
            .ok()
            .and_then(|g| g.get(principal).cloned())
            .unwrap_or_default()
    }

    /// Explain the decision for a single check (audit trail).
    pub fn explain(
        &self,
        subject: &PrincipalId,
        permission: &Permission,
        resource_type: &str,
        resource_id: &str,
    ) -> AuthorizationExplanation {
        let grants = self.grants_of(subject);
        let matching: Vec<Grant> = grants
            .iter()
            .filter(|g| g.covers(permission, resource_type, resource_id))
            .cloned()
            .collect();
        let granted = !matching.is_empty();
        let reason = if granted {
            format!(
                "principal {subject} holds {} matching grant(s)",
                matching.len()
            )
        } else if grants.is_empty() {
            format!("principal {subject} has no grants")
        } else {
            format!(
                "none of the {} grant(s) of principal {subject} cover '{permission}' on {resource_type} '{resource_id}'",
                grants.len()
            )
        };

        AuthorizationExplanation {
            required_permission: permission.as_str().to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            granted,
            reason,
            matching_grants: matching,
        }
    }
}

impl Authorizer for GrantAuthorizer {
    fn check(
        &self,
        subject: &PrincipalId,
        permission: &Permission,
        resource_type: &str,
        resource_id: &str,
    ) -> bool {
        let grants = self.grants_of(subject);
        match authorize(&grants, permission, resource_type, resource_id) {
            Ok(()) => true,
            Err(err) => {
                debug!(principal = %subject, error = %err, "authorization denied");
                false
            }
        }
    }
}

/// Detailed explanation of an authorization decision.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationExplanation {
    pub required_permission: String,
    pub resource_type: String,
    pub resource_id: String,
    pub granted: bool,
    pub reason: String,
    pub matching_grants: Vec<Grant>,
}

//! `batchflow-auth`: the authorization collaborator consumed by the batch engine.
//!
//! Decoupled from transport and storage: the engine only asks yes/no questions
//! through [`Authorizer`].

pub mod authorize;
pub mod permissions;
pub mod principal;

pub use authorize::{
    AllowAll, AuthorizationExplanation, Authorizer, AuthzError, GrantAuthorizer, authorize,
};
pub use permissions::{ANY_RESOURCE, Permission};
pub use principal::{Grant, PrincipalId};

//! `batchflow-core`: shared building blocks for the batch engine.
//!
//! Identifiers, the optimistic-lock expectation and the domain error model.
//! No storage or runtime concerns live here.

pub mod error;
pub mod id;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::{BatchId, IncidentId, JobId};
pub use version::{ExpectedVersion, Versioned};

//! Optimistic concurrency primitives shared by every durable record.

/// A durable record guarded by a version counter.
///
/// Every successful write bumps the version by one. Writers present the
/// version they read; the store rejects the write if it moved in between.
pub trait Versioned {
    /// Strongly-typed record identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the record identifier.
    fn id(&self) -> &Self::Id;

    /// Monotonically increasing version of the stored state.
    fn version(&self) -> u64;

    /// Expectation matching the version this copy was read at.
    fn expected_version(&self) -> ExpectedVersion {
        ExpectedVersion::Exact(self.version())
    }
}

/// Optimistic concurrency expectation for a write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking (operator overrides, cascading deletes).
    Any,
    /// Require the record to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }
}

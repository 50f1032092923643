//! Domain error model.

use thiserror::Error;

use crate::id::ProductId;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (precondition
/// violations, validation). These are returned synchronously to callers and
/// are specific enough to render as user-facing messages. Infrastructure
/// concerns belong in [`StoreError`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A checkout line asked for more stock than is available. Names the
    /// first failing product; no stock was decremented.
    #[error("insufficient stock for product {product_id}: only {available} left in stock ({requested} requested)")]
    InsufficientStock {
        product_id: ProductId,
        available: u32,
        requested: u32,
    },

    /// A refill was requested on a prescription that is not approved.
    #[error("refill not allowed: {0}")]
    RefillNotAllowed(String),

    /// A state machine was asked to make a transition its current state
    /// does not permit (including duplicate resolution of the same cycle).
    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// An operation is not allowed for the record's current status.
    #[error("not allowed: {0}")]
    NotAllowed(String),

    /// A value failed validation (e.g. malformed input, empty cart).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested record was not found (domain-level).
    #[error("not found")]
    NotFound,
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidStateTransition(msg.into())
    }

    pub fn refill_not_allowed(msg: impl Into<String>) -> Self {
        Self::RefillNotAllowed(msg.into())
    }

    pub fn not_allowed(msg: impl Into<String>) -> Self {
        Self::NotAllowed(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }
}

/// Record-store error.
///
/// Raised by store implementations (in-memory maps, file snapshots, ...).
/// Kept separate from [`DomainError`] so callers can distinguish business
/// preconditions from storage faults.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

/// Error surface of the lifecycle services (machines + pipeline).
///
/// Wraps both layers so service methods can `?` stores and domain logic
/// alike while callers can still match on the business failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LifecycleError {
    /// The underlying precondition violation, if this is a domain failure.
    pub fn as_domain(&self) -> Option<&DomainError> {
        match self {
            LifecycleError::Domain(e) => Some(e),
            LifecycleError::Store(_) => None,
        }
    }
}

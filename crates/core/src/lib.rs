//! `pharmaflow-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! strongly-typed identifiers, the domain error taxonomy, and the clock
//! abstraction the lifecycle machines run against.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult, LifecycleError, StoreError};
pub use id::{OrderId, PrescriptionId, ProductId};

//! Prescription verification domain.
//!
//! An uploaded prescription moves through an asynchronous review pipeline:
//! `Pending → {Approved | Rejected | NeedsClarification}`, with an approved
//! record re-enterable via `RefillRequested`. Review outcomes come from a
//! pluggable [`verifier::Verifier`] collaborator; the pipeline only enforces
//! the state machine and the artifact-XOR-reason invariant.

pub mod pipeline;
pub mod prescription;
pub mod store;
pub mod verifier;

pub use pipeline::{PipelineConfig, VerificationPipeline};
pub use prescription::{
    FileRef, Prescription, PrescriptionStatus, PrescriptionStatusChanged, VerificationOutcome,
};
pub use store::{InMemoryPrescriptionStore, PrescriptionStore};
pub use verifier::{SimulatedVerifier, Verifier, VerifierError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pharmaflow_core::{DomainError, DomainResult, PrescriptionId};
use pharmaflow_events::Event;

/// Prescription review status.
///
/// `Pending` resolves to one of the three outcomes; `Approved` can re-enter
/// the pipeline through `RefillRequested`, which resolves with the same
/// logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrescriptionStatus {
    Pending,
    Approved,
    Rejected,
    NeedsClarification,
    RefillRequested,
}

impl PrescriptionStatus {
    /// Whether a verification outcome may be applied in this status.
    pub fn is_resolvable(self) -> bool {
        matches!(
            self,
            PrescriptionStatus::Pending | PrescriptionStatus::RefillRequested
        )
    }
}

impl core::fmt::Display for PrescriptionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            PrescriptionStatus::Pending => "pending",
            PrescriptionStatus::Approved => "approved",
            PrescriptionStatus::Rejected => "rejected",
            PrescriptionStatus::NeedsClarification => "needs_clarification",
            PrescriptionStatus::RefillRequested => "refill_requested",
        };
        f.write_str(s)
    }
}

/// Opaque handle to an uploaded prescription artifact.
///
/// The engine never inspects file content; it carries the name and a
/// content hash for the verifier to bind into its attestation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub name: String,
    pub content_sha256: String,
}

impl FileRef {
    pub fn new(name: impl Into<String>, content_sha256: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content_sha256: content_sha256.into(),
        }
    }

    /// Build a reference from raw upload bytes.
    pub fn from_bytes(name: impl Into<String>, bytes: &[u8]) -> Self {
        use sha2::{Digest, Sha256};

        let digest = Sha256::digest(bytes);
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        Self::new(name, hex)
    }
}

/// The terminal outcome a verifier chose for one review cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VerificationOutcome {
    /// Approved, with the verifier's signed attestation.
    Approved { artifact: String },
    /// Rejected, with the reviewer's reason.
    Rejected { reason: String },
    /// The reviewer needs more information from the account holder.
    NeedsClarification { reason: String },
}

impl VerificationOutcome {
    pub fn status(&self) -> PrescriptionStatus {
        match self {
            VerificationOutcome::Approved { .. } => PrescriptionStatus::Approved,
            VerificationOutcome::Rejected { .. } => PrescriptionStatus::Rejected,
            VerificationOutcome::NeedsClarification { .. } => {
                PrescriptionStatus::NeedsClarification
            }
        }
    }
}

/// An uploaded prescription under (or past) review.
///
/// Invariant: once the record leaves `Pending`/`RefillRequested`, exactly
/// one of `approval_artifact` / `rejection_reason` is set. While a refill
/// cycle is in flight the previous approval artifact is retained and is
/// replaced atomically by the new outcome. Records are never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prescription {
    pub id: PrescriptionId,
    pub file_ref: FileRef,
    pub status: PrescriptionStatus,
    pub submitted_at: DateTime<Utc>,
    /// Settable by the account holder only while `Approved`; consumed by
    /// the periodic refill sweep.
    pub auto_refill: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    /// When the pending review is due to resolve; `None` once resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_due_at: Option<DateTime<Utc>>,
    /// Failed verifier attempts in the current cycle.
    #[serde(default)]
    pub verify_attempts: u32,
}

impl Prescription {
    /// Create a freshly submitted record in `Pending`.
    pub fn submit(id: PrescriptionId, file_ref: FileRef, now: DateTime<Utc>) -> Self {
        Self {
            id,
            file_ref,
            status: PrescriptionStatus::Pending,
            submitted_at: now,
            auto_refill: false,
            approval_artifact: None,
            rejection_reason: None,
            review_due_at: None,
            verify_attempts: 0,
        }
    }

    /// Apply a verification outcome, atomically with the status change.
    ///
    /// Only valid from `Pending`/`RefillRequested`; sets exactly one of the
    /// artifact/reason payloads and clears the other, closing the cycle.
    pub fn apply_outcome(&mut self, outcome: &VerificationOutcome) -> DomainResult<()> {
        if !self.status.is_resolvable() {
            return Err(DomainError::invalid_transition(format!(
                "prescription {} is {} and cannot be resolved",
                self.id, self.status
            )));
        }

        match outcome {
            VerificationOutcome::Approved { artifact } => {
                self.approval_artifact = Some(artifact.clone());
                self.rejection_reason = None;
            }
            VerificationOutcome::Rejected { reason }
            | VerificationOutcome::NeedsClarification { reason } => {
                self.approval_artifact = None;
                self.rejection_reason = Some(reason.clone());
            }
        }

        self.status = outcome.status();
        self.review_due_at = None;
        self.verify_attempts = 0;
        Ok(())
    }

    /// Re-enter the pipeline for a refill. Only approved prescriptions
    /// qualify; the existing artifact is kept until the new outcome lands.
    pub fn request_refill(&mut self) -> DomainResult<()> {
        if self.status != PrescriptionStatus::Approved {
            return Err(DomainError::refill_not_allowed(format!(
                "prescription {} is {}; only approved prescriptions can be refilled",
                self.id, self.status
            )));
        }
        self.status = PrescriptionStatus::RefillRequested;
        self.verify_attempts = 0;
        Ok(())
    }

    /// Toggle the auto-refill flag; offered only while `Approved`.
    pub fn set_auto_refill(&mut self, enabled: bool) -> DomainResult<()> {
        if self.status != PrescriptionStatus::Approved {
            return Err(DomainError::not_allowed(format!(
                "auto-refill can only be changed while approved; prescription {} is {}",
                self.id, self.status
            )));
        }
        self.auto_refill = enabled;
        Ok(())
    }

    /// Whether the pending review is due at `now`.
    pub fn review_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_resolvable()
            && self.review_due_at.is_some_and(|due| due <= now)
    }
}

/// Fired on every prescription status change, strictly ordered per
/// prescription. Carries the outcome payload so listeners can render it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrescriptionStatusChanged {
    pub prescription_id: PrescriptionId,
    pub old_status: PrescriptionStatus,
    pub new_status: PrescriptionStatus,
    pub occurred_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Event for PrescriptionStatusChanged {
    fn event_type(&self) -> &'static str {
        "prescriptions.status_changed"
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pending() -> Prescription {
        Prescription::submit(
            PrescriptionId::new(),
            FileRef::from_bytes("rx_scan.jpg", b"scan bytes"),
            Utc::now(),
        )
    }

    fn approved() -> Prescription {
        let mut rx = pending();
        rx.apply_outcome(&VerificationOutcome::Approved {
            artifact: "attestation".to_string(),
        })
        .unwrap();
        rx
    }

    #[test]
    fn submitted_record_is_pending_with_no_payloads() {
        let rx = pending();
        assert_eq!(rx.status, PrescriptionStatus::Pending);
        assert!(rx.approval_artifact.is_none());
        assert!(rx.rejection_reason.is_none());
    }

    #[test]
    fn approval_sets_artifact_and_clears_reason() {
        let rx = approved();
        assert_eq!(rx.status, PrescriptionStatus::Approved);
        assert_eq!(rx.approval_artifact.as_deref(), Some("attestation"));
        assert!(rx.rejection_reason.is_none());
    }

    #[test]
    fn rejection_sets_reason_and_clears_artifact() {
        let mut rx = pending();
        rx.apply_outcome(&VerificationOutcome::Rejected {
            reason: "blurry image".to_string(),
        })
        .unwrap();

        assert_eq!(rx.status, PrescriptionStatus::Rejected);
        assert!(rx.approval_artifact.is_none());
        assert_eq!(rx.rejection_reason.as_deref(), Some("blurry image"));
    }

    #[test]
    fn resolving_twice_is_an_invalid_transition() {
        let mut rx = approved();
        let err = rx
            .apply_outcome(&VerificationOutcome::Rejected {
                reason: "late duplicate".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition(_)));
        // Unchanged by the failed call.
        assert_eq!(rx.status, PrescriptionStatus::Approved);
        assert_eq!(rx.approval_artifact.as_deref(), Some("attestation"));
    }

    #[test]
    fn refill_keeps_artifact_until_new_outcome_replaces_it() {
        let mut rx = approved();
        rx.request_refill().unwrap();
        assert_eq!(rx.status, PrescriptionStatus::RefillRequested);
        assert_eq!(rx.approval_artifact.as_deref(), Some("attestation"));

        rx.apply_outcome(&VerificationOutcome::Rejected {
            reason: "dosage unclear".to_string(),
        })
        .unwrap();
        assert!(rx.approval_artifact.is_none());
        assert_eq!(rx.rejection_reason.as_deref(), Some("dosage unclear"));
    }

    #[test]
    fn refill_requires_approved_status() {
        let mut rx = pending();
        let err = rx.request_refill().unwrap_err();
        assert!(matches!(err, DomainError::RefillNotAllowed(_)));
        assert_eq!(rx.status, PrescriptionStatus::Pending);

        let mut rejected = pending();
        rejected
            .apply_outcome(&VerificationOutcome::Rejected {
                reason: "blurry image".to_string(),
            })
            .unwrap();
        let err = rejected.request_refill().unwrap_err();
        assert!(matches!(err, DomainError::RefillNotAllowed(_)));
        assert_eq!(rejected.status, PrescriptionStatus::Rejected);
    }

    #[test]
    fn auto_refill_is_gated_on_approved() {
        let mut rx = pending();
        let err = rx.set_auto_refill(true).unwrap_err();
        assert!(matches!(err, DomainError::NotAllowed(_)));
        assert!(!rx.auto_refill);

        let mut rx = approved();
        rx.set_auto_refill(true).unwrap();
        assert!(rx.auto_refill);
    }

    #[test]
    fn payloads_are_mutually_exclusive_across_every_cycle() {
        let outcomes = [
            VerificationOutcome::Approved {
                artifact: "a1".to_string(),
            },
            VerificationOutcome::Rejected {
                reason: "r1".to_string(),
            },
            VerificationOutcome::NeedsClarification {
                reason: "c1".to_string(),
            },
        ];

        for outcome in &outcomes {
            let mut rx = pending();
            rx.apply_outcome(outcome).unwrap();
            assert_ne!(
                rx.approval_artifact.is_some(),
                rx.rejection_reason.is_some(),
                "exactly one payload must be set after {outcome:?}"
            );
        }
    }

    #[test]
    fn record_round_trips_through_json() {
        let mut rx = approved();
        rx.set_auto_refill(true).unwrap();

        let json = serde_json::to_string(&rx).unwrap();
        let back: Prescription = serde_json::from_str(&json).unwrap();
        assert_eq!(rx, back);
        assert!(back.auto_refill);
    }

    #[test]
    fn file_ref_hash_is_stable_for_same_bytes() {
        let a = FileRef::from_bytes("a.jpg", b"same");
        let b = FileRef::from_bytes("b.jpg", b"same");
        assert_eq!(a.content_sha256, b.content_sha256);
        assert_eq!(a.content_sha256.len(), 64);
    }

    fn outcome_strategy() -> impl Strategy<Value = VerificationOutcome> {
        prop_oneof![
            "[a-z]{1,12}".prop_map(|artifact| VerificationOutcome::Approved { artifact }),
            "[a-z]{1,12}".prop_map(|reason| VerificationOutcome::Rejected { reason }),
            "[a-z]{1,12}".prop_map(|reason| VerificationOutcome::NeedsClarification { reason }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: across any sequence of resolution cycles (refilling
        /// whenever approved), a resolved record carries exactly one of
        /// artifact/reason, and the payload matches the status.
        #[test]
        fn resolved_records_carry_exactly_one_payload(
            outcomes in prop::collection::vec(outcome_strategy(), 1..8)
        ) {
            let mut rx = pending();
            for outcome in &outcomes {
                if rx.status == PrescriptionStatus::Approved {
                    rx.request_refill().unwrap();
                }
                if !rx.status.is_resolvable() {
                    // Rejected / NeedsClarification end the lifecycle.
                    break;
                }
                rx.apply_outcome(outcome).unwrap();

                prop_assert_ne!(
                    rx.approval_artifact.is_some(),
                    rx.rejection_reason.is_some()
                );
                match rx.status {
                    PrescriptionStatus::Approved => {
                        prop_assert!(rx.approval_artifact.is_some())
                    }
                    PrescriptionStatus::Rejected
                    | PrescriptionStatus::NeedsClarification => {
                        prop_assert!(rx.rejection_reason.is_some())
                    }
                    other => prop_assert!(false, "unexpected resolved status {}", other),
                }
            }
        }
    }
}

//! Prescription verification pipeline.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use pharmaflow_core::{Clock, DomainError, LifecycleError, PrescriptionId};
use pharmaflow_events::EventBus;

use crate::prescription::{
    FileRef, Prescription, PrescriptionStatus, PrescriptionStatusChanged, VerificationOutcome,
};
use crate::store::PrescriptionStore;
use crate::verifier::Verifier;

/// Pipeline tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// Verifier failures tolerated per cycle before the record is routed to
    /// clarification instead of being left pending forever.
    pub max_verify_attempts: u32,
    /// Delay before a failed verification is retried.
    pub retry_backoff: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_verify_attempts: 3,
            retry_backoff: Duration::seconds(5),
        }
    }
}

/// Removes its id from the in-flight set when the cycle step finishes.
struct InFlightGuard {
    id: PrescriptionId,
    set: Arc<Mutex<HashSet<PrescriptionId>>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// The prescription verification pipeline.
///
/// One logical machine per prescription. Resolution for a given id is
/// serialized through an in-flight guard: a duplicate `resolve` while a
/// cycle is being decided fails with `InvalidStateTransition` instead of
/// racing, and overlapping sweeps (due reviews, auto-refill) deduplicate on
/// the same guard.
pub struct VerificationPipeline<S, B, V> {
    store: S,
    bus: B,
    verifier: V,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
    in_flight: Arc<Mutex<HashSet<PrescriptionId>>>,
}

impl<S, B, V> VerificationPipeline<S, B, V>
where
    S: PrescriptionStore,
    B: EventBus<PrescriptionStatusChanged>,
    V: Verifier,
{
    pub fn new(store: S, bus: B, verifier: V, clock: Arc<dyn Clock>, config: PipelineConfig) -> Self {
        Self {
            store,
            bus,
            verifier,
            clock,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Accept an upload and schedule its review.
    ///
    /// No content inspection happens here; the file reference is opaque and
    /// the verifier decides the outcome when the review comes due.
    pub fn submit(&self, file_ref: FileRef) -> Result<Prescription, LifecycleError> {
        let now = self.clock.now();
        let mut prescription = Prescription::submit(PrescriptionId::new(), file_ref, now);
        prescription.review_due_at = Some(now + self.verifier.review_delay());

        self.store.insert(prescription.clone())?;
        info!(
            prescription_id = %prescription.id,
            due_at = %prescription.review_due_at.unwrap_or(now),
            "prescription submitted"
        );
        Ok(prescription)
    }

    /// Apply a verifier's outcome to one review cycle.
    ///
    /// Valid only while the record is `Pending`/`RefillRequested`; a second
    /// call on the same cycle — concurrent or late — fails with
    /// `InvalidStateTransition`. The payload is attached atomically with
    /// the status change.
    pub fn resolve(
        &self,
        id: PrescriptionId,
        outcome: VerificationOutcome,
    ) -> Result<Prescription, LifecycleError> {
        let _guard = self.begin(id)?;
        let mut prescription = self.get(id)?;
        self.apply_resolution(&mut prescription, &outcome, self.clock.now())?;
        Ok(prescription)
    }

    /// Re-enter the pipeline for a refill of an approved prescription.
    pub fn request_refill(&self, id: PrescriptionId) -> Result<Prescription, LifecycleError> {
        let _guard = self.begin(id)?;
        let mut prescription = self.get(id)?;
        self.refill_held(&mut prescription)?;
        Ok(prescription)
    }

    /// Toggle auto-refill; only offered while the prescription is approved.
    pub fn set_auto_refill(
        &self,
        id: PrescriptionId,
        enabled: bool,
    ) -> Result<Prescription, LifecycleError> {
        let mut prescription = self.get(id)?;
        prescription.set_auto_refill(enabled)?;
        self.store.update(&prescription)?;
        debug!(prescription_id = %id, enabled, "auto-refill flag updated");
        Ok(prescription)
    }

    /// Read-only snapshot of a prescription record.
    pub fn get(&self, id: PrescriptionId) -> Result<Prescription, LifecycleError> {
        Ok(self.store.get(id)?.ok_or(DomainError::NotFound)?)
    }

    /// Resolve every record whose review is due.
    ///
    /// Invokes the verifier per record; a verifier error is retried with
    /// backoff up to the configured attempt budget, after which the record
    /// falls back to `NeedsClarification` with a system-generated reason —
    /// a pending record is never stuck indefinitely. A failure on one
    /// record is logged and does not stop the sweep. Returns how many
    /// records reached an outcome.
    pub fn resolve_due(&self) -> Result<usize, LifecycleError> {
        let now = self.clock.now();
        let mut resolved = 0;

        for candidate in self.store.list()? {
            if !candidate.review_due(now) {
                continue;
            }
            let Ok(_guard) = self.begin(candidate.id) else {
                // Another thread is already deciding this cycle.
                continue;
            };
            match self.resolve_one(candidate.id, now) {
                Ok(true) => resolved += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(prescription_id = %candidate.id, error = %e, "review sweep failed for record");
                }
            }
        }

        Ok(resolved)
    }

    /// Request a refill for every approved prescription with auto-refill
    /// enabled. Deduplicated per id against concurrent sweeps. Returns the
    /// number of refills entered.
    pub fn auto_refill_sweep(&self) -> Result<usize, LifecycleError> {
        let mut refilled = 0;

        for candidate in self.store.list()? {
            if candidate.status != PrescriptionStatus::Approved || !candidate.auto_refill {
                continue;
            }
            let Ok(_guard) = self.begin(candidate.id) else {
                continue;
            };
            // Re-read under the guard; the flag or status may have changed.
            let Some(mut prescription) = self.store.get(candidate.id)? else {
                continue;
            };
            if prescription.status != PrescriptionStatus::Approved || !prescription.auto_refill {
                continue;
            }
            match self.refill_held(&mut prescription) {
                Ok(()) => refilled += 1,
                Err(e) => {
                    warn!(prescription_id = %prescription.id, error = %e, "auto-refill failed for record");
                }
            }
        }

        if refilled > 0 {
            info!(refilled, "auto-refill sweep entered refills");
        }
        Ok(refilled)
    }

    // One due review, id already guarded. Returns whether an outcome landed.
    fn resolve_one(&self, id: PrescriptionId, now: DateTime<Utc>) -> Result<bool, LifecycleError> {
        let Some(mut prescription) = self.store.get(id)? else {
            return Ok(false);
        };
        if !prescription.review_due(now) {
            return Ok(false);
        }

        match self.verifier.verify(&prescription) {
            Ok(outcome) => {
                self.apply_resolution(&mut prescription, &outcome, now)?;
                Ok(true)
            }
            Err(e) => {
                prescription.verify_attempts += 1;
                if prescription.verify_attempts >= self.config.max_verify_attempts {
                    let outcome = VerificationOutcome::NeedsClarification {
                        reason: format!(
                            "[system] verification unavailable after {} attempts ({e}); \
                             routed for manual review",
                            prescription.verify_attempts
                        ),
                    };
                    warn!(
                        prescription_id = %prescription.id,
                        attempts = prescription.verify_attempts,
                        "verifier exhausted, falling back to clarification"
                    );
                    self.apply_resolution(&mut prescription, &outcome, now)?;
                    Ok(true)
                } else {
                    prescription.review_due_at = Some(now + self.config.retry_backoff);
                    self.store.update(&prescription)?;
                    warn!(
                        prescription_id = %prescription.id,
                        attempts = prescription.verify_attempts,
                        error = %e,
                        "verifier failed, retry scheduled"
                    );
                    Ok(false)
                }
            }
        }
    }

    // Status change + payload + persistence + notification, as one step.
    fn apply_resolution(
        &self,
        prescription: &mut Prescription,
        outcome: &VerificationOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        let old = prescription.status;
        prescription.apply_outcome(outcome)?;
        self.store.update(prescription)?;

        self.emit(PrescriptionStatusChanged {
            prescription_id: prescription.id,
            old_status: old,
            new_status: prescription.status,
            occurred_at: now,
            artifact: prescription.approval_artifact.clone(),
            reason: prescription.rejection_reason.clone(),
        });

        info!(
            prescription_id = %prescription.id,
            from = %old,
            to = %prescription.status,
            "prescription resolved"
        );
        Ok(())
    }

    // Refill transition, id already guarded by the caller.
    fn refill_held(&self, prescription: &mut Prescription) -> Result<(), LifecycleError> {
        let now = self.clock.now();
        let old = prescription.status;
        prescription.request_refill()?;
        prescription.review_due_at = Some(now + self.verifier.review_delay());
        self.store.update(prescription)?;

        self.emit(PrescriptionStatusChanged {
            prescription_id: prescription.id,
            old_status: old,
            new_status: prescription.status,
            occurred_at: now,
            // The previous approval stays visible until the new outcome
            // replaces it.
            artifact: prescription.approval_artifact.clone(),
            reason: None,
        });

        info!(prescription_id = %prescription.id, "refill requested");
        Ok(())
    }

    fn begin(&self, id: PrescriptionId) -> Result<InFlightGuard, LifecycleError> {
        let mut set = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !set.insert(id) {
            return Err(DomainError::invalid_transition(format!(
                "resolution already in flight for prescription {id}"
            ))
            .into());
        }
        Ok(InFlightGuard {
            id,
            set: Arc::clone(&self.in_flight),
        })
    }

    // Fire-and-forget: the store already holds the new state.
    fn emit(&self, event: PrescriptionStatusChanged) {
        if let Err(e) = self.bus.publish(event) {
            warn!(error = ?e, "failed to publish prescription notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::mpsc;

    use pharmaflow_core::ManualClock;
    use pharmaflow_events::{InMemoryEventBus, Subscription};

    use crate::store::InMemoryPrescriptionStore;
    use crate::verifier::VerifierError;

    /// Replays a scripted sequence of verifier results.
    struct ScriptedVerifier {
        script: Mutex<VecDeque<Result<VerificationOutcome, VerifierError>>>,
        delay: Duration,
    }

    impl ScriptedVerifier {
        fn new(
            script: impl IntoIterator<Item = Result<VerificationOutcome, VerifierError>>,
        ) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                delay: Duration::seconds(5),
            }
        }
    }

    impl Verifier for ScriptedVerifier {
        fn verifier_id(&self) -> &str {
            "test-verifier"
        }

        fn review_delay(&self) -> Duration {
            self.delay
        }

        fn verify(&self, _: &Prescription) -> Result<VerificationOutcome, VerifierError> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| panic!("verifier called more times than scripted"))
        }
    }

    fn approved_outcome() -> VerificationOutcome {
        VerificationOutcome::Approved {
            artifact: "attestation".to_string(),
        }
    }

    type TestPipeline = VerificationPipeline<
        Arc<InMemoryPrescriptionStore>,
        Arc<InMemoryEventBus<PrescriptionStatusChanged>>,
        ScriptedVerifier,
    >;

    struct Fixture {
        pipeline: TestPipeline,
        clock: Arc<ManualClock>,
        events: Subscription<PrescriptionStatusChanged>,
    }

    fn fixture(verifier: ScriptedVerifier) -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let bus = Arc::new(InMemoryEventBus::new());
        let events = bus.subscribe();
        let pipeline = VerificationPipeline::new(
            Arc::new(InMemoryPrescriptionStore::new()),
            bus,
            verifier,
            clock.clone(),
            PipelineConfig::default(),
        );
        Fixture {
            pipeline,
            clock,
            events,
        }
    }

    fn file_ref() -> FileRef {
        FileRef::from_bytes("rx_scan.jpg", b"scan bytes")
    }

    #[test]
    fn submit_schedules_a_review() {
        let fx = fixture(ScriptedVerifier::new([]));
        let rx = fx.pipeline.submit(file_ref()).unwrap();

        assert_eq!(rx.status, PrescriptionStatus::Pending);
        assert_eq!(
            rx.review_due_at,
            Some(fx.clock.now() + Duration::seconds(5))
        );
        assert!(fx.events.drain().is_empty());
    }

    #[test]
    fn rejected_prescription_carries_reason_and_blocks_refill() {
        let fx = fixture(ScriptedVerifier::new([]));
        let rx = fx.pipeline.submit(file_ref()).unwrap();

        fx.pipeline
            .resolve(
                rx.id,
                VerificationOutcome::Rejected {
                    reason: "blurry image".to_string(),
                },
            )
            .unwrap();

        let stored = fx.pipeline.get(rx.id).unwrap();
        assert_eq!(stored.status, PrescriptionStatus::Rejected);
        assert!(stored.approval_artifact.is_none());
        assert_eq!(stored.rejection_reason.as_deref(), Some("blurry image"));

        let err = fx.pipeline.request_refill(rx.id).unwrap_err();
        assert!(matches!(
            err.as_domain(),
            Some(DomainError::RefillNotAllowed(_))
        ));
        // Unchanged by the failed refill.
        assert_eq!(fx.pipeline.get(rx.id).unwrap(), stored);
    }

    #[test]
    fn resolving_the_same_cycle_twice_fails() {
        let fx = fixture(ScriptedVerifier::new([]));
        let rx = fx.pipeline.submit(file_ref()).unwrap();

        fx.pipeline.resolve(rx.id, approved_outcome()).unwrap();
        let err = fx
            .pipeline
            .resolve(rx.id, approved_outcome())
            .unwrap_err();
        assert!(matches!(
            err.as_domain(),
            Some(DomainError::InvalidStateTransition(_))
        ));
    }

    #[test]
    fn due_review_resolves_through_the_verifier() {
        let fx = fixture(ScriptedVerifier::new([Ok(approved_outcome())]));
        let rx = fx.pipeline.submit(file_ref()).unwrap();

        // Not due yet.
        assert_eq!(fx.pipeline.resolve_due().unwrap(), 0);

        fx.clock.advance(Duration::seconds(6));
        assert_eq!(fx.pipeline.resolve_due().unwrap(), 1);

        let stored = fx.pipeline.get(rx.id).unwrap();
        assert_eq!(stored.status, PrescriptionStatus::Approved);
        assert_eq!(stored.approval_artifact.as_deref(), Some("attestation"));

        let events = fx.events.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].old_status, PrescriptionStatus::Pending);
        assert_eq!(events[0].new_status, PrescriptionStatus::Approved);
        assert_eq!(events[0].artifact.as_deref(), Some("attestation"));

        // Nothing left to do.
        assert_eq!(fx.pipeline.resolve_due().unwrap(), 0);
    }

    #[test]
    fn verifier_failures_retry_then_fall_back_to_clarification() {
        let unavailable = || Err(VerifierError::Unavailable("OCR offline".to_string()));
        let fx = fixture(ScriptedVerifier::new([
            unavailable(),
            unavailable(),
            unavailable(),
        ]));
        let rx = fx.pipeline.submit(file_ref()).unwrap();

        for attempt in 1..=2 {
            fx.clock.advance(Duration::seconds(6));
            assert_eq!(fx.pipeline.resolve_due().unwrap(), 0);
            let stored = fx.pipeline.get(rx.id).unwrap();
            assert_eq!(stored.status, PrescriptionStatus::Pending);
            assert_eq!(stored.verify_attempts, attempt);
        }

        // Third failure exhausts the budget.
        fx.clock.advance(Duration::seconds(6));
        assert_eq!(fx.pipeline.resolve_due().unwrap(), 1);

        let stored = fx.pipeline.get(rx.id).unwrap();
        assert_eq!(stored.status, PrescriptionStatus::NeedsClarification);
        assert!(stored.approval_artifact.is_none());
        let reason = stored.rejection_reason.unwrap();
        assert!(reason.starts_with("[system]"), "system reason must be distinguishable: {reason}");
    }

    #[test]
    fn refill_reenters_the_pipeline_and_resolves_again() {
        let fx = fixture(ScriptedVerifier::new([Ok(VerificationOutcome::Rejected {
            reason: "dosage unclear".to_string(),
        })]));
        let rx = fx.pipeline.submit(file_ref()).unwrap();
        fx.pipeline.resolve(rx.id, approved_outcome()).unwrap();

        let refilled = fx.pipeline.request_refill(rx.id).unwrap();
        assert_eq!(refilled.status, PrescriptionStatus::RefillRequested);
        assert_eq!(refilled.approval_artifact.as_deref(), Some("attestation"));
        assert!(refilled.review_due_at.is_some());

        fx.clock.advance(Duration::seconds(6));
        assert_eq!(fx.pipeline.resolve_due().unwrap(), 1);

        let stored = fx.pipeline.get(rx.id).unwrap();
        assert_eq!(stored.status, PrescriptionStatus::Rejected);
        assert!(stored.approval_artifact.is_none());
        assert_eq!(stored.rejection_reason.as_deref(), Some("dosage unclear"));

        let transitions: Vec<(PrescriptionStatus, PrescriptionStatus)> = fx
            .events
            .drain()
            .iter()
            .map(|e| (e.old_status, e.new_status))
            .collect();
        assert_eq!(
            transitions,
            vec![
                (PrescriptionStatus::Pending, PrescriptionStatus::Approved),
                (PrescriptionStatus::Approved, PrescriptionStatus::RefillRequested),
                (PrescriptionStatus::RefillRequested, PrescriptionStatus::Rejected),
            ]
        );
    }

    #[test]
    fn auto_refill_sweep_targets_only_flagged_approved_records() {
        let fx = fixture(ScriptedVerifier::new([]));

        let flagged = fx.pipeline.submit(file_ref()).unwrap();
        fx.pipeline.resolve(flagged.id, approved_outcome()).unwrap();
        fx.pipeline.set_auto_refill(flagged.id, true).unwrap();

        let unflagged = fx.pipeline.submit(file_ref()).unwrap();
        fx.pipeline.resolve(unflagged.id, approved_outcome()).unwrap();

        let still_pending = fx.pipeline.submit(file_ref()).unwrap();

        assert_eq!(fx.pipeline.auto_refill_sweep().unwrap(), 1);

        assert_eq!(
            fx.pipeline.get(flagged.id).unwrap().status,
            PrescriptionStatus::RefillRequested
        );
        assert_eq!(
            fx.pipeline.get(unflagged.id).unwrap().status,
            PrescriptionStatus::Approved
        );
        assert_eq!(
            fx.pipeline.get(still_pending.id).unwrap().status,
            PrescriptionStatus::Pending
        );

        // The flagged record is no longer approved, so a second sweep is a
        // no-op rather than a double submission.
        assert_eq!(fx.pipeline.auto_refill_sweep().unwrap(), 0);
    }

    #[test]
    fn set_auto_refill_requires_approved() {
        let fx = fixture(ScriptedVerifier::new([]));
        let rx = fx.pipeline.submit(file_ref()).unwrap();

        let err = fx.pipeline.set_auto_refill(rx.id, true).unwrap_err();
        assert!(matches!(err.as_domain(), Some(DomainError::NotAllowed(_))));
    }

    /// Blocks inside `verify` until released, to hold the in-flight guard
    /// open across threads.
    struct BlockingVerifier {
        entered: mpsc::Sender<()>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl Verifier for BlockingVerifier {
        fn verifier_id(&self) -> &str {
            "blocking-verifier"
        }

        fn review_delay(&self) -> Duration {
            Duration::seconds(5)
        }

        fn verify(&self, _: &Prescription) -> Result<VerificationOutcome, VerifierError> {
            self.entered.send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
            Ok(approved_outcome())
        }
    }

    #[test]
    fn concurrent_resolution_of_one_cycle_is_rejected_not_raced() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();

        let clock = Arc::new(ManualClock::new(Utc::now()));
        let bus = Arc::new(InMemoryEventBus::new());
        let events = bus.subscribe();
        let pipeline = Arc::new(VerificationPipeline::new(
            Arc::new(InMemoryPrescriptionStore::new()),
            bus,
            BlockingVerifier {
                entered: entered_tx,
                release: Mutex::new(release_rx),
            },
            clock.clone(),
            PipelineConfig::default(),
        ));

        let rx = pipeline.submit(file_ref()).unwrap();
        clock.advance(Duration::seconds(6));

        let sweep = {
            let pipeline = Arc::clone(&pipeline);
            std::thread::spawn(move || pipeline.resolve_due().unwrap())
        };

        // The sweep is now mid-verification and holds the in-flight guard.
        entered_rx.recv().unwrap();
        let err = pipeline.resolve(rx.id, approved_outcome()).unwrap_err();
        assert!(matches!(
            err.as_domain(),
            Some(DomainError::InvalidStateTransition(_))
        ));

        release_tx.send(()).unwrap();
        assert_eq!(sweep.join().unwrap(), 1);

        assert_eq!(
            pipeline.get(rx.id).unwrap().status,
            PrescriptionStatus::Approved
        );
        assert_eq!(events.drain().len(), 1);
    }
}

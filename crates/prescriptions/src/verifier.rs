//! Verifier collaborator boundary.
//!
//! Outcome selection belongs to the verifier (OCR service, pharmacist
//! console, ...); the pipeline only enforces the state machine around it.
//! The simulated verifier models the observed behavior of the platform:
//! a uniformly random outcome after a bounded random review delay.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use thiserror::Error;

use crate::prescription::{Prescription, VerificationOutcome};

/// Verifier failure (infrastructure, not a review outcome).
///
/// A verifier that *errors* has not chosen an outcome; the pipeline retries
/// and eventually routes the record to clarification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifierError {
    #[error("verifier unavailable: {0}")]
    Unavailable(String),
}

/// Resolves a pending prescription to a terminal outcome.
pub trait Verifier: Send + Sync {
    /// Stable identity bound into approval attestations.
    fn verifier_id(&self) -> &str;

    /// How long the current review should take. Called once per
    /// submission/refill to schedule `review_due_at`.
    fn review_delay(&self) -> Duration;

    /// Choose the outcome for one review cycle. Must be called at most once
    /// per cycle; the pipeline serializes calls per prescription id.
    fn verify(&self, prescription: &Prescription) -> Result<VerificationOutcome, VerifierError>;
}

/// Rejection note used by the simulated reviewer (mirrors the production
/// pharmacist wording).
const SIMULATED_REJECTION: &str =
    "The provided image was not clear enough to verify. Please upload a new one.";

const SIMULATED_CLARIFICATION: &str =
    "The pharmacist requires more information before this prescription can be filled.";

/// Simulated review: uniform random outcome, delay uniform in 5–8s.
#[derive(Debug, Clone)]
pub struct SimulatedVerifier {
    verifier_id: String,
}

impl SimulatedVerifier {
    pub fn new(verifier_id: impl Into<String>) -> Self {
        Self {
            verifier_id: verifier_id.into(),
        }
    }
}

impl Default for SimulatedVerifier {
    fn default() -> Self {
        Self::new("pharm-007")
    }
}

impl Verifier for SimulatedVerifier {
    fn verifier_id(&self) -> &str {
        &self.verifier_id
    }

    fn review_delay(&self) -> Duration {
        Duration::milliseconds(rand::thread_rng().gen_range(5_000..=8_000))
    }

    fn verify(&self, prescription: &Prescription) -> Result<VerificationOutcome, VerifierError> {
        match rand::thread_rng().gen_range(0..3) {
            0 => Ok(VerificationOutcome::Approved {
                artifact: attestation(&self.verifier_id, prescription, Utc::now()),
            }),
            1 => Ok(VerificationOutcome::Rejected {
                reason: SIMULATED_REJECTION.to_string(),
            }),
            _ => Ok(VerificationOutcome::NeedsClarification {
                reason: SIMULATED_CLARIFICATION.to_string(),
            }),
        }
    }
}

/// Build the opaque approval attestation for a prescription.
///
/// JWS-shaped: `b64url(header).b64url(claims).b64url(seal)`, with claims
/// binding the prescription id, verifier identity, issuance time, and the
/// file's content hash. The seal is a content-bound digest, not a real
/// cryptographic signature — real signing belongs to an external verifier
/// behind this same interface. Callers treat the whole string as opaque.
pub fn attestation(
    verifier_id: &str,
    prescription: &Prescription,
    issued_at: DateTime<Utc>,
) -> String {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use sha2::{Digest, Sha256};

    let header = serde_json::json!({ "alg": "HS256", "typ": "JWT" });
    let claims = serde_json::json!({
        "sub": prescription.id.to_string(),
        "verifier_id": verifier_id,
        "iat": issued_at.timestamp(),
        "file_sha256": prescription.file_ref.content_sha256,
    });

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string()),
    );
    let seal = Sha256::digest(format!("{signing_input}.{verifier_id}").as_bytes());

    format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(seal))
}

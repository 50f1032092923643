//! Prescription record store.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use pharmaflow_core::{PrescriptionId, StoreError};

use crate::prescription::Prescription;

/// Repository for prescription records.
///
/// Inserted at upload, mutated by the pipeline and the refill command,
/// never deleted. Implementations must be shareable across the submitting
/// caller and the sweep thread.
pub trait PrescriptionStore: Send + Sync {
    fn insert(&self, prescription: Prescription) -> Result<(), StoreError>;

    fn get(&self, id: PrescriptionId) -> Result<Option<Prescription>, StoreError>;

    fn update(&self, prescription: &Prescription) -> Result<(), StoreError>;

    /// Every stored prescription, oldest submission first.
    fn list(&self) -> Result<Vec<Prescription>, StoreError>;
}

impl<S> PrescriptionStore for Arc<S>
where
    S: PrescriptionStore + ?Sized,
{
    fn insert(&self, prescription: Prescription) -> Result<(), StoreError> {
        (**self).insert(prescription)
    }

    fn get(&self, id: PrescriptionId) -> Result<Option<Prescription>, StoreError> {
        (**self).get(id)
    }

    fn update(&self, prescription: &Prescription) -> Result<(), StoreError> {
        (**self).update(prescription)
    }

    fn list(&self) -> Result<Vec<Prescription>, StoreError> {
        (**self).list()
    }
}

/// In-memory prescription store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryPrescriptionStore {
    prescriptions: RwLock<HashMap<PrescriptionId, Prescription>>,
}

impl InMemoryPrescriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole map (snapshot restore).
    pub fn load(&self, prescriptions: impl IntoIterator<Item = Prescription>) {
        let mut map = self
            .prescriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        map.clear();
        map.extend(prescriptions.into_iter().map(|p| (p.id, p)));
    }
}

impl PrescriptionStore for InMemoryPrescriptionStore {
    fn insert(&self, prescription: Prescription) -> Result<(), StoreError> {
        let mut map = self
            .prescriptions
            .write()
            .map_err(|e| StoreError::storage(e.to_string()))?;
        if map.contains_key(&prescription.id) {
            return Err(StoreError::AlreadyExists(prescription.id.to_string()));
        }
        map.insert(prescription.id, prescription);
        Ok(())
    }

    fn get(&self, id: PrescriptionId) -> Result<Option<Prescription>, StoreError> {
        let map = self
            .prescriptions
            .read()
            .map_err(|e| StoreError::storage(e.to_string()))?;
        Ok(map.get(&id).cloned())
    }

    fn update(&self, prescription: &Prescription) -> Result<(), StoreError> {
        let mut map = self
            .prescriptions
            .write()
            .map_err(|e| StoreError::storage(e.to_string()))?;
        match map.get_mut(&prescription.id) {
            Some(slot) => {
                *slot = prescription.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(prescription.id.to_string())),
        }
    }

    fn list(&self) -> Result<Vec<Prescription>, StoreError> {
        let map = self
            .prescriptions
            .read()
            .map_err(|e| StoreError::storage(e.to_string()))?;
        let mut prescriptions: Vec<Prescription> = map.values().cloned().collect();
        prescriptions.sort_by_key(|p| (p.submitted_at, *p.id.as_uuid()));
        Ok(prescriptions)
    }
}

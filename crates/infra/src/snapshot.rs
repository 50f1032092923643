//! JSON snapshot persistence.
//!
//! Whole-state snapshots are enough here: order statuses are re-derived
//! from `created_at` on every read, so a restart recovers by reloading the
//! records and letting the sweeps catch up. Nothing about elapsed time is
//! persisted.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use pharmaflow_catalog::{InventoryLedger, Product};
use pharmaflow_core::StoreError;
use pharmaflow_orders::{InMemoryOrderStore, Order, OrderStore};
use pharmaflow_prescriptions::{InMemoryPrescriptionStore, Prescription, PrescriptionStore};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
}

/// A point-in-time capture of the whole engine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub taken_at: DateTime<Utc>,
    pub products: Vec<Product>,
    pub orders: Vec<Order>,
    pub prescriptions: Vec<Prescription>,
}

/// In-memory state rebuilt from a snapshot.
#[derive(Debug)]
pub struct RestoredState {
    pub ledger: InventoryLedger,
    pub orders: InMemoryOrderStore,
    pub prescriptions: InMemoryPrescriptionStore,
}

impl Snapshot {
    /// Capture the current state of the ledger and both stores.
    pub fn capture<O, P>(
        ledger: &InventoryLedger,
        orders: &O,
        prescriptions: &P,
        taken_at: DateTime<Utc>,
    ) -> Result<Self, SnapshotError>
    where
        O: OrderStore,
        P: PrescriptionStore,
    {
        Ok(Self {
            version: SNAPSHOT_VERSION,
            taken_at,
            products: ledger.snapshot(),
            orders: orders.list()?,
            prescriptions: prescriptions.list()?,
        })
    }

    /// Rebuild fresh in-memory stores from this snapshot.
    pub fn restore(self) -> RestoredState {
        let orders = InMemoryOrderStore::new();
        orders.load(self.orders);
        let prescriptions = InMemoryPrescriptionStore::new();
        prescriptions.load(self.prescriptions);
        RestoredState {
            ledger: InventoryLedger::from_products(self.products),
            orders,
            prescriptions,
        }
    }
}

/// Reads and writes snapshots at a fixed path.
///
/// Writes go through a sibling temp file and a rename, so a crash mid-write
/// leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let encoded = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &encoded)?;
        fs::rename(&tmp, &self.path)?;
        info!(
            path = %self.path.display(),
            orders = snapshot.orders.len(),
            prescriptions = snapshot.prescriptions.len(),
            "snapshot saved"
        );
        Ok(())
    }

    /// Load the snapshot if one exists.
    pub fn load(&self) -> Result<Option<Snapshot>, SnapshotError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no snapshot to load");
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)?;
        let snapshot: Snapshot = serde_json::from_str(&raw)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(snapshot.version));
        }
        Ok(Some(snapshot))
    }
}

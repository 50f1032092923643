//! Background lifecycle worker.
//!
//! The engine has no per-record timers. One worker thread polls the order
//! machine and the verification pipeline; each sweep is idempotent, so the
//! poll interval only bounds notification latency, never correctness.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use pharmaflow_events::EventBus;
use pharmaflow_orders::{OrderLifecycle, OrderStatusChanged, OrderStore};
use pharmaflow_prescriptions::{
    PrescriptionStatusChanged, PrescriptionStore, VerificationPipeline, Verifier,
};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct LifecycleWorkerConfig {
    /// How often to sweep timed transitions and due reviews.
    pub poll_interval: Duration,
    /// How often to sweep approved prescriptions for auto-refill.
    pub refill_interval: Duration,
    /// Name for logging and the thread.
    pub name: String,
}

impl Default for LifecycleWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            refill_interval: Duration::from_secs(1),
            name: "lifecycle-worker".to_string(),
        }
    }
}

impl LifecycleWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub sweeps: u64,
    pub order_transitions: u64,
    pub prescriptions_resolved: u64,
    pub refills_entered: u64,
    pub uptime_secs: u64,
}

/// Spawns the sweep loop over an order machine and a verification pipeline.
pub struct LifecycleWorker;

impl LifecycleWorker {
    pub fn spawn<OS, OB, PS, PB, V>(
        config: LifecycleWorkerConfig,
        orders: Arc<OrderLifecycle<OS, OB>>,
        prescriptions: Arc<VerificationPipeline<PS, PB, V>>,
    ) -> WorkerHandle
    where
        OS: OrderStore + 'static,
        OB: EventBus<OrderStatusChanged> + 'static,
        PS: PrescriptionStore + 'static,
        PB: EventBus<PrescriptionStatusChanged> + 'static,
        V: Verifier + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = stats.clone();

        let name = config.name.clone();
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(config, orders, prescriptions, shutdown_rx, stats_clone))
            .expect("failed to spawn lifecycle worker thread");

        WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

fn worker_loop<OS, OB, PS, PB, V>(
    config: LifecycleWorkerConfig,
    orders: Arc<OrderLifecycle<OS, OB>>,
    prescriptions: Arc<VerificationPipeline<PS, PB, V>>,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<WorkerStats>>,
) where
    OS: OrderStore,
    OB: EventBus<OrderStatusChanged>,
    PS: PrescriptionStore,
    PB: EventBus<PrescriptionStatusChanged>,
    V: Verifier,
{
    info!(worker = %config.name, "lifecycle worker started");
    let start_time = Instant::now();
    let mut last_refill: Option<Instant> = None;

    loop {
        match shutdown_rx.recv_timeout(config.poll_interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let mut transitions = 0u64;
        let mut resolved = 0u64;
        let mut refilled = 0u64;

        match orders.advance_due() {
            Ok(n) => transitions = n as u64,
            Err(e) => warn!(worker = %config.name, error = %e, "order sweep failed"),
        }

        match prescriptions.resolve_due() {
            Ok(n) => resolved = n as u64,
            Err(e) => warn!(worker = %config.name, error = %e, "review sweep failed"),
        }

        let refill_due = last_refill
            .map(|at| at.elapsed() >= config.refill_interval)
            .unwrap_or(true);
        if refill_due {
            match prescriptions.auto_refill_sweep() {
                Ok(n) => refilled = n as u64,
                Err(e) => warn!(worker = %config.name, error = %e, "auto-refill sweep failed"),
            }
            last_refill = Some(Instant::now());
        }

        if transitions + resolved + refilled > 0 {
            debug!(
                worker = %config.name,
                transitions,
                resolved,
                refilled,
                "sweep advanced lifecycle state"
            );
        }

        let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
        s.sweeps += 1;
        s.order_transitions += transitions;
        s.prescriptions_resolved += resolved;
        s.refills_entered += refilled;
        s.uptime_secs = start_time.elapsed().as_secs();
    }

    info!(worker = %config.name, "lifecycle worker stopped");
}

//! Order lifecycle machine.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use pharmaflow_catalog::InventoryLedger;
use pharmaflow_core::{Clock, DomainError, LifecycleError, OrderId, ProductId};
use pharmaflow_events::EventBus;

use crate::order::{DelayTable, Order, OrderLine, OrderStatus, OrderStatusChanged, ShippingAddress, tracking_link};
use crate::store::OrderStore;

/// The order lifecycle machine.
///
/// One logical state machine per order; all of them share this service,
/// which commits stock at placement, answers status queries from elapsed
/// time, and advances stored statuses on a sweep — emitting exactly one
/// [`OrderStatusChanged`] per transition, in order, per order.
pub struct OrderLifecycle<S, B> {
    store: S,
    ledger: Arc<InventoryLedger>,
    bus: B,
    clock: Arc<dyn Clock>,
    delays: DelayTable,
    // Serializes sweep steps against cancellation; without it a sweep could
    // write a stale pre-cancellation record back over `Cancelled`.
    mutation: Mutex<()>,
}

impl<S, B> OrderLifecycle<S, B>
where
    S: OrderStore,
    B: EventBus<OrderStatusChanged>,
{
    pub fn new(
        store: S,
        ledger: Arc<InventoryLedger>,
        bus: B,
        clock: Arc<dyn Clock>,
        delays: DelayTable,
    ) -> Self {
        Self {
            store,
            ledger,
            bus,
            clock,
            delays,
            mutation: Mutex::new(()),
        }
    }

    pub fn delays(&self) -> &DelayTable {
        &self.delays
    }

    fn mutation_guard(&self) -> MutexGuard<'_, ()> {
        self.mutation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Place an order for the given cart lines.
    ///
    /// Unit prices are snapshot from the catalog at this moment. Stock for
    /// every line is committed atomically (all-or-nothing); on any shortfall
    /// the error names the first failing product and nothing is decremented.
    /// The committed decrement is only ever reversed by [`Self::cancel`].
    pub fn place_order(
        &self,
        lines: &[(ProductId, u32)],
        shipping_address: ShippingAddress,
        payment_method: impl Into<String>,
    ) -> Result<Order, LifecycleError> {
        if lines.is_empty() {
            return Err(DomainError::validation("cannot place an order with no items").into());
        }

        let mut items = Vec::with_capacity(lines.len());
        for (product_id, quantity) in lines {
            let product = self.ledger.product(*product_id).ok_or_else(|| {
                DomainError::validation(format!("unknown product {product_id}"))
            })?;
            items.push(OrderLine {
                product_id: *product_id,
                quantity: *quantity,
                unit_price: product.price,
            });
        }

        self.ledger.reserve_and_commit(lines)?;

        let now = self.clock.now();
        let order = Order::place(OrderId::new(), items, shipping_address, payment_method, now)?;
        self.store.insert(order.clone())?;

        info!(order_id = %order.id, total = order.total, "order placed");
        Ok(order)
    }

    /// Current status, derived from `created_at` + now + the delay table.
    ///
    /// Idempotent, and always agrees with what the sweep will broadcast.
    pub fn status_of(&self, order_id: OrderId) -> Result<OrderStatus, LifecycleError> {
        let order = self.get(order_id)?;
        Ok(order.status_at(self.clock.now(), &self.delays))
    }

    /// Read-only snapshot of an order record.
    pub fn get(&self, order_id: OrderId) -> Result<Order, LifecycleError> {
        Ok(self
            .store
            .get(order_id)?
            .ok_or(DomainError::NotFound)?)
    }

    /// Advance every order whose derived status has moved past its stored
    /// status, one transition at a time.
    ///
    /// Emits one event per transition, strictly ordered per order. Safe to
    /// call repeatedly: a sweep that finds nothing due emits nothing, and a
    /// restart resumes from the persisted status. Each order's steps are
    /// serialized against [`Self::cancel`], so a concurrent cancellation is
    /// never overwritten. A failure on one order is logged and does not stop
    /// the sweep. Returns the number of transitions broadcast.
    pub fn advance_due(&self) -> Result<usize, LifecycleError> {
        let now = self.clock.now();
        let mut transitions = 0;

        for listed in self.store.list()? {
            let _guard = self.mutation_guard();
            // Re-read under the guard: the order may have been cancelled
            // since it was listed.
            let mut order = match self.store.get(listed.id) {
                Ok(Some(order)) => order,
                Ok(None) => continue,
                Err(e) => {
                    warn!(order_id = %listed.id, error = %e, "failed to re-read order during sweep");
                    continue;
                }
            };
            let target = order.status_at(now, &self.delays);

            while order.status < target {
                let Some(next) = order.status.next() else {
                    break;
                };
                let old = order.status;
                order.status = next;
                if next == OrderStatus::Shipped {
                    order.tracking_link = Some(tracking_link(order.id));
                }

                if let Err(e) = self.store.update(&order) {
                    warn!(order_id = %order.id, error = %e, "failed to persist order transition");
                    break;
                }

                self.emit(OrderStatusChanged {
                    order_id: order.id,
                    old_status: old,
                    new_status: next,
                    occurred_at: now,
                    tracking_link: order.tracking_link.clone(),
                });
                transitions += 1;

                debug!(order_id = %order.id, from = %old, to = %next, "order advanced");
            }
        }

        Ok(transitions)
    }

    /// Cancel an order (refund extension point).
    ///
    /// Allowed only while the order is still `Processing` or `Paid` *as
    /// derived at call time* — if elapsed time has already carried it to
    /// `Shipped`, the timed transition wins and cancellation fails. Releases
    /// the stock the order had committed.
    pub fn cancel(&self, order_id: OrderId) -> Result<Order, LifecycleError> {
        let _guard = self.mutation_guard();
        let mut order = self.get(order_id)?;
        let now = self.clock.now();

        let current = order.status_at(now, &self.delays);
        if !matches!(current, OrderStatus::Processing | OrderStatus::Paid) {
            return Err(DomainError::invalid_transition(format!(
                "order {order_id} is {current} and can no longer be cancelled"
            ))
            .into());
        }

        order.status = OrderStatus::Cancelled;
        self.store.update(&order)?;

        let released: Vec<(ProductId, u32)> = order
            .items
            .iter()
            .map(|line| (line.product_id, line.quantity))
            .collect();
        self.ledger.release(&released);

        self.emit(OrderStatusChanged {
            order_id: order.id,
            old_status: current,
            new_status: OrderStatus::Cancelled,
            occurred_at: now,
            tracking_link: order.tracking_link.clone(),
        });

        info!(order_id = %order.id, "order cancelled, stock released");
        Ok(order)
    }

    // Fire-and-forget: the store already holds the new state, so a bus
    // failure is logged, not propagated.
    fn emit(&self, event: OrderStatusChanged) {
        if let Err(e) = self.bus.publish(event) {
            warn!(error = ?e, "failed to publish order notification");
        }
    }
}

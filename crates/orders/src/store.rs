//! Order record store.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use pharmaflow_core::{OrderId, StoreError};

use crate::order::Order;

/// Repository for order records.
///
/// Orders are inserted once at checkout and updated only by the lifecycle
/// machine; they are never deleted (history view). Implementations must be
/// safe to share across the caller and the sweep thread.
pub trait OrderStore: Send + Sync {
    fn insert(&self, order: Order) -> Result<(), StoreError>;

    fn get(&self, order_id: OrderId) -> Result<Option<Order>, StoreError>;

    fn update(&self, order: &Order) -> Result<(), StoreError>;

    /// Every stored order, oldest first.
    fn list(&self) -> Result<Vec<Order>, StoreError>;
}

impl<S> OrderStore for Arc<S>
where
    S: OrderStore + ?Sized,
{
    fn insert(&self, order: Order) -> Result<(), StoreError> {
        (**self).insert(order)
    }

    fn get(&self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
        (**self).get(order_id)
    }

    fn update(&self, order: &Order) -> Result<(), StoreError> {
        (**self).update(order)
    }

    fn list(&self) -> Result<Vec<Order>, StoreError> {
        (**self).list()
    }
}

/// In-memory order store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    orders: RwLock<HashMap<OrderId, Order>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole map (snapshot restore).
    pub fn load(&self, orders: impl IntoIterator<Item = Order>) {
        let mut map = self.orders.write().unwrap_or_else(PoisonError::into_inner);
        map.clear();
        map.extend(orders.into_iter().map(|o| (o.id, o)));
    }
}

impl OrderStore for InMemoryOrderStore {
    fn insert(&self, order: Order) -> Result<(), StoreError> {
        let mut map = self
            .orders
            .write()
            .map_err(|e| StoreError::storage(e.to_string()))?;
        if map.contains_key(&order.id) {
            return Err(StoreError::AlreadyExists(order.id.to_string()));
        }
        map.insert(order.id, order);
        Ok(())
    }

    fn get(&self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
        let map = self
            .orders
            .read()
            .map_err(|e| StoreError::storage(e.to_string()))?;
        Ok(map.get(&order_id).cloned())
    }

    fn update(&self, order: &Order) -> Result<(), StoreError> {
        let mut map = self
            .orders
            .write()
            .map_err(|e| StoreError::storage(e.to_string()))?;
        match map.get_mut(&order.id) {
            Some(slot) => {
                *slot = order.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(order.id.to_string())),
        }
    }

    fn list(&self) -> Result<Vec<Order>, StoreError> {
        let map = self
            .orders
            .read()
            .map_err(|e| StoreError::storage(e.to_string()))?;
        let mut orders: Vec<Order> = map.values().cloned().collect();
        orders.sort_by_key(|o| (o.created_at, *o.id.as_uuid()));
        Ok(orders)
    }
}

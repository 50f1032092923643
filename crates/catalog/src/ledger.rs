//! Inventory ledger: non-negative, all-or-nothing stock mutation.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::warn;

use pharmaflow_core::{DomainError, DomainResult, ProductId};

use crate::product::Product;

/// Shared stock ledger.
///
/// All mutation happens under one mutex: a multi-line checkout is a single
/// critical section, so concurrent checkouts against the same product can
/// never oversell. Reads through [`InventoryLedger::available`] are for
/// display and may be stale by the time a commit runs; the commit re-checks.
#[derive(Debug, Default)]
pub struct InventoryLedger {
    products: Mutex<HashMap<ProductId, Product>>,
}

impl InventoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_products(products: impl IntoIterator<Item = Product>) -> Self {
        Self {
            products: Mutex::new(products.into_iter().map(|p| (p.id, p)).collect()),
        }
    }

    // Commits are two-phase (validate, then apply infallibly), so the map is
    // consistent even if a holder panicked; recover the guard instead of
    // propagating poisoning.
    fn guard(&self) -> MutexGuard<'_, HashMap<ProductId, Product>> {
        self.products.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_product(&self, product: Product) {
        self.guard().insert(product.id, product);
    }

    /// Current stock for a product; zero if the product is unknown.
    pub fn available(&self, product_id: ProductId) -> u32 {
        self.guard().get(&product_id).map_or(0, |p| p.stock)
    }

    pub fn product(&self, product_id: ProductId) -> Option<Product> {
        self.guard().get(&product_id).cloned()
    }

    /// Decrement stock for every line, or change nothing.
    ///
    /// Quantities for the same product across lines are aggregated. Fails
    /// with [`DomainError::InsufficientStock`] at the first line whose
    /// cumulative requested quantity exceeds what is available; in that case
    /// no product's stock is touched.
    pub fn reserve_and_commit(&self, lines: &[(ProductId, u32)]) -> DomainResult<()> {
        if lines.is_empty() {
            return Err(DomainError::validation("cannot commit an empty checkout"));
        }

        let mut products = self.guard();

        // A checkout may name the same product on several lines; validate
        // the running total per product so the apply pass can never
        // underflow.
        let mut requested: HashMap<ProductId, u32> = HashMap::with_capacity(lines.len());
        for (product_id, quantity) in lines {
            if *quantity == 0 {
                return Err(DomainError::validation("line quantity must be positive"));
            }
            let total = requested.entry(*product_id).or_insert(0);
            *total = total.checked_add(*quantity).ok_or_else(|| {
                DomainError::validation(format!(
                    "requested quantity for {product_id} overflows"
                ))
            })?;
            let available = products.get(product_id).map_or(0, |p| p.stock);
            if available < *total {
                return Err(DomainError::InsufficientStock {
                    product_id: *product_id,
                    available,
                    requested: *total,
                });
            }
        }

        // Every aggregate validated above while holding the lock; apply
        // cannot fail.
        for (product_id, quantity) in requested {
            if let Some(product) = products.get_mut(&product_id) {
                product.stock -= quantity;
            }
        }

        Ok(())
    }

    /// Return previously committed stock (cancellation/refund path).
    ///
    /// Unknown products are skipped with a warning: the decrement they would
    /// reverse must have gone through this ledger, so this only happens if
    /// the catalog dropped the product in between.
    pub fn release(&self, lines: &[(ProductId, u32)]) {
        let mut products = self.guard();
        for (product_id, quantity) in lines {
            match products.get_mut(product_id) {
                Some(product) => product.stock = product.stock.saturating_add(*quantity),
                None => warn!(%product_id, quantity, "release for unknown product skipped"),
            }
        }
    }

    /// Increase stock (catalog replenishment).
    pub fn restock(&self, product_id: ProductId, quantity: u32) -> DomainResult<()> {
        let mut products = self.guard();
        let product = products.get_mut(&product_id).ok_or(DomainError::NotFound)?;
        product.stock = product.stock.saturating_add(quantity);
        Ok(())
    }

    /// Point-in-time copy of every product (persistence wiring).
    pub fn snapshot(&self) -> Vec<Product> {
        let mut products: Vec<Product> = self.guard().values().cloned().collect();
        products.sort_by_key(|p| *p.id.as_uuid());
        products
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ledger_with(stocks: &[(ProductId, u32)]) -> InventoryLedger {
        InventoryLedger::from_products(
            stocks
                .iter()
                .map(|(id, stock)| Product::new(*id, "item", 100, *stock)),
        )
    }

    #[test]
    fn commit_decrements_every_line() {
        let a = ProductId::new();
        let b = ProductId::new();
        let ledger = ledger_with(&[(a, 5), (b, 3)]);

        ledger.reserve_and_commit(&[(a, 2), (b, 1)]).unwrap();

        assert_eq!(ledger.available(a), 3);
        assert_eq!(ledger.available(b), 2);
    }

    #[test]
    fn insufficient_line_leaves_all_stock_untouched() {
        let a = ProductId::new();
        let b = ProductId::new();
        let ledger = ledger_with(&[(a, 5), (b, 0)]);

        let err = ledger.reserve_and_commit(&[(a, 2), (b, 1)]).unwrap_err();
        match err {
            DomainError::InsufficientStock {
                product_id,
                available,
                requested,
            } => {
                assert_eq!(product_id, b);
                assert_eq!(available, 0);
                assert_eq!(requested, 1);
            }
            other => panic!("Expected InsufficientStock, got {other:?}"),
        }

        assert_eq!(ledger.available(a), 5);
        assert_eq!(ledger.available(b), 0);
    }

    #[test]
    fn unknown_product_reports_zero_available() {
        let ledger = ledger_with(&[]);
        let ghost = ProductId::new();

        let err = ledger.reserve_and_commit(&[(ghost, 1)]).unwrap_err();
        match err {
            DomainError::InsufficientStock { available, .. } => assert_eq!(available, 0),
            other => panic!("Expected InsufficientStock, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_lines_are_validated_as_an_aggregate() {
        let a = ProductId::new();
        let ledger = ledger_with(&[(a, 3)]);

        // Each line alone fits the stock; together they do not.
        let err = ledger.reserve_and_commit(&[(a, 2), (a, 2)]).unwrap_err();
        match err {
            DomainError::InsufficientStock {
                product_id,
                available,
                requested,
            } => {
                assert_eq!(product_id, a);
                assert_eq!(available, 3);
                assert_eq!(requested, 4);
            }
            other => panic!("Expected InsufficientStock, got {other:?}"),
        }
        assert_eq!(ledger.available(a), 3);
    }

    #[test]
    fn duplicate_lines_within_stock_commit_once_each() {
        let a = ProductId::new();
        let ledger = ledger_with(&[(a, 3)]);

        ledger.reserve_and_commit(&[(a, 1), (a, 2)]).unwrap();
        assert_eq!(ledger.available(a), 0);
    }

    #[test]
    fn zero_quantity_line_is_rejected() {
        let a = ProductId::new();
        let ledger = ledger_with(&[(a, 5)]);

        let err = ledger.reserve_and_commit(&[(a, 0)]).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(ledger.available(a), 5);
    }

    #[test]
    fn release_returns_stock() {
        let a = ProductId::new();
        let ledger = ledger_with(&[(a, 5)]);

        ledger.reserve_and_commit(&[(a, 4)]).unwrap();
        assert_eq!(ledger.available(a), 1);

        ledger.release(&[(a, 4)]);
        assert_eq!(ledger.available(a), 5);
    }

    #[test]
    fn restock_unknown_product_is_not_found() {
        let ledger = ledger_with(&[]);
        assert_eq!(
            ledger.restock(ProductId::new(), 10),
            Err(DomainError::NotFound)
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: a successful commit removes exactly the requested total,
        /// and a failed commit removes nothing.
        #[test]
        fn stock_is_conserved(
            stocks in prop::collection::vec(0u32..50, 1..6),
            requests in prop::collection::vec(1u32..20, 1..6),
        ) {
            let ids: Vec<ProductId> = stocks.iter().map(|_| ProductId::new()).collect();
            let ledger = ledger_with(
                &ids.iter().copied().zip(stocks.iter().copied()).collect::<Vec<_>>(),
            );

            let lines: Vec<(ProductId, u32)> = ids
                .iter()
                .copied()
                .zip(requests.iter().copied())
                .collect();

            let before: u64 = ids.iter().map(|id| ledger.available(*id) as u64).sum();
            let requested: u64 = lines.iter().map(|(_, q)| *q as u64).sum();

            let result = ledger.reserve_and_commit(&lines);
            let after: u64 = ids.iter().map(|id| ledger.available(*id) as u64).sum();

            match result {
                Ok(()) => prop_assert_eq!(after, before - requested),
                Err(_) => prop_assert_eq!(after, before),
            }
        }
    }
}

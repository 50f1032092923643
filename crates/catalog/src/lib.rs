//! Catalog domain: product records and the inventory ledger.
//!
//! The ledger is the only mutable resource shared between concurrent
//! checkouts. Multi-line commits happen under a single critical section so
//! two carts racing for the same product can never oversell it.

pub mod ledger;
pub mod product;

pub use ledger::InventoryLedger;
pub use product::Product;

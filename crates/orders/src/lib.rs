//! Order lifecycle domain.
//!
//! An order's delivery status is a pure function of its creation time, the
//! current time, and a fixed delay table — no timer handles are persisted,
//! so a restart resumes exactly where elapsed wall-clock time says it
//! should. The [`machine::OrderLifecycle`] service owns placement (with
//! all-or-nothing stock commit), the scheduled advancement sweep, and the
//! cancellation extension.

pub mod machine;
pub mod order;
pub mod store;

pub use machine::OrderLifecycle;
pub use order::{
    DelayTable, Order, OrderLine, OrderStatus, OrderStatusChanged, ShippingAddress,
    tracking_link,
};
pub use store::{InMemoryOrderStore, OrderStore};

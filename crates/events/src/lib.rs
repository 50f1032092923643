//! Notification fan-out machinery.
//!
//! The lifecycle machines push status-change events through the [`EventBus`]
//! abstraction; UI, email, and push adapters subscribe. Delivery is
//! fire-and-forget, at-least-once: listeners must tolerate duplicates. The
//! concrete payload types live with the machines that emit them.

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};

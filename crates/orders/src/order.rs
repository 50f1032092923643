use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use pharmaflow_core::{DomainError, DomainResult, OrderId, ProductId};
use pharmaflow_events::Event;

/// Flat shipping fee in smallest currency unit, added to every order total.
pub const SHIPPING_FEE: u64 = 2_500;

/// Order delivery status.
///
/// The happy path moves strictly forward: `Processing → Paid → Shipped →
/// Delivered`. `Cancelled` is terminal and reachable only from `Processing`
/// or `Paid` (refund extension point); it sorts last so `Ord`-based
/// monotonicity checks treat it as an end state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Processing,
    Paid,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    /// The next status on the happy path, if any.
    pub fn next(self) -> Option<OrderStatus> {
        match self {
            OrderStatus::Processing => Some(OrderStatus::Paid),
            OrderStatus::Paid => Some(OrderStatus::Shipped),
            OrderStatus::Shipped => Some(OrderStatus::Delivered),
            OrderStatus::Delivered | OrderStatus::Cancelled => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            OrderStatus::Processing => "processing",
            OrderStatus::Paid => "paid",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Cumulative offsets from `created_at` at which an order advances.
///
/// Checked latest-first, so the exact values need not be ordered, but a
/// sensible table is strictly increasing. Defaults model a short payment
/// confirmation, a longer fulfilment window, and delivery after that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayTable {
    pub paid_after: Duration,
    pub shipped_after: Duration,
    pub delivered_after: Duration,
}

impl Default for DelayTable {
    fn default() -> Self {
        Self {
            paid_after: Duration::seconds(5),
            shipped_after: Duration::seconds(10),
            delivered_after: Duration::seconds(20),
        }
    }
}

impl DelayTable {
    /// Happy-path status implied by elapsed time alone.
    pub fn status_for_elapsed(&self, elapsed: Duration) -> OrderStatus {
        if elapsed >= self.delivered_after {
            OrderStatus::Delivered
        } else if elapsed >= self.shipped_after {
            OrderStatus::Shipped
        } else if elapsed >= self.paid_after {
            OrderStatus::Paid
        } else {
            OrderStatus::Processing
        }
    }
}

/// Deterministic carrier tracking URL for an order.
pub fn tracking_link(order_id: OrderId) -> String {
    format!("https://example-courier.com/track?id={order_id}")
}

/// One purchased line: product, quantity, and the unit price frozen at
/// purchase time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub quantity: u32,
    /// Price in smallest currency unit, snapshot at purchase time.
    pub unit_price: u64,
}

/// Delivery address captured at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingAddress {
    pub full_name: String,
    pub address_line1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_line2: Option<String>,
    pub city: String,
    pub state: String,
    pub country: String,
}

/// A committed purchase.
///
/// `items` and `total` are fixed at creation and never change; `status`
/// only moves forward. Orders are never deleted (retained for history).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub items: Vec<OrderLine>,
    /// Subtotal plus shipping, in smallest currency unit.
    pub total: u64,
    pub shipping_address: ShippingAddress,
    pub payment_method: String,
    /// Last broadcast status; the authoritative value is
    /// [`Order::status_at`], which this never exceeds on the happy path.
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_link: Option<String>,
}

impl Order {
    /// Create a new order in `Processing`.
    ///
    /// Stock must already have been committed by the caller; this only
    /// validates the shape of the snapshot and freezes the total.
    pub fn place(
        id: OrderId,
        items: Vec<OrderLine>,
        shipping_address: ShippingAddress,
        payment_method: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if items.is_empty() {
            return Err(DomainError::validation("cannot place an order with no items"));
        }
        if items.iter().any(|line| line.quantity == 0) {
            return Err(DomainError::validation("line quantity must be positive"));
        }

        let mut subtotal: u64 = 0;
        for line in &items {
            subtotal = line
                .unit_price
                .checked_mul(u64::from(line.quantity))
                .and_then(|line_total| subtotal.checked_add(line_total))
                .ok_or_else(|| DomainError::validation("order total overflows"))?;
        }
        let total = subtotal
            .checked_add(SHIPPING_FEE)
            .ok_or_else(|| DomainError::validation("order total overflows"))?;

        Ok(Self {
            id,
            items,
            total,
            shipping_address,
            payment_method: payment_method.into(),
            status: OrderStatus::Processing,
            created_at: now,
            tracking_link: None,
        })
    }

    /// The status this order holds at `now`.
    ///
    /// Pure function of `created_at`, the delay table, and the stored
    /// status: cancellation sticks, and the result never regresses below
    /// what was already broadcast. Repeated calls at the same instant agree.
    pub fn status_at(&self, now: DateTime<Utc>, delays: &DelayTable) -> OrderStatus {
        if self.status == OrderStatus::Cancelled {
            return OrderStatus::Cancelled;
        }
        let derived = delays.status_for_elapsed(now - self.created_at);
        derived.max(self.status)
    }
}

/// Fired once per status transition, strictly in lifecycle order per order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusChanged {
    pub order_id: OrderId,
    pub old_status: OrderStatus,
    pub new_status: OrderStatus,
    pub occurred_at: DateTime<Utc>,
    /// Present from the Shipped transition onwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_link: Option<String>,
}

impl Event for OrderStatusChanged {
    fn event_type(&self) -> &'static str {
        "orders.status_changed"
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

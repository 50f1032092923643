use serde::{Deserialize, Serialize};

use pharmaflow_core::ProductId;

/// A catalog product.
///
/// Created by catalog management (outside this engine); the ledger only
/// reads `stock` and applies decrements. `price` is in the smallest
/// currency unit (e.g. cents) and `stock` is non-negative by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    /// Price in smallest currency unit (e.g., cents).
    pub price: u64,
    pub stock: u32,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub is_recommended: bool,
}

impl Product {
    pub fn new(id: ProductId, name: impl Into<String>, price: u64, stock: u32) -> Self {
        Self {
            id,
            name: name.into(),
            price,
            stock,
            category: String::new(),
            is_recommended: false,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }
}

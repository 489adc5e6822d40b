//! Integration events of the ordering domain.

use serde::{Deserialize, Serialize};
use shared_types::{integration_event, EventMetadata};

/// An order was placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreated {
    #[serde(flatten)]
    pub metadata: EventMetadata,
    pub order_id: u64,
    pub buyer: String,
}

impl OrderCreated {
    #[must_use]
    pub fn new(order_id: u64, buyer: impl Into<String>) -> Self {
        Self {
            metadata: EventMetadata::new(),
            order_id,
            buyer: buyer.into(),
        }
    }
}

/// Payment for an order was confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPaid {
    #[serde(flatten)]
    pub metadata: EventMetadata,
    pub order_id: u64,
    pub amount_cents: u64,
}

impl OrderPaid {
    #[must_use]
    pub fn new(order_id: u64, amount_cents: u64) -> Self {
        Self {
            metadata: EventMetadata::new(),
            order_id,
            amount_cents,
        }
    }
}

integration_event!(OrderCreated, OrderPaid);

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info};

use super::inventory::HbwInventory;
use crate::mqtt::{EnvelopeMessage, SessionClient};

pub const STOCK_TOPIC: &str = "ccu/state/stock";
pub const ACTIVE_ORDERS_TOPIC: &str = "ccu/order/active";

#[derive(Debug, Clone, Default)]
struct Cached {
    stock: Option<Value>,
    inventory: Option<HbwInventory>,
    active_orders: Vec<Value>,
    refreshed_at: Option<DateTime<Utc>>,
}

/// Latest stock and order picture, derived from buffered CCU messages.
///
/// After [`invalidate`](Self::invalidate) only messages received later are
/// taken into account, so a factory reset never resurrects stale stock.
#[derive(Debug, Default)]
pub struct FactoryStateCache {
    state: RwLock<Cached>,
    invalidated_at: RwLock<Option<DateTime<Utc>>>,
}

impl FactoryStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Topics the cache reads; the client must be subscribed to them.
    pub fn topics() -> [&'static str; 2] {
        [STOCK_TOPIC, ACTIVE_ORDERS_TOPIC]
    }

    /// Pulls the newest stock and active-order messages from `client`.
    /// Returns whether anything changed.
    pub fn refresh_from(&self, client: &SessionClient) -> bool {
        let cutoff = *self
            .invalidated_at
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let fresh = |message: &EnvelopeMessage| cutoff.map_or(true, |at| message.received_at > at);

        let stock = client
            .latest(STOCK_TOPIC)
            .filter(|m| fresh(m))
            .and_then(|m| m.payload.json().cloned());
        let orders = client
            .latest(ACTIVE_ORDERS_TOPIC)
            .filter(|m| fresh(m))
            .and_then(|m| m.payload.json().and_then(Value::as_array).cloned());

        if stock.is_none() && orders.is_none() {
            return false;
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(stock) = stock {
            state.inventory = Some(HbwInventory::from_stock(&stock));
            state.stock = Some(stock);
        }
        if let Some(orders) = orders {
            state.active_orders = orders;
        }
        state.refreshed_at = Some(Utc::now());
        debug!(
            "Factory state refreshed: {} active orders",
            state.active_orders.len()
        );
        true
    }

    /// Forgets every cached order and stock entry.
    pub fn invalidate(&self) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Cached::default();
        *self
            .invalidated_at
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        info!("Factory state cache invalidated");
    }

    pub fn stock(&self) -> Option<Value> {
        self.read().stock.clone()
    }

    pub fn inventory(&self) -> Option<HbwInventory> {
        self.read().inventory.clone()
    }

    pub fn active_orders(&self) -> Vec<Value> {
        self.read().active_orders.clone()
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.read().refreshed_at
    }

    pub fn is_empty(&self) -> bool {
        let state = self.read();
        state.stock.is_none() && state.active_orders.is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Cached> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }
}

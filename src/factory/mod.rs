//! # Factory Consumers
//!
//! Read-side views derived from buffered broker traffic: the high-bay
//! warehouse grid and a cache of CCU stock and order state.

pub mod cache;
pub mod inventory;

pub use cache::{FactoryStateCache, ACTIVE_ORDERS_TOPIC, STOCK_TOPIC};
pub use inventory::{HbwInventory, HBW_POSITIONS};

//! Domain model for StockFlow: inventory, invoicing, identity, authorization, billing and notifications.
//!
//! Everything here is free of I/O so the storage and HTTP layers can share the
//! same rules and tests.

pub mod billing;
pub mod identity;
pub mod invoice;
pub mod notification;
pub mod paging;
pub mod permissions;
pub mod product;
pub mod role_upgrade;
pub mod roles;

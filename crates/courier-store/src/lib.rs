//! # courier-store
//!
//! Durable JSON document storage, the runtime document registry, and the
//! day-partitioned audit log.

pub mod audit;
pub mod registry;
pub mod store;

pub use audit::{AuditLog, AuditStatus, HistoryQuery};
pub use registry::Registry;
pub use store::JsonStore;

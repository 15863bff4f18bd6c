//! Redis-based cache and distributed lease infrastructure
//!
//! Short-lived tenant status entries and `SET NX PX` leases used for
//! single-flight provisioning, sweep locks and activity debouncing.

pub mod manager;

pub use manager::*;

//! # Fleet Testing Utils
//!
//! Shared testing utilities for the fleet orchestrator workspace:
//!
//! - **In-memory stores**: host/tenant repositories, cache and lease service
//! - **Fakes**: remote executor, cloud provisioner, notifier, credential revoker
//! - **Test containers**: PostgreSQL with migrations applied, Redis
//! - **Builders**: hosts and tenants with sensible defaults
//!
//! ```toml
//! [dev-dependencies]
//! fleet-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod containers;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use containers::*;
pub use helpers::*;
pub use mocks::*;

pub mod cache;
pub mod database;
pub mod observability;
pub mod remote;

pub use cache::*;
pub use database::*;
pub use observability::*;
pub use remote::*;

pub mod cache;
pub mod remote;
pub mod repository;

pub use cache::*;
pub use remote::*;
pub use repository::*;

pub mod billing;
pub mod health;
pub mod hosts;
pub mod tasks;
pub mod tenants;

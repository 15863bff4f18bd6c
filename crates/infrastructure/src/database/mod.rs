pub mod postgres;

pub use postgres::{
    DatabaseManager, DbPool, PostgresHostRepository, PostgresTaskAuditRepository,
    PostgresTenantRepository,
};

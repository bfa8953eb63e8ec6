pub mod config;
pub mod database;
pub mod lock;
pub mod store;

pub use config::DatabaseConfig;
pub use database::Database;
pub use lock::PgDispatchLock;
pub use store::PgStore;

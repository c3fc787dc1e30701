//! SQLite persistence for running totals and dedup markers.

mod pool;
mod store;

pub use pool::DatabasePool;
pub use store::SqliteStore;

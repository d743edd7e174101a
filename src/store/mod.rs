/// Backing store trait and stored record types
pub mod backend;

/// SQLite durable backend
pub mod sqlite;

/// In-memory backend
pub mod memory;

/// Timeout-bounded aggregate store facade
pub mod aggregate;

pub use aggregate::{AggregateStore, ErrorHistory};
pub use backend::{Delivery, ErrorDefinition, HourlyCount, StoreBackend};
pub use memory::InMemoryBackend;
pub use sqlite::SqliteBackend;

//! Document-store adapters.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryDocumentStore;
pub use sqlite::SqliteDocumentStore;

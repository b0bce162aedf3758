//! Port trait definitions (Hexagonal Architecture)
//!
//! - `DocumentStore`: the persistence primitive adapters implement
//! - `StorageProtocol`: the facade every caller programs against
//!
//! Services depend only on these traits, never on a concrete backend.

pub mod document_store;
pub mod storage_protocol;

pub use document_store::{DocumentStore, WriteOutcome};
pub use storage_protocol::StorageProtocol;

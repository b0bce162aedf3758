//! Domain layer: experiment and trial models, queries, and the ports the
//! storage core is programmed against.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{StorageError, StorageResult};

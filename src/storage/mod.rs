// src/storage/mod.rs
pub mod memory;
pub mod postgres;
pub mod traits;

pub use memory::{MemoryConn, MemoryStore};
pub use postgres::PostgresStore;
pub use traits::{ProvenanceStore, RuleStore, StoreError, StoreResult, TransactionManager};

//! Persistence collaborator for Swarmdeck.
//!
//! The orchestrator never talks to a database directly. It goes through the
//! [`Persistence`] trait: durable insert/update/delete/query on entity
//! tables, plus a per-table change feed for observers.
//!
//! # Main types
//!
//! - [`Persistence`] - The storage contract.
//! - [`PersistenceExt`] - Typed helpers for [`Record`] entities.
//! - [`MemoryStore`] - In-process implementation for tests and ephemeral runs.
//! - [`FileStore`] - JSON-file-per-record implementation.

/// JSON file store.
pub mod file;
/// In-memory store.
pub mod memory;
/// Storage contract.
pub mod store;
/// Tables, records, and change events.
pub mod table;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use store::{Persistence, PersistenceExt};
pub use table::{ChangeEvent, ChangeFeed, ChangeKind, Record, Table};
